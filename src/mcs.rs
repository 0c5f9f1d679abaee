//! MCS framing layer: varint size prefixes, the incremental frame parser
//! and the tagged message set.
//!
//! Wire format after the TLS handshake:
//!
//! ```text
//! session opener: <version: u8> <tag: u8> <size: varint32> <payload>
//! subsequent:                   <tag: u8> <size: varint32> <payload>
//! ```

include!(concat!(env!("OUT_DIR"), "/mcs_proto.rs"));

use prost::Message as _;
use thiserror::Error;

/// Protocol version spoken by this client.
pub const MCS_VERSION: u8 = 41;
/// Oldest server version still accepted on the session opener.
pub const MCS_VERSION_LEGACY: u8 = 38;

/// Upper bound on a single frame payload. A size varint beyond this is
/// treated as stream corruption rather than an allocation request.
pub const MAX_PAYLOAD_LEN: u32 = 1024 * 1024;

pub type Tag = u8;

pub const HEARTBEAT_PING_TAG: Tag = 0;
pub const HEARTBEAT_ACK_TAG: Tag = 1;
pub const LOGIN_REQUEST_TAG: Tag = 2;
pub const LOGIN_RESPONSE_TAG: Tag = 3;
pub const CLOSE_TAG: Tag = 4;
pub const IQ_STANZA_TAG: Tag = 7;
pub const DATA_MESSAGE_STANZA_TAG: Tag = 8;

/// Appends `value` to `out` as a little-endian base-128 varint (1-5 bytes,
/// continuation bit set on every byte but the last).
pub fn encode_varint32(mut value: u32, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Decodes a varint32 from the start of `buf`, returning the value and the
/// number of bytes consumed.
///
/// `Ok(None)` means the continuation bit was still set on the last available
/// byte and more input is needed. Encodings past 5 bytes are rejected.
pub fn decode_varint32(buf: &[u8]) -> Result<Option<(u32, usize)>, FrameError> {
    let mut value = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if i == 5 {
            return Err(FrameError::VarintOverflow);
        }
        value |= u32::from(byte & 0x7f) << (i * 7);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= 5 {
        return Err(FrameError::VarintOverflow);
    }
    Ok(None)
}

/// Fatal framing failures. Any of these means the byte stream can no longer
/// be trusted and the session must end.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("size varint exceeds 5 bytes")]
    VarintOverflow,
    #[error("frame payload of {len} bytes exceeds the {MAX_PAYLOAD_LEN} byte limit")]
    PayloadTooLarge { len: u32 },
    #[error("unsupported protocol version {got} (expected {MCS_VERSION})")]
    VersionMismatch { got: u8 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Session opener: version byte, tag byte and at least one size byte.
    ExpectVersionTagSize,
    ExpectTagSize,
    ExpectSize,
    ExpectPayload,
}

/// Incremental parser for the MCS framing layer.
///
/// Bytes read from the transport are appended with [`push`](Self::push);
/// [`next_frame`](Self::next_frame) runs whatever state transitions the
/// carried bytes allow and yields a whole `(tag, payload)` pair once one is
/// complete. [`bytes_wanted`](Self::bytes_wanted) reports exactly how many
/// further bytes the current state needs, so the read loop never blocks for
/// more than the protocol requires.
#[derive(Debug)]
pub struct FrameReader {
    state: State,
    size_bytes_so_far: u8,
    tag: Tag,
    payload_len: u32,
    carry: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            state: State::ExpectVersionTagSize,
            size_bytes_so_far: 0,
            tag: 0,
            payload_len: 0,
            carry: Vec::new(),
        }
    }

    /// Total bytes the current state must see in the carry buffer.
    fn bytes_required(&self) -> usize {
        match self.state {
            State::ExpectVersionTagSize => 3,
            State::ExpectTagSize => 2,
            State::ExpectSize => self.size_bytes_so_far as usize + 1,
            State::ExpectPayload => self.payload_len as usize,
        }
    }

    /// Additional bytes to read before the current state can complete.
    pub fn bytes_wanted(&self) -> usize {
        self.bytes_required().saturating_sub(self.carry.len())
    }

    /// Whether the stream sits exactly between frames. End-of-stream here is
    /// an orderly close rather than a truncated frame.
    pub fn at_frame_boundary(&self) -> bool {
        self.carry.is_empty()
            && matches!(self.state, State::ExpectVersionTagSize | State::ExpectTagSize)
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.carry.extend_from_slice(bytes);
    }

    /// Runs state transitions until a whole frame is available or more input
    /// is needed.
    pub fn next_frame(&mut self) -> Result<Option<(Tag, Vec<u8>)>, FrameError> {
        loop {
            if self.carry.len() < self.bytes_required() {
                return Ok(None);
            }
            match self.state {
                State::ExpectVersionTagSize => {
                    let version = self.carry[0];
                    if version != MCS_VERSION && version != MCS_VERSION_LEGACY {
                        return Err(FrameError::VersionMismatch { got: version });
                    }
                    self.tag = self.carry[1];
                    self.carry.drain(..2);
                    self.size_bytes_so_far = 0;
                    self.state = State::ExpectSize;
                }
                State::ExpectTagSize => {
                    self.tag = self.carry[0];
                    self.carry.remove(0);
                    self.size_bytes_so_far = 0;
                    self.state = State::ExpectSize;
                }
                State::ExpectSize => match decode_varint32(&self.carry)? {
                    Some((size, consumed)) => {
                        if size > MAX_PAYLOAD_LEN {
                            return Err(FrameError::PayloadTooLarge { len: size });
                        }
                        self.carry.drain(..consumed);
                        self.size_bytes_so_far = 0;
                        self.payload_len = size;
                        self.state = State::ExpectPayload;
                    }
                    None => {
                        // Request one size byte at a time until the varint ends.
                        self.size_bytes_so_far = self.carry.len() as u8;
                        return Ok(None);
                    }
                },
                State::ExpectPayload => {
                    let payload: Vec<u8> = self.carry.drain(..self.payload_len as usize).collect();
                    let tag = self.tag;
                    self.state = State::ExpectTagSize;
                    return Ok(Some((tag, payload)));
                }
            }
        }
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

/// The closed set of messages a receive-only session exchanges.
#[derive(Debug)]
pub enum Message {
    HeartbeatPing(HeartbeatPing),
    HeartbeatAck(HeartbeatAck),
    LoginRequest(LoginRequest),
    LoginResponse(LoginResponse),
    Close(Close),
    IqStanza(IqStanza),
    DataMessageStanza(DataMessageStanza),
}

impl Message {
    /// Decodes the payload of a framed message with the given wire tag.
    pub fn decode(tag: Tag, buf: &[u8]) -> Result<Self, DecodeError> {
        Ok(match tag {
            HEARTBEAT_PING_TAG => Self::HeartbeatPing(HeartbeatPing::decode(buf)?),
            HEARTBEAT_ACK_TAG => Self::HeartbeatAck(HeartbeatAck::decode(buf)?),
            LOGIN_REQUEST_TAG => Self::LoginRequest(LoginRequest::decode(buf)?),
            LOGIN_RESPONSE_TAG => Self::LoginResponse(LoginResponse::decode(buf)?),
            CLOSE_TAG => Self::Close(Close::decode(buf)?),
            IQ_STANZA_TAG => Self::IqStanza(IqStanza::decode(buf)?),
            DATA_MESSAGE_STANZA_TAG => Self::DataMessageStanza(DataMessageStanza::decode(buf)?),
            _ => return Err(DecodeError::UnknownTag { tag }),
        })
    }
}

/// Errors returned by [`Message::decode()`].
#[derive(Debug, Error)]
#[error("failed to decode mcs message: {0}")]
pub enum DecodeError {
    Prost(#[from] prost::DecodeError),
    #[error("unknown tag `{tag}`")]
    UnknownTag { tag: Tag },
}

/// Frames an outbound message as `<tag><size varint><payload>`.
pub fn encode_frame(tag: Tag, message: &impl prost::Message) -> Vec<u8> {
    let payload = message.encode_to_vec();
    let mut buf = Vec::with_capacity(1 + 5 + payload.len());
    buf.push(tag);
    encode_varint32(payload.len() as u32, &mut buf);
    buf.extend_from_slice(&payload);
    buf
}

impl DataMessageStanza {
    /// Returns the value of the first `app_data` entry with the given key.
    pub(crate) fn app_data_value(&self, key: &str) -> Option<&str> {
        self.app_data
            .iter()
            .find(|data| data.key == key)
            .map(|data| data.value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;

    #[test]
    fn varint_round_trip() {
        let samples = [
            0u32,
            1,
            0x7f,
            0x80,
            0x3fff,
            0x4000,
            0x001f_ffff,
            0x0020_0000,
            0x0fff_ffff,
            0x1000_0000,
            u32::MAX,
        ];
        for value in samples {
            let mut buf = Vec::new();
            encode_varint32(value, &mut buf);
            assert!((1..=5).contains(&buf.len()), "len for {value}");
            let (decoded, consumed) = decode_varint32(&buf).unwrap().unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn varint_short_read_wants_more() {
        let mut buf = Vec::new();
        encode_varint32(u32::MAX, &mut buf);
        for len in 0..buf.len() {
            assert!(matches!(decode_varint32(&buf[..len]), Ok(None)));
        }
    }

    #[test]
    fn varint_overlong_is_rejected() {
        assert!(matches!(
            decode_varint32(&[0x80; 5]),
            Err(FrameError::VarintOverflow)
        ));
        assert!(matches!(
            decode_varint32(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x00]),
            Err(FrameError::VarintOverflow)
        ));
    }

    fn sample_stream() -> Vec<u8> {
        let login = LoginResponse {
            id: "session-1".into(),
            last_stream_id_received: Some(5),
            ..Default::default()
        };
        let ping = HeartbeatPing {
            stream_id: Some(0),
            last_stream_id_received: Some(5),
            status: Some(0),
        };
        let mut bytes = vec![MCS_VERSION];
        bytes.extend_from_slice(&encode_frame(LOGIN_RESPONSE_TAG, &login));
        bytes.extend_from_slice(&encode_frame(HEARTBEAT_PING_TAG, &ping));
        bytes.extend_from_slice(&encode_frame(CLOSE_TAG, &Close::default()));
        bytes
    }

    #[test]
    fn whole_stream_and_byte_at_a_time_agree() {
        let bytes = sample_stream();

        let mut whole = FrameReader::new();
        whole.push(&bytes);
        let mut whole_frames = Vec::new();
        while let Some(frame) = whole.next_frame().unwrap() {
            whole_frames.push(frame);
        }

        let mut trickle = FrameReader::new();
        let mut trickle_frames = Vec::new();
        for byte in &bytes {
            trickle.push(std::slice::from_ref(byte));
            while let Some(frame) = trickle.next_frame().unwrap() {
                trickle_frames.push(frame);
            }
        }

        assert_eq!(whole_frames.len(), 3);
        assert_eq!(whole_frames, trickle_frames);
        assert_eq!(whole_frames[2], (CLOSE_TAG, Vec::new()));
    }

    #[test]
    fn version_gating() {
        for (version, accepted) in [(38u8, true), (39, false), (40, false), (41, true), (42, false)]
        {
            let mut reader = FrameReader::new();
            reader.push(&[version, CLOSE_TAG, 0]);
            match reader.next_frame() {
                Ok(Some((tag, payload))) => {
                    assert!(accepted, "version {version} should have been rejected");
                    assert_eq!(tag, CLOSE_TAG);
                    assert!(payload.is_empty());
                }
                Err(FrameError::VersionMismatch { got }) => {
                    assert!(!accepted, "version {version} should have been accepted");
                    assert_eq!(got, version);
                }
                other => panic!("unexpected result for version {version}: {other:?}"),
            }
        }
    }

    #[test]
    fn bytes_wanted_tracks_state() {
        let mut reader = FrameReader::new();
        assert_eq!(reader.bytes_wanted(), 3);

        // Multi-byte size varint: only one further byte is requested per
        // stalled decode attempt.
        reader.push(&[MCS_VERSION, DATA_MESSAGE_STANZA_TAG, 0x80]);
        assert!(reader.next_frame().unwrap().is_none());
        assert_eq!(reader.bytes_wanted(), 1);

        reader.push(&[0x01]); // size = 128
        assert!(reader.next_frame().unwrap().is_none());
        assert_eq!(reader.bytes_wanted(), 128);
    }

    #[test]
    fn oversized_payload_is_fatal() {
        let mut reader = FrameReader::new();
        let mut bytes = vec![MCS_VERSION, DATA_MESSAGE_STANZA_TAG];
        encode_varint32(MAX_PAYLOAD_LEN + 1, &mut bytes);
        reader.push(&bytes);
        assert!(matches!(
            reader.next_frame(),
            Err(FrameError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn unknown_tag_is_reported() {
        assert!(matches!(
            Message::decode(9, &[]),
            Err(DecodeError::UnknownTag { tag: 9 })
        ));
    }

    #[test]
    fn encode_frame_prefixes_tag_and_size() {
        let ping = HeartbeatPing {
            stream_id: Some(0),
            last_stream_id_received: Some(7),
            status: Some(0),
        };
        let frame = encode_frame(HEARTBEAT_PING_TAG, &ping);
        assert_eq!(frame[0], HEARTBEAT_PING_TAG);
        let (size, consumed) = decode_varint32(&frame[1..]).unwrap().unwrap();
        let payload = &frame[1 + consumed..];
        assert_eq!(payload.len(), size as usize);
        assert_eq!(HeartbeatPing::decode(payload).unwrap(), ping);
    }
}
