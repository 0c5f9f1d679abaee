//! # FCM web-push receiver.
//!
//! Long-lived client for Firebase Cloud Messaging over the Mobile Connection
//! Server (MCS) channel. A one-time [`Client::register`] call mints the
//! device identity and Web Push subscription; afterwards [`Client::connect`]
//! opens an authenticated TLS stream to the message server and
//! [`Client::receive`] consumes framed protocol-buffer messages, decrypting
//! Web Push payloads and reporting them through registered callbacks.
//!
//! Reconnection is the caller's responsibility: `receive` returns on any
//! fatal transport or protocol error and the host decides whether to call
//! `connect` again with the latest persisted persistent-id set.
//!
// https://chromium.googlesource.com/chromium/chromium/+/trunk/google_apis/gcm/

use std::sync::Arc;

use base64::prelude::{Engine as _, BASE64_URL_SAFE_NO_PAD};
use ece::legacy::AesGcmEncryptedBlock;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_native_tls::{native_tls::TlsConnector as RawTlsConnector, TlsConnector, TlsStream};

mod credentials;
mod emitter;
mod fcm;
mod gcm;
mod mcs;

use credentials::DeviceCredentials;
use credentials::{PUBLIC_KEY_LEN, SALT_LEN};
use emitter::Emitter;
use mcs::{login_request, DataMessageStanza, HeartbeatAck, HeartbeatPing, LoginRequest, Message};

pub use credentials::{
    join_persistent_ids, split_persistent_ids, AcgCredentials, Config, ConfigError, EceKeys,
    InitConfig, RegisterData,
};
pub use emitter::{Event, ListenerHandle};
pub use mcs::{FrameError, Tag};

pub(crate) const MCS_HOST: &str = "mtalk.google.com";
pub(crate) const MCS_PORT: u16 = 5228;
pub(crate) const CHROME_VERSION: &str = "87.0.4280.66";

/// Client for receiving FCM push notifications.
#[derive(Debug)]
pub struct Client {
    /// Persistent ids of messages already delivered to this device. Echoed
    /// on login so the server does not replay them; grows with each inbound
    /// data message.
    pub persistent_ids: Vec<String>,
    credentials: DeviceCredentials,
    config: Config,
    emitter: Emitter,
    http: reqwest::Client,
}

/// Errors raised while registering or opening a session.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    CheckIn(#[from] gcm::CheckInError),
    #[error(transparent)]
    GcmRegister(#[from] gcm::RegisterError),
    #[error(transparent)]
    Installation(#[from] fcm::InstallationError),
    #[error(transparent)]
    FcmRegister(#[from] fcm::RegisterError),
    #[error(transparent)]
    Ece(#[from] ece::Error),
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
    #[error(transparent)]
    Tls(#[from] tokio_native_tls::native_tls::Error),
}

/// Fatal session failures. [`Client::receive`] terminates by returning one;
/// everything milder is logged and absorbed.
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("failed to decode message with tag {tag}: {source}")]
    MessageParse {
        tag: Tag,
        source: prost::DecodeError,
    },
    #[error("server closed the stream")]
    ServerClosed,
    #[error("connection lost mid-frame")]
    UnexpectedEof,
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a data message is dropped before reaching the host. None of these
/// end the session.
#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("missing `{field}` header")]
    HeaderMissing { field: &'static str },
    #[error("`{field}` header is not valid base64url: {source}")]
    HeaderEncoding {
        field: &'static str,
        source: base64::DecodeError,
    },
    #[error("`{field}` header has length {len}, expected {expected}")]
    HeaderLength {
        field: &'static str,
        len: usize,
        expected: usize,
    },
    #[error("empty payload")]
    EmptyPayload,
    #[error(transparent)]
    Ece(#[from] ece::Error),
}

/// A live MCS session produced by [`Client::connect`].
///
/// The receive loop exclusively owns the read half and all parser state; the
/// write half is shared with at most one pending heartbeat task. Dropping
/// the session aborts that task and closes the transport.
pub struct Session<S> {
    reader: mcs::FrameReader,
    read_half: ReadHalf<S>,
    write_half: Arc<Mutex<WriteHalf<S>>>,
    heartbeat: Option<JoinHandle<()>>,
    last_stream_id_received: i32,
    logged_in: bool,
}

impl<S: AsyncRead + AsyncWrite> Session<S> {
    pub(crate) fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: mcs::FrameReader::new(),
            read_half,
            write_half: Arc::new(Mutex::new(write_half)),
            heartbeat: None,
            last_stream_id_received: 0,
            logged_in: false,
        }
    }

    async fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        send_all(&self.write_half, bytes).await
    }
}

impl<S> Drop for Session<S> {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }
}

async fn send_all<S: AsyncWrite>(
    write_half: &Mutex<WriteHalf<S>>,
    bytes: &[u8],
) -> std::io::Result<()> {
    let mut writer = write_half.lock().await;
    writer.write_all(bytes).await?;
    writer.flush().await
}

impl Client {
    /// Constructs a client from a stored credential bundle.
    ///
    /// `persistent_ids` is the set loaded from the host's persistent-id
    /// store; it is echoed on login so the server suppresses replay.
    pub fn new(
        data: &RegisterData,
        config: Config,
        persistent_ids: Vec<String>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            credentials: data.decode()?,
            config,
            emitter: Emitter::default(),
            persistent_ids,
            http: reqwest::Client::new(),
        })
    }

    /// Registers `callback` for every occurrence of `event`.
    pub fn on(
        &mut self,
        event: Event,
        callback: impl FnMut(&str) + Send + 'static,
    ) -> ListenerHandle {
        self.emitter.on(event, callback)
    }

    /// Registers `callback` for the next occurrence of `event` only.
    pub fn once(
        &mut self,
        event: Event,
        callback: impl FnMut(&str) + Send + 'static,
    ) -> ListenerHandle {
        self.emitter.once(event, callback)
    }

    /// Removes a previously registered listener.
    pub fn off(&mut self, event: Event, handle: ListenerHandle) -> bool {
        self.emitter.off(event, handle)
    }

    /// Registers a new device and Web Push subscription with FCM.
    ///
    /// Runs the four-step sequence (checkin, GCM register, Firebase
    /// installation, FCM registration); each step's output feeds the next.
    /// The returned bundle is everything a later [`Client::new`] needs.
    pub async fn register(init: &InitConfig) -> Result<RegisterData, ClientError> {
        let http = reqwest::Client::new();
        let keys = credentials::Keys::generate()?;

        let checkin = gcm::check_in(&http, None, None).await?;
        let android_id = checkin.android_id();
        let security_token = checkin.security_token();
        if android_id == 0 || security_token == 0 {
            return Err(gcm::CheckInError::Incomplete.into());
        }

        let gcm_token = gcm::register(&http, &init.app_id, android_id, security_token).await?;
        let installation_token = fcm::request_installation(&http, init).await?;
        let token = fcm::register(&http, init, &installation_token, &keys, &gcm_token).await?;

        info!("registered with fcm as device {android_id}");

        Ok(RegisterData {
            acg: AcgCredentials {
                id: android_id.to_string(),
                security_token: security_token.to_string(),
            },
            ece: EceKeys {
                auth_secret: keys.auth_secret,
                private_key: keys.private_key,
                public_key: Some(keys.public_key),
            },
            token,
        })
    }

    /// Opens TLS to the message server and submits the login request.
    ///
    /// Returns before the `LoginResponse` arrives; drive the session with
    /// [`receive`](Self::receive).
    pub async fn connect(&self) -> Result<Session<TlsStream<TcpStream>>, ClientError> {
        self.check_in().await;

        let address = format!("{}:{}", self.config.host, self.config.port);
        let tcp_stream = TcpStream::connect(address).await?;
        let connector = TlsConnector::from(RawTlsConnector::new()?);
        let stream = connector.connect(&self.config.host, tcp_stream).await?;

        let session = Session::new(stream);
        self.send_login_request(&session).await?;
        Ok(session)
    }

    /// Runs the receive loop until a fatal error.
    ///
    /// Undecryptable messages and heartbeat send failures are logged and
    /// absorbed; anything returned from here means the session is over. A
    /// `Close` frame or an orderly end-of-stream between frames surfaces as
    /// [`ReceiveError::ServerClosed`].
    pub async fn receive<S>(&mut self, mut session: Session<S>) -> Result<(), ReceiveError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        loop {
            while let Some((tag, payload)) = session.reader.next_frame()? {
                self.handle_frame(&mut session, tag, &payload).await?;
            }

            // Reads are sized to exactly what the parser state still needs,
            // so heartbeat latency stays bounded.
            let wanted = session.reader.bytes_wanted();
            let mut buf = vec![0u8; wanted];
            let n = session.read_half.read(&mut buf).await?;
            if n == 0 {
                return Err(if session.reader.at_frame_boundary() {
                    ReceiveError::ServerClosed
                } else {
                    ReceiveError::UnexpectedEof
                });
            }
            if self.config.verbose {
                debug!("read {n} of {wanted} pending bytes");
            }
            session.reader.push(&buf[..n]);
        }
    }

    async fn send_login_request<S: AsyncRead + AsyncWrite>(
        &self,
        session: &Session<S>,
    ) -> Result<(), std::io::Error> {
        let frame = mcs::encode_frame(mcs::LOGIN_REQUEST_TAG, &self.login_request());
        let mut buf = Vec::with_capacity(1 + frame.len());
        buf.push(mcs::MCS_VERSION);
        buf.extend_from_slice(&frame);
        session.send(&buf).await
    }

    fn login_request(&self) -> LoginRequest {
        let android_id = self.credentials.android_id;
        LoginRequest {
            adaptive_heartbeat: Some(false),
            auth_service: Some(login_request::AuthService::AndroidId as i32),
            auth_token: self.credentials.security_token.to_string(),
            id: format!("chrome-{CHROME_VERSION}"),
            domain: "mcs.android.com".into(),
            device_id: Some(format!("android-{android_id:X}")),
            network_type: Some(1),
            resource: android_id.to_string(),
            user: android_id.to_string(),
            use_rmq2: Some(true),
            setting: vec![mcs::Setting {
                name: "new_vc".into(),
                value: "1".into(),
            }],
            received_persistent_id: self
                .persistent_ids
                .iter()
                .filter(|id| !id.is_empty())
                .cloned()
                .collect(),
            ..Default::default()
        }
    }

    async fn handle_frame<S>(
        &mut self,
        session: &mut Session<S>,
        tag: Tag,
        payload: &[u8],
    ) -> Result<(), ReceiveError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let message = match Message::decode(tag, payload) {
            Ok(message) => message,
            Err(mcs::DecodeError::UnknownTag { tag }) => {
                debug!("ignoring message with unhandled tag {tag}");
                return Ok(());
            }
            Err(mcs::DecodeError::Prost(source)) => {
                return Err(ReceiveError::MessageParse { tag, source })
            }
        };

        match message {
            Message::LoginResponse(response) => {
                self.handle_login_response(session, response).await
            }
            Message::HeartbeatAck(ack) => {
                self.handle_heartbeat_ack(session, &ack);
                Ok(())
            }
            Message::DataMessageStanza(stanza) => {
                self.handle_data_message(&stanza);
                Ok(())
            }
            Message::IqStanza(iq) => {
                debug!("received iq stanza `{}`", iq.id);
                Ok(())
            }
            Message::Close(_) => Err(ReceiveError::ServerClosed),
            Message::HeartbeatPing(_) => {
                // The server expects an ack or it will eventually close.
                let ack = HeartbeatAck {
                    stream_id: Some(0),
                    last_stream_id_received: Some(session.last_stream_id_received),
                    status: Some(0),
                };
                let frame = mcs::encode_frame(mcs::HEARTBEAT_ACK_TAG, &ack);
                if let Err(error) = session.send(&frame).await {
                    warn!("heartbeat ack send failed: {error}");
                }
                Ok(())
            }
            Message::LoginRequest(_) => {
                warn!("ignoring client-bound login request");
                Ok(())
            }
        }
    }

    async fn handle_login_response<S>(
        &mut self,
        session: &mut Session<S>,
        response: mcs::LoginResponse,
    ) -> Result<(), ReceiveError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if let Some(error) = &response.error {
            warn!("login response carried error {}: {}", error.code, error.message());
        }
        let last_stream_id = response.last_stream_id_received();
        debug!("logged in, last stream id {last_stream_id}");

        // The server has acknowledged everything sent with the login
        // request. The set is not re-emitted here, so the host's persisted
        // copy keeps the old ids until the next data message arrives.
        self.persistent_ids.clear();
        session.last_stream_id_received = last_stream_id;

        self.send_heartbeat(session).await;

        if !session.logged_in {
            session.logged_in = true;
            self.emitter.emit(
                Event::Connected,
                &format!("connected to {}", self.config.host),
            );
        }
        Ok(())
    }

    /// Submits one heartbeat ping echoing the server's last stream id. Send
    /// failures are logged only; the next read surfaces any real fault.
    async fn send_heartbeat<S: AsyncRead + AsyncWrite>(&self, session: &Session<S>) {
        let last_stream_id_received = session.last_stream_id_received;
        let ping = HeartbeatPing {
            stream_id: Some(0),
            last_stream_id_received: Some(last_stream_id_received),
            status: Some(0),
        };
        match session.send(&mcs::encode_frame(mcs::HEARTBEAT_PING_TAG, &ping)).await {
            Ok(()) => {
                if self.config.verbose {
                    debug!("sent heartbeat, echoed stream id {last_stream_id_received}");
                }
            }
            Err(error) => warn!("heartbeat send failed: {error}"),
        }
    }

    /// Schedules the next heartbeat. A single timer is pending at a time;
    /// each ack cancels and replaces it.
    fn handle_heartbeat_ack<S>(&self, session: &mut Session<S>, ack: &HeartbeatAck)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let last_stream_id = ack.last_stream_id_received();
        if self.config.verbose {
            debug!(
                "heartbeat ack, status {} stream {} last {}",
                ack.status(),
                ack.stream_id(),
                last_stream_id
            );
        }
        session.last_stream_id_received = last_stream_id;

        let write_half = Arc::clone(&session.write_half);
        let interval = self.config.heartbeat_interval;
        let task = tokio::spawn(async move {
            time::sleep(interval).await;
            let ping = HeartbeatPing {
                stream_id: Some(0),
                last_stream_id_received: Some(last_stream_id),
                status: Some(0),
            };
            let frame = mcs::encode_frame(mcs::HEARTBEAT_PING_TAG, &ping);
            if let Err(error) = send_all(&write_half, &frame).await {
                warn!("heartbeat send failed: {error}");
            }
        });
        if let Some(previous) = session.heartbeat.replace(task) {
            previous.abort();
        }
    }

    fn handle_data_message(&mut self, stanza: &DataMessageStanza) {
        let persistent_id = stanza.persistent_id();
        if !persistent_id.is_empty() {
            self.persistent_ids.push(persistent_id.to_string());
            let joined = join_persistent_ids(&self.persistent_ids);
            self.emitter.emit(Event::PersistentId, &joined);
        }

        match self.decrypt(stanza) {
            Ok(plaintext) => {
                let text = String::from_utf8_lossy(&plaintext);
                self.emitter.emit(Event::Message, &text);
            }
            Err(DecryptError::EmptyPayload) => {}
            Err(error) => warn!("dropping data message: {error}"),
        }
    }

    fn decrypt(&self, stanza: &DataMessageStanza) -> Result<Vec<u8>, DecryptError> {
        let ciphertext = stanza.raw_data();
        if ciphertext.is_empty() {
            return Err(DecryptError::EmptyPayload);
        }
        let salt = decode_crypto_header(stanza, "encryption", SALT_LEN)?;
        let dh = decode_crypto_header(stanza, "crypto-key", PUBLIC_KEY_LEN)?;

        let block =
            AesGcmEncryptedBlock::new(&dh, &salt, self.config.record_size, ciphertext.to_vec())?;
        Ok(ece::legacy::decrypt_aesgcm(
            &self.credentials.key_components,
            &self.credentials.auth_secret,
            &block,
        )?)
    }

    /// Refreshes the device checkin. Failures are logged only; a stale
    /// checkin does not prevent the login attempt.
    async fn check_in(&self) {
        let result = gcm::check_in(
            &self.http,
            Some(self.credentials.android_id),
            Some(self.credentials.security_token),
        )
        .await;
        match result {
            Ok(response) => debug!("checked in as device {}", response.android_id()),
            Err(error) => warn!("pre-connect check-in failed: {error}"),
        }
    }
}

/// Pulls `<prefix>=<base64url>` out of the stanza's app data and decodes it.
fn decode_crypto_header(
    stanza: &DataMessageStanza,
    key: &'static str,
    expected: usize,
) -> Result<Vec<u8>, DecryptError> {
    let value = stanza
        .app_data_value(key)
        .ok_or(DecryptError::HeaderMissing { field: key })?;
    let encoded = value
        .split_once('=')
        .map(|(_, encoded)| encoded)
        .ok_or(DecryptError::HeaderMissing { field: key })?;
    let bytes = BASE64_URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|source| DecryptError::HeaderEncoding { field: key, source })?;
    if bytes.len() != expected {
        return Err(DecryptError::HeaderLength {
            field: key,
            len: bytes.len(),
            expected,
        });
    }
    Ok(bytes)
}
