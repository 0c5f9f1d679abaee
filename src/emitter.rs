//! Callback registry for session events.

use std::collections::HashMap;
use std::fmt;

/// Events surfaced while a session is being driven.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// Login completed; the payload is a human-readable status string.
    Connected,
    /// The persistent-id set grew; the payload is the full `;`-joined set.
    PersistentId,
    /// A data message decrypted; the payload is the plaintext.
    Message,
}

/// Identifies a registered listener so it can be removed later.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerHandle(u64);

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Persistent,
    OneShot,
}

struct Listener {
    id: u64,
    mode: Mode,
    callback: Box<dyn FnMut(&str) + Send>,
}

/// Maps events to listeners, fired in registration order. One-shot listeners
/// are dropped after their first fire; removal goes through the handle
/// returned at registration.
#[derive(Default)]
pub(crate) struct Emitter {
    listeners: HashMap<Event, Vec<Listener>>,
    next_id: u64,
}

impl Emitter {
    fn register(
        &mut self,
        event: Event,
        mode: Mode,
        callback: impl FnMut(&str) + Send + 'static,
    ) -> ListenerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.listeners.entry(event).or_default().push(Listener {
            id,
            mode,
            callback: Box::new(callback),
        });
        ListenerHandle(id)
    }

    pub fn on(
        &mut self,
        event: Event,
        callback: impl FnMut(&str) + Send + 'static,
    ) -> ListenerHandle {
        self.register(event, Mode::Persistent, callback)
    }

    pub fn once(
        &mut self,
        event: Event,
        callback: impl FnMut(&str) + Send + 'static,
    ) -> ListenerHandle {
        self.register(event, Mode::OneShot, callback)
    }

    /// Removes the listener behind `handle`. Returns whether it was present.
    pub fn off(&mut self, event: Event, handle: ListenerHandle) -> bool {
        match self.listeners.get_mut(&event) {
            Some(listeners) => {
                let before = listeners.len();
                listeners.retain(|listener| listener.id != handle.0);
                listeners.len() != before
            }
            None => false,
        }
    }

    /// Invokes every listener for `event` in registration order, dropping
    /// one-shot listeners as they fire.
    pub fn emit(&mut self, event: Event, payload: &str) {
        if let Some(listeners) = self.listeners.get_mut(&event) {
            listeners.retain_mut(|listener| {
                (listener.callback)(payload);
                listener.mode == Mode::Persistent
            });
        }
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut counts = f.debug_struct("Emitter");
        for (event, listeners) in &self.listeners {
            counts.field(&format!("{event:?}"), &listeners.len());
        }
        counts.finish()
    }
}
