//! Deferred side effects.
//!
//! Components never call the transport or a subscriber directly. They push
//! onto an [`Outbox`] while the reactor lock is held; the reactor drains it
//! in order once the lock is released, so callbacks may re-enter.

use crate::protocol::ClientMessage;

/// Outbound channel to the server.
pub trait Transport: Send + Sync {
    fn send(&self, event_id: &str, message: ClientMessage);
}

pub enum Effect {
    Send {
        event_id: String,
        message: ClientMessage,
    },
    Call(Box<dyn FnOnce() + Send>),
}

#[derive(Default)]
pub struct Outbox {
    effects: Vec<Effect>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, event_id: impl Into<String>, message: ClientMessage) {
        self.effects.push(Effect::Send {
            event_id: event_id.into(),
            message,
        });
    }

    pub fn call(&mut self, f: impl FnOnce() + Send + 'static) {
        self.effects.push(Effect::Call(Box::new(f)));
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    /// Messages queued so far, for inspection.
    pub fn sent(&self) -> impl Iterator<Item = (&str, &ClientMessage)> {
        self.effects.iter().filter_map(|e| match e {
            Effect::Send { event_id, message } => Some((event_id.as_str(), message)),
            Effect::Call(_) => None,
        })
    }

    /// Drop queued messages `keep` rejects. Callbacks stay.
    pub fn retain_sends(&mut self, keep: impl Fn(&ClientMessage) -> bool) {
        self.effects.retain(|e| match e {
            Effect::Send { message, .. } => keep(message),
            Effect::Call(_) => true,
        });
    }

    /// Run every effect in push order.
    pub fn deliver(self, transport: &dyn Transport) {
        for effect in self.effects {
            match effect {
                Effect::Send { event_id, message } => transport.send(&event_id, message),
                Effect::Call(f) => f(),
            }
        }
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("effects", &self.effects.len())
            .finish()
    }
}
