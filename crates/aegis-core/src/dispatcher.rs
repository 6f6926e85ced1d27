//! Message routing and lifecycle callbacks.
//!
//! The dispatcher maps a `Protocol`-assigned message tag to a handler, and
//! holds the single-registration lifecycle callbacks (`onSessionStarted`,
//! `onSessionDisconnected`, `onSessionReconnected`, `onSessionExpired`) plus
//! the error sink. A handler panic or returned error is caught and routed to
//! the error sink without tearing down the session — only transport-level
//! failures (decrypt failure run past threshold, queue overflow, timeout) do
//! that, and those are decided in [`crate::reliability`] and
//! [`crate::session`], not here.

use crate::frame::DisconnectReason;
use crate::ids::SessionId;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use tracing::error;

/// A decoded message ready for a handler, paired with the session it arrived on.
pub struct Dispatched<'a, M> {
    /// Session the message arrived on.
    pub session_id: SessionId,
    /// The decoded message value.
    pub message: &'a M,
}

/// Failure reported to the error sink.
#[derive(Debug)]
pub enum DispatchError {
    /// No handler is registered for this message tag.
    UnknownMessageType(u16),
    /// A registered handler panicked or returned an error while processing a message.
    HandlerFailed {
        /// The session the failing message arrived on.
        session_id: SessionId,
        /// The message tag being handled.
        message_tag: u16,
        /// Human-readable failure detail.
        detail: String,
    },
}

type Handler<M> = Box<dyn Fn(SessionId, &M) + Send + Sync>;
type ErrorSink = Box<dyn Fn(DispatchError) + Send + Sync>;
type SessionCallback = Box<dyn Fn(SessionId) + Send + Sync>;
type DisconnectCallback = Box<dyn Fn(SessionId, &DisconnectReason) + Send + Sync>;

/// Registry of message handlers and lifecycle callbacks for a server or client.
///
/// `M` is the decoded message enum produced by the pluggable `Protocol`; the
/// dispatcher itself is generic over it and never inspects message content,
/// only the tag used to look up a handler.
pub struct Dispatcher<M> {
    handlers: HashMap<u16, Handler<M>>,
    error_sink: Option<ErrorSink>,
    on_session_started: Option<SessionCallback>,
    on_session_disconnected: Option<DisconnectCallback>,
    on_session_reconnected: Option<SessionCallback>,
    on_session_expired: Option<SessionCallback>,
}

impl<M> Default for Dispatcher<M> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            error_sink: None,
            on_session_started: None,
            on_session_disconnected: None,
            on_session_reconnected: None,
            on_session_expired: None,
        }
    }
}

impl<M> Dispatcher<M> {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a message tag, replacing any previous one.
    pub fn on_message(&mut self, tag: u16, handler: impl Fn(SessionId, &M) + Send + Sync + 'static) {
        self.handlers.insert(tag, Box::new(handler));
    }

    /// Register the single error sink. Replaces any previous registration, per
    /// the "single registration per server/client" contract.
    pub fn on_error(&mut self, sink: impl Fn(DispatchError) + Send + Sync + 'static) {
        self.error_sink = Some(Box::new(sink));
    }

    /// Register the `onSessionStarted` callback.
    pub fn on_session_started(&mut self, cb: impl Fn(SessionId) + Send + Sync + 'static) {
        self.on_session_started = Some(Box::new(cb));
    }

    /// Register the `onSessionDisconnected` callback.
    pub fn on_session_disconnected(
        &mut self,
        cb: impl Fn(SessionId, &DisconnectReason) + Send + Sync + 'static,
    ) {
        self.on_session_disconnected = Some(Box::new(cb));
    }

    /// Register the `onSessionReconnected` callback.
    pub fn on_session_reconnected(&mut self, cb: impl Fn(SessionId) + Send + Sync + 'static) {
        self.on_session_reconnected = Some(Box::new(cb));
    }

    /// Register the `onSessionExpired` callback.
    pub fn on_session_expired(&mut self, cb: impl Fn(SessionId) + Send + Sync + 'static) {
        self.on_session_expired = Some(Box::new(cb));
    }

    /// Route one decoded message. Unknown tags and handler panics are both
    /// captured and sent to the error sink; neither tears down the session.
    pub fn dispatch(&self, session_id: SessionId, message_tag: u16, message: &M) {
        let Some(handler) = self.handlers.get(&message_tag) else {
            self.report(DispatchError::UnknownMessageType(message_tag));
            return;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(session_id, message)));
        if let Err(panic) = outcome {
            let detail = panic_message(&panic);
            self.report(DispatchError::HandlerFailed {
                session_id,
                message_tag,
                detail,
            });
        }
    }

    /// Fire `onSessionStarted`.
    pub fn fire_session_started(&self, session_id: SessionId) {
        if let Some(cb) = &self.on_session_started {
            cb(session_id);
        }
    }

    /// Fire `onSessionDisconnected`.
    pub fn fire_session_disconnected(&self, session_id: SessionId, reason: &DisconnectReason) {
        if let Some(cb) = &self.on_session_disconnected {
            cb(session_id, reason);
        }
    }

    /// Fire `onSessionReconnected`.
    pub fn fire_session_reconnected(&self, session_id: SessionId) {
        if let Some(cb) = &self.on_session_reconnected {
            cb(session_id);
        }
    }

    /// Fire `onSessionExpired`.
    pub fn fire_session_expired(&self, session_id: SessionId) {
        if let Some(cb) = &self.on_session_expired {
            cb(session_id);
        }
    }

    fn report(&self, err: DispatchError) {
        match &self.error_sink {
            Some(sink) => {
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| sink(err))) {
                    error!(detail = %panic_message(&panic), "error sink itself panicked");
                }
            }
            None => error!(?err, "dispatch error with no error sink registered"),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked with non-string payload".to_string()
    }
}
