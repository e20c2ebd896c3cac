//! Request/response delivery seam and verb dispatch.

use super::rpc::{Message, Verb};
use crate::error::{NetworkError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Why a request produced no response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// No response before the deadline.
    Timeout,
    /// The peer could not be reached.
    Unreachable,
    /// The peer has no handler for the verb.
    NoHandler,
    /// The exchange failed for another reason.
    Error(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::Unreachable => write!(f, "unreachable"),
            FailureReason::NoHandler => write!(f, "no handler"),
            FailureReason::Error(e) => write!(f, "{}", e),
        }
    }
}

/// Outbound request/response messaging.
///
/// Failures come back as a [`FailureReason`] value; callers apply their own
/// deadlines around `request`.
#[async_trait::async_trait]
pub trait MessageDelivery: Send + Sync + fmt::Debug {
    /// Send `message` to `to` and wait for the response.
    async fn request(&self, to: SocketAddr, message: Message) -> std::result::Result<Message, FailureReason>;
}

/// Handler for one inbound verb.
pub trait VerbHandler: Send + Sync + 'static {
    /// Handle an incoming message and optionally return a response.
    fn handle(&self, message: Message) -> Option<Message>;
}

/// Verb handlers of one node.
#[derive(Default, Clone)]
pub struct VerbHandlers {
    handlers: Arc<RwLock<HashMap<Verb, Arc<dyn VerbHandler>>>>,
}

impl VerbHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `verb`, replacing any previous one.
    pub fn register(&self, verb: Verb, handler: Arc<dyn VerbHandler>) {
        self.handlers.write().insert(verb, handler);
    }

    /// Dispatch a message to its verb's handler.
    pub fn dispatch(&self, message: Message) -> Result<Option<Message>> {
        let handler = self.handlers.read().get(&message.verb).cloned();
        match handler {
            Some(handler) => Ok(handler.handle(message)),
            None => Err(NetworkError::NoHandler(message.verb.to_string()).into()),
        }
    }
}

impl fmt::Debug for VerbHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verbs: Vec<Verb> = self.handlers.read().keys().copied().collect();
        f.debug_struct("VerbHandlers").field("verbs", &verbs).finish()
    }
}

impl VerbHandler for VerbHandlers {
    fn handle(&self, message: Message) -> Option<Message> {
        self.dispatch(message).ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::network::rpc::Payload;

    struct Echo;

    impl VerbHandler for Echo {
        fn handle(&self, message: Message) -> Option<Message> {
            Some(message.response(message.from, Verb::DiscoverRsp, Payload::Discover))
        }
    }

    #[test]
    fn test_dispatch_by_verb() {
        let handlers = VerbHandlers::new();
        let from: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let err = handlers.dispatch(Message::discover(1, from)).unwrap_err();
        assert!(matches!(err, Error::Network(NetworkError::NoHandler(_))));

        handlers.register(Verb::DiscoverReq, Arc::new(Echo));
        let rsp = handlers.dispatch(Message::discover(1, from)).unwrap().unwrap();
        assert_eq!(rsp.verb, Verb::DiscoverRsp);
    }
}
