//! Network communication layer.

pub mod delivery;
pub mod rpc;
pub mod server;

pub use delivery::{FailureReason, MessageDelivery, VerbHandler, VerbHandlers};
pub use rpc::{Message, Payload, Verb};
pub use server::{NetworkServer, TcpDelivery};
