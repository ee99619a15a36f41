//! Inter-process communication: messages, endpoints, capabilities.

pub mod capability;
pub mod endpoint;
pub mod message;

pub use endpoint::{Endpoint, EndpointFlags, IpcOp, IpcResult, WaitRecord};
pub use message::{Message, MessageTag, MsgFlags, MSG_MAX_CAPS, MSG_REGS};
