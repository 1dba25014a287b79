pub mod constants;
pub mod protocol;
pub mod types;

mod error;

pub use error::ProtocolError;
pub use types::{AttachTicket, CalleeId, CallerInfo, ConnMode, GlobalCalleeId, Role};
