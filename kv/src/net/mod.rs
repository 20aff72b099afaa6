//! Wire messages, framing, transport and the dispatcher that correlates
//! requests with responses (§6, §9's "cursor-free encode/decode").

pub mod dispatcher;
pub mod message;
pub mod transport;

pub use dispatcher::Dispatcher;
pub use message::Message;
pub use transport::Transport;
