mod error;
mod memory;
mod topic;
mod transport;

pub use error::NodeError;
pub use memory::{MemoryHub, MemoryNode, NodeCall};
pub use topic::{
    SubscriptionSet, Topic, DATA_SUBTOPIC, INBOX_SUBTOPIC, INVITE_CODES_TOPIC, TOPIC_VERSION,
};
pub use transport::{InboundMessage, Node, StreamArgs, SystemEvent};
