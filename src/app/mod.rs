//! Application layer: a [`Peer`] drives the core against a [`Node`](crate::ds::Node).
//!
//! - [`Peer`] - command surface and per-peer context
//! - [`spawn_dispatcher`] - routes inbound messages into the peer
//! - [`PendingOperations`] - correlates published operations with their outcome
//! - [`DependencyResolver`] - debounced topic replay for out-of-order events
//! - [`InviteCodes`] - invite code rendezvous
//!
//! ```ignore
//! let hub = MemoryHub::new();
//! let (node, inbound) = hub.join(public_key);
//! let peer = Arc::new(Peer::new(MemoryStore::new(), node, Config::default()).await?);
//! spawn_dispatcher(peer.clone(), inbound, peer.cancellation_token());
//! let calendar_id = peer.create_calendar(fields).await?;
//! ```

mod correlation;
mod dispatcher;
mod error;
mod invite;
mod peer;
mod resolver;

pub use correlation::{Completion, OperationError, PendingOperations};
pub use dispatcher::{spawn_dispatcher, Delivery};
pub use error::PeerError;
pub use invite::{invite_code, InviteCodeError, InviteCodes, ResolvedCalendar};
pub use peer::Peer;
pub use resolver::DependencyResolver;
