//! Busbar Core
//!
//! This crate contains the capability-graph and message-transfer runtime of
//! the busbar message bus:
//! - Peers, nodes and handles with their lifetime and identity management
//!   (`peer`, `node`, `handle`)
//! - The message object model: builder, seal, send, receive reconstruction
//!   (`message`)
//! - Object-method dispatch: interfaces, members, reply slots (`interface`,
//!   `reply`, `dispatch`)
//! - Destroy-notification subscriptions and multicast groups (`notify`,
//!   `multicast`)
//! - The kernel transport contract and the in-process loopback bus
//!   (`transport`)
//!
//! A peer is a cooperative single-threaded object: its tables are internally
//! guarded but operations on one peer are meant to run from one thread.
//! Reference counting on peers and handles is atomic, so transport-aware
//! code may finalise objects from any thread.

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

pub mod dispatch;
pub mod env;
pub mod error;
pub mod handle;
pub mod interface;
pub mod message;
pub mod multicast;
pub mod node;
pub mod notify;
pub mod options;
pub mod peer;
pub mod reply;
pub mod transport;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::error::{BusError, Result};
    pub use crate::handle::Handle;
    pub use crate::interface::Interface;
    pub use crate::message::{Message, MessageKind};
    pub use crate::multicast::{multicast_send, MulticastGroup};
    pub use crate::node::{Node, NodeState};
    pub use crate::notify::Subscription;
    pub use crate::options::PeerOptions;
    pub use crate::peer::Peer;
    pub use crate::reply::ReplySlot;
}
