//! # Busbar
//!
//! Userspace client library for a capability-based local IPC bus.
//!
//! ## Architecture
//!
//! Busbar is structured as a small runtime with clean layering:
//!
//! - **`busbar-core`**: the capability graph (peers, nodes, handles), the
//!   message object model, dispatch, and the kernel transport contract
//! - **`busbar-variant`**: the self-describing typed payload codec
//! - **`busbar`**: public API surface (this crate)
//!
//! ## Quick Start
//!
//! ```no_run
//! use busbar::prelude::*;
//!
//! # fn main() -> busbar::Result<()> {
//! // A service peer and a client peer connected through a root node.
//! let service = Peer::open_at("loopback://example")?;
//! let (client, root, client_handle) = service.clone_peer()?;
//!
//! // The client owns the root; expose a method on it.
//! let iface = Interface::new("org.example.Echo");
//! iface.add_member("ping", "(t)", "(t)", |node, msg| {
//!     msg.enter()?;
//!     let value = msg.read_u64()?;
//!     let mut reply = Message::new_reply(node.peer(), None)?;
//!     reply.begin_tuple()?;
//!     reply.write_u64(value)?;
//!     reply.end_tuple()?;
//!     reply.send(&[msg.reply_handle().expect("ping carries a reply slot")])?;
//!     Ok(())
//! })?;
//! root.implement(&iface)?;
//!
//! // Call it from the service side.
//! let slot = ReplySlot::new(&service, "(t)", |_peer, reply| {
//!     reply.enter()?;
//!     assert_eq!(reply.read_u64()?, 7);
//!     Ok(())
//! })?;
//! let mut call = Message::new_call(&service, "org.example.Echo", "ping", Some(&slot))?;
//! call.begin_tuple()?;
//! call.write_u64(7)?;
//! call.end_tuple()?;
//! call.send(&[&client_handle])?;
//!
//! // Pump both peers.
//! let inbound = client.recv()?.expect("call queued");
//! client.dispatch(inbound)?;
//! let answer = service.recv()?.expect("reply queued");
//! service.dispatch(answer)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Integration
//!
//! A peer exposes its endpoint fd ([`Peer::fd`]) for the application's
//! poll/epoll loop; `recv` never blocks. Peers can be inherited across
//! `exec` through the `BUS1_PEER_FD` environment variable
//! ([`Peer::from_environment`] / [`Peer::export_to_environment`]).

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow some pedantic patterns
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

// Re-export core types
pub use busbar_core::dispatch::{
    ERROR_ERRNO, ERROR_INVALID_INTERFACE, ERROR_INVALID_MEMBER, ERROR_INVALID_SIGNATURE,
    ERROR_MISSING_ROOT_INTERFACE, ERROR_NODE_DESTROYED,
};
pub use busbar_core::env::PEER_FD_ENV;
pub use busbar_core::error::{BusError, Result};
pub use busbar_core::handle::Handle;
pub use busbar_core::interface::{Interface, Member};
pub use busbar_core::message::{Message, MessageKind};
pub use busbar_core::multicast::{multicast_send, MulticastGroup};
pub use busbar_core::node::{Node, NodeState};
pub use busbar_core::notify::Subscription;
pub use busbar_core::options::PeerOptions;
pub use busbar_core::peer::Peer;
pub use busbar_core::reply::ReplySlot;
pub use busbar_core::transport::{Credentials, HANDLE_INVALID};
pub use busbar_variant::{Value, Variant, VariantBuilder, VariantCursor, VariantError};
pub use bytes::Bytes;

/// Transport-level surface: the kernel device contract and the loopback bus.
pub mod transport {
    pub use busbar_core::transport::loopback::{
        endpoint_stats, EndpointStats, DEFAULT_BUS, POOL_DEFAULT_SIZE, QUEUE_DEFAULT_CAPACITY,
    };
    pub use busbar_core::transport::{
        ClonedEndpoint, PoolSlice, Received, SendDesc, Transport, NODE_FLAG_ALLOCATE,
        NODE_FLAG_MANAGED, NODE_FLAG_PERSISTENT, SEND_FLAG_SEED, SEND_FLAG_SILENT,
    };
}

/// The working set, importable in one line.
pub mod prelude {
    pub use busbar_core::prelude::*;
    pub use busbar_variant::{Value, Variant, VariantBuilder};
}

pub mod dev_tracing;
