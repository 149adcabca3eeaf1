//! Reply slots: one-shot nodes bound to a reply callback.
//!
//! A slot wraps a private node whose owner handle travels with an outbound
//! call. The first REPLY or ERROR addressed to the node fires the callback
//! and destroys the node; dropping the slot before the reply arrives cancels
//! it the same way.

use busbar_variant::signature;

use crate::error::{BusError, Result};
use crate::handle::Handle;
use crate::message::Message;
use crate::node::Node;
use crate::peer::Peer;

/// Callback fired with the reply (or error) message.
pub(crate) type ReplyFn = Box<dyn FnOnce(&Peer, &mut Message) -> Result<()> + Send>;

pub(crate) struct ReplyState {
    /// Expected payload signature of the reply, enforced as a prefix.
    pub(crate) signature: String,
    /// One-shot callback; `None` once consumed.
    pub(crate) callback: Option<ReplyFn>,
}

/// A one-shot reply-receiving node bound to a callback.
pub struct ReplySlot {
    node: Node,
}

impl ReplySlot {
    /// Create a slot expecting a reply payload matching `signature`
    /// (an empty signature accepts any payload).
    pub fn new<F>(peer: &Peer, sig: &str, callback: F) -> Result<Self>
    where
        F: FnOnce(&Peer, &mut Message) -> Result<()> + Send + 'static,
    {
        signature::validate(sig)?;
        let node = Node::new(peer);
        *node.shared().reply.lock() = Some(ReplyState {
            signature: sig.to_string(),
            callback: Some(Box::new(callback)),
        });
        Ok(Self { node })
    }

    /// The private node receiving the reply.
    #[must_use]
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Whether the callback has not fired yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.node
            .shared()
            .reply
            .lock()
            .as_ref()
            .is_some_and(|state| state.callback.is_some())
    }

    /// The slot node's owner handle, attached to the outbound call.
    pub(crate) fn handle(&self) -> Result<Handle> {
        self.node
            .handle()
            .ok_or_else(|| BusError::invalid("reply slot node was released"))
    }
}

impl std::fmt::Debug for ReplySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplySlot")
            .field("node", &self.node)
            .field("pending", &self.is_pending())
            .finish()
    }
}
