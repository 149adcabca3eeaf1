//! Routing of received messages to nodes, reply slots and subscriptions.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{BusError, Result};
use crate::message::{Message, MessageKind};
use crate::node::{Node, NodeShared};
use crate::notify;
use crate::peer::Peer;

/// Inbound call payload does not match the member's input signature.
pub const ERROR_INVALID_SIGNATURE: &str = "org.bus1.Error.InvalidSignature";
/// The destination node no longer exists.
pub const ERROR_NODE_DESTROYED: &str = "org.bus1.Error.NodeDestroyed";
/// The destination node implements no interface at all.
pub const ERROR_MISSING_ROOT_INTERFACE: &str = "org.bus1.Error.MissingRootInterface";
/// The named interface is not implemented on the destination node.
pub const ERROR_INVALID_INTERFACE: &str = "org.bus1.Error.InvalidInterface";
/// The named member does not exist on the interface.
pub const ERROR_INVALID_MEMBER: &str = "org.bus1.Error.InvalidMember";
/// A call handler failed; the payload carries the POSIX error number.
pub const ERROR_ERRNO: &str = "org.bus1.Error.Errno";

/// Route one received message.
///
/// CALL, REPLY, ERROR, SEED and the notification kinds are consumed; DATA
/// is handed back to the caller.
pub(crate) fn dispatch(peer: &Peer, msg: Message) -> Result<Option<Message>> {
    match msg.kind() {
        MessageKind::NodeDestroy => {
            let id = msg
                .node_id()
                .ok_or_else(|| BusError::invalid("notification without a node id"))?;
            on_node_destroy(peer, id)?;
            Ok(None)
        }
        MessageKind::NodeRelease => {
            let id = msg
                .node_id()
                .ok_or_else(|| BusError::invalid("notification without a node id"))?;
            on_node_release(peer, id)?;
            Ok(None)
        }
        MessageKind::Seed => dispatch_seed(peer, &msg).map(|()| None),
        MessageKind::Data => Ok(Some(msg)),
        MessageKind::Call => dispatch_call(peer, msg),
        MessageKind::Reply | MessageKind::Error => dispatch_reply(peer, msg),
    }
}

/// The node behind one of this peer's handles was destroyed: fire every
/// subscription on that handle.
fn on_node_destroy(peer: &Peer, id: u64) -> Result<()> {
    debug!(id, "dispatching node destroy notification");
    let Some(shared) = peer.lookup_handle(id) else {
        return Ok(());
    };
    notify::fire(peer, &shared)
}

/// All foreign references to an owned node were released: fire the node's
/// release callback, if installed.
fn on_node_release(peer: &Peer, id: u64) -> Result<()> {
    debug!(id, "dispatching node release notification");
    let Some(shared) = peer.lookup_node(id) else {
        return Ok(());
    };
    let callback = shared.destroy_fn.lock().take();
    if let Some(callback) = callback {
        let node = Node::from_shared(peer.clone(), shared);
        callback(&node)?;
    }
    Ok(())
}

/// Atomically replace the peer's named-root table with the nodes carried by
/// a seed message. Previously unclaimed roots are freed.
pub(crate) fn dispatch_seed(peer: &Peer, msg: &Message) -> Result<()> {
    let mut roots: BTreeMap<String, Arc<NodeShared>> = BTreeMap::new();
    for (name, index) in msg.seed_roots() {
        let handle = msg.handle(*index as usize)?;
        let shared = match handle.shared().node.lock().upgrade() {
            Some(existing) => {
                // A handle to a node we already track: the node moves from
                // the id table into the root table.
                peer.unlink_node(existing.id());
                *existing.name.lock() = Some(name.clone());
                existing
            }
            None => NodeShared::for_root(peer, Arc::clone(handle.shared()), name),
        };
        if roots.insert(name.clone(), shared).is_some() {
            return Err(BusError::duplicate(format!(
                "root '{name}' named twice in one seed"
            )));
        }
    }
    debug!(roots = roots.len(), "root table replaced from seed");
    peer.replace_roots(roots);
    Ok(())
}

fn dispatch_call(peer: &Peer, mut msg: Message) -> Result<Option<Message>> {
    let destination = msg
        .destination()
        .ok_or_else(|| BusError::invalid("call without a destination"))?;
    let Some(node_shared) = peer.lookup_node(destination) else {
        error_reply(peer, &msg, ERROR_NODE_DESTROYED, None);
        return Ok(None);
    };

    let interface_name = msg.interface_name().unwrap_or_default().to_string();
    let member_name = msg.member_name().unwrap_or_default().to_string();
    let resolved = {
        let interfaces = node_shared.interfaces.lock();
        if interfaces.is_empty() {
            Err(ERROR_MISSING_ROOT_INTERFACE)
        } else {
            match interfaces.get(&interface_name) {
                None => Err(ERROR_INVALID_INTERFACE),
                Some(interface) => interface.member(&member_name).ok_or(ERROR_INVALID_MEMBER),
            }
        }
    };
    let member = match resolved {
        Ok(member) => member,
        Err(error_name) => {
            warn!(
                interface = %interface_name,
                member = %member_name,
                error = error_name,
                "call resolution failed"
            );
            error_reply(peer, &msg, error_name, None);
            return Ok(None);
        }
    };

    let payload_sig = msg.payload_signature().unwrap_or_default().to_string();
    if !payload_sig.starts_with(member.signature_in()) {
        warn!(
            expected = member.signature_in(),
            found = %payload_sig,
            "call signature mismatch"
        );
        error_reply(peer, &msg, ERROR_INVALID_SIGNATURE, None);
        return Ok(None);
    }

    let node = Node::from_shared(peer.clone(), node_shared);
    match (member.callback())(&node, &mut msg) {
        Ok(()) => Ok(None),
        Err(e) => {
            warn!(
                interface = %interface_name,
                member = %member_name,
                error = %e,
                "call handler failed"
            );
            error_reply(peer, &msg, ERROR_ERRNO, Some(e.errno()));
            Ok(None)
        }
    }
}

fn dispatch_reply(peer: &Peer, mut msg: Message) -> Result<Option<Message>> {
    let destination = msg
        .destination()
        .ok_or_else(|| BusError::invalid("reply without a destination"))?;
    let Some(node_shared) = peer.lookup_node(destination) else {
        // No such node; replies are never answered, so drop.
        return Ok(None);
    };
    let taken = {
        let mut reply = node_shared.reply.lock();
        reply
            .as_mut()
            .and_then(|state| state.callback.take().map(|cb| (state.signature.clone(), cb)))
    };
    let Some((signature, callback)) = taken else {
        return Ok(None);
    };

    let payload_sig = msg.payload_signature().unwrap_or_default().to_string();
    let result = if msg.kind() == MessageKind::Reply && !payload_sig.starts_with(&signature) {
        Err(BusError::SignatureMismatch {
            expected: signature,
            found: payload_sig,
        })
    } else {
        callback(peer, &mut msg)
    };

    // One-shot: the slot node dies with its reply. Errors from the slot are
    // terminal and never answered on the wire.
    let node = Node::from_shared(peer.clone(), node_shared);
    let _ = node.destroy();
    result.map(|()| None)
}

/// Best-effort synthesised ERROR reply; dropped when the call carried no
/// reply handle.
fn error_reply(peer: &Peer, msg: &Message, name: &str, errno: Option<i32>) {
    let Some(reply_handle) = msg.reply_handle() else {
        return;
    };
    let mut error = Message::new_error(peer, name);
    let delivered = errno
        .map_or(Ok(()), |code| error.write_i32(code))
        .and_then(|()| error.send(&[reply_handle]));
    if let Err(e) = delivered {
        warn!(name, error = %e, "failed to deliver error reply");
    }
}
