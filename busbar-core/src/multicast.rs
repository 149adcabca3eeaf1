//! Multicast groups: dynamic handle sets with atomic fanout.
//!
//! A group collects subscriber handles — typically the freshly minted reply
//! handles of the calls that created the memberships — and delivers one
//! message to all of them in a single kernel send. Membership is exclusive
//! (a handle joins at most one group) and self-cleaning: a destroy
//! notification for a member's node removes it from the group.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{BusError, Result};
use crate::handle::Handle;
use crate::message::Message;
use crate::notify::Subscription;
use crate::peer::Peer;

pub(crate) struct GroupInner {
    members: Mutex<Vec<GroupMember>>,
}

struct GroupMember {
    handle: Handle,
    /// Auto-removal on the member peer's departure.
    _subscription: Subscription,
}

/// A dynamic set of subscriber handles fanned out to atomically.
///
/// Cloning shares the member list, so a call handler can capture the group
/// while the owner keeps using it.
#[derive(Clone)]
pub struct MulticastGroup {
    peer: Peer,
    inner: Arc<GroupInner>,
}

impl MulticastGroup {
    /// Create an empty group owned by `peer`.
    #[must_use]
    pub fn new(peer: &Peer) -> Self {
        Self {
            peer: peer.clone(),
            inner: Arc::new(GroupInner {
                members: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Join the reply handle of `message` to the group.
    ///
    /// Fails not-found when the message carries no reply handle and busy
    /// when that handle already belongs to a group. Installs a destroy
    /// subscription so the handle leaves the group automatically when its
    /// node's owner departs.
    pub fn join(&self, message: &Message) -> Result<()> {
        let handle = message
            .reply_handle()
            .ok_or_else(|| BusError::not_found("message carries no reply handle"))?
            .clone();
        if handle.peer() != &self.peer {
            return Err(BusError::invalid(
                "reply handle is held by a different peer than the group",
            ));
        }
        {
            let mut membership = handle.shared().group.lock();
            if membership.upgrade().is_some() {
                return Err(BusError::busy("handle already joined a multicast group"));
            }
            *membership = Arc::downgrade(&self.inner);
        }
        let group = Arc::downgrade(&self.inner);
        let target = Arc::downgrade(handle.shared());
        let subscription = handle.subscribe(move |_| {
            if let (Some(group), Some(target)) = (group.upgrade(), target.upgrade()) {
                group
                    .members
                    .lock()
                    .retain(|member| !Arc::ptr_eq(member.handle.shared(), &target));
                *target.group.lock() = Weak::new();
            }
            Ok(())
        });
        debug!(id = handle.id(), "handle joined multicast group");
        self.inner.members.lock().push(GroupMember {
            handle,
            _subscription: subscription,
        });
        Ok(())
    }

    /// Remove a handle from the group.
    pub fn leave(&self, handle: &Handle) -> Result<()> {
        let mut members = self.inner.members.lock();
        let before = members.len();
        members.retain(|member| member.handle != *handle);
        if members.len() == before {
            return Err(BusError::not_found("handle is not a group member"));
        }
        drop(members);
        *handle.shared().group.lock() = Weak::new();
        Ok(())
    }

    /// Current member count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.members.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.members.lock().is_empty()
    }

    fn collect_handles(&self) -> Vec<Handle> {
        self.inner
            .members
            .lock()
            .iter()
            .map(|member| member.handle.clone())
            .collect()
    }
}

impl std::fmt::Debug for MulticastGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MulticastGroup")
            .field("members", &self.len())
            .finish()
    }
}

/// Send one message to every member of every group, as a single atomic
/// fanout. A handle present in several groups is rejected by the
/// destination distinctness rule of [`Message::send`].
pub fn multicast_send(groups: &[&MulticastGroup], message: &mut Message) -> Result<()> {
    let handles: Vec<Handle> = groups
        .iter()
        .flat_map(|group| group.collect_handles())
        .collect();
    let refs: Vec<&Handle> = handles.iter().collect();
    message.send(&refs)
}
