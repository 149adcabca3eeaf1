//! Named interfaces with typed members.
//!
//! An interface is a named collection of members, each carrying an input and
//! output signature and a call handler. Interfaces are shared by strong
//! reference across nodes; attaching one to a node latches it against
//! further mutation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use busbar_variant::signature;

use crate::error::{BusError, Result};
use crate::message::Message;
use crate::node::Node;

/// Handler invoked for an inbound call on a member.
pub type MemberFn = Arc<dyn Fn(&Node, &mut Message) -> Result<()> + Send + Sync>;

/// One callable member of an interface.
pub struct Member {
    name: String,
    sig_in: String,
    sig_out: String,
    callback: MemberFn,
}

impl Member {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Input signature enforced as a prefix of inbound call payloads.
    #[must_use]
    pub fn signature_in(&self) -> &str {
        &self.sig_in
    }

    /// Output signature the member's replies are expected to carry.
    #[must_use]
    pub fn signature_out(&self) -> &str {
        &self.sig_out
    }

    pub(crate) fn callback(&self) -> &MemberFn {
        &self.callback
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("name", &self.name)
            .field("sig_in", &self.sig_in)
            .field("sig_out", &self.sig_out)
            .finish()
    }
}

struct InterfaceShared {
    name: String,
    members: Mutex<BTreeMap<String, Arc<Member>>>,
    implemented: AtomicBool,
}

/// A named, shareable collection of members.
///
/// # Examples
///
/// ```no_run
/// use busbar_core::interface::Interface;
///
/// let iface = Interface::new("org.example.Calculator");
/// iface
///     .add_member("add", "(tt)", "t", |_node, msg| {
///         msg.enter()?;
///         let a = msg.read_u64()?;
///         let b = msg.read_u64()?;
///         let _ = a + b;
///         Ok(())
///     })
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct Interface {
    shared: Arc<InterfaceShared>,
}

impl Interface {
    /// Create an empty interface named `name`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            shared: Arc::new(InterfaceShared {
                name: name.to_string(),
                members: Mutex::new(BTreeMap::new()),
                implemented: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Register a member.
    ///
    /// Fails busy once the interface has been attached to any node, and
    /// duplicate on a member name collision. Signatures are validated
    /// against the variant grammar.
    pub fn add_member<F>(
        &self,
        name: &str,
        sig_in: &str,
        sig_out: &str,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(&Node, &mut Message) -> Result<()> + Send + Sync + 'static,
    {
        if self.shared.implemented.load(Ordering::Acquire) {
            return Err(BusError::busy(format!(
                "interface '{}' is already implemented",
                self.shared.name
            )));
        }
        signature::validate(sig_in)?;
        signature::validate(sig_out)?;
        let mut members = self.shared.members.lock();
        if members.contains_key(name) {
            return Err(BusError::duplicate(format!(
                "member '{name}' already exists on '{}'",
                self.shared.name
            )));
        }
        members.insert(
            name.to_string(),
            Arc::new(Member {
                name: name.to_string(),
                sig_in: sig_in.to_string(),
                sig_out: sig_out.to_string(),
                callback: Arc::new(callback),
            }),
        );
        Ok(())
    }

    /// Whether the interface has been attached to a node.
    #[must_use]
    pub fn is_implemented(&self) -> bool {
        self.shared.implemented.load(Ordering::Acquire)
    }

    pub(crate) fn latch(&self) {
        self.shared.implemented.store(true, Ordering::Release);
    }

    pub(crate) fn member(&self, name: &str) -> Option<Arc<Member>> {
        self.shared.members.lock().get(name).cloned()
    }

    /// Member names, in order.
    #[must_use]
    pub fn member_names(&self) -> Vec<String> {
        self.shared.members.lock().keys().cloned().collect()
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.shared.name)
            .field("members", &self.member_names())
            .field("implemented", &self.is_implemented())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_registration() {
        let iface = Interface::new("org.example.Test");
        iface.add_member("ping", "", "", |_, _| Ok(())).unwrap();
        assert!(iface.member("ping").is_some());
        assert!(iface.member("pong").is_none());
        assert_eq!(iface.member_names(), vec!["ping".to_string()]);
    }

    #[test]
    fn test_duplicate_member() {
        let iface = Interface::new("org.example.Test");
        iface.add_member("ping", "", "", |_, _| Ok(())).unwrap();
        assert!(matches!(
            iface.add_member("ping", "", "", |_, _| Ok(())),
            Err(BusError::Duplicate(_))
        ));
    }

    #[test]
    fn test_latch_blocks_mutation() {
        let iface = Interface::new("org.example.Test");
        iface.add_member("ping", "", "", |_, _| Ok(())).unwrap();
        iface.latch();
        assert!(matches!(
            iface.add_member("pong", "", "", |_, _| Ok(())),
            Err(BusError::Busy(_))
        ));
    }

    #[test]
    fn test_bad_signature_rejected() {
        let iface = Interface::new("org.example.Test");
        assert!(iface.add_member("m", "(t", "", |_, _| Ok(())).is_err());
        assert!(iface.add_member("m", "tu", "z", |_, _| Ok(())).is_err());
    }
}
