//! Kernel transport contract.
//!
//! The capability bus kernel is consumed through the [`Transport`] trait: a
//! thin, opaque capability offering send, dequeue, handle release, node
//! destruction, endpoint cloning and cross-endpoint handle transfer. The
//! runtime never assumes anything about the implementation beyond this
//! contract, so the same graph code runs against the character device or the
//! in-process [`loopback`] bus.
//!
//! Identifier conventions follow the kernel ABI: ids are opaque 64-bit values
//! minted with the low three bits clear, so a slot carrying allocation flags
//! (`NODE_FLAG_*`) is never a valid id and `HANDLE_INVALID` (all ones) never
//! collides with either.

pub mod loopback;

use std::any::Any;
use std::fmt;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};

use bytes::Bytes;
use smallvec::SmallVec;

use crate::error::Result;

/// Sentinel for a handle or node without a kernel identity yet.
pub const HANDLE_INVALID: u64 = u64::MAX;

/// Slot flag: the kernel manages the lifetime of the minted node.
pub const NODE_FLAG_MANAGED: u64 = 1 << 0;

/// Slot flag: mint a fresh id for this slot during send.
pub const NODE_FLAG_ALLOCATE: u64 = 1 << 1;

/// Slot flag: the node survives the queue drop of its seed message.
pub const NODE_FLAG_PERSISTENT: u64 = 1 << 2;

/// Send flag: store as the endpoint's seed instead of queueing.
pub const SEND_FLAG_SEED: u32 = 1 << 0;

/// Send flag: suppress release notifications for this transmission.
pub const SEND_FLAG_SILENT: u32 = 1 << 1;

/// Whether a handle slot value is a concrete kernel id (as opposed to an
/// allocation request or the invalid sentinel).
#[must_use]
pub const fn is_concrete_id(slot: u64) -> bool {
    slot != HANDLE_INVALID && slot & 0b111 == 0
}

/// Credentials stamped by the kernel when a message is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub tid: u32,
}

/// One send submission: destinations, vectored payload, handle slots, file
/// descriptors and flags.
pub struct SendDesc<'a> {
    /// Destination node ids; empty for seed sends.
    pub destinations: &'a [u64],
    /// Payload segments, concatenated by the kernel into the receiver pool.
    pub segments: &'a [Bytes],
    /// Handle slots: concrete ids or `NODE_FLAG_*` allocation requests.
    pub handles: &'a [u64],
    /// File descriptors to duplicate into each receiver.
    pub fds: &'a [BorrowedFd<'a>],
    /// `SEND_FLAG_*` bits.
    pub flags: u32,
}

/// Result of a successful send: the id now occupying each handle slot, in
/// submission order. Slots that carried a concrete id echo it back.
pub type SendReturn = SmallVec<[u64; 4]>;

/// A kernel-shared pool region holding one received message.
///
/// The region is read-only for userspace and must be handed back so the
/// kernel can reclaim the space; release happens exactly once, explicitly or
/// on drop.
pub struct PoolSlice {
    data: Bytes,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl PoolSlice {
    /// Wrap a pool region with its release action.
    #[must_use]
    pub fn new(data: Bytes, release: Option<Box<dyn FnOnce() + Send>>) -> Self {
        Self { data, release }
    }

    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Hand the region back to the kernel. Idempotent.
    pub fn release(&mut self) {
        if let Some(f) = self.release.take() {
            f();
        }
    }
}

impl Drop for PoolSlice {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for PoolSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolSlice")
            .field("len", &self.data.len())
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// One dequeued kernel record.
#[derive(Debug)]
pub enum Received {
    /// A data message copied into the receive pool.
    Slice {
        /// The pool region: payload, padding, handle id array, fd array.
        slice: PoolSlice,
        /// Length of the payload prefix within the slice.
        payload_len: usize,
        /// Number of handle ids following the payload.
        n_handles: usize,
        /// Id of the destination node, in the receiver's namespace.
        destination: u64,
        /// Sender credentials stamped at delivery.
        creds: Credentials,
        /// File descriptors delivered out-of-band, already receiver-owned.
        fds: Vec<OwnedFd>,
    },
    /// The node behind one of this peer's handles was destroyed.
    NodeDestroy(u64),
    /// All foreign references to a node owned by this peer were dropped.
    NodeRelease(u64),
    /// `n` messages were dropped on pool exhaustion since the last dequeue.
    Dropped(u64),
}

/// A freshly cloned child endpoint plus the connecting root node id.
pub struct ClonedEndpoint {
    /// Transport of the child peer.
    pub transport: Box<dyn Transport>,
    /// Id of the child's root node; the parent holds a handle to it under
    /// the same id.
    pub root_id: u64,
}

/// The kernel device capability consumed by the runtime.
///
/// Implementations must be safe to call from any thread; the runtime itself
/// serializes table access and never holds a lock across these calls.
pub trait Transport: Send + Sync {
    /// Enqueue one message to every destination.
    fn send(&self, desc: &SendDesc<'_>) -> Result<SendReturn>;

    /// Dequeue one record; `seed` drains the stored seed message instead of
    /// the queue. Returns `None` when nothing is pending.
    fn recv(&self, seed: bool) -> Result<Option<Received>>;

    /// Drop this peer's kernel reference on a handle id.
    fn release(&self, id: u64) -> Result<()>;

    /// Destroy locally owned nodes; holders are notified.
    fn destroy(&self, ids: &[u64]) -> Result<()>;

    /// Create a child endpoint connected through a fresh root node.
    fn clone_endpoint(&self) -> Result<ClonedEndpoint>;

    /// Materialise `src_id` (or a freshly allocated id, when given an
    /// allocation request) as a handle in `dst`. Returns the source and
    /// destination ids.
    fn transfer(&self, dst: &dyn Transport, src_id: u64) -> Result<(u64, u64)>;

    /// The pollable endpoint file descriptor.
    fn raw_fd(&self) -> RawFd;

    /// Downcast support for same-bus checks.
    fn as_any(&self) -> &dyn Any;
}

/// Round up to the pool's 8-byte alignment.
#[must_use]
pub const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_discrimination() {
        assert!(is_concrete_id(0));
        assert!(is_concrete_id(8));
        assert!(is_concrete_id(1 << 32));
        assert!(!is_concrete_id(HANDLE_INVALID));
        assert!(!is_concrete_id(NODE_FLAG_MANAGED | NODE_FLAG_ALLOCATE));
    }

    #[test]
    fn test_align8() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(13), 16);
    }

    #[test]
    fn test_pool_slice_release_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let mut slice = PoolSlice::new(
            Bytes::from_static(b"abc"),
            Some(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })),
        );
        slice.release();
        slice.release();
        drop(slice);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
