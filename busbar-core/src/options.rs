//! Peer configuration options.

use crate::transport::loopback::{DEFAULT_BUS, POOL_DEFAULT_SIZE, QUEUE_DEFAULT_CAPACITY};

/// Configuration for opening a peer.
///
/// # Examples
///
/// ```no_run
/// use busbar_core::options::PeerOptions;
/// use busbar_core::peer::Peer;
///
/// let peer = Peer::open_with(
///     &PeerOptions::default()
///         .with_path("loopback://session")
///         .with_pool_size(4 << 20)
///         .with_queue_capacity(256),
/// )
/// .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// Bus path to attach to.
    path: String,
    /// Receive pool capacity in bytes. Messages that do not fit are dropped
    /// by the kernel and surface as a stale error on the next dequeue.
    pool_size: usize,
    /// Receive queue capacity in messages. Sends past the cap are dropped
    /// the same way; destroy/release notifications are exempt.
    queue_capacity: usize,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            path: DEFAULT_BUS.to_string(),
            pool_size: POOL_DEFAULT_SIZE,
            queue_capacity: QUEUE_DEFAULT_CAPACITY,
        }
    }
}

impl PeerOptions {
    #[must_use]
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    #[must_use]
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let opts = PeerOptions::default()
            .with_path("loopback://x")
            .with_pool_size(64)
            .with_queue_capacity(2);
        assert_eq!(opts.path(), "loopback://x");
        assert_eq!(opts.pool_size(), 64);
        assert_eq!(opts.queue_capacity(), 2);
    }

    #[test]
    fn test_defaults() {
        let opts = PeerOptions::default();
        assert_eq!(opts.path(), DEFAULT_BUS);
        assert_eq!(opts.pool_size(), POOL_DEFAULT_SIZE);
        assert_eq!(opts.queue_capacity(), QUEUE_DEFAULT_CAPACITY);
    }
}
