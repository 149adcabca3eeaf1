//! Environment integration: peer inheritance through `BUS1_PEER_FD`.

use std::os::fd::RawFd;

use tracing::debug;

use crate::error::{BusError, Result};
use crate::peer::Peer;

/// Environment variable naming the endpoint fd to adopt.
pub const PEER_FD_ENV: &str = "BUS1_PEER_FD";

/// Adopt the peer whose endpoint fd is published in `BUS1_PEER_FD`.
pub fn from_environment() -> Result<Peer> {
    let value = std::env::var(PEER_FD_ENV)
        .map_err(|_| BusError::not_found(format!("{PEER_FD_ENV} is not set")))?;
    let fd: RawFd = value.trim().parse().map_err(|_| {
        BusError::invalid(format!("{PEER_FD_ENV} holds '{value}', expected a decimal fd"))
    })?;
    debug!(fd, "adopting peer from environment");
    Peer::adopt(fd)
}

/// Publish the peer's endpoint fd in `BUS1_PEER_FD` for children to adopt.
pub fn export_to_environment(peer: &Peer) -> Result<()> {
    std::env::set_var(PEER_FD_ENV, peer.fd().to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test: the variable is process-global and the test runner is
    // multi-threaded.
    #[test]
    fn test_export_and_adopt() {
        let peer = Peer::open_at("loopback://t-env").unwrap();
        peer.export_to_environment().unwrap();
        let adopted = Peer::from_environment().unwrap();
        assert_eq!(adopted.fd(), peer.fd());

        std::env::set_var(PEER_FD_ENV, "not-a-number");
        assert!(matches!(
            from_environment(),
            Err(BusError::InvalidArgument(_))
        ));

        std::env::remove_var(PEER_FD_ENV);
        assert!(matches!(from_environment(), Err(BusError::NotFound(_))));
    }
}
