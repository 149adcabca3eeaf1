//! Peer inheritance through the environment: `BUS1_PEER_FD` round-trips to
//! the same endpoint, and transfers connect peers that opened the bus
//! independently.

use busbar::prelude::*;
use busbar::PEER_FD_ENV;

#[test]
fn test_environment_adoption_shares_endpoint() {
    let origin = Peer::open_at("loopback://e2e-env").unwrap();
    let (remote, _root, remote_to_origin) = {
        // A second endpoint on the same bus, connected via transfer.
        let other = Peer::open_at("loopback://e2e-env").unwrap();
        let node = Node::new(&origin);
        let handle = node.handle().unwrap();
        let transferred = handle.transfer(&other).unwrap();
        (other, node, transferred)
    };

    origin.export_to_environment().unwrap();
    let adopted = Peer::from_environment().unwrap();
    assert_eq!(adopted.fd(), origin.fd());
    std::env::remove_var(PEER_FD_ENV);

    // A message sent to the origin's node is visible through the adopted
    // peer object: both wrap the same endpoint.
    let mut msg = Message::new_data(&remote);
    msg.write_str("inherited").unwrap();
    msg.send(&[&remote_to_origin]).unwrap();

    let mut inbound = adopted.recv().unwrap().expect("message delivered");
    assert_eq!(inbound.read_str().unwrap(), "inherited");
    assert!(origin.recv().unwrap().is_none());
}
