//! Seed delivery: named-root reconstruction and atomic root-table swap.

use busbar::prelude::*;

#[test]
fn test_seed_roundtrip_and_adoption() {
    let peer = Peer::open_at("loopback://e2e-seed").unwrap();
    let alpha = Node::new(&peer);
    let beta = Node::new(&peer);

    let mut seed =
        Message::new_seed(&peer, &[("svc.alpha", &alpha), ("svc.beta", &beta)]).unwrap();
    seed.send(&[]).unwrap();

    let alpha_id = alpha.handle().unwrap().id();
    let beta_id = beta.handle().unwrap().id();
    assert_ne!(alpha_id, beta_id);

    // Before the swap the named roots are absent.
    assert!(!peer.has_root("svc.alpha"));
    peer.get_seed().unwrap();
    // After the swap both are present.
    assert_eq!(
        peer.root_names(),
        vec!["svc.alpha".to_string(), "svc.beta".to_string()]
    );

    // Adoption hands back a node whose owner handle carries the original id.
    let iface = Interface::new("svc.alpha");
    iface
        .add_member("probe", "", "", |_node, _msg| Ok(()))
        .unwrap();
    let adopted = peer.implement(&iface).unwrap();
    assert_eq!(adopted.handle().unwrap().id(), alpha_id);
    assert_eq!(adopted.name().as_deref(), Some("svc.alpha"));
    assert!(!peer.has_root("svc.alpha"));
    assert!(peer.has_root("svc.beta"));
}

#[test]
fn test_second_seed_replaces_roots_wholesale() {
    let peer = Peer::open_at("loopback://e2e-seed-swap").unwrap();
    let first = Node::new(&peer);
    let mut seed = Message::new_seed(&peer, &[("svc.first", &first)]).unwrap();
    seed.send(&[]).unwrap();
    peer.get_seed().unwrap();
    assert!(peer.has_root("svc.first"));

    let second = Node::new(&peer);
    let mut seed = Message::new_seed(&peer, &[("svc.second", &second)]).unwrap();
    seed.send(&[]).unwrap();
    peer.get_seed().unwrap();

    // The swap is wholesale: no partial merge is ever visible.
    assert!(!peer.has_root("svc.first"));
    assert_eq!(peer.root_names(), vec!["svc.second".to_string()]);
}

#[test]
fn test_get_seed_without_seed_is_not_found() {
    let peer = Peer::open_at("loopback://e2e-seed-none").unwrap();
    assert!(matches!(peer.get_seed(), Err(BusError::NotFound(_))));
}

#[test]
fn test_seed_with_destinations_is_invalid() {
    let peer = Peer::open_at("loopback://e2e-seed-dest").unwrap();
    let (_child, _root, handle) = peer.clone_peer().unwrap();
    let node = Node::new(&peer);
    let mut seed = Message::new_seed(&peer, &[("svc", &node)]).unwrap();
    assert!(matches!(
        seed.send(&[&handle]),
        Err(BusError::InvalidArgument(_))
    ));
}

#[test]
fn test_adopting_absent_root_is_not_found() {
    let peer = Peer::open_at("loopback://e2e-seed-absent").unwrap();
    let iface = Interface::new("svc.missing");
    assert!(matches!(peer.implement(&iface), Err(BusError::NotFound(_))));
}
