//! Integration tests for the capability graph: handle deduplication,
//! attachment rules and lifetime notifications.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use busbar_core::error::BusError;
use busbar_core::message::{Message, MessageKind};
use busbar_core::node::Node;
use busbar_core::peer::Peer;
use busbar_core::transport::loopback::endpoint_stats;

#[test]
fn test_duplicate_attach_returns_first_index() {
    let peer = Peer::open_at("loopback://core-dup-attach").unwrap();
    let node = Node::new(&peer);
    let handle = node.handle().unwrap();

    let mut msg = Message::new_data(&peer);
    assert_eq!(msg.append_handle(&handle).unwrap(), 0);
    assert_eq!(msg.append_handle(&handle).unwrap(), 0);
    assert_eq!(msg.n_handles(), 1);

    // A clone is the same capability.
    let other = handle.clone();
    assert_eq!(msg.append_handle(&other).unwrap(), 0);

    // A second node's handle gets a fresh slot.
    let node2 = Node::new(&peer);
    let handle2 = node2.handle().unwrap();
    assert_eq!(msg.append_handle(&handle2).unwrap(), 1);
}

#[test]
fn test_handle_dedup_on_recv_releases_once() {
    let a = Peer::open_at("loopback://core-dedup-recv").unwrap();
    let b = Peer::open_at("loopback://core-dedup-recv").unwrap();

    let node = Node::new(&a);
    let handle = node.handle().unwrap();
    let in_b = handle.transfer(&b).unwrap();
    let id = handle.id();
    assert_eq!(in_b.id(), id);

    // B references the same node both as destination and as an attachment.
    let mut msg = Message::new_data(&b);
    msg.append_handle(&in_b).unwrap();
    msg.send(&[&in_b]).unwrap();

    let before = endpoint_stats(a.fd()).unwrap();
    let inbound = a.recv().unwrap().expect("message delivered");
    let after = endpoint_stats(a.fd()).unwrap();

    // Same handle object, and exactly one redundant kernel ref released.
    assert_eq!(inbound.handle(0).unwrap(), &handle);
    assert_eq!(after.releases - before.releases, 1);
}

#[test]
fn test_out_of_range_accessors() {
    let peer = Peer::open_at("loopback://core-range").unwrap();
    let msg = Message::new_data(&peer);
    assert!(matches!(msg.handle(0), Err(BusError::Range { .. })));
    assert!(matches!(msg.fd(0), Err(BusError::Range { .. })));
}

#[test]
fn test_data_without_destination_is_invalid() {
    let peer = Peer::open_at("loopback://core-no-dest").unwrap();
    let mut msg = Message::new_data(&peer);
    assert!(matches!(
        msg.send(&[]),
        Err(BusError::InvalidArgument(_))
    ));
}

#[test]
fn test_duplicate_handles_in_one_send_rejected() {
    let a = Peer::open_at("loopback://core-dup-send").unwrap();
    let (_b, _root, dest) = a.clone_peer().unwrap();

    let node = Node::new(&a);
    let handle = node.handle().unwrap();
    let mut msg = Message::new_data(&a);
    msg.set_handles(&[handle.clone(), handle.clone()]).unwrap();
    assert!(matches!(msg.send(&[&dest]), Err(BusError::Duplicate(_))));

    // The failed send leaves no residue; the fixed message goes through.
    msg.set_handles(&[handle]).unwrap();
    msg.send(&[&dest]).unwrap();
}

#[test]
fn test_duplicate_destinations_rejected() {
    let a = Peer::open_at("loopback://core-dup-dest").unwrap();
    let (_b, _root, dest) = a.clone_peer().unwrap();
    let mut msg = Message::new_data(&a);
    assert!(matches!(
        msg.send(&[&dest, &dest]),
        Err(BusError::Duplicate(_))
    ));
}

#[test]
fn test_send_links_node_and_handle() {
    let a = Peer::open_at("loopback://core-link").unwrap();
    let (b, _root, dest) = a.clone_peer().unwrap();

    let node = Node::new(&a);
    let handle = node.handle().unwrap();
    assert!(!handle.is_valid());

    let mut msg = Message::new_data(&a);
    msg.append_handle(&handle).unwrap();
    msg.send(&[&dest]).unwrap();

    assert!(handle.is_valid());
    assert_eq!(node.id(), handle.id());
    assert_eq!(handle.node().unwrap(), node);

    // The receiver can address the freshly linked node.
    let inbound = b.recv().unwrap().expect("message delivered");
    let back = inbound.handle(0).unwrap().clone();
    let mut answer = Message::new_data(&b);
    answer.send(&[&back]).unwrap();
    let echoed = a.recv().unwrap().expect("answer delivered");
    assert_eq!(echoed.destination(), Some(node.id()));
    assert!(node.is_live());
}

#[test]
fn test_release_notification_fires_destroy_fn() {
    let a = Peer::open_at("loopback://core-release").unwrap();
    let (b, root, parent_handle) = a.clone_peer().unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    root.set_destroy_fn(move |_node| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    drop(parent_handle);
    let msg = b.recv().unwrap().expect("release notification queued");
    assert_eq!(msg.kind(), MessageKind::NodeRelease);
    assert_eq!(msg.node_id(), Some(root.id()));
    b.dispatch(msg).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_destroy_notification_fires_subscriptions() {
    let a = Peer::open_at("loopback://core-destroy").unwrap();
    let (b, root, parent_handle) = a.clone_peer().unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let _sub = parent_handle.subscribe(move |_handle| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    root.destroy().unwrap();
    let msg = a.recv().unwrap().expect("destroy notification queued");
    assert_eq!(msg.kind(), MessageKind::NodeDestroy);
    a.dispatch(msg).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    drop(b);
}

#[test]
fn test_dropped_subscription_does_not_fire() {
    let a = Peer::open_at("loopback://core-unsub").unwrap();
    let (_b, root, parent_handle) = a.clone_peer().unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let sub = parent_handle.subscribe(move |_handle| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    drop(sub);

    root.destroy().unwrap();
    let msg = a.recv().unwrap().expect("destroy notification queued");
    a.dispatch(msg).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_credentials_stamped_on_delivery() {
    let a = Peer::open_at("loopback://core-creds").unwrap();
    let (b, _root, dest) = a.clone_peer().unwrap();

    let mut msg = Message::new_data(&a);
    msg.write_str("hello").unwrap();
    msg.send(&[&dest]).unwrap();

    let inbound = b.recv().unwrap().expect("message delivered");
    assert_eq!(inbound.uid(), Some(rustix::process::getuid().as_raw()));
    assert_eq!(inbound.gid(), Some(rustix::process::getgid().as_raw()));
    assert!(inbound.pid().is_some());
    assert!(inbound.tid().is_some());
}

#[test]
fn test_payload_roundtrip_and_rewind() {
    let a = Peer::open_at("loopback://core-payload").unwrap();
    let (b, _root, dest) = a.clone_peer().unwrap();

    let mut msg = Message::new_data(&a);
    msg.begin_tuple().unwrap();
    msg.write_u64(7).unwrap();
    msg.write_str("payload").unwrap();
    msg.end_tuple().unwrap();
    msg.send(&[&dest]).unwrap();

    // A sealed message stays readable on the sender side too.
    msg.rewind().unwrap();
    msg.enter().unwrap();
    assert_eq!(msg.read_u64().unwrap(), 7);

    let mut inbound = b.recv().unwrap().expect("message delivered");
    assert_eq!(inbound.kind(), MessageKind::Data);
    assert_eq!(inbound.payload_signature(), Some("(ts)"));
    inbound.enter().unwrap();
    assert_eq!(inbound.read_u64().unwrap(), 7);
    assert_eq!(inbound.read_str().unwrap(), "payload");
    inbound.exit().unwrap();
    inbound.rewind().unwrap();
    inbound.enter().unwrap();
    assert_eq!(inbound.read_u64().unwrap(), 7);
}

#[test]
fn test_send_to_released_node_fails() {
    let a = Peer::open_at("loopback://core-released").unwrap();
    let (_b, root, dest) = a.clone_peer().unwrap();

    root.release();
    let mut msg = Message::new_data(&a);
    assert!(matches!(msg.send(&[&dest]), Err(BusError::Stale(_))));
}

#[test]
fn test_transfer_across_buses_rejected() {
    let a = Peer::open_at("loopback://core-bus-one").unwrap();
    let b = Peer::open_at("loopback://core-bus-two").unwrap();
    let node = Node::new(&a);
    let handle = node.handle().unwrap();
    assert!(matches!(
        handle.transfer(&b),
        Err(BusError::InvalidArgument(_))
    ));
}

#[test]
fn test_wrong_peer_attachments_rejected() {
    let a = Peer::open_at("loopback://core-wrong-peer").unwrap();
    let b = Peer::open_at("loopback://core-wrong-peer").unwrap();
    let node = Node::new(&b);
    let foreign = node.handle().unwrap();

    let mut msg = Message::new_data(&a);
    assert!(matches!(
        msg.append_handle(&foreign),
        Err(BusError::InvalidArgument(_))
    ));
    assert!(matches!(
        msg.set_handles(&[foreign]),
        Err(BusError::InvalidArgument(_))
    ));
}
