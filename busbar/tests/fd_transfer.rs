//! File-descriptor transfer: attachment duplicates survive closing the
//! original and reference the same underlying file.

use std::os::fd::{AsFd, AsRawFd};

use busbar::prelude::*;

#[test]
fn test_fd_transfer_roundtrip() {
    let a = Peer::open_at("loopback://e2e-fd").unwrap();
    let (b, _root, a_to_b) = a.clone_peer().unwrap();

    let (read_end, write_end) = rustix::pipe::pipe().unwrap();
    let original = write_end.as_raw_fd();

    let mut msg = Message::new_data(&a);
    assert_eq!(msg.append_fd(write_end.as_fd()).unwrap(), 0);
    assert_eq!(msg.n_fds(), 1);
    // The message owns a duplicate; the original can go away.
    assert_ne!(msg.fd(0).unwrap().as_raw_fd(), original);
    drop(write_end);

    msg.send(&[&a_to_b]).unwrap();
    drop(msg);

    let inbound = b.recv().unwrap().expect("message delivered");
    assert_eq!(inbound.n_fds(), 1);
    let received = inbound.fd(0).unwrap();

    // Same underlying pipe: bytes written through the received fd come out
    // of the original read end.
    rustix::io::write(received, b"x").unwrap();
    let mut buf = [0u8; 1];
    rustix::io::read(&read_end, &mut buf).unwrap();
    assert_eq!(&buf, b"x");
}

#[test]
fn test_set_fds_replaces_and_duplicates() {
    let a = Peer::open_at("loopback://e2e-fd-set").unwrap();
    let (b, _root, a_to_b) = a.clone_peer().unwrap();

    let (read_one, write_one) = rustix::pipe::pipe().unwrap();
    let (read_two, write_two) = rustix::pipe::pipe().unwrap();
    drop(read_one);

    let mut msg = Message::new_data(&a);
    msg.append_fd(write_one.as_fd()).unwrap();
    msg.set_fds(&[write_two.as_fd()]).unwrap();
    assert_eq!(msg.n_fds(), 1);
    drop(write_two);

    msg.send(&[&a_to_b]).unwrap();
    let inbound = b.recv().unwrap().expect("message delivered");
    rustix::io::write(inbound.fd(0).unwrap(), b"y").unwrap();
    let mut buf = [0u8; 1];
    rustix::io::read(&read_two, &mut buf).unwrap();
    assert_eq!(&buf, b"y");
    drop(write_one);
}
