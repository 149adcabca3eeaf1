//! Messages: mutable builders that seal into transmittable artifacts.
//!
//! A message is built against a peer, accumulates a typed payload through
//! the variant codec and grows its attachment arrays (handles, file
//! descriptors). `seal` freezes it into the wire framing — an outer tuple
//! `(tvv)` of kind, header variant and payload variant — after which it can
//! be read and sent any number of times. Receive-side messages are
//! reconstructed from a kernel pool slice and come sealed, with credentials
//! stamped and handle references rebuilt.
//!
//! Pool layout of a received slice is fixed by the kernel ABI: payload
//! bytes, padding to 8, `n_handles × 8` ids, padding to 8, `n_fds × 4`
//! (the fd numbers are delivered out-of-band and the trailing array is used
//! for sizing only).

use std::fmt;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use hashbrown::HashSet;
use smallvec::SmallVec;
use tracing::trace;

use busbar_variant::{Value, Variant, VariantBuilder, VariantCursor};

use crate::error::{BusError, Result};
use crate::handle::Handle;
use crate::node::Node;
use crate::peer::Peer;
use crate::reply::ReplySlot;
use crate::transport::{
    align8, Credentials, PoolSlice, SendDesc, HANDLE_INVALID, NODE_FLAG_ALLOCATE,
    NODE_FLAG_MANAGED, NODE_FLAG_PERSISTENT, SEND_FLAG_SEED,
};

/// Message kinds as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum MessageKind {
    /// Opaque user payload.
    Data = 0,
    /// Synthesised on receive: a referenced node was destroyed.
    NodeDestroy = 1,
    /// Synthesised on receive: all foreign handles to an owned node were
    /// released.
    NodeRelease = 2,
    /// Method call addressed at an interface member.
    Call = 3,
    /// Reply to a call.
    Reply = 4,
    /// Error reply to a call.
    Error = 5,
    /// One-shot named-root graph delivered at peer creation.
    Seed = 6,
}

impl MessageKind {
    fn from_wire(raw: u64) -> Result<Self> {
        Ok(match raw {
            0 => Self::Data,
            1 => Self::NodeDestroy,
            2 => Self::NodeRelease,
            3 => Self::Call,
            4 => Self::Reply,
            5 => Self::Error,
            6 => Self::Seed,
            _ => return Err(BusError::invalid(format!("unknown message kind {raw}"))),
        })
    }

    /// Whether `send` accepts this kind.
    #[must_use]
    pub const fn is_sendable(self) -> bool {
        matches!(
            self,
            Self::Data | Self::Call | Self::Reply | Self::Error | Self::Seed
        )
    }

    /// Whether this kind is synthesised by the receive path.
    #[must_use]
    pub const fn is_notification(self) -> bool {
        matches!(self, Self::NodeDestroy | Self::NodeRelease)
    }
}

enum PayloadState {
    /// Accumulating payload writes.
    Building(VariantBuilder),
    /// Payload replaced wholesale, not yet framed.
    Preset(Variant),
    /// Framed and immutable; the cursor sits inside the payload variant.
    Sealed {
        outer: Variant,
        cursor: VariantCursor,
        payload_sig: String,
    },
}

#[derive(Default)]
struct HeaderFields {
    call_interface: Option<String>,
    call_member: Option<String>,
    error_name: Option<String>,
    seed_roots: Vec<(String, u32)>,
    reply_index: Option<u32>,
}

/// One payload crossing the bus, with its attachments.
pub struct Message {
    peer: Peer,
    kind: MessageKind,
    payload: PayloadState,
    handles: SmallVec<[Handle; 4]>,
    fds: SmallVec<[OwnedFd; 2]>,
    call_interface: Option<String>,
    call_member: Option<String>,
    error_name: Option<String>,
    seed_roots: Vec<(String, u32)>,
    reply_index: Option<u32>,
    creds: Option<Credentials>,
    destination: Option<u64>,
    notify_id: Option<u64>,
    slice: Option<PoolSlice>,
}

impl Message {
    fn blank(peer: &Peer, kind: MessageKind) -> Self {
        Self {
            peer: peer.clone(),
            kind,
            payload: PayloadState::Building(VariantBuilder::new()),
            handles: SmallVec::new(),
            fds: SmallVec::new(),
            call_interface: None,
            call_member: None,
            error_name: None,
            seed_roots: Vec::new(),
            reply_index: None,
            creds: None,
            destination: None,
            notify_id: None,
            slice: None,
        }
    }

    /// A data message carrying an opaque payload.
    #[must_use]
    pub fn new_data(peer: &Peer) -> Self {
        Self::blank(peer, MessageKind::Data)
    }

    /// A call to `interface`.`member`, optionally carrying a reply slot
    /// whose node will receive the answer.
    pub fn new_call(
        peer: &Peer,
        interface: &str,
        member: &str,
        reply: Option<&ReplySlot>,
    ) -> Result<Self> {
        let mut msg = Self::blank(peer, MessageKind::Call);
        msg.call_interface = Some(interface.to_string());
        msg.call_member = Some(member.to_string());
        if let Some(slot) = reply {
            let handle = slot.handle()?;
            let index = msg.append_handle(&handle)?;
            msg.reply_index = Some(index as u32);
        }
        Ok(msg)
    }

    /// A reply, optionally carrying a follow-up reply slot of its own.
    pub fn new_reply(peer: &Peer, reply: Option<&ReplySlot>) -> Result<Self> {
        let mut msg = Self::blank(peer, MessageKind::Reply);
        if let Some(slot) = reply {
            let handle = slot.handle()?;
            let index = msg.append_handle(&handle)?;
            msg.reply_index = Some(index as u32);
        }
        Ok(msg)
    }

    /// An error reply named `name` (reverse-domain error identifier).
    #[must_use]
    pub fn new_error(peer: &Peer, name: &str) -> Self {
        let mut msg = Self::blank(peer, MessageKind::Error);
        msg.error_name = Some(name.to_string());
        msg
    }

    /// A seed carrying the peer's named root nodes.
    pub fn new_seed(peer: &Peer, roots: &[(&str, &Node)]) -> Result<Self> {
        let mut msg = Self::blank(peer, MessageKind::Seed);
        for (name, node) in roots {
            let handle = node
                .handle()
                .ok_or_else(|| BusError::invalid("seed node was already released"))?;
            let index = msg.append_handle(&handle)?;
            msg.seed_roots.push(((*name).to_string(), index as u32));
        }
        Ok(msg)
    }

    /// Synthesise a notification message for a kernel destroy/release
    /// record.
    pub(crate) fn notification(peer: &Peer, kind: MessageKind, id: u64) -> Result<Self> {
        debug_assert!(kind.is_notification());
        let mut msg = Self::blank(peer, kind);
        msg.notify_id = Some(id);
        msg.seal()?;
        Ok(msg)
    }

    /// Rebuild a message from a received pool slice.
    pub(crate) fn from_slice(
        peer: &Peer,
        slice: PoolSlice,
        payload_len: usize,
        n_handles: usize,
        destination: u64,
        creds: Credentials,
        fds: Vec<OwnedFd>,
    ) -> Result<Self> {
        let data = slice.data().clone();
        if payload_len > data.len() {
            return Err(BusError::stale("slice payload exceeds pool bounds"));
        }
        let ids_off = align8(payload_len);
        if ids_off + 8 * n_handles > data.len() {
            return Err(BusError::stale("slice handle array exceeds pool bounds"));
        }

        let outer = Variant::from_wire(data.slice(..payload_len))?;
        let (kind, fields, cursor, payload_sig) = open_sealed(&outer)?;
        if !kind.is_sendable() {
            return Err(BusError::stale(format!("pool slice carries kind {kind:?}")));
        }

        let mut handles: SmallVec<[Handle; 4]> = SmallVec::with_capacity(n_handles);
        for k in 0..n_handles {
            let off = ids_off + 8 * k;
            let id = u64::from_le_bytes(data[off..off + 8].try_into().unwrap());
            handles.push(Handle::acquire(peer, id)?);
        }
        if let Some(index) = fields.reply_index {
            if index as usize >= handles.len() {
                return Err(BusError::Range {
                    index: index as usize,
                    len: handles.len(),
                });
            }
        }

        if let Some(node) = peer.lookup_node(destination) {
            node.mark_live();
        }
        trace!(?kind, destination, n_handles, "message reconstructed");

        Ok(Self {
            peer: peer.clone(),
            kind,
            payload: PayloadState::Sealed {
                outer,
                cursor,
                payload_sig,
            },
            handles,
            fds: fds.into(),
            call_interface: fields.call_interface,
            call_member: fields.call_member,
            error_name: fields.error_name,
            seed_roots: fields.seed_roots,
            reply_index: fields.reply_index,
            creds: Some(creds),
            destination: Some(destination),
            notify_id: None,
            slice: Some(slice),
        })
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    #[must_use]
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Whether this message was reconstructed from a received pool slice.
    #[must_use]
    pub fn is_received(&self) -> bool {
        self.slice.is_some()
    }

    /// Kernel id of the destination node, on received messages.
    #[must_use]
    pub fn destination(&self) -> Option<u64> {
        self.destination
    }

    /// Kernel id carried by a notification message.
    #[must_use]
    pub fn node_id(&self) -> Option<u64> {
        self.notify_id
    }

    /// Interface name of a call.
    #[must_use]
    pub fn interface_name(&self) -> Option<&str> {
        self.call_interface.as_deref()
    }

    /// Member name of a call.
    #[must_use]
    pub fn member_name(&self) -> Option<&str> {
        self.call_member.as_deref()
    }

    /// Error name of an error reply.
    #[must_use]
    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    pub(crate) fn seed_roots(&self) -> &[(String, u32)] {
        &self.seed_roots
    }

    /// The reply handle attached to a call or reply, if any.
    #[must_use]
    pub fn reply_handle(&self) -> Option<&Handle> {
        self.reply_index
            .and_then(|index| self.handles.get(index as usize))
    }

    pub fn uid(&self) -> Option<u32> {
        self.creds.map(|c| c.uid)
    }

    pub fn gid(&self) -> Option<u32> {
        self.creds.map(|c| c.gid)
    }

    pub fn pid(&self) -> Option<u32> {
        self.creds.map(|c| c.pid)
    }

    pub fn tid(&self) -> Option<u32> {
        self.creds.map(|c| c.tid)
    }

    #[must_use]
    pub fn n_handles(&self) -> usize {
        self.handles.len()
    }

    /// Attached handle by index.
    pub fn handle(&self, index: usize) -> Result<&Handle> {
        self.handles.get(index).ok_or(BusError::Range {
            index,
            len: self.handles.len(),
        })
    }

    #[must_use]
    pub fn n_fds(&self) -> usize {
        self.fds.len()
    }

    /// Attached file descriptor by index, borrowed from the message.
    pub fn fd(&self, index: usize) -> Result<BorrowedFd<'_>> {
        self.fds
            .get(index)
            .map(AsFd::as_fd)
            .ok_or(BusError::Range {
                index,
                len: self.fds.len(),
            })
    }

    /// Attach a handle; attaching the same handle again returns the index of
    /// the first attachment.
    pub fn append_handle(&mut self, handle: &Handle) -> Result<usize> {
        if handle.peer() != &self.peer {
            return Err(BusError::invalid(
                "handle is held by a different peer than the message",
            ));
        }
        for (index, existing) in self.handles.iter().enumerate() {
            if existing == handle {
                return Ok(index);
            }
        }
        self.handles.push(handle.clone());
        Ok(self.handles.len() - 1)
    }

    /// Attach a file descriptor. The fd is duplicated close-on-exec above
    /// the stdio range; the message owns the duplicate and the caller may
    /// close the original.
    pub fn append_fd(&mut self, fd: BorrowedFd<'_>) -> Result<usize> {
        let dup = rustix::io::fcntl_dupfd_cloexec(fd, 3).map_err(BusError::from)?;
        self.fds.push(dup);
        Ok(self.fds.len() - 1)
    }

    /// Replace the attached handles wholesale.
    pub fn set_handles(&mut self, handles: &[Handle]) -> Result<()> {
        for handle in handles {
            if handle.peer() != &self.peer {
                return Err(BusError::invalid(
                    "handle is held by a different peer than the message",
                ));
            }
        }
        self.handles = handles.iter().cloned().collect();
        Ok(())
    }

    /// Replace the attached file descriptors wholesale, duplicating each.
    pub fn set_fds(&mut self, fds: &[BorrowedFd<'_>]) -> Result<()> {
        let mut owned: SmallVec<[OwnedFd; 2]> = SmallVec::with_capacity(fds.len());
        for fd in fds {
            owned.push(rustix::io::fcntl_dupfd_cloexec(fd, 3).map_err(BusError::from)?);
        }
        self.fds = owned;
        Ok(())
    }

    /// Replace the payload with an already sealed variant.
    pub fn set_payload(&mut self, payload: Variant) -> Result<()> {
        if matches!(self.payload, PayloadState::Sealed { .. }) {
            return Err(BusError::invalid("message is sealed"));
        }
        self.payload = PayloadState::Preset(payload);
        Ok(())
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        matches!(self.payload, PayloadState::Sealed { .. })
    }

    /// Signature of the payload variant, available once sealed.
    #[must_use]
    pub fn payload_signature(&self) -> Option<&str> {
        match &self.payload {
            PayloadState::Sealed { payload_sig, .. } => Some(payload_sig),
            _ => None,
        }
    }

    fn builder(&mut self) -> Result<&mut VariantBuilder> {
        match &mut self.payload {
            PayloadState::Building(b) => Ok(b),
            _ => Err(BusError::invalid("message is sealed")),
        }
    }

    fn reader(&mut self) -> Result<&mut VariantCursor> {
        match &mut self.payload {
            PayloadState::Sealed { cursor, .. } => Ok(cursor),
            _ => Err(BusError::invalid("message is not sealed")),
        }
    }

    pub fn begin_tuple(&mut self) -> Result<()> {
        Ok(self.builder()?.begin_tuple()?)
    }

    pub fn end_tuple(&mut self) -> Result<()> {
        Ok(self.builder()?.end_tuple()?)
    }

    pub fn begin_array(&mut self) -> Result<()> {
        Ok(self.builder()?.begin_array()?)
    }

    pub fn begin_array_of(&mut self, elem_sig: &str) -> Result<()> {
        Ok(self.builder()?.begin_array_of(elem_sig)?)
    }

    pub fn end_array(&mut self) -> Result<()> {
        Ok(self.builder()?.end_array()?)
    }

    pub fn begin_variant(&mut self) -> Result<()> {
        Ok(self.builder()?.begin_variant()?)
    }

    pub fn end_variant(&mut self) -> Result<()> {
        Ok(self.builder()?.end_variant()?)
    }

    pub fn write_bool(&mut self, v: bool) -> Result<()> {
        Ok(self.builder()?.write_bool(v)?)
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        Ok(self.builder()?.write_u8(v)?)
    }

    pub fn write_i16(&mut self, v: i16) -> Result<()> {
        Ok(self.builder()?.write_i16(v)?)
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        Ok(self.builder()?.write_u16(v)?)
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        Ok(self.builder()?.write_i32(v)?)
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        Ok(self.builder()?.write_u32(v)?)
    }

    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        Ok(self.builder()?.write_i64(v)?)
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        Ok(self.builder()?.write_u64(v)?)
    }

    pub fn write_f64(&mut self, v: f64) -> Result<()> {
        Ok(self.builder()?.write_f64(v)?)
    }

    pub fn write_str(&mut self, v: &str) -> Result<()> {
        Ok(self.builder()?.write_str(v)?)
    }

    pub fn write_value(&mut self, v: &Value) -> Result<()> {
        Ok(self.builder()?.write_value(v)?)
    }

    pub fn write_values(&mut self, values: &[Value]) -> Result<()> {
        Ok(self.builder()?.write_values(values)?)
    }

    /// Splice an already sealed variant into the payload.
    pub fn write_variant(&mut self, v: &Variant) -> Result<()> {
        Ok(self.builder()?.write_variant(v)?)
    }

    pub fn enter(&mut self) -> Result<()> {
        Ok(self.reader()?.enter()?)
    }

    pub fn exit(&mut self) -> Result<()> {
        Ok(self.reader()?.exit()?)
    }

    pub fn skip(&mut self) -> Result<()> {
        Ok(self.reader()?.skip()?)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.reader()?.read_bool()?)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.reader()?.read_u8()?)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.reader()?.read_i16()?)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(self.reader()?.read_u16()?)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.reader()?.read_i32()?)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.reader()?.read_u32()?)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.reader()?.read_i64()?)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(self.reader()?.read_u64()?)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(self.reader()?.read_f64()?)
    }

    pub fn read_str(&mut self) -> Result<String> {
        Ok(self.reader()?.read_str()?)
    }

    pub fn read_value(&mut self) -> Result<Value> {
        Ok(self.reader()?.read_value()?)
    }

    pub fn read_values(&mut self, n: usize) -> Result<Vec<Value>> {
        Ok(self.reader()?.read_values(n)?)
    }

    /// Signature of the next payload value, once sealed.
    #[must_use]
    pub fn peek_type(&self) -> Option<String> {
        match &self.payload {
            PayloadState::Sealed { cursor, .. } => cursor.peek_type().map(str::to_string),
            _ => None,
        }
    }

    /// Remaining value count at the payload cursor, once sealed.
    pub fn peek_count(&self) -> Result<u32> {
        match &self.payload {
            PayloadState::Sealed { cursor, .. } => Ok(cursor.peek_count()?),
            _ => Err(BusError::invalid("message is not sealed")),
        }
    }

    /// Reposition the payload cursor at the first payload value.
    pub fn rewind(&mut self) -> Result<()> {
        match &mut self.payload {
            PayloadState::Sealed { outer, cursor, .. } => {
                let (_, _, fresh, _) = open_sealed(outer)?;
                *cursor = fresh;
                Ok(())
            }
            _ => Err(BusError::invalid("message is not sealed")),
        }
    }

    fn build_header(&self) -> Result<Variant> {
        let mut b = VariantBuilder::new();
        match self.kind {
            MessageKind::Data | MessageKind::NodeDestroy | MessageKind::NodeRelease => {
                b.begin_tuple()?;
                b.end_tuple()?;
            }
            MessageKind::Call => {
                let interface = self
                    .call_interface
                    .as_deref()
                    .ok_or_else(|| BusError::invalid("call without an interface name"))?;
                let member = self
                    .call_member
                    .as_deref()
                    .ok_or_else(|| BusError::invalid("call without a member name"))?;
                b.begin_tuple()?;
                b.write_str(interface)?;
                b.write_str(member)?;
                b.write_u32(self.reply_index.unwrap_or(u32::MAX))?;
                b.end_tuple()?;
            }
            MessageKind::Reply => {
                b.write_u32(self.reply_index.unwrap_or(u32::MAX))?;
            }
            MessageKind::Error => {
                let name = self
                    .error_name
                    .as_deref()
                    .ok_or_else(|| BusError::invalid("error message without a name"))?;
                b.write_str(name)?;
            }
            MessageKind::Seed => {
                b.begin_array_of("(su)")?;
                for (name, index) in &self.seed_roots {
                    b.begin_tuple()?;
                    b.write_str(name)?;
                    b.write_u32(*index)?;
                    b.end_tuple()?;
                }
                b.end_array()?;
            }
        }
        Ok(b.seal()?)
    }

    /// Freeze the payload into the wire framing. Idempotent; invoked by
    /// `send` as a side effect.
    pub fn seal(&mut self) -> Result<()> {
        if matches!(self.payload, PayloadState::Sealed { .. }) {
            return Ok(());
        }
        let payload = match std::mem::replace(
            &mut self.payload,
            PayloadState::Preset(Variant::empty()),
        ) {
            PayloadState::Building(b) => b.seal()?,
            PayloadState::Preset(v) => v,
            PayloadState::Sealed { .. } => unreachable!("checked above"),
        };
        let header = self.build_header()?;
        let outer = assemble(self.kind, &header, &payload)?;
        let (_, _, cursor, payload_sig) = open_sealed(&outer)?;
        self.payload = PayloadState::Sealed {
            outer,
            cursor,
            payload_sig,
        };
        Ok(())
    }

    /// Transmit to every destination handle atomically.
    ///
    /// Seals the message as a side effect. Destination handles must be held
    /// by the message's peer, carry valid ids and be pairwise distinct;
    /// attached handles must be pairwise distinct. Seed messages take no
    /// destinations, every other kind takes at least one. On success, every
    /// handle the kernel allocated an id for is linked into the peer —
    /// either all of them or, on failure, none.
    pub fn send(&mut self, destinations: &[&Handle]) -> Result<()> {
        if !self.kind.is_sendable() {
            return Err(BusError::invalid(format!(
                "{:?} messages cannot be sent",
                self.kind
            )));
        }
        let seed = self.kind == MessageKind::Seed;
        if seed && !destinations.is_empty() {
            return Err(BusError::invalid("seed messages take no destinations"));
        }
        if !seed && destinations.is_empty() {
            return Err(BusError::invalid("at least one destination is required"));
        }

        let mut dest_ids: SmallVec<[u64; 4]> = SmallVec::with_capacity(destinations.len());
        let mut seen_dest: HashSet<u64> = HashSet::with_capacity(destinations.len());
        for dest in destinations {
            if dest.peer() != &self.peer {
                return Err(BusError::invalid(
                    "destination handle is held by a different peer",
                ));
            }
            let id = dest.id();
            if id == HANDLE_INVALID {
                return Err(BusError::invalid("destination handle has no kernel id"));
            }
            if !seen_dest.insert(id) {
                return Err(BusError::duplicate(format!(
                    "destination {id} named twice in one send"
                )));
            }
            dest_ids.push(id);
        }

        self.seal()?;

        // Attached handles must be pairwise distinct within one message.
        let mut seen: HashSet<usize> = HashSet::with_capacity(self.handles.len());
        for handle in &self.handles {
            if !seen.insert(std::sync::Arc::as_ptr(handle.shared()) as usize) {
                return Err(BusError::duplicate("handle attached twice to one message"));
            }
        }

        let mut slots: SmallVec<[u64; 4]> = SmallVec::with_capacity(self.handles.len());
        let mut pending: Vec<usize> = Vec::new();
        for (index, handle) in self.handles.iter().enumerate() {
            let id = handle.id();
            if id == HANDLE_INVALID {
                let mut slot = NODE_FLAG_MANAGED | NODE_FLAG_ALLOCATE;
                if seed {
                    slot |= NODE_FLAG_PERSISTENT;
                }
                slots.push(slot);
                pending.push(index);
            } else {
                slots.push(id);
            }
        }

        let segments = match &self.payload {
            PayloadState::Sealed { outer, .. } => outer.segments(),
            _ => unreachable!("sealed above"),
        };
        let fd_refs: Vec<BorrowedFd<'_>> = self.fds.iter().map(AsFd::as_fd).collect();
        let desc = SendDesc {
            destinations: &dest_ids,
            segments: &segments,
            handles: &slots,
            fds: &fd_refs,
            flags: if seed { SEND_FLAG_SEED } else { 0 },
        };
        let allocated = self.peer.transport().send(&desc)?;
        debug_assert_eq!(allocated.len(), slots.len());

        if !pending.is_empty() {
            let items: Vec<_> = pending
                .into_iter()
                .map(|index| {
                    (
                        std::sync::Arc::clone(self.handles[index].shared()),
                        allocated[index],
                    )
                })
                .collect();
            self.peer.link_allocated_handles(&items)?;
        }
        trace!(kind = ?self.kind, destinations = dest_ids.len(), "message sent");
        Ok(())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("sealed", &self.is_sealed())
            .field("handles", &self.handles.len())
            .field("fds", &self.fds.len())
            .field("destination", &self.destination)
            .finish()
    }
}

/// Frame kind, header and payload into the outer `(tvv)` wire variant.
fn assemble(kind: MessageKind, header: &Variant, payload: &Variant) -> Result<Variant> {
    let mut b = VariantBuilder::new();
    b.begin_tuple()?;
    b.write_u64(kind as u64)?;
    b.write_variant(header)?;
    b.write_variant(payload)?;
    b.end_tuple()?;
    Ok(b.seal()?)
}

/// Parse the outer framing and position a cursor inside the payload
/// variant. Returns the kind, the decoded header fields, the positioned
/// cursor and the payload signature.
fn open_sealed(outer: &Variant) -> Result<(MessageKind, HeaderFields, VariantCursor, String)> {
    let mut c = outer.cursor();
    c.enter()?;
    let kind = MessageKind::from_wire(c.read_u64()?)?;
    c.enter()?;
    let mut fields = HeaderFields::default();
    match kind {
        MessageKind::Data | MessageKind::NodeDestroy | MessageKind::NodeRelease => {}
        MessageKind::Call => {
            c.enter()?;
            fields.call_interface = Some(c.read_str()?);
            fields.call_member = Some(c.read_str()?);
            let index = c.read_u32()?;
            fields.reply_index = (index != u32::MAX).then_some(index);
            c.exit()?;
        }
        MessageKind::Reply => {
            let index = c.read_u32()?;
            fields.reply_index = (index != u32::MAX).then_some(index);
        }
        MessageKind::Error => {
            fields.error_name = Some(c.read_str()?);
        }
        MessageKind::Seed => {
            c.enter()?;
            while !c.at_end() {
                c.enter()?;
                let name = c.read_str()?;
                let index = c.read_u32()?;
                c.exit()?;
                fields.seed_roots.push((name, index));
            }
            c.exit()?;
        }
    }
    c.exit()?;
    c.enter()?;
    let payload_sig = c.container_signature().to_string();
    Ok((kind, fields, c, payload_sig))
}
