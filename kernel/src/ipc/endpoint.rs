//! Endpoints: synchronous rendezvous IPC.
//!
//! An endpoint keeps two FIFO queues of blocked threads, one per
//! direction; at most one of them is ever nonempty. A sender that finds
//! a queued receiver hands its message over directly (no intermediate
//! buffer) and wakes it; otherwise the sender parks a wait record on
//! its own kernel stack and sleeps. The record outlives the queue entry
//! by construction: the blocked thread cannot touch its stack again
//! until its partner fills the result slot and wakes it.
//!
//! `call` pairs a send with a receive on the caller's bound reply
//! endpoint, created lazily at the first call; `reply` targets the
//! recorded caller's reply endpoint, and `reply_recv` is the server
//! loop's fused fast path.

use super::capability::{cap_copy, cap_move, CapSpace};
use super::message::{Message, MsgFlags, MSG_MAX_CAPS};
use crate::process::Pid;
use crate::spinlock::TicketLock;
use crate::task::scheduler;
use crate::task::Tid;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use bitflags::bitflags;
use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use spin::Mutex;

/// Outcome of an IPC operation, returned to userspace as a negative
/// code on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum IpcResult {
    Ok = 0,
    /// Bad endpoint or malformed message.
    Invalid = -1,
    /// The endpoint was destroyed.
    Dead = -2,
    Timeout = -3,
    /// Capability transfer could not complete.
    Overflow = -4,
    /// Nonblocking operation found no partner.
    NoPartner = -5,
    Busy = -6,
    /// Capability rights do not permit the operation.
    Perm = -7,
}

impl IpcResult {
    pub fn from_i64(value: i64) -> Self {
        match value {
            0 => Self::Ok,
            -2 => Self::Dead,
            -3 => Self::Timeout,
            -4 => Self::Overflow,
            -5 => Self::NoPartner,
            -6 => Self::Busy,
            -7 => Self::Perm,
            _ => Self::Invalid,
        }
    }

    /// The tag-error encoding (positive, small) of a failure.
    pub fn tag_error(self) -> u16 {
        (-(self as i64)) as u16
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EndpointFlags: u32 {
        /// Bound to one specific receiver thread.
        const BOUND        = 1 << 0;
        /// A per-thread reply endpoint.
        const REPLY        = 1 << 1;
        /// Notification semantics (non-blocking signal bits).
        const NOTIFICATION = 1 << 2;
        /// Destroyed; every operation reports Dead.
        const DEAD         = 1 << 3;
    }
}

/// What a blocked thread is waiting to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcOp {
    Send,
    Recv,
    Call,
    Reply,
    ReplyRecv,
}

const PENDING: i64 = i64::MIN;

/// Rendezvous bookkeeping, built on the blocking thread's kernel stack.
/// The partner fills `result` (and `partner`) before waking the owner.
pub struct WaitRecord {
    pub tid: Tid,
    pub op: IpcOp,
    msg: *mut Message,
    pub partner: AtomicU64,
    result: AtomicI64,
}

impl WaitRecord {
    pub fn new(tid: Tid, op: IpcOp, msg: &mut Message) -> Self {
        Self {
            tid,
            op,
            msg,
            partner: AtomicU64::new(0),
            result: AtomicI64::new(PENDING),
        }
    }

    pub fn result(&self) -> Option<IpcResult> {
        match self.result.load(Ordering::Acquire) {
            PENDING => None,
            value => Some(IpcResult::from_i64(value)),
        }
    }

    fn complete(&self, result: IpcResult, partner: Tid) {
        self.partner.store(partner, Ordering::Relaxed);
        self.result.store(result as i64, Ordering::Release);
    }
}

/// Queue entry: a raw pointer onto a blocked thread's stack. Sound
/// because the owning thread sleeps until the record is completed and
/// popped.
struct WaitPtr(*mut WaitRecord);

unsafe impl Send for WaitPtr {}

struct EndpointInner {
    flags: EndpointFlags,
    senders: VecDeque<WaitPtr>,
    receivers: VecDeque<WaitPtr>,
    bound_tid: Tid,
    msgs_sent: u64,
    msgs_received: u64,
}

/// A first-class communication port.
pub struct Endpoint {
    id: u64,
    owner: Option<Pid>,
    inner: TicketLock<EndpointInner>,
}

impl core::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .finish()
    }
}

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// Global endpoint registry. The `Arc` strong count doubles as the
/// endpoint reference count: `endpoint_get` bumps it, dropping the
/// handle releases it.
static ENDPOINTS: Mutex<BTreeMap<u64, Arc<Endpoint>>> = Mutex::new(BTreeMap::new());

impl Endpoint {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn owner(&self) -> Option<Pid> {
        self.owner
    }

    pub fn is_dead(&self) -> bool {
        self.inner.lock().flags.contains(EndpointFlags::DEAD)
    }

    pub fn flags(&self) -> EndpointFlags {
        self.inner.lock().flags
    }

    pub fn bound_tid(&self) -> Tid {
        self.inner.lock().bound_tid
    }

    /// (senders, receivers) queue lengths.
    pub fn queue_lengths(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.senders.len(), inner.receivers.len())
    }

    /// (sent, received) message counters.
    pub fn counters(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.msgs_sent, inner.msgs_received)
    }

    /// Non-blocking phase of send: deliver to a queued receiver, fail
    /// fast, or enqueue `record`. `None` means enqueued; the caller
    /// must sleep on the record.
    pub(crate) fn send_inner(&self, record: &mut WaitRecord) -> Option<IpcResult> {
        let mut inner = self.inner.lock();
        if inner.flags.contains(EndpointFlags::DEAD) {
            return Some(IpcResult::Dead);
        }

        if let Some(receiver) = inner.receivers.pop_front() {
            let receiver = unsafe { &*receiver.0 };
            let result = unsafe { deliver(record, receiver) };
            inner.msgs_sent += 1;
            inner.msgs_received += 1;
            let rtid = receiver.tid;
            receiver.complete(result, record.tid);
            drop(inner);
            scheduler::wake_thread(rtid);
            return Some(result);
        }

        let nonblock = unsafe { (*record.msg).tag.flags().contains(MsgFlags::NONBLOCK) };
        if nonblock {
            return Some(IpcResult::NoPartner);
        }

        debug_assert!(
            inner.receivers.is_empty(),
            "both endpoint queues nonempty"
        );
        inner.senders.push_back(WaitPtr(record));
        None
    }

    /// Non-blocking phase of recv, symmetric to [`Self::send_inner`].
    pub(crate) fn recv_inner(&self, record: &mut WaitRecord) -> Option<IpcResult> {
        let mut inner = self.inner.lock();
        if inner.flags.contains(EndpointFlags::DEAD) {
            return Some(IpcResult::Dead);
        }

        if let Some(sender) = inner.senders.pop_front() {
            let sender = unsafe { &*sender.0 };
            let result = unsafe { deliver(sender, record) };
            inner.msgs_sent += 1;
            inner.msgs_received += 1;
            let stid = sender.tid;
            sender.complete(result, record.tid);
            drop(inner);
            scheduler::wake_thread(stid);
            record.partner.store(stid, Ordering::Relaxed);
            return Some(result);
        }

        let nonblock = unsafe { (*record.msg).tag.flags().contains(MsgFlags::NONBLOCK) };
        if nonblock {
            return Some(IpcResult::NoPartner);
        }

        debug_assert!(inner.senders.is_empty(), "both endpoint queues nonempty");
        inner.receivers.push_back(WaitPtr(record));
        None
    }

    /// Drop `record` from whichever queue holds it (abandoned wait).
    fn cancel(&self, record: *mut WaitRecord) {
        let mut inner = self.inner.lock();
        inner.senders.retain(|w| !core::ptr::eq(w.0, record));
        inner.receivers.retain(|w| !core::ptr::eq(w.0, record));
    }

    /// Kill the endpoint: mark dead and wake every waiter with `Dead`.
    fn destroy(&self) {
        let drained: alloc::vec::Vec<WaitPtr> = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner.flags.insert(EndpointFlags::DEAD);
            inner
                .senders
                .drain(..)
                .chain(inner.receivers.drain(..))
                .collect()
        };
        for waiter in drained {
            let record = unsafe { &*waiter.0 };
            record.complete(IpcResult::Dead, 0);
            scheduler::wake_thread(record.tid);
        }
    }
}

/// Copy one message from sender to receiver: tag and register words in
/// full, the out-of-line part truncated to the shorter buffer, and the
/// declared capabilities transferred between the two processes' cspaces.
///
/// # Safety
///
/// Both records' message pointers must be live and disjoint.
unsafe fn deliver(sender: &WaitRecord, receiver: &WaitRecord) -> IpcResult {
    let src = unsafe { &mut *sender.msg };
    let dst = unsafe { &mut *receiver.msg };

    dst.tag = src.tag;
    dst.regs = src.regs;
    dst.sender = sender.tid;

    if let (Some(sbuf), Some(dbuf)) = (src.buffer, dst.buffer) {
        let n = sbuf.len.min(dbuf.len);
        if n > 0 {
            unsafe { core::ptr::copy_nonoverlapping(sbuf.ptr, dbuf.ptr, n) };
        }
    }

    let cap_count = src.tag.caps();
    let transfer_flags = src.tag.flags();
    let wants_transfer = cap_count > 0
        && (transfer_flags.contains(MsgFlags::GRANT) || transfer_flags.contains(MsgFlags::DONATE));
    if wants_transfer {
        match transfer_caps(sender.tid, receiver.tid, src, dst, cap_count, transfer_flags) {
            Ok(moved) => {
                dst.tag = dst.tag.with_caps(moved);
            }
            Err(result) => {
                dst.tag = dst.tag.with_caps(0).with_error(result.tag_error());
                return result;
            }
        }
    } else {
        dst.tag = dst.tag.with_caps(0);
        dst.caps = [0; MSG_MAX_CAPS];
    }

    IpcResult::Ok
}

/// Move or copy the tagged capability slots from the sender's cspace
/// into the receiver's, recording the new slot indices in the received
/// message.
fn transfer_caps(
    sender_tid: Tid,
    receiver_tid: Tid,
    src: &Message,
    dst: &mut Message,
    count: usize,
    flags: MsgFlags,
) -> Result<usize, IpcResult> {
    let src_space = cspace_of(sender_tid).ok_or(IpcResult::Perm)?;
    let dst_space = cspace_of(receiver_tid).ok_or(IpcResult::Overflow)?;

    let mut moved = 0;
    for i in 0..count {
        let slot = src.caps[i];
        let transferred = if flags.contains(MsgFlags::DONATE) {
            cap_move(&src_space, slot, &dst_space)
        } else {
            cap_copy(&src_space, slot, &dst_space)
        };
        match transferred {
            Ok(new_slot) => {
                dst.caps[moved] = new_slot;
                moved += 1;
            }
            Err(super::capability::CapError::NoRights) => return Err(IpcResult::Perm),
            Err(_) => return Err(IpcResult::Overflow),
        }
    }
    Ok(moved)
}

fn cspace_of(tid: Tid) -> Option<Arc<CapSpace>> {
    let pid = scheduler::with_thread(tid, |t| t.pid)?;
    crate::process::with_process(pid, |p| p.cspace.clone())
}

/// Create an endpoint and link it into the registry. A `None` owner is
/// a kernel-internal endpoint.
pub fn endpoint_create(owner: Option<Pid>, flags: EndpointFlags) -> Arc<Endpoint> {
    let id = NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed);
    let ep = Arc::new(Endpoint {
        id,
        owner,
        inner: TicketLock::new(EndpointInner {
            flags,
            senders: VecDeque::new(),
            receivers: VecDeque::new(),
            bound_tid: 0,
            msgs_sent: 0,
            msgs_received: 0,
        }),
    });
    ENDPOINTS.lock().insert(id, ep.clone());
    ep
}

/// Look up a live endpoint, taking a reference.
pub fn endpoint_get(id: u64) -> Option<Arc<Endpoint>> {
    ENDPOINTS.lock().get(&id).cloned()
}

/// Release a reference taken with [`endpoint_get`].
pub fn endpoint_put(ep: Arc<Endpoint>) {
    drop(ep);
}

/// Destroy an endpoint: unlink it, mark it dead, and wake all waiters
/// with `Dead`. Stragglers holding a reference see the dead flag.
pub fn endpoint_destroy(id: u64) -> bool {
    let Some(ep) = ENDPOINTS.lock().remove(&id) else {
        return false;
    };
    ep.destroy();
    true
}

/// Registered endpoint count (diagnostics).
pub fn endpoint_count() -> usize {
    ENDPOINTS.lock().len()
}

/// Sleep until the partner completes `record`, or cancel on hosted
/// builds, which cannot truly block.
fn block_on(ep: &Endpoint, record: &mut WaitRecord) -> IpcResult {
    loop {
        if let Some(result) = record.result() {
            return result;
        }
        scheduler::block_current();
        #[cfg(not(target_os = "none"))]
        {
            // Hosted: one scheduling pass, then give up the slot so the
            // stack-held record never dangles.
            ep.cancel(record);
            return record.result().unwrap_or(IpcResult::Busy);
        }
    }
}

/// Blocking send.
pub fn send(ep: &Endpoint, msg: &mut Message) -> IpcResult {
    let tid = scheduler::current_tid();
    let mut record = WaitRecord::new(tid, IpcOp::Send, msg);
    match ep.send_inner(&mut record) {
        Some(result) => result,
        None => block_on(ep, &mut record),
    }
}

/// Blocking receive.
pub fn recv(ep: &Endpoint, msg: &mut Message) -> IpcResult {
    let tid = scheduler::current_tid();
    let mut record = WaitRecord::new(tid, IpcOp::Recv, msg);
    match ep.recv_inner(&mut record) {
        Some(result) => result,
        None => block_on(ep, &mut record),
    }
}

/// The caller's bound reply endpoint, created on first use.
pub fn ensure_reply_endpoint(tid: Tid) -> Option<Arc<Endpoint>> {
    let existing = scheduler::with_thread(tid, |t| t.reply_endpoint)?;
    if existing != 0 {
        if let Some(ep) = endpoint_get(existing) {
            return Some(ep);
        }
    }
    let pid = scheduler::with_thread(tid, |t| t.pid)?;
    let owner = (pid != 0).then_some(pid);
    let ep = endpoint_create(owner, EndpointFlags::REPLY | EndpointFlags::BOUND);
    ep.inner.lock().bound_tid = tid;
    scheduler::with_thread(tid, |t| t.reply_endpoint = ep.id());
    Some(ep)
}

/// Send, then receive the reply on the caller's reply endpoint. One
/// call may be in flight per thread.
pub fn call(ep: &Endpoint, msg: &mut Message, reply: &mut Message) -> IpcResult {
    let tid = scheduler::current_tid();
    let Some(reply_ep) = ensure_reply_endpoint(tid) else {
        return IpcResult::Invalid;
    };

    let mut record = WaitRecord::new(tid, IpcOp::Call, msg);
    let sent = match ep.send_inner(&mut record) {
        Some(result) => result,
        None => block_on(ep, &mut record),
    };
    if sent != IpcResult::Ok {
        return sent;
    }
    recv(&reply_ep, reply)
}

/// Reply to `caller`: a send to its bound reply endpoint, which must
/// already be waiting.
pub fn reply_to(caller: Tid, msg: &mut Message) -> IpcResult {
    let reply_ep_id = match scheduler::with_thread(caller, |t| t.reply_endpoint) {
        Some(id) if id != 0 => id,
        _ => return IpcResult::Invalid,
    };
    let Some(reply_ep) = endpoint_get(reply_ep_id) else {
        return IpcResult::Dead;
    };

    let tid = scheduler::current_tid();
    let mut record = WaitRecord::new(tid, IpcOp::Reply, msg);
    match reply_ep.send_inner(&mut record) {
        Some(result) => result,
        None => {
            // The caller is not at its rendezvous; a reply never waits.
            reply_ep.cancel(&mut record);
            IpcResult::NoPartner
        }
    }
}

/// Server fast path: reply to the previous caller, then receive the
/// next request.
pub fn reply_recv(
    ep: &Endpoint,
    caller: Tid,
    reply: &mut Message,
    next: &mut Message,
) -> IpcResult {
    let replied = reply_to(caller, reply);
    if replied != IpcResult::Ok {
        return replied;
    }
    recv(ep, next)
}
