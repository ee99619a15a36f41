//! The priority-preemptive scheduler.
//!
//! Per-CPU run queue: one FIFO list per priority level plus a bitmap of
//! nonempty levels, so picking the next thread is find-first-set and a
//! pop. The timer tick burns the current thread's quantum and requests
//! a reschedule on expiry or whenever a more urgent thread is runnable;
//! the actual switch happens at the next preemption-safe boundary.
//!
//! Wait channels are the classic sleep/wakeup scheme: a sleeping thread
//! records an opaque channel word, wakeup scans the global registry.
//! Wakeups are edge-triggered; a wakeup with no sleeper queued is lost,
//! so callers must establish the wait before signaling.

use super::context;
use super::thread::{Thread, ThreadFlags, ThreadState, Tid, IDLE_PRIO, MAX_PRIO};
use crate::per_cpu;
use crate::spinlock::TicketLock;
use crate::time;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use spin::Mutex;

/// Global thread registry. Taken only for lifecycle and channel wakeup,
/// never inside the run-queue lock.
static THREADS: Mutex<BTreeMap<Tid, Arc<Mutex<Thread>>>> = Mutex::new(BTreeMap::new());

const BITMAP_WORDS: usize = MAX_PRIO.div_ceil(64);

struct RunQueue {
    queues: [VecDeque<Tid>; MAX_PRIO],
    /// Bit set per nonempty priority list.
    bitmap: [u64; BITMAP_WORDS],
    nr_running: u64,
    current: Tid,
    idle: Tid,
    switches: u64,
}

impl RunQueue {
    fn new(idle: Tid) -> Self {
        Self {
            queues: core::array::from_fn(|_| VecDeque::new()),
            bitmap: [0; BITMAP_WORDS],
            nr_running: 0,
            current: idle,
            idle,
            switches: 0,
        }
    }

    fn enqueue(&mut self, tid: Tid, priority: u8) {
        let prio = (priority as usize).min(MAX_PRIO - 1);
        self.queues[prio].push_back(tid);
        self.bitmap[prio / 64] |= 1 << (prio % 64);
        self.nr_running += 1;
    }

    fn dequeue(&mut self, tid: Tid, priority: u8) -> bool {
        let prio = (priority as usize).min(MAX_PRIO - 1);
        let queue = &mut self.queues[prio];
        if let Some(pos) = queue.iter().position(|&t| t == tid) {
            queue.remove(pos);
            if queue.is_empty() {
                self.bitmap[prio / 64] &= !(1 << (prio % 64));
            }
            self.nr_running -= 1;
            true
        } else {
            false
        }
    }

    /// Most urgent queued priority, if any.
    fn first_set(&self) -> Option<usize> {
        for (word_idx, &word) in self.bitmap.iter().enumerate() {
            if word != 0 {
                return Some(word_idx * 64 + word.trailing_zeros() as usize);
            }
        }
        None
    }

    /// Pop the most urgent runnable thread; idle when empty.
    fn pick_next(&mut self) -> Tid {
        match self.first_set() {
            Some(prio) => {
                let tid = self.queues[prio].pop_front().expect("bitmap said nonempty");
                if self.queues[prio].is_empty() {
                    self.bitmap[prio / 64] &= !(1 << (prio % 64));
                }
                self.nr_running -= 1;
                tid
            }
            None => self.idle,
        }
    }
}

static RUN_QUEUE: TicketLock<Option<RunQueue>> = TicketLock::new(None);

fn with_rq<R>(f: impl FnOnce(&mut RunQueue) -> R) -> Option<R> {
    let mut guard = RUN_QUEUE.lock_irqsave();
    guard.as_mut().map(f)
}

/// Bring up the scheduler: registry, run queue, and the idle thread.
/// Idempotent.
pub fn init() {
    let mut guard = RUN_QUEUE.lock_irqsave();
    if guard.is_some() {
        return;
    }
    let idle = Thread::new_idle().expect("no memory for idle thread");
    let idle_tid = idle.id;
    THREADS.lock().insert(idle_tid, Arc::new(Mutex::new(idle)));
    *guard = Some(RunQueue::new(idle_tid));
    drop(guard);

    per_cpu::set_idle_tid(idle_tid);
    per_cpu::set_current_tid(idle_tid);
    log::info!("sched: ready, idle thread {}", idle_tid);
}

pub fn is_initialized() -> bool {
    RUN_QUEUE.lock_irqsave().is_some()
}

/// Register `thread` and queue it to run. Returns its id.
pub fn spawn(thread: Thread) -> Tid {
    let tid = thread.id;
    let priority = thread.priority;
    THREADS.lock().insert(tid, Arc::new(Mutex::new(thread)));
    with_rq(|rq| rq.enqueue(tid, priority)).expect("scheduler not initialized");
    tid
}

pub fn thread_ref(tid: Tid) -> Option<Arc<Mutex<Thread>>> {
    THREADS.lock().get(&tid).cloned()
}

/// Run `f` on the thread `tid`, if it exists.
pub fn with_thread<R>(tid: Tid, f: impl FnOnce(&mut Thread) -> R) -> Option<R> {
    let arc = thread_ref(tid)?;
    let mut thread = arc.lock();
    Some(f(&mut thread))
}

/// Non-blocking [`with_thread`] for interrupt context: gives up instead
/// of spinning on a lock the interrupted code may hold.
fn with_thread_try<R>(tid: Tid, f: impl FnOnce(&mut Thread) -> R) -> Option<R> {
    let arc = thread_ref(tid)?;
    let mut thread = arc.try_lock()?;
    Some(f(&mut thread))
}

/// Run `f` on the current thread.
pub fn with_current<R>(f: impl FnOnce(&mut Thread) -> R) -> Option<R> {
    let tid = current_tid();
    if tid == per_cpu::NO_THREAD {
        return None;
    }
    with_thread(tid, f)
}

pub fn current_tid() -> Tid {
    with_rq(|rq| rq.current).unwrap_or(per_cpu::NO_THREAD)
}

pub fn runnable_count() -> u64 {
    with_rq(|rq| rq.nr_running).unwrap_or(0)
}

/// Pick the next thread and switch to it.
///
/// The current thread goes back to the tail of its priority list if it
/// is still runnable; a sleeping, stopped, or zombie current stays off
/// the queue. On bare metal this call returns when the caller is next
/// scheduled; hosted builds update the bookkeeping and return at once.
pub fn schedule() {
    per_cpu::preempt_disable();

    loop {
        let Some(switch) = with_rq(|rq| {
            let prev = rq.current;
            if prev != rq.idle {
                let requeue = with_thread(prev, |t| t.is_runnable()).unwrap_or(false);
                if requeue {
                    let prio = with_thread(prev, |t| t.priority).unwrap_or(IDLE_PRIO);
                    rq.enqueue(prev, prio);
                }
            }
            let next = rq.pick_next();
            if next == prev {
                // Nothing better to do (pick_next already pulled prev
                // back off the list if it was requeued).
                None
            } else {
                rq.current = next;
                rq.switches += 1;
                Some((prev, next))
            }
        })
        .flatten() else {
            break;
        };

        let (prev, next) = switch;
        per_cpu::set_current_tid(next);
        per_cpu::count_context_switch();

        let next_stack_top = with_thread(next, |t| {
            t.flags.remove(ThreadFlags::NEED_RESCHED);
            t.last_run_tick = time::ticks();
            t.last_cpu = 0;
            t.kernel_stack_top()
        })
        .unwrap_or(0);
        per_cpu::set_kernel_stack_top(next_stack_top);

        switch_address_space(prev, next);
        switch_context_to(prev, next);

        // Back on this thread (bare metal) or fall through (hosted).
        if !per_cpu::need_resched() {
            break;
        }
        per_cpu::take_need_resched();
    }

    per_cpu::preempt_enable_no_resched();
}

/// Load the next thread's address space if it differs from the
/// previous one. Kernel threads run on whatever tables are live.
fn switch_address_space(prev: Tid, next: Tid) {
    let prev_pid = with_thread(prev, |t| t.pid).unwrap_or(0);
    let next_pid = with_thread(next, |t| t.pid).unwrap_or(0);
    if prev_pid == next_pid || next_pid == 0 {
        return;
    }
    crate::process::activate_address_space(next_pid);
}

#[cfg(target_os = "none")]
fn switch_context_to(prev: Tid, next: Tid) {
    use super::thread::CpuContext;

    let prev_ctx = with_thread(prev, |t| &mut t.context as *mut CpuContext);
    let next_ctx = with_thread(next, |t| &t.context as *const CpuContext);
    if let (Some(old), Some(new)) = (prev_ctx, next_ctx) {
        // The registry outlives both threads' stacks here: prev cannot
        // be reaped while it is the one switching away.
        unsafe { context::switch_context(old, new) };
    }
}

#[cfg(not(target_os = "none"))]
fn switch_context_to(_prev: Tid, _next: Tid) {
    let _ = context::kernel_thread_entry_point();
}

/// Give up the CPU voluntarily.
pub fn yield_now() {
    schedule();
}

/// Timer-tick accounting and preemption policy. Runs in interrupt
/// context with the tick already counted globally.
pub fn scheduler_tick() {
    let Some((current, idle, has_runnable, best_queued)) = with_rq(|rq| {
        (rq.current, rq.idle, rq.nr_running > 0, rq.first_set())
    }) else {
        return;
    };

    let is_idle = current == idle;
    per_cpu::count_tick(is_idle);

    if is_idle {
        if has_runnable {
            per_cpu::set_need_resched();
        }
        return;
    }

    // try_lock throughout: the interrupted context may hold this very
    // thread's lock, and a tick is allowed to miss one accounting step.
    let outcome = with_thread_try(current, |t| {
        t.system_time_ns += time::TICK_NS;
        t.time_slice_ns = t.time_slice_ns.saturating_sub(time::TICK_NS);
        let expired = t.time_slice_ns == 0;
        if expired {
            t.time_slice_ns = time::DEFAULT_TIME_SLICE_NS;
        }
        let more_urgent = matches!(best_queued, Some(prio) if (prio as u8) < t.priority);
        if expired || more_urgent {
            t.flags.insert(ThreadFlags::NEED_RESCHED);
        }
        expired || more_urgent
    });

    if outcome.unwrap_or(false) {
        per_cpu::set_need_resched();
    }
}

/// Sleep the current thread on `channel` (any unique word; by
/// convention the address of the awaited object). Edge-triggered: a
/// wakeup before this call is lost.
pub fn sleep_on(channel: u64) {
    sleep_common(channel, ThreadState::Sleeping);
}

/// Like [`sleep_on`] but not interruptible by anything except an
/// explicit wake.
pub fn sleep_on_uninterruptible(channel: u64) {
    sleep_common(channel, ThreadState::SleepingUninterruptible);
}

fn sleep_common(channel: u64, state: ThreadState) {
    let tid = current_tid();
    with_thread(tid, |t| {
        t.state = state;
        t.wait_channel = channel;
    });
    schedule();
}

/// Block the current thread until [`wake_thread`] targets it.
pub fn block_current() {
    sleep_common(0, ThreadState::Sleeping);
}

/// Wake every thread sleeping on `channel`. Returns how many woke.
pub fn wake_up_channel(channel: u64) -> usize {
    let sleepers: alloc::vec::Vec<(Tid, u8)> = {
        let threads = THREADS.lock();
        threads
            .iter()
            .filter_map(|(&tid, arc)| {
                let t = arc.lock();
                (t.state.is_sleeping() && t.wait_channel == channel)
                    .then_some((tid, t.priority))
            })
            .collect()
    };

    let mut woken = 0;
    for (tid, priority) in sleepers {
        if wake_ready(tid, priority) {
            woken += 1;
        }
    }
    woken
}

/// Wake one specific thread out of its sleep state.
pub fn wake_thread(tid: Tid) -> bool {
    let Some(priority) = with_thread(tid, |t| t.state.is_sleeping().then_some(t.priority))
        .flatten()
    else {
        return false;
    };
    wake_ready(tid, priority)
}

fn wake_ready(tid: Tid, priority: u8) -> bool {
    let became_ready = with_thread(tid, |t| {
        if t.state.is_sleeping() {
            t.set_ready();
            true
        } else {
            false
        }
    })
    .unwrap_or(false);
    if !became_ready {
        return false;
    }

    with_rq(|rq| {
        if rq.current != tid {
            rq.enqueue(tid, priority);
            // A more urgent arrival preempts the current thread at the
            // next safe boundary.
            let cur_prio = with_thread(rq.current, |t| t.priority).unwrap_or(IDLE_PRIO);
            if priority < cur_prio || rq.current == rq.idle {
                per_cpu::set_need_resched();
            }
        }
    });
    true
}

/// Change a thread's priority, requeueing it if it is waiting to run.
pub fn set_priority(tid: Tid, priority: u8) {
    let priority = priority.min(IDLE_PRIO);
    let Some(old) = with_thread(tid, |t| {
        let old = t.priority;
        t.priority = priority;
        old
    }) else {
        return;
    };

    with_rq(|rq| {
        if rq.dequeue(tid, old) {
            rq.enqueue(tid, priority);
        }
    });
}

/// Apply a nice value through the fixed user-band mapping.
pub fn set_nice(tid: Tid, nice: i8) {
    with_thread(tid, |t| t.nice = nice.clamp(-20, 19));
    set_priority(tid, super::thread::nice_to_prio(nice));
}

/// Terminate the current thread: it becomes a zombie and the CPU moves
/// on. On bare metal this never returns.
pub fn exit_current() {
    let tid = current_tid();
    with_thread(tid, |t| {
        t.state = ThreadState::Zombie;
        t.flags.insert(ThreadFlags::EXITING);
    });
    schedule();
}

/// Drop a dead thread from the registry. The process layer calls this
/// while reaping.
pub fn reap_thread(tid: Tid) {
    with_rq(|rq| {
        let prio = with_thread(tid, |t| t.priority).unwrap_or(IDLE_PRIO);
        rq.dequeue(tid, prio);
    });
    with_thread(tid, |t| t.state = ThreadState::Dead);
    THREADS.lock().remove(&tid);
}

/// Scheduler counters for diagnostics.
pub struct SchedStats {
    pub switches: u64,
    pub runnable: u64,
    pub threads: usize,
}

pub fn stats() -> SchedStats {
    let (switches, runnable) = with_rq(|rq| (rq.switches, rq.nr_running)).unwrap_or((0, 0));
    SchedStats {
        switches,
        runnable,
        threads: THREADS.lock().len(),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::init_test_pmm;
    use test_support::{reset, spawn_kernel};

    #[test]
    fn picks_highest_priority_first() {
        let _pmm = init_test_pmm();
        reset();

        let hi = spawn_kernel("hi", 10);
        let lo = spawn_kernel("lo", 20);

        schedule();
        assert_eq!(current_tid(), hi);

        // hi sleeps; lo takes over.
        let channel = 0xDEAD_0001;
        sleep_on(channel);
        assert_eq!(current_tid(), lo);

        // hi wakes; the very next schedule selects it again.
        assert_eq!(wake_up_channel(channel), 1);
        schedule();
        assert_eq!(current_tid(), hi);

        reap_thread(hi);
        reap_thread(lo);
        reset();
    }

    #[test]
    fn fifo_within_one_priority() {
        let _pmm = init_test_pmm();
        reset();

        let a = spawn_kernel("a", 30);
        let b = spawn_kernel("b", 30);
        let c = spawn_kernel("c", 30);

        schedule();
        assert_eq!(current_tid(), a);
        schedule();
        assert_eq!(current_tid(), b);
        schedule();
        assert_eq!(current_tid(), c);
        // Round-robin wraps back to the first arrival.
        schedule();
        assert_eq!(current_tid(), a);

        for tid in [a, b, c] {
            reap_thread(tid);
        }
        reset();
    }

    #[test]
    fn idle_when_queue_empty() {
        let _pmm = init_test_pmm();
        reset();
        schedule();
        assert_eq!(current_tid(), per_cpu::idle_tid());
    }

    #[test]
    fn runnable_thread_queued_exactly_once() {
        let _pmm = init_test_pmm();
        reset();

        let t = spawn_kernel("once", 40);
        assert_eq!(runnable_count(), 1);
        schedule();
        // Now current, so not queued.
        assert_eq!(current_tid(), t);
        assert_eq!(runnable_count(), 0);

        // Yielding with nothing else runnable keeps it current and off
        // the queue.
        yield_now();
        assert_eq!(current_tid(), t);
        assert_eq!(runnable_count(), 0);

        reap_thread(t);
        reset();
    }

    #[test]
    fn tick_expires_quantum_and_requests_resched() {
        let _pmm = init_test_pmm();
        reset();

        let t = spawn_kernel("spin", 50);
        schedule();
        assert_eq!(current_tid(), t);

        let ticks_per_slice = crate::time::DEFAULT_TIME_SLICE_NS / crate::time::TICK_NS;
        per_cpu::take_need_resched();
        for _ in 0..ticks_per_slice {
            scheduler_tick();
        }
        assert!(per_cpu::need_resched(), "expired quantum must request resched");
        assert!(with_thread(t, |th| th.flags.contains(ThreadFlags::NEED_RESCHED)).unwrap());
        // The quantum reset for the next round.
        assert_eq!(
            with_thread(t, |th| th.time_slice_ns).unwrap(),
            crate::time::DEFAULT_TIME_SLICE_NS
        );

        per_cpu::take_need_resched();
        reap_thread(t);
        reset();
    }

    #[test]
    fn urgent_arrival_preempts_at_tick() {
        let _pmm = init_test_pmm();
        reset();

        let lo = spawn_kernel("lo", 60);
        schedule();
        assert_eq!(current_tid(), lo);
        per_cpu::take_need_resched();

        let _hi = spawn_kernel("hi", 5);
        scheduler_tick();
        assert!(per_cpu::need_resched());

        per_cpu::take_need_resched();
        reap_thread(_hi);
        reap_thread(lo);
        reset();
    }

    #[test]
    fn priority_change_requeues() {
        let _pmm = init_test_pmm();
        reset();

        let a = spawn_kernel("a", 70);
        let b = spawn_kernel("b", 80);
        // Flip their order before anything runs.
        set_priority(b, 60);
        schedule();
        assert_eq!(current_tid(), b);

        reap_thread(a);
        reap_thread(b);
        reset();
    }

    #[test]
    fn lost_wakeup_is_edge_triggered() {
        let _pmm = init_test_pmm();
        reset();
        // No sleeper on the channel: the wakeup evaporates.
        assert_eq!(wake_up_channel(0xDEAD_0002), 0);
        reset();
    }

    #[test]
    fn nice_adjusts_user_priority() {
        let _pmm = init_test_pmm();
        reset();
        let t = spawn_kernel("nice", 120);
        set_nice(t, -10);
        assert_eq!(with_thread(t, |th| th.priority).unwrap(), 110);
        reap_thread(t);
        reset();
    }
}
