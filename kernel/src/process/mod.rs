//! Processes: address-space owners and thread containers.
//!
//! A process owns its address space, its threads (destruction
//! cascades), a capability space, and the parent/child links that wait
//! and reaping traverse. Kernel threads belong to the pseudo-process
//! pid 0, which has no table entry and no address space of its own.

pub mod fork;

use crate::ipc::capability::CapSpace;
use crate::memory::address_space::AddressSpace;
use crate::memory::layout;
use crate::memory::vma::VmaFlags;
use crate::spinlock::TicketLock;
use crate::syscall::errno::Errno;
use crate::task::thread::DEFAULT_USER_PRIO;
use crate::task::{scheduler, Thread, ThreadState, Tid};
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::VirtAddr;

pub type Pid = u64;

/// Process names are clipped to this many bytes.
pub const PROCESS_NAME_MAX: usize = 16;

/// Largest pid the bitmap allocator hands out.
pub const PID_MAX: usize = 32768;

/// uid/gid triples (real, effective, saved).
#[derive(Debug, Clone, Copy, Default)]
pub struct Credentials {
    pub uid: u32,
    pub euid: u32,
    pub suid: u32,
    pub gid: u32,
    pub egid: u32,
    pub sgid: u32,
}

pub struct Process {
    pub pid: Pid,
    pub ppid: Pid,
    pub pgid: Pid,
    pub sid: Pid,
    pub creds: Credentials,

    /// None for kernel processes.
    pub aspace: Option<Arc<TicketLock<AddressSpace>>>,
    pub cspace: Arc<CapSpace>,

    pub threads: Vec<Tid>,
    pub main_thread: Tid,

    pub children: Vec<Pid>,
    /// Set when the process has exited and awaits reaping.
    pub exit_code: Option<i32>,
    pub exit_signal: u32,

    pub name: String,
}

impl Process {
    pub fn is_zombie(&self) -> bool {
        self.exit_code.is_some()
    }
}

static PROCESS_TABLE: Mutex<BTreeMap<Pid, Arc<Mutex<Process>>>> = Mutex::new(BTreeMap::new());

/// Pid bitmap. Pid 0 is the kernel, pid bits are allocated lowest
/// first and recycled on reap.
struct PidAllocator {
    words: [u64; PID_MAX / 64],
}

impl PidAllocator {
    const fn new() -> Self {
        let mut words = [0u64; PID_MAX / 64];
        words[0] = 1; // pid 0 = kernel, never handed out
        Self { words }
    }

    fn alloc(&mut self) -> Option<Pid> {
        for (i, word) in self.words.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                *word |= 1 << bit;
                return Some((i * 64 + bit) as Pid);
            }
        }
        None
    }

    fn free(&mut self, pid: Pid) {
        let pid = pid as usize;
        if pid > 0 && pid < PID_MAX {
            self.words[pid / 64] &= !(1 << (pid % 64));
        }
    }
}

static PID_ALLOCATOR: TicketLock<PidAllocator> = TicketLock::new(PidAllocator::new());

pub fn allocate_pid() -> Option<Pid> {
    PID_ALLOCATOR.lock().alloc()
}

fn free_pid(pid: Pid) {
    PID_ALLOCATOR.lock().free(pid);
}

pub fn init() {
    log::info!("process: table ready, pids 1..{}", PID_MAX);
}

fn clip_name(name: &str) -> String {
    let mut s = String::from(name);
    s.truncate(PROCESS_NAME_MAX);
    s
}

/// Create a user process: fresh address space with a lazily populated
/// stack region, a main thread entering at `entry`, and an empty
/// capability space. The thread is queued runnable.
pub fn create_user_process(name: &str, entry: u64) -> Result<Pid, Errno> {
    let pid = allocate_pid().ok_or(Errno::EAGAIN)?;

    let mut aspace = AddressSpace::new_user().ok_or(Errno::ENOMEM)?;
    let stack_bottom = layout::USER_STACK_TOP - layout::USER_STACK_SIZE;
    aspace
        .mmap(
            Some(VirtAddr::new(stack_bottom)),
            layout::USER_STACK_SIZE,
            VmaFlags::READ | VmaFlags::WRITE | VmaFlags::ANONYMOUS | VmaFlags::STACK,
            None,
        )
        .map_err(|_| Errno::ENOMEM)?;

    let thread = Thread::new_user(
        clip_name(name),
        pid,
        entry,
        layout::USER_STACK_TOP,
        DEFAULT_USER_PRIO,
    )
    .ok_or(Errno::ENOMEM)?;
    let tid = thread.id;

    let process = Process {
        pid,
        ppid: current_pid(),
        pgid: pid,
        sid: pid,
        creds: Credentials::default(),
        aspace: Some(Arc::new(TicketLock::new(aspace))),
        cspace: Arc::new(CapSpace::new()),
        threads: alloc::vec![tid],
        main_thread: tid,
        children: Vec::new(),
        exit_code: None,
        exit_signal: 0,
        name: clip_name(name),
    };

    let parent = process.ppid;
    PROCESS_TABLE.lock().insert(pid, Arc::new(Mutex::new(process)));
    if parent != 0 {
        with_process(parent, |p| p.children.push(pid));
    }

    scheduler::spawn(thread);
    log::info!("process: created '{}' pid {} tid {}", name, pid, tid);
    Ok(pid)
}

pub fn process_ref(pid: Pid) -> Option<Arc<Mutex<Process>>> {
    PROCESS_TABLE.lock().get(&pid).cloned()
}

pub fn with_process<R>(pid: Pid, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    let arc = process_ref(pid)?;
    let mut process = arc.lock();
    Some(f(&mut process))
}

pub fn process_count() -> usize {
    PROCESS_TABLE.lock().len()
}

/// Pid of the process the current thread belongs to (0 = kernel).
pub fn current_pid() -> Pid {
    scheduler::with_current(|t| t.pid).unwrap_or(0)
}

/// Parent pid of the current process.
pub fn current_ppid() -> Pid {
    with_process(current_pid(), |p| p.ppid).unwrap_or(0)
}

/// Run `f` against the current process's address space.
pub fn with_current_address_space<R>(f: impl FnOnce(&mut AddressSpace) -> R) -> Option<R> {
    with_address_space(current_pid(), f)
}

pub fn with_address_space<R>(pid: Pid, f: impl FnOnce(&mut AddressSpace) -> R) -> Option<R> {
    let aspace = with_process(pid, |p| p.aspace.clone())??;
    let mut guard = aspace.lock();
    Some(f(&mut guard))
}

/// Point the MMU at `pid`'s address space (context-switch path).
pub fn activate_address_space(pid: Pid) {
    #[cfg(target_os = "none")]
    {
        if let Some(aspace) = with_process(pid, |p| p.aspace.clone()).flatten() {
            unsafe { aspace.lock().activate() };
        }
    }
    #[cfg(not(target_os = "none"))]
    let _ = pid;
}

/// Wait channel the parent sleeps on while waiting for children.
fn child_wait_channel(pid: Pid) -> u64 {
    0x6368_6C64_0000_0000 | pid
}

/// Terminate the current process: every thread becomes a zombie, the
/// exit code is parked for the parent, and the parent's wait channel is
/// signaled. On bare metal this never returns.
pub fn exit_current(code: i32) {
    let pid = current_pid();
    if pid == 0 {
        panic!("kernel process attempted exit({})", code);
    }

    let (ppid, threads) = match with_process(pid, |p| {
        p.exit_code = Some(code);
        (p.ppid, p.threads.clone())
    }) {
        Some(v) => v,
        None => return,
    };

    log::info!("process: pid {} exiting with code {}", pid, code);
    let current = scheduler::current_tid();
    for tid in threads {
        if tid != current {
            scheduler::with_thread(tid, |t| t.state = ThreadState::Zombie);
            scheduler::reap_thread(tid);
        }
    }

    // Release what can be released now; the pid and the zombie record
    // stay for wait() to harvest.
    if let Some(ep) = scheduler::with_current(|t| t.reply_endpoint) {
        if ep != 0 {
            crate::ipc::endpoint::endpoint_destroy(ep);
        }
    }

    scheduler::wake_up_channel(child_wait_channel(ppid));
    scheduler::exit_current();
}

/// Kill the current process after an unresolvable fault.
pub fn fatal_fault() {
    // Exit status convention: 128 + SIGSEGV.
    exit_current(139);
}

/// Reap one zombie child of `parent`, blocking until one exists.
/// Returns the child's pid and exit code.
pub fn wait_any(parent: Pid) -> Result<(Pid, i32), Errno> {
    loop {
        let children = with_process(parent, |p| p.children.clone()).ok_or(Errno::ESRCH)?;
        if children.is_empty() {
            return Err(Errno::ECHILD);
        }

        let zombie = children
            .iter()
            .copied()
            .find(|&pid| with_process(pid, |p| p.is_zombie()).unwrap_or(false));

        if let Some(pid) = zombie {
            return Ok(reap(parent, pid));
        }

        // Hosted builds cannot block; report "try again" instead of
        // spinning.
        #[cfg(not(target_os = "none"))]
        return Err(Errno::EAGAIN);
        #[cfg(target_os = "none")]
        scheduler::sleep_on(child_wait_channel(parent));
    }
}

/// Remove a zombie child from the tables and recycle its resources.
fn reap(parent: Pid, pid: Pid) -> (Pid, i32) {
    let arc = PROCESS_TABLE.lock().remove(&pid);
    let mut code = 0;
    if let Some(arc) = arc {
        let process = arc.lock();
        code = process.exit_code.unwrap_or(0);
        for &tid in &process.threads {
            scheduler::reap_thread(tid);
        }
        // The address space and cspace fall with their last Arc.
    }
    with_process(parent, |p| p.children.retain(|&c| c != pid));
    free_pid(pid);
    log::info!("process: reaped pid {} (code {})", pid, code);
    (pid, code)
}

/// Drop a process without wait semantics. Test teardown only.
#[cfg(test)]
pub fn remove_for_test(pid: Pid) {
    let arc = PROCESS_TABLE.lock().remove(&pid);
    if let Some(arc) = arc {
        let threads = arc.lock().threads.clone();
        for tid in threads {
            scheduler::reap_thread(tid);
        }
    }
    free_pid(pid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::init_test_pmm;
    use crate::task::scheduler::test_support::reset;

    #[test]
    fn pid_allocation_recycles() {
        let _pmm = init_test_pmm();
        let a = allocate_pid().unwrap();
        let b = allocate_pid().unwrap();
        assert_ne!(a, b);
        assert_ne!(a, 0);
        free_pid(a);
        let c = allocate_pid().unwrap();
        assert_eq!(c, a, "lowest free pid is reused");
        free_pid(b);
        free_pid(c);
    }

    #[test]
    fn create_and_reap_user_process() {
        let _pmm = init_test_pmm();
        reset();

        let pid = create_user_process("demo", layout::USER_CODE_BASE).unwrap();
        assert!(with_process(pid, |p| p.name == "demo").unwrap());
        let tid = with_process(pid, |p| p.main_thread).unwrap();
        assert_eq!(scheduler::with_thread(tid, |t| t.pid).unwrap(), pid);

        // The stack region is reserved but demand-paged.
        with_address_space(pid, |aspace| {
            assert_eq!(aspace.total_vm(), 0);
            assert!(aspace
                .find_vma(VirtAddr::new(layout::USER_STACK_TOP - 0x1000))
                .is_some());
        })
        .unwrap();

        // Fake an exit and reap directly.
        with_process(pid, |p| p.exit_code = Some(3));
        let (reaped, code) = reap(0, pid);
        assert_eq!((reaped, code), (pid, 3));
        assert!(process_ref(pid).is_none());
        assert!(scheduler::thread_ref(tid).is_none());

        reset();
    }

    #[test]
    fn long_names_are_clipped() {
        let _pmm = init_test_pmm();
        reset();
        let pid = create_user_process(
            "a-very-long-process-name-indeed",
            layout::USER_CODE_BASE,
        )
        .unwrap();
        let name = with_process(pid, |p| p.name.clone()).unwrap();
        assert_eq!(name.len(), PROCESS_NAME_MAX);
        with_process(pid, |p| p.exit_code = Some(0));
        reap(0, pid);
        reset();
    }

    #[test]
    fn wait_with_no_children() {
        let _pmm = init_test_pmm();
        reset();
        let parent = create_user_process("parent", layout::USER_CODE_BASE).unwrap();
        assert_eq!(wait_any(parent), Err(Errno::ECHILD));
        with_process(parent, |p| p.exit_code = Some(0));
        reap(0, parent);
        reset();
    }

    #[test]
    fn wait_reaps_zombie_child() {
        let _pmm = init_test_pmm();
        reset();
        let parent = create_user_process("wparent", layout::USER_CODE_BASE).unwrap();
        let child = create_user_process("wchild", layout::USER_CODE_BASE).unwrap();
        // Adopt: creation ran with kernel as current, so link by hand.
        with_process(parent, |p| p.children.push(child));
        with_process(child, |p| p.ppid = parent);

        // Not a zombie yet: hosted wait reports EAGAIN instead of
        // blocking.
        assert_eq!(wait_any(parent), Err(Errno::EAGAIN));

        with_process(child, |p| p.exit_code = Some(42));
        assert_eq!(wait_any(parent), Ok((child, 42)));
        assert!(process_ref(child).is_none());
        assert!(with_process(parent, |p| p.children.is_empty()).unwrap());

        with_process(parent, |p| p.exit_code = Some(0));
        reap(0, parent);
        reset();
    }
}
