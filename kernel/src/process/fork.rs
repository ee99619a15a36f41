//! fork(): duplicate the current process.
//!
//! The child gets a copy-on-write clone of the parent's address space,
//! a copy of the parent's capability slots (same objects, same rights
//! and badges), inherited credentials and session ids, and a main
//! thread whose context is a clone of the forking thread's. The child's
//! syscall return frame (rax = 0) is the architecture glue's business;
//! the core hands it a thread that resumes at the same point with its
//! own stack.

use super::{allocate_pid, current_pid, free_pid, with_process, Pid, Process};
use crate::spinlock::TicketLock;
use crate::syscall::errno::Errno;
use crate::task::{scheduler, Thread, ThreadFlags};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// Fork the current process. Returns the child pid to the caller; the
/// child observes 0 through its rewritten return frame.
pub fn fork_current() -> Result<Pid, Errno> {
    let parent_pid = current_pid();
    if parent_pid == 0 {
        // Kernel threads are spawned, not forked.
        return Err(Errno::EPERM);
    }
    fork_process(parent_pid)
}

pub fn fork_process(parent_pid: Pid) -> Result<Pid, Errno> {
    let child_pid = allocate_pid().ok_or(Errno::EAGAIN)?;

    scheduler::with_current(|t| t.flags.insert(ThreadFlags::FORKING));
    let result = do_fork(parent_pid, child_pid);
    scheduler::with_current(|t| t.flags.remove(ThreadFlags::FORKING));

    if result.is_err() {
        free_pid(child_pid);
    }
    result
}

fn do_fork(parent_pid: Pid, child_pid: Pid) -> Result<Pid, Errno> {
    let parent = super::process_ref(parent_pid).ok_or(Errno::ESRCH)?;

    // Clone the address space under the parent lock: nothing may remap
    // while pages are being demoted to CoW.
    let (child_aspace, child_cspace, template) = {
        let parent = parent.lock();
        let parent_aspace = parent.aspace.clone().ok_or(Errno::EPERM)?;
        let child_aspace = parent_aspace
            .lock()
            .clone_cow()
            .ok_or(Errno::ENOMEM)?;
        let child_cspace = Arc::new(parent.cspace.duplicate());
        let template = (
            parent.pgid,
            parent.sid,
            parent.creds,
            parent.name.clone(),
        );
        (child_aspace, child_cspace, template)
    };

    // The child's main thread mirrors the forking thread.
    let child_thread = build_child_thread(child_pid, &template.3).ok_or(Errno::ENOMEM)?;
    let child_tid = child_thread.id;

    let child = Process {
        pid: child_pid,
        ppid: parent_pid,
        pgid: template.0,
        sid: template.1,
        creds: template.2,
        aspace: Some(Arc::new(TicketLock::new(child_aspace))),
        cspace: child_cspace,
        threads: alloc::vec![child_tid],
        main_thread: child_tid,
        children: Vec::new(),
        exit_code: None,
        exit_signal: 0,
        name: template.3,
    };

    super::PROCESS_TABLE
        .lock()
        .insert(child_pid, Arc::new(Mutex::new(child)));
    with_process(parent_pid, |p| p.children.push(child_pid));

    scheduler::spawn(child_thread);
    log::info!("fork: pid {} -> child pid {}", parent_pid, child_pid);
    Ok(child_pid)
}

/// Child main thread: a fresh kernel stack, the forking thread's
/// context and priority.
fn build_child_thread(child_pid: Pid, name: &str) -> Option<Thread> {
    let (context, user_stack_top, priority, nice) = scheduler::with_current(|t| {
        (
            t.context.clone(),
            t.user_stack_top,
            t.priority,
            t.nice,
        )
    })?;

    let mut thread = Thread::new_user(
        alloc::string::String::from(name),
        child_pid,
        context.rip,
        user_stack_top,
        priority,
    )?;
    // Resume where the parent forked. The kernel-stack pointer stays
    // the child's own; the return path rebuilds the frame there.
    let child_rsp = thread.context.rsp;
    thread.context = context;
    thread.context.rsp = child_rsp;
    thread.nice = nice;
    Some(thread)
}
