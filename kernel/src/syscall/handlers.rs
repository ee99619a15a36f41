//! System call implementations.
//!
//! Each handler validates its arguments against the calling process's
//! state, performs the operation, and reports a non-negative result or
//! a negative errno. IPC handlers speak [`IpcResult`] codes instead;
//! those are already shaped for the return word.

use super::errno::Errno;
use super::userptr;
use crate::ipc::capability::{CapObject, CapRights};
use crate::ipc::endpoint::{self, IpcResult};
use crate::ipc::message::{Message, MessageTag, MSG_REGS};
use crate::process;
use crate::task::scheduler;

/// The only writable file descriptors: the serial console.
const FD_STDIN: u64 = 0;
const FD_STDOUT: u64 = 1;
const FD_STDERR: u64 = 2;

/// Per-call byte bound for console I/O and debug prints.
const IO_CHUNK_MAX: usize = 4096;

/// Data registers carried through the syscall IPC surface (r1..r4).
pub const IPC_SYSCALL_REGS: usize = 4;

pub fn sys_exit(code: u64) -> i64 {
    process::exit_current(code as i32);
    // Unreachable on bare metal; hosted callers observe success.
    0
}

pub fn sys_fork() -> i64 {
    match process::fork::fork_current() {
        Ok(child) => child as i64,
        Err(errno) => errno.to_ret(),
    }
}

/// exec validates its arguments, but program loading belongs to the
/// external ELF collaborator; without it the call reports ENOSYS.
pub fn sys_exec(path_ptr: u64, _argv: u64, _envp: u64) -> i64 {
    let checked = process::with_current_address_space(|aspace| {
        let mut first = [0u8; 1];
        userptr::copy_from_user(aspace, path_ptr, &mut first)
    });
    match checked {
        Some(Ok(())) => Errno::ENOSYS.to_ret(),
        Some(Err(errno)) => errno.to_ret(),
        None => Errno::EPERM.to_ret(),
    }
}

pub fn sys_wait(status_ptr: u64) -> i64 {
    let pid = process::current_pid();
    if pid == 0 {
        return Errno::EPERM.to_ret();
    }
    match process::wait_any(pid) {
        Ok((child, code)) => {
            if status_ptr != 0 {
                let copied = process::with_current_address_space(|aspace| {
                    userptr::copy_to_user(aspace, status_ptr, &(code as i32).to_ne_bytes())
                });
                match copied {
                    Some(Ok(())) => {}
                    Some(Err(errno)) => return errno.to_ret(),
                    None => return Errno::EFAULT.to_ret(),
                }
            }
            child as i64
        }
        Err(errno) => errno.to_ret(),
    }
}

pub fn sys_getpid() -> i64 {
    process::current_pid() as i64
}

pub fn sys_getppid() -> i64 {
    process::current_ppid() as i64
}

pub fn sys_yield() -> i64 {
    scheduler::yield_now();
    0
}

pub fn sys_read(fd: u64, buf: u64, count: u64) -> i64 {
    if fd != FD_STDIN {
        return Errno::EBADF.to_ret();
    }
    let want = (count as usize).min(IO_CHUNK_MAX);
    let mut staged = [0u8; IO_CHUNK_MAX];
    let got = crate::serial::read_input(&mut staged[..want]);
    if got == 0 {
        return 0;
    }
    let copied = process::with_current_address_space(|aspace| {
        userptr::copy_to_user(aspace, buf, &staged[..got])
    });
    match copied {
        Some(Ok(())) => got as i64,
        Some(Err(errno)) => errno.to_ret(),
        None => Errno::EFAULT.to_ret(),
    }
}

pub fn sys_write(fd: u64, buf: u64, count: u64) -> i64 {
    if fd != FD_STDOUT && fd != FD_STDERR {
        return Errno::EBADF.to_ret();
    }
    write_user_bytes(buf, count)
}

pub fn sys_debug_print(buf: u64, count: u64) -> i64 {
    write_user_bytes(buf, count)
}

fn write_user_bytes(buf: u64, count: u64) -> i64 {
    let len = (count as usize).min(IO_CHUNK_MAX);
    let mut staged = [0u8; IO_CHUNK_MAX];
    let copied = process::with_current_address_space(|aspace| {
        userptr::copy_from_user(aspace, buf, &mut staged[..len])
    });
    match copied {
        Some(Ok(())) => {
            for &byte in &staged[..len] {
                crate::serial::write_byte(byte);
            }
            len as i64
        }
        Some(Err(errno)) => errno.to_ret(),
        None => Errno::EFAULT.to_ret(),
    }
}

/// Endpoint handle resolution: userspace names endpoints by capability
/// slot; nothing else ever crosses the boundary.
fn endpoint_for(slot: u64, needed: CapRights) -> Result<alloc::sync::Arc<endpoint::Endpoint>, i64> {
    let pid = process::current_pid();
    let cspace =
        process::with_process(pid, |p| p.cspace.clone()).ok_or(Errno::EPERM.to_ret())?;
    let (ep, rights, _badge) = cspace
        .lookup_endpoint(slot as u32)
        .map_err(|_| IpcResult::Invalid as i64)?;
    if !rights.contains(needed) {
        return Err(IpcResult::Perm as i64);
    }
    Ok(ep)
}

pub fn sys_ipc_send(ep_cap: u64, tag: u64, r1: u64, r2: u64, r3: u64, r4: u64) -> i64 {
    let ep = match endpoint_for(ep_cap, CapRights::SEND) {
        Ok(ep) => ep,
        Err(code) => return code,
    };
    let mut msg = Message::with_regs(MessageTag::from_raw(tag), &[r1, r2, r3, r4]);
    endpoint::send(&ep, &mut msg) as i64
}

pub fn sys_ipc_recv(ep_cap: u64, tag_ptr: u64, regs_ptr: u64) -> i64 {
    let ep = match endpoint_for(ep_cap, CapRights::RECV) {
        Ok(ep) => ep,
        Err(code) => return code,
    };

    let mut msg = Message::new(MessageTag::default());
    let result = endpoint::recv(&ep, &mut msg);
    if result != IpcResult::Ok {
        return result as i64;
    }

    let copied = process::with_current_address_space(|aspace| {
        userptr::put_user_u64(aspace, tag_ptr, msg.tag.raw())?;
        let mut bytes = [0u8; IPC_SYSCALL_REGS * 8];
        for (i, chunk) in bytes.chunks_exact_mut(8).enumerate() {
            debug_assert!(i < MSG_REGS);
            chunk.copy_from_slice(&msg.regs[i].to_ne_bytes());
        }
        userptr::copy_to_user(aspace, regs_ptr, &bytes)
    });
    match copied {
        Some(Ok(())) => IpcResult::Ok as i64,
        Some(Err(errno)) => errno.to_ret(),
        None => Errno::EFAULT.to_ret(),
    }
}

pub fn sys_endpoint_create(_flags: u64) -> i64 {
    let pid = process::current_pid();
    if pid == 0 {
        return Errno::EPERM.to_ret();
    }
    let Some(cspace) = process::with_process(pid, |p| p.cspace.clone()) else {
        return Errno::ESRCH.to_ret();
    };

    let ep = endpoint::endpoint_create(Some(pid), crate::ipc::EndpointFlags::empty());
    let slot = cspace.insert(
        CapObject::Endpoint(ep),
        CapRights::SEND | CapRights::RECV | CapRights::GRANT | CapRights::REVOKE | CapRights::MANAGE,
        0,
    );
    slot as i64
}

pub fn sys_endpoint_destroy(ep_cap: u64) -> i64 {
    let ep = match endpoint_for(ep_cap, CapRights::MANAGE) {
        Ok(ep) => ep,
        Err(code) => return code,
    };
    let pid = process::current_pid();
    if ep.owner() != Some(pid) {
        return Errno::EPERM.to_ret();
    }
    endpoint::endpoint_destroy(ep.id());
    if let Some(cspace) = process::with_process(pid, |p| p.cspace.clone()) {
        cspace.delete(ep_cap as u32);
    }
    0
}
