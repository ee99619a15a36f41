//! The system-call surface.
//!
//! The architecture layer's syscall entry decodes the number and up to
//! six argument words and calls [`syscall_dispatch`]; the return word
//! is non-negative on success and `-errno` (or an IPC result code) on
//! failure. Numbers are stable ABI.

pub mod errno;
pub mod handlers;
pub mod userptr;

use errno::Errno;

/// Stable syscall numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SyscallNumber {
    Exit = 0,
    Fork = 1,
    Exec = 2,
    Wait = 3,
    GetPid = 4,
    GetPpid = 5,
    Yield = 10,
    Read = 32,
    Write = 33,
    IpcSend = 50,
    IpcRecv = 51,
    EndpointCreate = 60,
    EndpointDestroy = 61,
    DebugPrint = 99,
}

impl SyscallNumber {
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Exit),
            1 => Some(Self::Fork),
            2 => Some(Self::Exec),
            3 => Some(Self::Wait),
            4 => Some(Self::GetPid),
            5 => Some(Self::GetPpid),
            10 => Some(Self::Yield),
            32 => Some(Self::Read),
            33 => Some(Self::Write),
            50 => Some(Self::IpcSend),
            51 => Some(Self::IpcRecv),
            60 => Some(Self::EndpointCreate),
            61 => Some(Self::EndpointDestroy),
            99 => Some(Self::DebugPrint),
            _ => None,
        }
    }
}

pub fn init() {
    log::info!("syscall: dispatcher ready");
}

/// Entry point for the architecture layer: dispatch syscall `nr` with
/// its argument words.
pub fn syscall_dispatch(nr: u64, args: [u64; 6]) -> i64 {
    use handlers::*;

    let Some(number) = SyscallNumber::from_u64(nr) else {
        log::debug!("syscall: unknown number {}", nr);
        return Errno::ENOSYS.to_ret();
    };

    match number {
        SyscallNumber::Exit => sys_exit(args[0]),
        SyscallNumber::Fork => sys_fork(),
        SyscallNumber::Exec => sys_exec(args[0], args[1], args[2]),
        SyscallNumber::Wait => sys_wait(args[0]),
        SyscallNumber::GetPid => sys_getpid(),
        SyscallNumber::GetPpid => sys_getppid(),
        SyscallNumber::Yield => sys_yield(),
        SyscallNumber::Read => sys_read(args[0], args[1], args[2]),
        SyscallNumber::Write => sys_write(args[0], args[1], args[2]),
        SyscallNumber::IpcSend => {
            sys_ipc_send(args[0], args[1], args[2], args[3], args[4], args[5])
        }
        SyscallNumber::IpcRecv => sys_ipc_recv(args[0], args[1], args[2]),
        SyscallNumber::EndpointCreate => sys_endpoint_create(args[0]),
        SyscallNumber::EndpointDestroy => sys_endpoint_destroy(args[0]),
        SyscallNumber::DebugPrint => sys_debug_print(args[0], args[1]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::endpoint::IpcResult;
    use crate::ipc::message::{MessageTag, MsgFlags};
    use crate::memory::test_support::init_test_pmm;
    use crate::memory::vma::VmaFlags;
    use crate::memory::{layout, PAGE_SIZE};
    use crate::process;
    use crate::task::scheduler;
    use crate::task::scheduler::test_support::reset;
    use x86_64::VirtAddr;

    /// Create a user process with a small RW scratch region and make
    /// its main thread current.
    fn enter_test_process(name: &str) -> (process::Pid, u64) {
        let pid = process::create_user_process(name, layout::USER_CODE_BASE).unwrap();
        let scratch = 0x4400_0000u64;
        process::with_address_space(pid, |aspace| {
            aspace
                .map_region(
                    VirtAddr::new(scratch),
                    4 * PAGE_SIZE,
                    VmaFlags::READ | VmaFlags::WRITE | VmaFlags::ANONYMOUS,
                )
                .unwrap();
        })
        .unwrap();
        scheduler::schedule();
        let tid = process::with_process(pid, |p| p.main_thread).unwrap();
        assert_eq!(scheduler::current_tid(), tid, "test process must be current");
        (pid, scratch)
    }

    fn leave_test_process(pid: process::Pid) {
        process::remove_for_test(pid);
    }

    fn write_user(pid: process::Pid, addr: u64, bytes: &[u8]) {
        process::with_address_space(pid, |aspace| {
            userptr::copy_to_user(aspace, addr, bytes).unwrap();
        })
        .unwrap();
    }

    fn read_user(pid: process::Pid, addr: u64, len: usize) -> alloc::vec::Vec<u8> {
        process::with_address_space(pid, |aspace| {
            let mut buf = alloc::vec![0u8; len];
            userptr::copy_from_user(aspace, addr, &mut buf).unwrap();
            buf
        })
        .unwrap()
    }

    #[test]
    fn unknown_number_is_enosys() {
        let _pmm = init_test_pmm();
        reset();
        assert_eq!(syscall_dispatch(777, [0; 6]), -38);
        reset();
    }

    #[test]
    fn getpid_and_getppid() {
        let _pmm = init_test_pmm();
        reset();
        let (pid, _) = enter_test_process("ids");
        assert_eq!(syscall_dispatch(4, [0; 6]), pid as i64);
        assert_eq!(syscall_dispatch(5, [0; 6]), 0, "parented to the kernel");
        leave_test_process(pid);
        reset();
    }

    #[test]
    fn write_validates_fd_and_pointer() {
        let _pmm = init_test_pmm();
        reset();
        let (pid, scratch) = enter_test_process("writer");
        write_user(pid, scratch, b"hi");

        assert_eq!(syscall_dispatch(33, [1, scratch, 2, 0, 0, 0]), 2);
        assert_eq!(syscall_dispatch(33, [2, scratch, 2, 0, 0, 0]), 2);
        // fd 0 is not writable.
        assert_eq!(
            syscall_dispatch(33, [0, scratch, 2, 0, 0, 0]),
            Errno::EBADF.to_ret()
        );
        // A wild pointer faults cleanly.
        assert_eq!(
            syscall_dispatch(33, [1, 0x1000, 2, 0, 0, 0]),
            Errno::EFAULT.to_ret()
        );

        leave_test_process(pid);
        reset();
    }

    #[test]
    fn debug_print_copies_bounded() {
        let _pmm = init_test_pmm();
        reset();
        let (pid, scratch) = enter_test_process("printer");
        write_user(pid, scratch, b"dbg!");
        assert_eq!(syscall_dispatch(99, [scratch, 4, 0, 0, 0, 0]), 4);
        leave_test_process(pid);
        reset();
    }

    #[test]
    fn read_drains_console_input() {
        let _pmm = init_test_pmm();
        reset();
        let (pid, scratch) = enter_test_process("reader");

        // Drain anything left over, then stage input.
        let mut sink = [0u8; 256];
        crate::serial::read_input(&mut sink);
        for b in b"ok" {
            crate::serial::push_input(*b);
        }

        assert_eq!(syscall_dispatch(32, [0, scratch, 16, 0, 0, 0]), 2);
        assert_eq!(read_user(pid, scratch, 2), b"ok");
        // Empty console reads zero bytes.
        assert_eq!(syscall_dispatch(32, [0, scratch, 16, 0, 0, 0]), 0);
        // Only fd 0 is readable.
        assert_eq!(
            syscall_dispatch(32, [1, scratch, 16, 0, 0, 0]),
            Errno::EBADF.to_ret()
        );

        leave_test_process(pid);
        reset();
    }

    #[test]
    fn exec_reports_enosys_after_validation() {
        let _pmm = init_test_pmm();
        reset();
        let (pid, scratch) = enter_test_process("execer");
        write_user(pid, scratch, b"/bin/sh\0");
        assert_eq!(
            syscall_dispatch(2, [scratch, 0, 0, 0, 0, 0]),
            Errno::ENOSYS.to_ret()
        );
        assert_eq!(
            syscall_dispatch(2, [0, 0, 0, 0, 0, 0]),
            Errno::EFAULT.to_ret()
        );
        leave_test_process(pid);
        reset();
    }

    #[test]
    fn endpoint_create_send_nonblock() {
        let _pmm = init_test_pmm();
        reset();
        let (pid, _) = enter_test_process("ipc-user");

        let slot = syscall_dispatch(60, [0; 6]);
        assert!(slot >= 0);

        // Nonblocking send with no partner.
        let tag = MessageTag::new(9, 2, 0, MsgFlags::NONBLOCK).raw();
        assert_eq!(
            syscall_dispatch(50, [slot as u64, tag, 1, 2, 0, 0]),
            IpcResult::NoPartner as i64
        );

        // A bogus slot is invalid.
        assert_eq!(
            syscall_dispatch(50, [999, tag, 0, 0, 0, 0]),
            IpcResult::Invalid as i64
        );

        assert_eq!(syscall_dispatch(61, [slot as u64, 0, 0, 0, 0, 0]), 0);
        // Destroyed: the slot is gone.
        assert_eq!(
            syscall_dispatch(61, [slot as u64, 0, 0, 0, 0, 0]),
            IpcResult::Invalid as i64
        );

        leave_test_process(pid);
        reset();
    }

    #[test]
    fn wait_with_no_children_is_echild() {
        let _pmm = init_test_pmm();
        reset();
        let (pid, _) = enter_test_process("waiter");
        assert_eq!(syscall_dispatch(3, [0; 6]), Errno::ECHILD.to_ret());
        leave_test_process(pid);
        reset();
    }
}
