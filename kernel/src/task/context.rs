//! Low-level context switch.
//!
//! Cooperative switches only need the callee-saved registers, the stack
//! pointer, and a resume address; everything else is dead across the
//! call per the System V ABI. The offsets in the assembly must match
//! `CpuContext`'s `#[repr(C)]` layout exactly.
//!
//! Hosted builds carry no switch: the scheduler's bookkeeping runs, but
//! control flow stays with the caller.

#[cfg(target_os = "none")]
mod imp {
    use crate::task::thread::CpuContext;
    use core::arch::global_asm;

    global_asm!(
        r#"
    .global __switch_context
    .global __kernel_thread_entry

    // __switch_context(old: *mut CpuContext, new: *const CpuContext)
    // rdi = old, rsi = new
    __switch_context:
        mov [rdi + 0x00], r15
        mov [rdi + 0x08], r14
        mov [rdi + 0x10], r13
        mov [rdi + 0x18], r12
        mov [rdi + 0x20], rbx
        mov [rdi + 0x28], rbp
        lea rax, [rsp + 8]          // rsp as the caller will see it
        mov [rdi + 0x30], rax
        mov rax, [rsp]              // return address = resume point
        mov [rdi + 0x38], rax
        pushfq
        pop rax
        mov [rdi + 0x40], rax

        mov rax, [rsi + 0x40]
        push rax
        popfq
        mov r15, [rsi + 0x00]
        mov r14, [rsi + 0x08]
        mov r13, [rsi + 0x10]
        mov r12, [rsi + 0x18]
        mov rbx, [rsi + 0x20]
        mov rbp, [rsi + 0x28]
        mov rsp, [rsi + 0x30]
        mov rax, [rsi + 0x38]
        jmp rax

    // First entry into a kernel thread: entry point in r12, argument
    // in r13 (parked there by Thread::new_kernel).
    __kernel_thread_entry:
        mov rdi, r13
        call r12
        ud2
    "#
    );

    extern "C" {
        fn __switch_context(old: *mut CpuContext, new: *const CpuContext);
        fn __kernel_thread_entry();
    }

    /// Switch from `old` to `new`. Returns when `old` is switched back
    /// in.
    ///
    /// # Safety
    ///
    /// Both pointers must refer to valid contexts; `new` must have a
    /// live stack and resume address.
    pub unsafe fn switch_context(old: *mut CpuContext, new: *const CpuContext) {
        unsafe { __switch_context(old, new) };
    }

    pub fn kernel_thread_entry_point() -> u64 {
        __kernel_thread_entry as usize as u64
    }
}

#[cfg(not(target_os = "none"))]
mod imp {
    use crate::task::thread::CpuContext;

    /// Hosted stub: scheduler state changes, control flow does not.
    pub unsafe fn switch_context(_old: *mut CpuContext, _new: *const CpuContext) {}

    pub fn kernel_thread_entry_point() -> u64 {
        0
    }
}

pub use imp::*;
