//! POSIX-shaped error numbers.
//!
//! Syscalls return non-negative values on success and `-errno` on
//! failure, packed into the single return word.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum Errno {
    /// Operation not permitted.
    EPERM = 1,
    /// No such file or directory.
    ENOENT = 2,
    /// No such process.
    ESRCH = 3,
    /// Interrupted system call.
    EINTR = 4,
    /// I/O error.
    EIO = 5,
    /// Bad file descriptor.
    EBADF = 9,
    /// No child processes.
    ECHILD = 10,
    /// Try again.
    EAGAIN = 11,
    /// Out of memory.
    ENOMEM = 12,
    /// Permission denied.
    EACCES = 13,
    /// Bad address.
    EFAULT = 14,
    /// Device or resource busy.
    EBUSY = 16,
    /// Invalid argument.
    EINVAL = 22,
    /// Function not implemented.
    ENOSYS = 38,
}

impl Errno {
    /// The negative return-word encoding.
    pub fn to_ret(self) -> i64 {
        -(self as i64)
    }
}

/// Fold a `Result` into the syscall return word.
pub fn ret(result: Result<i64, Errno>) -> i64 {
    match result {
        Ok(value) => value,
        Err(errno) => errno.to_ret(),
    }
}
