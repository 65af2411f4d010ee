//! Syscall-facing error numbers.
//!
//! These are the values the SYSCALL dispatcher returns to user space as a
//! negative `i64` (§7, §6 syscall ABI). [`KernelError`] is the Rust-idiomatic
//! counterpart used at internal seams (VFS, ELF loader, ACPI/MADT, TAR); the
//! `From` impl below is where the two meet.

/// No such file or directory.
pub const ENOENT: i64 = 2;
/// Bad file descriptor.
pub const EBADF: i64 = 9;
/// Invalid argument.
pub const EINVAL: i64 = 22;
/// Is a directory.
pub const EISDIR: i64 = 21;
/// Illegal seek.
pub const ESPIPE: i64 = 29;
/// Function not implemented (unknown syscall number).
pub const ENOSYS: i64 = 38;
/// No space left on device.
pub const ENOSPC: i64 = 28;

/// Internal error type used at VFS/ELF/ACPI/TAR call seams.
///
/// Distinct from the raw negative-errno values returned across the syscall
/// ABI; `From<KernelError> for i64` is where the two are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    NotFound,
    NotADirectory,
    IsADirectory,
    InvalidArgument,
    BadFileDescriptor,
    NoSpace,
    SeekOnPipe,
}

impl From<KernelError> for i64 {
    fn from(err: KernelError) -> i64 {
        -match err {
            KernelError::NotFound => ENOENT,
            KernelError::NotADirectory => EINVAL,
            KernelError::IsADirectory => EISDIR,
            KernelError::InvalidArgument => EINVAL,
            KernelError::BadFileDescriptor => EBADF,
            KernelError::NoSpace => ENOSPC,
            KernelError::SeekOnPipe => ESPIPE,
        }
    }
}
