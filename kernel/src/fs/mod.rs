//! Virtual filesystem: mount table, inode/file-descriptor/file-ops vtable,
//! and dispatch to the mounted filesystem backends.
//!
//! The VFS itself never interprets file contents; every operation that
//! touches data routes through `inode.ops`, which `initramfs`/`devfs`
//! implement.

pub mod devfs;
pub mod initramfs;
pub mod path;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::errno::KernelError;
use crate::sync::IrqSpinLock;

/// What kind of object an [`Inode`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
    NotFound,
    Regular,
    Directory,
    CharDevice,
}

/// A directory entry as returned by [`FileSystem::readdir`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: InodeType,
}

/// Per-file operation table. Every operation takes the owning
/// [`FileDescriptor`], so a single `&'static FileOps` can be shared by every
/// open instance of a device or regular file.
pub struct FileOps {
    pub read: fn(&mut FileDescriptor, &mut [u8]) -> Result<usize, KernelError>,
    pub write: fn(&mut FileDescriptor, &[u8]) -> Result<usize, KernelError>,
    pub close: fn(&mut FileDescriptor),
    pub lseek: fn(&mut FileDescriptor, offset: i64, whence: SeekWhence) -> Result<u64, KernelError>,
}

/// `lseek` origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Cur,
    End,
}

/// Backing data behind a regular (initramfs) file.
pub struct RegularFileData {
    pub bytes: &'static [u8],
}

/// An open (or openable) file. Heap-allocated for regular files; device
/// inodes are statically allocated singletons.
pub struct Inode {
    pub kind: InodeType,
    pub size: usize,
    pub ops: &'static FileOps,
    pub private: InodePrivate,
}

/// The per-inode-kind private payload `Inode` carries.
pub enum InodePrivate {
    None,
    Regular(RegularFileData),
    Device(&'static dyn core::any::Any),
}

/// A process's open-file handle: which inode, how far into it, and the
/// flags it was opened with.
pub struct FileDescriptor {
    pub inode: Arc<Inode>,
    pub offset: usize,
    pub flags: i32,
}

impl FileDescriptor {
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let ops = self.inode.ops;
        (ops.read)(self, buf)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, KernelError> {
        let ops = self.inode.ops;
        (ops.write)(self, buf)
    }

    pub fn close(&mut self) {
        let ops = self.inode.ops;
        (ops.close)(self);
    }

    pub fn lseek(&mut self, offset: i64, whence: SeekWhence) -> Result<u64, KernelError> {
        let ops = self.inode.ops;
        (ops.lseek)(self, offset, whence)
    }
}

/// Stat information returned by [`FileSystem::stat`].
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub kind: InodeType,
    pub size: usize,
}

/// A mountable filesystem backend.
pub trait FileSystem: Send + Sync {
    fn name(&self) -> &str;
    fn open(&self, relative_path: &str, flags: i32) -> Result<Arc<Inode>, KernelError>;
    fn stat(&self, relative_path: &str) -> Result<Stat, KernelError>;
    fn readdir(&self, relative_path: &str) -> Result<Vec<DirEntry>, KernelError>;
}

struct Mount {
    root: String,
    fs: Box<dyn FileSystem>,
}

static MOUNTS: IrqSpinLock<Vec<Mount>> = IrqSpinLock::new(Vec::new());

/// Mounts `fs` at `root` (must be a canonical absolute path).
pub fn mount(root: &str, fs: Box<dyn FileSystem>) {
    MOUNTS.lock().push(Mount {
        root: String::from(root),
        fs,
    });
}

/// Finds the mount whose root is the longest prefix of canonical `path`.
fn find_mount(path: &str) -> Option<(String, usize)> {
    let mounts = MOUNTS.lock();
    let mut best: Option<(usize, usize)> = None;
    for (i, mount) in mounts.iter().enumerate() {
        if path == mount.root || path.starts_with(&mount.root) && (mount.root == "/" || path[mount.root.len()..].starts_with('/')) {
            let len = mount.root.len();
            if best.map(|(best_len, _)| len > best_len).unwrap_or(true) {
                best = Some((len, i));
            }
        }
    }
    best.map(|(_, i)| (mounts[i].root.clone(), i))
}

fn with_mount_fs<R>(path: &str, f: impl FnOnce(&str, &dyn FileSystem) -> R) -> Option<R> {
    let canon = path::canonicalize(path);
    let (root, idx) = find_mount(&canon)?;
    let relative = path::strip_mount_prefix(&canon, &root);
    let mounts = MOUNTS.lock();
    Some(f(relative, mounts[idx].fs.as_ref()))
}

/// Opens `path`, dispatching to the owning mount's `open`.
pub fn open(path: &str, flags: i32) -> Result<Arc<Inode>, KernelError> {
    with_mount_fs(path, |relative, fs| fs.open(relative, flags)).unwrap_or(Err(KernelError::NotFound))
}

/// Stats `path`, dispatching to the owning mount's `stat`.
pub fn stat(path: &str) -> Result<Stat, KernelError> {
    with_mount_fs(path, |relative, fs| fs.stat(relative)).unwrap_or(Err(KernelError::NotFound))
}

/// Lists `path`'s entries, dispatching to the owning mount's `readdir`.
pub fn readdir(path: &str) -> Result<Vec<DirEntry>, KernelError> {
    with_mount_fs(path, |relative, fs| fs.readdir(relative)).unwrap_or(Err(KernelError::NotFound))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubFs;
    impl FileSystem for StubFs {
        fn name(&self) -> &str {
            "stub"
        }
        fn open(&self, _relative_path: &str, _flags: i32) -> Result<Arc<Inode>, KernelError> {
            Err(KernelError::NotFound)
        }
        fn stat(&self, _relative_path: &str) -> Result<Stat, KernelError> {
            Err(KernelError::NotFound)
        }
        fn readdir(&self, _relative_path: &str) -> Result<Vec<DirEntry>, KernelError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn longest_prefix_wins() {
        MOUNTS.lock().clear();
        mount("/", Box::new(StubFs));
        mount("/dev", Box::new(StubFs));
        let (root, _) = find_mount("/dev/tty1").unwrap();
        assert_eq!(root, "/dev");
        let (root, _) = find_mount("/bin/a").unwrap();
        assert_eq!(root, "/");
    }
}
