//! Read-only initramfs: a ustar TAR archive parsed once at boot into an
//! in-memory directory of `{filename, data, size}` entries.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::errno::KernelError;
use crate::fs::{DirEntry, FileDescriptor, FileOps, FileSystem, Inode, InodePrivate, InodeType, RegularFileData, SeekWhence, Stat};

const BLOCK_SIZE: usize = 512;
/// ustar directory typeflag.
const TYPEFLAG_DIRECTORY: u8 = b'5';

struct RawEntry {
    filename: String,
    is_directory: bool,
    data: &'static [u8],
}

/// The parsed archive: a flat list of entries, searched linearly on `open`.
pub struct Initramfs {
    entries: Vec<RawEntry>,
}

fn parse_octal(field: &[u8]) -> u64 {
    let mut value = 0u64;
    for &byte in field {
        if byte == 0 || byte == b' ' {
            break;
        }
        if !byte.is_ascii_digit() {
            break;
        }
        value = value * 8 + (byte - b'0') as u64;
    }
    value
}

fn parse_cstr(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).to_string()
}

/// Parses a ustar archive out of `data`, which must outlive the kernel (the
/// Limine module it came from is never unmapped).
pub fn parse(data: &'static [u8]) -> Initramfs {
    let mut entries = Vec::new();
    let mut offset = 0usize;

    while offset + BLOCK_SIZE <= data.len() {
        let header = &data[offset..offset + BLOCK_SIZE];
        // Two consecutive zero blocks mark the end of the archive.
        if header.iter().all(|&b| b == 0) {
            break;
        }

        let name = parse_cstr(&header[0..100]);
        let size = parse_octal(&header[124..136]);
        let typeflag = header[156];
        let prefix = parse_cstr(&header[345..500]);

        let filename = if prefix.is_empty() {
            name
        } else {
            let mut combined = prefix;
            combined.push('/');
            combined.push_str(&name);
            combined
        };

        let data_start = offset + BLOCK_SIZE;
        let size = size as usize;
        let blocks = size.div_ceil(BLOCK_SIZE);
        let data_end = (data_start + size).min(data.len());

        entries.push(RawEntry {
            filename: format!("/{}", filename.trim_end_matches('/')),
            is_directory: typeflag == TYPEFLAG_DIRECTORY,
            data: &data[data_start..data_end],
        });

        offset = data_start + blocks * BLOCK_SIZE;
    }

    Initramfs { entries }
}

use alloc::format;

static FILE_OPS: FileOps = FileOps {
    read: file_read,
    write: file_write,
    close: file_close,
    lseek: file_lseek,
};

fn file_read(fd: &mut FileDescriptor, buf: &mut [u8]) -> Result<usize, KernelError> {
    let InodePrivate::Regular(ref data) = fd.inode.private else {
        return Err(KernelError::InvalidArgument);
    };
    if fd.offset >= data.bytes.len() {
        return Ok(0);
    }
    let remaining = &data.bytes[fd.offset..];
    let n = remaining.len().min(buf.len());
    buf[..n].copy_from_slice(&remaining[..n]);
    fd.offset += n;
    Ok(n)
}

fn file_write(_fd: &mut FileDescriptor, _buf: &[u8]) -> Result<usize, KernelError> {
    Err(KernelError::InvalidArgument)
}

fn file_close(_fd: &mut FileDescriptor) {}

fn file_lseek(fd: &mut FileDescriptor, offset: i64, whence: SeekWhence) -> Result<u64, KernelError> {
    let InodePrivate::Regular(ref data) = fd.inode.private else {
        return Err(KernelError::InvalidArgument);
    };
    let base: i64 = match whence {
        SeekWhence::Set => 0,
        SeekWhence::Cur => fd.offset as i64,
        SeekWhence::End => data.bytes.len() as i64,
    };
    let new_offset = base + offset;
    if new_offset < 0 {
        return Err(KernelError::InvalidArgument);
    }
    fd.offset = new_offset as usize;
    Ok(fd.offset as u64)
}

impl FileSystem for Initramfs {
    fn name(&self) -> &str {
        "initramfs"
    }

    fn open(&self, relative_path: &str, _flags: i32) -> Result<Arc<Inode>, KernelError> {
        let canon = crate::fs::path::canonicalize(relative_path);
        let entry = self
            .entries
            .iter()
            .find(|e| e.filename == canon && !e.is_directory)
            .ok_or(KernelError::NotFound)?;

        Ok(Arc::new(Inode {
            kind: InodeType::Regular,
            size: entry.data.len(),
            ops: &FILE_OPS,
            private: InodePrivate::Regular(RegularFileData { bytes: entry.data }),
        }))
    }

    fn stat(&self, relative_path: &str) -> Result<Stat, KernelError> {
        let canon = crate::fs::path::canonicalize(relative_path);
        let entry = self
            .entries
            .iter()
            .find(|e| e.filename == canon)
            .ok_or(KernelError::NotFound)?;
        Ok(Stat {
            kind: if entry.is_directory { InodeType::Directory } else { InodeType::Regular },
            size: entry.data.len(),
        })
    }

    fn readdir(&self, relative_path: &str) -> Result<Vec<DirEntry>, KernelError> {
        let canon = crate::fs::path::canonicalize(relative_path);
        let prefix = if canon == "/" { String::new() } else { canon };

        let mut seen = Vec::new();
        for entry in &self.entries {
            let Some(rest) = entry.filename.strip_prefix(&prefix) else {
                continue;
            };
            let rest = rest.strip_prefix('/').unwrap_or(rest);
            if rest.is_empty() {
                continue;
            }
            let basename = match rest.find('/') {
                Some(slash) => &rest[..slash],
                None => rest,
            };
            if !seen.iter().any(|(name, _): &(String, InodeType)| name == basename) {
                let kind = if rest.contains('/') || entry.is_directory {
                    InodeType::Directory
                } else {
                    InodeType::Regular
                };
                seen.push((basename.to_string(), kind));
            }
        }
        Ok(seen.into_iter().map(|(name, kind)| DirEntry { name, kind }).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, content) in files {
            let mut header = [0u8; BLOCK_SIZE];
            let name_bytes = name.as_bytes();
            header[0..name_bytes.len()].copy_from_slice(name_bytes);
            let size_octal = alloc::format!("{:011o}\0", content.len());
            header[124..124 + size_octal.len()].copy_from_slice(size_octal.as_bytes());
            header[156] = b'0';
            out.extend_from_slice(&header);
            out.extend_from_slice(content);
            let pad = content.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE - content.len();
            out.extend(core::iter::repeat(0u8).take(pad));
        }
        out.extend(core::iter::repeat(0u8).take(BLOCK_SIZE * 2));
        out
    }

    #[test]
    fn parses_single_file() {
        let tar = build_tar(&[("bin/a", b"hello")]);
        let leaked: &'static [u8] = Box::leak(tar.into_boxed_slice());
        let fs = parse(leaked);
        assert_eq!(fs.entries.len(), 1);
        assert_eq!(fs.entries[0].filename, "/bin/a");
        assert_eq!(fs.entries[0].data, b"hello");
    }

    #[test]
    fn open_and_read_roundtrip() {
        let tar = build_tar(&[("bin/a", b"hello world")]);
        let leaked: &'static [u8] = Box::leak(tar.into_boxed_slice());
        let fs = parse(leaked);
        let inode = fs.open("/bin/a", 0).unwrap();
        let mut fd = FileDescriptor { inode, offset: 0, flags: 0 };
        let mut buf = [0u8; 32];
        let n = fd.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
        assert_eq!(fd.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn readdir_lists_one_level() {
        let tar = build_tar(&[("bin/a", b"x"), ("bin/b", b"y")]);
        let leaked: &'static [u8] = Box::leak(tar.into_boxed_slice());
        let fs = parse(leaked);
        let mut names: Vec<String> = fs.readdir("/").unwrap().into_iter().map(|e| e.name).collect();
        names.sort();
        assert_eq!(names, alloc::vec!["bin".to_string()]);

        let mut names: Vec<String> = fs.readdir("/bin").unwrap().into_iter().map(|e| e.name).collect();
        names.sort();
        assert_eq!(names, alloc::vec!["a".to_string(), "b".to_string()]);
    }

    use alloc::boxed::Box;
}
