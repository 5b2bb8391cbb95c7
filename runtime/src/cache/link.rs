//! Materializing stored blobs into VM directories.
//!
//! The linker prefers a copy-on-write clone, then a hardlink, then a plain
//! copy. The first failing method is remembered, so callers never branch on
//! filesystem type. Targets the VM writes to never get a hardlink: writes
//! through it would land in the store blob.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};

use vmpull_core::error::{Result, VmError};

/// How a blob ended up at its target path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkMethod {
    Reflink = 0,
    Hardlink = 1,
    Copy = 2,
}

impl LinkMethod {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LinkMethod::Reflink,
            1 => LinkMethod::Hardlink,
            _ => LinkMethod::Copy,
        }
    }

    /// Whether the target shares storage with the source.
    pub fn is_shared(self) -> bool {
        !matches!(self, LinkMethod::Copy)
    }
}

/// How the materialized file will be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Only ever read (configs)
    ReadOnly,
    /// Opened read-write by the VM (disks, NVRAM)
    Writable,
}

/// Dedup-link with transparent fallback.
#[derive(Debug)]
pub struct Linker {
    /// Best method not yet known to fail on this store's filesystem
    best: AtomicU8,
}

impl Default for Linker {
    fn default() -> Self {
        Self::new()
    }
}

impl Linker {
    pub fn new() -> Self {
        Self {
            best: AtomicU8::new(LinkMethod::Reflink as u8),
        }
    }

    /// Best method still considered usable.
    pub fn preferred(&self) -> LinkMethod {
        LinkMethod::from_u8(self.best.load(Ordering::Relaxed))
    }

    /// Materialize `source` at `target`.
    ///
    /// With `dedup` disabled the target is always an independent copy. A
    /// [`Access::Writable`] target is cloned or copied, never hardlinked.
    /// `target` must not exist.
    pub fn link(
        &self,
        source: &Path,
        target: &Path,
        dedup: bool,
        access: Access,
    ) -> Result<LinkMethod> {
        if !dedup {
            copy_file(source, target)?;
            return Ok(LinkMethod::Copy);
        }

        let mut method = self.preferred();
        loop {
            let attempt = match method {
                LinkMethod::Reflink => reflink(source, target),
                LinkMethod::Hardlink if access == Access::ReadOnly => {
                    std::fs::hard_link(source, target)
                }
                LinkMethod::Hardlink | LinkMethod::Copy => {
                    copy_file(source, target)?;
                    return Ok(LinkMethod::Copy);
                }
            };

            match attempt {
                Ok(()) => return Ok(method),
                Err(e) if is_unsupported(&e) => {
                    let next = LinkMethod::from_u8(method as u8 + 1);
                    tracing::debug!(
                        method = ?method,
                        fallback = ?next,
                        error = %e,
                        "Link method unsupported, falling back"
                    );
                    // Another task may have lowered it further already
                    self.best.fetch_max(next as u8, Ordering::Relaxed);
                    let _ = std::fs::remove_file(target);
                    method = next;
                }
                Err(e) => {
                    return Err(VmError::StorageError(format!(
                        "Failed to link {} -> {}: {}",
                        source.display(),
                        target.display(),
                        e
                    )))
                }
            }
        }
    }
}

fn copy_file(source: &Path, target: &Path) -> Result<()> {
    std::fs::copy(source, target).map_err(|e| {
        VmError::StorageError(format!(
            "Failed to copy {} -> {}: {}",
            source.display(),
            target.display(),
            e
        ))
    })?;
    Ok(())
}

/// Errors meaning "this filesystem can't do that", as opposed to real failures.
fn is_unsupported(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::Unsupported {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc::EXDEV
            || code == libc::EOPNOTSUPP
            || code == libc::ENOTSUP
            || code == libc::EINVAL
            || code == libc::ENOTTY
            || code == libc::EPERM
            || code == libc::EMLINK
            || code == libc::ENOSYS
    )
}

#[cfg(target_os = "linux")]
fn reflink(source: &Path, target: &Path) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // _IOW(0x94, 9, int)
    const FICLONE: libc::c_ulong = 0x4004_9409;

    let src = std::fs::File::open(source)?;
    let dst = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)?;
    // SAFETY: both descriptors are open for the duration of the call.
    let rc = unsafe { libc::ioctl(dst.as_raw_fd(), FICLONE as _, src.as_raw_fd()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(target_os = "macos")]
fn reflink(source: &Path, target: &Path) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    extern "C" {
        fn clonefile(src: *const libc::c_char, dst: *const libc::c_char, flags: u32) -> libc::c_int;
    }

    let to_c = |p: &Path| {
        CString::new(p.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    };
    let src = to_c(source)?;
    let dst = to_c(target)?;
    // SAFETY: both pointers are valid NUL-terminated strings.
    let rc = unsafe { clonefile(src.as_ptr(), dst.as_ptr(), 0) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn reflink(_source: &Path, _target: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "copy-on-write clone not available on this platform",
    ))
}
