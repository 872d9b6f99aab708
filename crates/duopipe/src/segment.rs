//! POSIX shared memory segments.
//!
//! Thin wrappers around `shm_open`, `ftruncate` and `mmap`. A segment is
//! unmapped on drop, and unlinked on drop by the process that created it.
//! The peer keeps its own mapping alive independently of the unlink.

use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU8;

use crate::CONSUMED_OFFSET;
use crate::Error;
use crate::HEADER_LEN;
use crate::MAX_NAME_LEN;
use crate::Result;
use crate::SEQUENCE_OFFSET;

/// A mapped shared memory segment.
pub struct Segment {
    ptr: *mut u8,
    size: usize,
    name: String,
    owned: bool,
}

// SAFETY: the mapping is process-wide and outlives every borrow handed out
// by `Segment`. Concurrent access to the header goes through atomics; message
// bytes are only written before the sequence number that publishes them.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Creates a zeroed segment of `size` bytes.
    ///
    /// Fails with `AlreadyExists` if the name is taken, so a live pipe is
    /// never taken over by a second creator.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let size = size.max(HEADER_LEN);
        let c_name = Self::c_name(name)?;

        // SAFETY: c_name is a valid NUL-terminated string.
        let fd = unsafe {
            libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR | libc::O_EXCL, 0o600)
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::AlreadyExists {
                return Err(Error::AlreadyExists(name.to_string()));
            }
            return Err(Error::SegmentCreate(err));
        }

        // SAFETY: fd came from a successful shm_open above.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and closed exactly once on this path. The
            // half-created object is unlinked so it cannot be opened.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(Error::SegmentCreate(err));
        }

        let ptr = match Self::map(fd, size) {
            Ok(ptr) => ptr,
            Err(e) => {
                // SAFETY: see above.
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(e);
            }
        };

        // SAFETY: ptr maps exactly `size` writable bytes that nobody else
        // has seen yet.
        unsafe { ptr::write_bytes(ptr, 0, size) };

        tracing::trace!(segment = name, size, "created shared memory segment");
        Ok(Self { ptr, size, name: name.to_string(), owned: true })
    }

    /// Opens an existing segment, mapping its full size.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = Self::c_name(name)?;

        // SAFETY: c_name is a valid NUL-terminated string; mode is ignored
        // without O_CREAT.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(Error::NotFound(name.to_string()));
            }
            return Err(Error::SegmentOpen(err));
        }

        // SAFETY: fd is valid; stat is plain old data and fully written by
        // fstat on success.
        let size = unsafe {
            let mut stat: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut stat) < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(Error::SegmentOpen(err));
            }
            stat.st_size as usize
        };
        if size < HEADER_LEN {
            // SAFETY: fd is valid and not used again.
            unsafe { libc::close(fd) };
            return Err(Error::OutOfBounds { offset: 0, len: HEADER_LEN, size });
        }

        let ptr = Self::map(fd, size)?;
        tracing::trace!(segment = name, size, "opened shared memory segment");
        Ok(Self { ptr, size, name: name.to_string(), owned: false })
    }

    /// Maps `size` bytes of `fd` and closes the descriptor.
    fn map(fd: libc::c_int, size: usize) -> Result<*mut u8> {
        // SAFETY: fd is a valid shared memory descriptor of at least `size`
        // bytes. A null hint lets the kernel choose the address.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        // SAFETY: the mapping, if any, holds its own reference to the object.
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(Error::Mmap(io::Error::last_os_error()));
        }
        Ok(ptr as *mut u8)
    }

    fn c_name(name: &str) -> Result<CString> {
        let valid = name.starts_with('/')
            && !name[1..].contains('/')
            && name.len() > 1
            && name.len() <= MAX_NAME_LEN;
        if !valid {
            return Err(Error::InvalidName(name.to_string()));
        }
        CString::new(name).map_err(|_| Error::InvalidName(name.to_string()))
    }

    /// Like `create`, but first unlinks whatever holds the name.
    ///
    /// Used for continuation segments, whose names can be left behind by a
    /// writer that died before releasing them.
    pub fn create_replacing(name: &str, size: usize) -> Result<Self> {
        match Self::unlink(name) {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        Self::create(name, size)
    }

    /// Removes a segment name. Existing mappings stay valid.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = Self::c_name(name)?;
        // SAFETY: c_name is a valid NUL-terminated string.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(Error::NotFound(name.to_string()));
            }
            return Err(Error::SegmentOpen(err));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// True if this process created the segment and will unlink it.
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::OutOfBounds { offset, len, size: self.size }),
        }
    }

    /// The published message sequence number.
    pub fn sequence(&self) -> &AtomicI32 {
        // SAFETY: the mapping is page aligned and always larger than the
        // header, so the header words are in bounds and aligned.
        unsafe { &*(self.ptr.add(SEQUENCE_OFFSET) as *const AtomicI32) }
    }

    /// Set by the reader once it has moved past this segment.
    pub fn consumed(&self) -> &AtomicU8 {
        // SAFETY: see `sequence`.
        unsafe { &*(self.ptr.add(CONSUMED_OFFSET) as *const AtomicU8) }
    }

    /// The first word of the segment viewed as a futex word.
    pub(crate) fn word(&self) -> &AtomicU32 {
        // SAFETY: see `sequence`; only used on dedicated signal segments.
        unsafe { &*(self.ptr as *const AtomicU32) }
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check(offset, bytes.len())?;
        // SAFETY: the range was bounds checked and the source is a distinct
        // Rust slice, so the regions cannot overlap.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len()) };
        Ok(())
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check(offset, len)?;
        let mut out = vec![0u8; len];
        // SAFETY: the range was bounds checked; `out` is freshly allocated.
        unsafe { ptr::copy_nonoverlapping(self.ptr.add(offset), out.as_mut_ptr(), len) };
        Ok(out)
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let bytes = self.read(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: ptr/size describe the mapping created in `map`, and no
        // borrow of it can outlive `self`.
        unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.size) };
        if self.owned {
            if let Err(e) = Self::unlink(&self.name) {
                tracing::debug!(segment = %self.name, error = %e, "segment already unlinked");
            }
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("owned", &self.owned)
            .finish()
    }
}
