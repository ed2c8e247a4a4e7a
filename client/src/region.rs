//! The mapped shared region and its page-protection plumbing.

use std::fs::File;
use std::num::NonZeroUsize;
use std::os::unix::io::AsRawFd;

use nix::sys::mman::{mmap, mprotect, munmap, MapFlags, ProtFlags};

use dsm_proto::DSM_PAGE_SIZE;

use crate::DsmError;

/// A `MAP_SHARED` mapping of the arbiter-created backing file. The
/// region is the coherence payload; protection toggles between
/// read-only steady state and briefly-writable capture/apply windows.
pub(crate) struct Region {
    base: *mut u8,
    len: usize,
}

// The raw pointer is only ever dereferenced through the accessors
// below, which the runtime serializes via the coherence protocol.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Map `len` bytes of `file` read-write. Callers reprotect as the
    /// capture mode requires.
    pub fn map(file: &File, len: usize) -> Result<Region, DsmError> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| DsmError::Argument("cannot map an empty region".into()))?;
        let base = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )?
        };
        Ok(Region {
            base: base as *mut u8,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn base_addr(&self) -> usize {
        self.base as usize
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Reprotect the whole region.
    pub fn protect_all(&self, prot: ProtFlags) -> Result<(), DsmError> {
        unsafe { mprotect(self.base as *mut _, self.len, prot)? };
        Ok(())
    }

    /// Reprotect the pages covering `offset..offset + len`.
    pub fn protect_range(&self, offset: usize, len: usize, prot: ProtFlags) -> Result<(), DsmError> {
        debug_assert!(offset + len <= self.len);
        let first = offset / DSM_PAGE_SIZE;
        let last = (offset + len - 1) / DSM_PAGE_SIZE;
        let start = first * DSM_PAGE_SIZE;
        let span = (last + 1) * DSM_PAGE_SIZE - start;
        unsafe { mprotect(self.base.add(start) as *mut _, span, prot)? };
        Ok(())
    }

    pub fn protect_page(&self, page: usize, prot: ProtFlags) -> Result<(), DsmError> {
        self.protect_range(page * DSM_PAGE_SIZE, DSM_PAGE_SIZE, prot)
    }

    /// Snapshot `out.len()` bytes at `offset`. Caller checks bounds.
    pub fn read_into(&self, offset: usize, out: &mut [u8]) {
        debug_assert!(offset + out.len() <= self.len);
        unsafe { std::ptr::copy_nonoverlapping(self.base.add(offset), out.as_mut_ptr(), out.len()) }
    }

    /// Copy `src` into the region at `offset`. The pages must currently
    /// be writable; caller checks bounds.
    pub fn write_from(&self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= self.len);
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(offset), src.len()) }
    }

    /// Snapshot one whole page.
    pub fn copy_page(&self, page: usize) -> Vec<u8> {
        let mut out = vec![0u8; DSM_PAGE_SIZE];
        self.read_into(page * DSM_PAGE_SIZE, &mut out);
        out
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.base as *mut _, self.len) } {
            tracing::warn!("failed to unmap shared region: {e}");
        }
    }
}
