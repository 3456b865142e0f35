//! mmap-backed memory regions

use std::io;
use std::ptr;

/// An anonymous private mapping, optionally bound to a NUMA node and
/// locked into physical memory.
///
/// The mapping is unmapped on drop.
#[derive(Debug)]
pub struct Region {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Map `len` bytes of anonymous memory.
    ///
    /// Mapping failure is fatal: region sizes are derived from workload
    /// parameters at startup and a deployment that cannot satisfy them
    /// cannot run.
    pub fn anonymous(len: usize) -> Region {
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            tracing::error!(len, %err, "mmap failed; cannot allocate region");
            std::process::abort();
        }
        Region {
            base: base.cast(),
            len,
        }
    }

    /// Map `len` bytes bound to `numa_node` with a strict bind policy and
    /// lock them into memory.
    pub fn numa(len: usize, numa_node: usize) -> Region {
        let region = Region::anonymous(len);
        region.bind(0, len, numa_node);
        region
    }

    /// Bind the sub-range at `offset` to `numa_node` and lock it.
    ///
    /// The bind uses `MPOL_BIND | MPOL_MF_STRICT`. Kernels without NUMA
    /// support (and containers that veto `mlock`) degrade with a warning;
    /// the mapping itself is still fatal on failure.
    pub fn bind(&self, offset: usize, len: usize, numa_node: usize) {
        assert!(offset + len <= self.len);
        unsafe {
            let p = self.base.add(offset);
            let nodemask: libc::c_ulong = 1 << numa_node;
            let rc = libc::syscall(
                libc::SYS_mbind,
                p,
                len,
                2 as libc::c_int, // MPOL_BIND
                &nodemask as *const libc::c_ulong,
                (8 * std::mem::size_of::<libc::c_ulong>()) as libc::c_ulong,
                (1 << 0) as libc::c_uint, // MPOL_MF_STRICT
            );
            if rc < 0 {
                let err = io::Error::last_os_error();
                tracing::warn!(numa_node, %err, "mbind failed; range is not node-bound");
            }
            if libc::mlock(p.cast(), len) < 0 {
                let err = io::Error::last_os_error();
                tracing::warn!(len, %err, "mlock failed; range may be swapped");
            }
        }
    }

    /// Base pointer of the mapping.
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_region_is_writable() {
        let region = Region::anonymous(4096);
        unsafe {
            region.base().write(0xAB);
            assert_eq!(region.base().read(), 0xAB);
        }
    }

    #[test]
    fn test_numa_region_is_writable() {
        let region = Region::numa(4096, 0);
        unsafe {
            region.base().add(4095).write(0xCD);
            assert_eq!(region.base().add(4095).read(), 0xCD);
        }
        assert_eq!(region.len(), 4096);
    }
}
