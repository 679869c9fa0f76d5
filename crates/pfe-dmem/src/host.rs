//! Host-backed DMEM region.
//!
//! Stands in for the memory-mapped PE window during tests and simulated
//! runs. Blocks are handed out first-fit from a flat byte region, and the
//! allocator keeps enough bookkeeping to answer "is anything still
//! allocated" questions after teardown paths run.

use crate::{Dmem, DmemAddr, DmemError, DmemResult};
use log::{debug, warn};
use std::collections::BTreeMap;

/// Allocations start above the null handle and stay word aligned.
const BASE_OFFSET: u32 = 0x40;
const ALIGN: usize = 4;

/// A software DMEM region with a first-fit block allocator.
///
/// # Examples
///
/// ```
/// use pfe_dmem::{Dmem, HostDmem};
///
/// let mut dmem = HostDmem::new(1024);
/// let addr = dmem.alloc(16).unwrap();
/// dmem.write(addr, &[1, 2, 3, 4]).unwrap();
/// assert_eq!(dmem.read(addr, 4).unwrap(), vec![1, 2, 3, 4]);
///
/// dmem.free(addr).unwrap();
/// assert_eq!(dmem.outstanding(), 0);
/// ```
pub struct HostDmem {
    bytes: Vec<u8>,
    /// Live blocks: start offset -> block size.
    blocks: BTreeMap<u32, usize>,
    /// Remaining writes to reject (fault injection).
    write_faults: usize,
}

impl HostDmem {
    /// Creates a region of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
            blocks: BTreeMap::new(),
            write_faults: 0,
        }
    }

    /// Returns the number of live allocations.
    pub fn outstanding(&self) -> usize {
        self.blocks.len()
    }

    /// Returns the total number of allocated bytes.
    pub fn bytes_in_use(&self) -> usize {
        self.blocks.values().sum()
    }

    /// Rejects the next `count` writes with [`DmemError::WriteFailed`].
    ///
    /// Fault injection hook for exercising rollback paths against a
    /// simulated engine.
    pub fn inject_write_faults(&mut self, count: usize) {
        self.write_faults = count;
    }

    fn end(&self) -> u32 {
        self.bytes.len() as u32
    }

    /// Finds the live block containing `[addr, addr + len)`, if any.
    fn containing_block(&self, addr: u32, len: usize) -> Option<(u32, usize)> {
        self.blocks
            .range(..=addr)
            .next_back()
            .filter(|(start, size)| addr as usize + len <= **start as usize + **size)
            .map(|(start, size)| (*start, *size))
    }

    fn first_fit(&self, size: usize) -> Option<u32> {
        let mut candidate = BASE_OFFSET;
        for (start, block_size) in &self.blocks {
            if (candidate as usize) + size <= *start as usize {
                return Some(candidate);
            }
            candidate = start + *block_size as u32;
        }
        if (candidate as usize) + size <= self.end() as usize {
            Some(candidate)
        } else {
            None
        }
    }
}

impl Dmem for HostDmem {
    fn alloc(&mut self, size: usize) -> DmemResult<DmemAddr> {
        if size == 0 {
            return Err(DmemError::out_of_memory(0));
        }
        let size = size.div_ceil(ALIGN) * ALIGN;
        let start = self
            .first_fit(size)
            .ok_or(DmemError::OutOfMemory { requested: size })?;

        self.blocks.insert(start, size);
        self.bytes[start as usize..start as usize + size].fill(0);
        debug!("dmem alloc: {} bytes at {:#010x}", size, start);
        Ok(DmemAddr::from_raw(start))
    }

    fn free(&mut self, addr: DmemAddr) -> DmemResult<()> {
        if addr.is_null() {
            warn!("dmem free of null address ignored");
            return Ok(());
        }
        match self.blocks.remove(&addr.as_u32()) {
            Some(size) => {
                debug!("dmem free: {} bytes at {}", size, addr);
                Ok(())
            }
            None => Err(DmemError::bad_address(addr.as_u32())),
        }
    }

    fn write(&mut self, addr: DmemAddr, bytes: &[u8]) -> DmemResult<()> {
        if self.write_faults > 0 {
            self.write_faults -= 1;
            warn!("dmem write fault injected at {}", addr);
            return Err(DmemError::WriteFailed {
                addr: addr.as_u32(),
            });
        }
        let start = addr.as_u32();
        if self.containing_block(start, bytes.len()).is_none() {
            return Err(DmemError::out_of_bounds(start, bytes.len()));
        }
        self.bytes[start as usize..start as usize + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read(&self, addr: DmemAddr, len: usize) -> DmemResult<Vec<u8>> {
        let start = addr.as_u32();
        if self.containing_block(start, len).is_none() {
            return Err(DmemError::out_of_bounds(start, len));
        }
        Ok(self.bytes[start as usize..start as usize + len].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_alloc_never_returns_null() {
        let mut dmem = HostDmem::new(256);
        let addr = dmem.alloc(8).unwrap();
        assert!(!addr.is_null());
    }

    #[test]
    fn test_alloc_free_accounting() {
        let mut dmem = HostDmem::new(1024);
        let a = dmem.alloc(16).unwrap();
        let b = dmem.alloc(32).unwrap();
        assert_eq!(dmem.outstanding(), 2);
        assert_eq!(dmem.bytes_in_use(), 48);

        dmem.free(a).unwrap();
        dmem.free(b).unwrap();
        assert_eq!(dmem.outstanding(), 0);
        assert_eq!(dmem.bytes_in_use(), 0);
    }

    #[test]
    fn test_alloc_reuses_freed_space() {
        let mut dmem = HostDmem::new(256);
        let a = dmem.alloc(64).unwrap();
        dmem.free(a).unwrap();
        let b = dmem.alloc(64).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_alloc_exhaustion() {
        let mut dmem = HostDmem::new(128);
        let _a = dmem.alloc(64).unwrap();
        let err = dmem.alloc(512).unwrap_err();
        assert!(matches!(err, DmemError::OutOfMemory { .. }));
    }

    #[test]
    fn test_double_free_reports_bad_address() {
        let mut dmem = HostDmem::new(256);
        let a = dmem.alloc(8).unwrap();
        dmem.free(a).unwrap();
        assert_eq!(dmem.free(a), Err(DmemError::bad_address(a.as_u32())));
    }

    #[test]
    fn test_free_null_is_noop() {
        let mut dmem = HostDmem::new(256);
        assert!(dmem.free(DmemAddr::NULL).is_ok());
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut dmem = HostDmem::new(256);
        let addr = dmem.alloc(16).unwrap();
        dmem.write(addr, &[0xde, 0xad, 0xbe, 0xef]).unwrap();
        assert_eq!(dmem.read(addr, 4).unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_write_outside_allocation() {
        let mut dmem = HostDmem::new(256);
        let addr = dmem.alloc(8).unwrap();
        let err = dmem.write(addr, &[0; 64]).unwrap_err();
        assert!(matches!(err, DmemError::OutOfBounds { .. }));

        let stray = DmemAddr::from_raw(0x20);
        assert!(dmem.write(stray, &[0; 4]).is_err());
    }

    #[test]
    fn test_write_within_block_interior() {
        let mut dmem = HostDmem::new(256);
        let addr = dmem.alloc(32).unwrap();
        let interior = DmemAddr::from_raw(addr.as_u32() + 8);
        dmem.write(interior, &[7; 4]).unwrap();
        assert_eq!(dmem.read(interior, 4).unwrap(), vec![7; 4]);
    }

    #[test]
    fn test_injected_write_fault() {
        let mut dmem = HostDmem::new(256);
        let addr = dmem.alloc(8).unwrap();
        dmem.inject_write_faults(1);
        assert!(matches!(
            dmem.write(addr, &[1]),
            Err(DmemError::WriteFailed { .. })
        ));
        // Next write goes through.
        assert!(dmem.write(addr, &[1]).is_ok());
    }
}
