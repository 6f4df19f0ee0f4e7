//! Opaque DMA-buffer handle table.
//!
//! Real enrollment (IOMMU mapping, allocation) lives in an external
//! collaborator; the runtime only tracks handles per client so commands can
//! validate references and lifetimes.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A buffer enrolled from a caller-provided DMA descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrolledBuffer {
    pub handle: u64,
    pub dma_fd: i32,
    pub flags: u32,
    /// Device-visible address assigned at enrollment.
    pub iova: u64,
}

/// A buffer allocated on the client's behalf.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedBuffer {
    pub handle: u64,
    pub size: usize,
    pub flags: u32,
}

/// Per-client table of enrolled and allocated buffer handles.
#[derive(Debug, Default)]
pub struct BufferTable {
    next_handle: u64,
    enrolled: HashMap<u64, EnrolledBuffer>,
    allocated: HashMap<u64, AllocatedBuffer>,
}

impl BufferTable {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            ..Self::default()
        }
    }

    fn next_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    pub fn enroll(&mut self, dma_fd: i32, flags: u32) -> Result<EnrolledBuffer> {
        if dma_fd < 0 {
            return Err(Error::BadFd(dma_fd));
        }
        let handle = self.next_handle();
        let buffer = EnrolledBuffer {
            handle,
            dma_fd,
            flags,
            iova: handle << 12,
        };
        self.enrolled.insert(handle, buffer.clone());
        Ok(buffer)
    }

    pub fn disenroll(&mut self, handle: u64) -> Result<()> {
        self.enrolled.remove(&handle).map(|_| ()).ok_or(Error::NotFound)
    }

    pub fn alloc(&mut self, size: usize, flags: u32) -> Result<AllocatedBuffer> {
        if size == 0 {
            return Err(Error::InvalidArg("zero-size buffer allocation".into()));
        }
        let handle = self.next_handle();
        let buffer = AllocatedBuffer {
            handle,
            size,
            flags,
        };
        self.allocated.insert(handle, buffer.clone());
        Ok(buffer)
    }

    pub fn free(&mut self, handle: u64) -> Result<()> {
        self.allocated.remove(&handle).map(|_| ()).ok_or(Error::NotFound)
    }

    /// Validates a CPU-access window against an allocated or enrolled
    /// buffer.
    pub fn cpu_access(&self, handle: u64, offset: usize, len: usize) -> Result<()> {
        let end = offset.checked_add(len).ok_or(Error::Overflow)?;
        if let Some(buffer) = self.allocated.get(&handle) {
            if end > buffer.size {
                return Err(Error::InvalidArg("cpu access beyond buffer end".into()));
            }
            return Ok(());
        }
        if self.enrolled.contains_key(&handle) {
            return Ok(());
        }
        Err(Error::NotFound)
    }

    pub fn enrolled_count(&self) -> usize {
        self.enrolled.len()
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enroll_and_disenroll() {
        let mut table = BufferTable::new();
        let buffer = table.enroll(5, 0).unwrap();
        assert!(buffer.iova > 0);
        assert_eq!(table.enrolled_count(), 1);
        table.disenroll(buffer.handle).unwrap();
        assert_eq!(table.disenroll(buffer.handle), Err(Error::NotFound));
    }

    #[test]
    fn enroll_rejects_bad_descriptor() {
        let mut table = BufferTable::new();
        assert_eq!(table.enroll(-1, 0), Err(Error::BadFd(-1)));
    }

    #[test]
    fn alloc_free_and_access_bounds() {
        let mut table = BufferTable::new();
        let buffer = table.alloc(4096, 0).unwrap();
        table.cpu_access(buffer.handle, 0, 4096).unwrap();
        assert!(table.cpu_access(buffer.handle, 4000, 200).is_err());
        assert_eq!(
            table.cpu_access(buffer.handle, usize::MAX, 2),
            Err(Error::Overflow)
        );
        table.free(buffer.handle).unwrap();
        assert_eq!(table.cpu_access(buffer.handle, 0, 1), Err(Error::NotFound));
    }

    #[test]
    fn alloc_rejects_zero_size() {
        let mut table = BufferTable::new();
        assert!(matches!(table.alloc(0, 0), Err(Error::InvalidArg(_))));
    }
}
