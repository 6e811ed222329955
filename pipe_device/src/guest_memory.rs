// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest physical memory access, supplied by the hosting VMM.
//!
//! The device moves pipe payloads directly between guest buffers and service
//! handlers, so the seam exposes a mapping primitive in addition to plain
//! reads and writes. A mapping is a borrow-scoped guard: it is released on
//! every exit path when it drops, and writes through a writable mapping
//! reach guest memory by then.

use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// A guest memory access error.
#[derive(Debug, Error)]
pub enum GuestMemoryError {
    /// The range does not point at guest RAM.
    #[error("guest memory access out of range: gpa {gpa:#x} len {len:#x}")]
    OutOfRange {
        /// Guest physical address of the failed access.
        gpa: u64,
        /// Length of the failed access.
        len: u64,
    },
}

/// Implemented by the hosting VMM to expose guest physical memory to the
/// device.
pub trait GuestMemoryAccess: Send + Sync {
    /// Reads `dest.len()` bytes at `gpa`.
    fn read(&self, gpa: u64, dest: &mut [u8]) -> Result<(), GuestMemoryError>;

    /// Writes `src` at `gpa`.
    fn write(&self, gpa: u64, src: &[u8]) -> Result<(), GuestMemoryError>;

    /// Maps `len` bytes at `gpa` for direct host access.
    ///
    /// The mapping may come back shorter than requested if the tail of the
    /// range leaves RAM; callers that need the full length must check
    /// [`MappedRange::mapped_len`].
    fn map(
        &self,
        gpa: u64,
        len: usize,
        writable: bool,
    ) -> Result<Box<dyn MappedRange + '_>, GuestMemoryError>;
}

/// A mapped guest memory range. Dropping the value releases the mapping.
pub trait MappedRange {
    /// The mapped bytes.
    fn bytes(&mut self) -> &mut [u8];

    /// Length of the mapping, which may be shorter than requested.
    fn mapped_len(&self) -> usize;
}

/// Cloneable handle to guest memory.
#[derive(Clone)]
pub struct GuestMemory {
    imp: Arc<dyn GuestMemoryAccess>,
}

impl GuestMemory {
    /// Wraps a backing implementation.
    pub fn new(imp: Arc<dyn GuestMemoryAccess>) -> Self {
        Self { imp }
    }

    /// Reads `dest.len()` bytes at `gpa`.
    pub fn read_at(&self, gpa: u64, dest: &mut [u8]) -> Result<(), GuestMemoryError> {
        self.imp.read(gpa, dest)
    }

    /// Writes `src` at `gpa`.
    pub fn write_at(&self, gpa: u64, src: &[u8]) -> Result<(), GuestMemoryError> {
        self.imp.write(gpa, src)
    }

    /// Reads a plain (no pointers, any bit pattern valid) struct at `gpa`.
    pub fn read_plain<T: FromBytes + IntoBytes + KnownLayout>(
        &self,
        gpa: u64,
    ) -> Result<T, GuestMemoryError> {
        let mut val = T::new_zeroed();
        self.imp.read(gpa, val.as_mut_bytes())?;
        Ok(val)
    }

    /// Writes a plain struct at `gpa`.
    pub fn write_plain<T: IntoBytes + Immutable + KnownLayout>(
        &self,
        gpa: u64,
        val: &T,
    ) -> Result<(), GuestMemoryError> {
        self.imp.write(gpa, val.as_bytes())
    }

    /// Maps `len` bytes at `gpa`. See [`GuestMemoryAccess::map`].
    pub fn map(
        &self,
        gpa: u64,
        len: usize,
        writable: bool,
    ) -> Result<Box<dyn MappedRange + '_>, GuestMemoryError> {
        self.imp.map(gpa, len, writable)
    }
}

/// Dense heap-backed guest RAM.
///
/// Suitable for tests and embedders that do not bring their own memory
/// backend. A mapping holds the backing lock until it drops, so service
/// handlers must not access guest memory from inside a transfer.
pub struct GuestRam {
    mem: Mutex<Box<[u8]>>,
}

impl GuestRam {
    /// Allocates `size` bytes of zeroed RAM.
    pub fn new(size: usize) -> Self {
        Self {
            mem: Mutex::new(vec![0; size].into_boxed_slice()),
        }
    }

    fn range(mem: &[u8], gpa: u64, len: usize) -> Result<(usize, usize), GuestMemoryError> {
        let start = usize::try_from(gpa).ok();
        let end = start
            .and_then(|s| s.checked_add(len))
            .filter(|&e| e <= mem.len());
        match (start, end) {
            (Some(start), Some(end)) => Ok((start, end)),
            _ => Err(GuestMemoryError::OutOfRange {
                gpa,
                len: len as u64,
            }),
        }
    }
}

impl GuestMemoryAccess for GuestRam {
    fn read(&self, gpa: u64, dest: &mut [u8]) -> Result<(), GuestMemoryError> {
        let mem = self.mem.lock();
        let (start, end) = Self::range(&mem, gpa, dest.len())?;
        dest.copy_from_slice(&mem[start..end]);
        Ok(())
    }

    fn write(&self, gpa: u64, src: &[u8]) -> Result<(), GuestMemoryError> {
        let mut mem = self.mem.lock();
        let (start, end) = Self::range(&mem, gpa, src.len())?;
        mem[start..end].copy_from_slice(src);
        Ok(())
    }

    fn map(
        &self,
        gpa: u64,
        len: usize,
        _writable: bool,
    ) -> Result<Box<dyn MappedRange + '_>, GuestMemoryError> {
        let mem = self.mem.lock();
        let start = usize::try_from(gpa)
            .ok()
            .filter(|&s| s <= mem.len())
            .ok_or(GuestMemoryError::OutOfRange {
                gpa,
                len: len as u64,
            })?;
        // Clamp to RAM; short mappings are the caller's problem.
        let mapped = len.min(mem.len() - start);
        Ok(Box::new(RamMapping {
            mem,
            start,
            len: mapped,
        }))
    }
}

struct RamMapping<'a> {
    mem: MutexGuard<'a, Box<[u8]>>,
    start: usize,
    len: usize,
}

impl MappedRange for RamMapping<'_> {
    fn bytes(&mut self) -> &mut [u8] {
        &mut self.mem[self.start..self.start + self.len]
    }

    fn mapped_len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_round_trip() {
        let ram = GuestRam::new(0x100);
        ram.write(0x10, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0; 4];
        ram.read(0x10, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn out_of_range() {
        let ram = GuestRam::new(0x100);
        assert!(ram.write(0xfe, &[0; 4]).is_err());
        assert!(ram.read(0x100, &mut [0; 1]).is_err());
        assert!(ram.map(0x101, 1, false).is_err());
    }

    #[test]
    fn map_clamps_to_ram() {
        let ram = GuestRam::new(0x100);
        let mapping = ram.map(0xf0, 0x20, true).unwrap();
        assert_eq!(mapping.mapped_len(), 0x10);
    }

    #[test]
    fn map_writes_reach_ram() {
        let ram = GuestRam::new(0x100);
        {
            let mut mapping = ram.map(0x20, 4, true).unwrap();
            mapping.bytes().copy_from_slice(b"abcd");
        }
        let mut buf = [0; 4];
        ram.read(0x20, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn plain_struct_round_trip() {
        let ram = GuestRam::new(0x100);
        let mem = GuestMemory::new(Arc::new(ram));
        mem.write_plain(0x40, &0x1122_3344_5566_7788u64).unwrap();
        assert_eq!(mem.read_plain::<u64>(0x40).unwrap(), 0x1122_3344_5566_7788);

        mem.write_at(0x80, b"bytes").unwrap();
        let mut buf = [0; 5];
        mem.read_at(0x80, &mut buf).unwrap();
        assert_eq!(&buf, b"bytes");
    }
}
