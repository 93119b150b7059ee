//! Segmented guest memory and the per-instance heap allocator.
//!
//! The address space is a set of named, permissioned segments, each backed by a contiguous byte
//! buffer. Every guest access is checked for alignment, segment membership, and permission before
//! any byte moves; segment membership is computed over inclusive [`AddressRange`]s so that
//! address arithmetic can never wrap around the 32-bit space unnoticed. These checks are the
//! core's trust boundary against guest code.

use crate::{Alignment, AddressRange};
use log::{debug, trace};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Base address of the standard code segment.
pub const CODE_BASE: u32 = 0x0000_8000;
/// Base address of the standard data segment.
pub const DATA_BASE: u32 = 0x0002_0000;
/// Base address of the standard heap segment.
pub const HEAP_BASE: u32 = 0x0003_0000;
/// Base address of the standard stack segment.
pub const STACK_BASE: u32 = 0x0004_0000;
/// Size of each standard segment.
pub const SEGMENT_SIZE: u32 = 0x0001_0000;

/// The kind of memory access being performed, for permission checks and error reporting.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Execute => "execute",
        })
    }
}

/// Access permissions of a segment.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Permissions {
    pub const R: Self = Self {
        read: true,
        write: false,
        execute: false,
    };
    pub const RW: Self = Self {
        read: true,
        write: true,
        execute: false,
    };
    pub const RX: Self = Self {
        read: true,
        write: false,
        execute: true,
    };
    pub const RWX: Self = Self {
        read: true,
        write: true,
        execute: true,
    };

    /// Returns `true` if these permissions allow `access`.
    pub fn allows(self, access: AccessType) -> bool {
        match access {
            AccessType::Read => self.read,
            AccessType::Write => self.write,
            AccessType::Execute => self.execute,
        }
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (allowed, ch) in [(self.read, 'r'), (self.write, 'w'), (self.execute, 'x')] {
            let ch = match allowed {
                true => ch,
                false => '-',
            };
            write!(f, "{ch}")?;
        }
        Ok(())
    }
}

/// A named, permissioned, contiguous region of the guest address space.
#[derive(Debug, Clone)]
struct Segment {
    name: String,
    range: AddressRange,
    permissions: Permissions,
    data: Vec<u8>,
}

impl Segment {
    /// Returns the backing-buffer slice for `range`, which must lie within this segment.
    fn slice(&self, range: AddressRange) -> &[u8] {
        const_assert!(usize::BITS >= 32);
        let start = (range.start() - self.range.start()) as usize;
        let end = (range.end() - self.range.start()) as usize;
        &self.data[start..=end]
    }

    fn slice_mut(&mut self, range: AddressRange) -> &mut [u8] {
        let start = (range.start() - self.range.start()) as usize;
        let end = (range.end() - self.range.start()) as usize;
        &mut self.data[start..=end]
    }
}

/// The segmented memory of a single VM instance, including its heap allocator state.
#[derive(Debug, Clone)]
pub struct Memory {
    segments: Vec<Segment>,
    heap: Heap,
}

impl Default for Memory {
    fn default() -> Self {
        Self::standard()
    }
}

impl Memory {
    /// Create a memory with no segments and an empty heap.
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
            heap: Heap::new(AddressRange::from_base_and_size(HEAP_BASE, SEGMENT_SIZE).unwrap()),
        }
    }

    /// Create the standard segment layout: code (rwx until [`Self::make_code_readonly`]), data,
    /// heap, and stack.
    pub fn standard() -> Self {
        let mut memory = Self::new();
        memory
            .add_segment("code", CODE_BASE, SEGMENT_SIZE, Permissions::RWX)
            .unwrap();
        memory
            .add_segment("data", DATA_BASE, SEGMENT_SIZE, Permissions::RW)
            .unwrap();
        memory
            .add_segment("heap", HEAP_BASE, SEGMENT_SIZE, Permissions::RW)
            .unwrap();
        memory
            .add_segment("stack", STACK_BASE, SEGMENT_SIZE, Permissions::RW)
            .unwrap();
        memory
    }

    /// Add a zero-initialized segment. The segment may not wrap past the end of the 32-bit
    /// address space, and `size` must be non-zero.
    pub fn add_segment(
        &mut self,
        name: impl Into<String>,
        base: u32,
        size: u32,
        permissions: Permissions,
    ) -> Result<(), MemoryError> {
        let range = AddressRange::from_base_and_size(base, size)
            .map_err(|_| MemoryError::WrapAround { address: base })?;
        self.segments.push(Segment {
            name: name.into(),
            range,
            permissions,
            data: vec![0; range.size().unwrap()],
        });
        Ok(())
    }

    /// Strips the write permission from the code segment, sealing it after program load.
    pub fn make_code_readonly(&mut self) {
        for segment in &mut self.segments {
            if segment.name == "code" {
                segment.permissions.write = false;
            }
        }
    }

    /// Returns the address range of the named segment, if present.
    pub fn segment_range(&self, name: &str) -> Option<AddressRange> {
        self.segments
            .iter()
            .find(|segment| segment.name == name)
            .map(|segment| segment.range)
    }

    /// Iterate over `(name, range, permissions)` of all segments, in registration order.
    pub fn segments(&self) -> impl Iterator<Item = (&str, AddressRange, Permissions)> {
        self.segments
            .iter()
            .map(|segment| (segment.name.as_str(), segment.range, segment.permissions))
    }

    /// Reads a naturally-aligned little-endian word.
    pub fn read_word(&self, address: u32) -> Result<u32, MemoryError> {
        trace!("Reading word from memory at {address:#010x}");
        let mut buf = [0u8; 4];
        self.read_span(address, &mut buf, Alignment::WORD, AccessType::Read)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Writes a naturally-aligned little-endian word.
    pub fn write_word(&mut self, address: u32, value: u32) -> Result<(), MemoryError> {
        trace!(value; "Writing word to memory at {address:#010x}");
        self.write_span(address, &value.to_le_bytes(), Alignment::WORD)
    }

    /// Reads a naturally-aligned little-endian halfword.
    pub fn read_halfword(&self, address: u32) -> Result<u16, MemoryError> {
        trace!("Reading halfword from memory at {address:#010x}");
        let mut buf = [0u8; 2];
        self.read_span(address, &mut buf, Alignment::HALFWORD, AccessType::Read)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Writes a naturally-aligned little-endian halfword.
    pub fn write_halfword(&mut self, address: u32, value: u16) -> Result<(), MemoryError> {
        trace!(value; "Writing halfword to memory at {address:#010x}");
        self.write_span(address, &value.to_le_bytes(), Alignment::HALFWORD)
    }

    /// Reads a single byte.
    pub fn read_byte(&self, address: u32) -> Result<u8, MemoryError> {
        trace!("Reading byte from memory at {address:#010x}");
        let mut buf = [0u8; 1];
        self.read_span(address, &mut buf, Alignment::BYTE, AccessType::Read)?;
        Ok(buf[0])
    }

    /// Writes a single byte.
    pub fn write_byte(&mut self, address: u32, value: u8) -> Result<(), MemoryError> {
        trace!(value; "Writing byte to memory at {address:#010x}");
        self.write_span(address, &[value], Alignment::BYTE)
    }

    /// Fetches an instruction word; requires execute permission on the containing segment.
    pub fn read_instruction(&self, address: u32) -> Result<u32, MemoryError> {
        trace!("Fetching instruction from memory at {address:#010x}");
        let mut buf = [0u8; 4];
        self.read_span(address, &mut buf, Alignment::WORD, AccessType::Execute)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Reads `buf.len()` bytes starting at `address`. The whole span must lie in one readable
    /// segment.
    pub fn read_bytes(&self, address: u32, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.read_span(address, buf, Alignment::BYTE, AccessType::Read)
    }

    /// Writes `buf` starting at `address`. The whole span must lie in one writable segment.
    pub fn write_bytes(&mut self, address: u32, buf: &[u8]) -> Result<(), MemoryError> {
        self.write_span(address, buf, Alignment::BYTE)
    }

    /// Checks that the span `[address, address + size)` is accessible for `access`, without
    /// transferring any data. Used by the block-transfer instructions, which must validate the
    /// entire range before touching memory.
    pub fn check_span(&self, address: u32, size: u32, access: AccessType) -> Result<(), MemoryError> {
        let range = span(address, size as usize)?;
        self.segment_for(range, access)?;
        Ok(())
    }

    /// Writes a program image through the privileged load path, ignoring the write-permission
    /// bit. The span must still lie within a single segment.
    pub fn load_image(&mut self, base: u32, image: &[u8]) -> Result<(), MemoryError> {
        debug!(
            "Loading {} byte image at {base:#010x}",
            image.len()
        );
        let range = span(base, image.len())?;
        let segment = self
            .segments
            .iter_mut()
            .find(|segment| segment.range.contains_range(range))
            .ok_or(MemoryError::AccessFault { address: base })?;
        segment.slice_mut(range).copy_from_slice(image);
        Ok(())
    }

    fn read_span(
        &self,
        address: u32,
        buf: &mut [u8],
        alignment: Alignment,
        access: AccessType,
    ) -> Result<(), MemoryError> {
        if !alignment.is_aligned(address) {
            debug!("Misaligned {access} of {} bytes at {address:#010x}", buf.len());
            return Err(MemoryError::MisalignedAccess { address });
        }
        let range = span(address, buf.len())?;
        let segment = self.segment_for(range, access)?;
        buf.copy_from_slice(segment.slice(range));
        Ok(())
    }

    fn write_span(
        &mut self,
        address: u32,
        buf: &[u8],
        alignment: Alignment,
    ) -> Result<(), MemoryError> {
        if !alignment.is_aligned(address) {
            debug!("Misaligned write of {} bytes at {address:#010x}", buf.len());
            return Err(MemoryError::MisalignedAccess { address });
        }
        let range = span(address, buf.len())?;
        // Borrow-friendly rerun of the lookup against mutable segments.
        self.segment_for(range, AccessType::Write)?;
        let segment = self
            .segments
            .iter_mut()
            .find(|segment| segment.range.contains_range(range))
            .unwrap();
        segment.slice_mut(range).copy_from_slice(buf);
        Ok(())
    }

    fn segment_for(
        &self,
        range: AddressRange,
        access: AccessType,
    ) -> Result<&Segment, MemoryError> {
        let segment = self
            .segments
            .iter()
            .find(|segment| segment.range.contains_range(range))
            .ok_or(MemoryError::AccessFault {
                address: range.start(),
            })?;
        if !segment.permissions.allows(access) {
            debug!(
                "Permission denied: {access} at {:#010x} in segment {} ({})",
                range.start(),
                segment.name,
                segment.permissions
            );
            return Err(MemoryError::PermissionDenied {
                address: range.start(),
                access,
            });
        }
        Ok(segment)
    }

    //
    // Heap allocator
    //

    /// Allocates `size` bytes on the guest heap, 4-byte aligned.
    ///
    /// Returns the allocation address, or 0 (mirroring `malloc`) when `size` is zero, the
    /// request overflows, or the heap is exhausted.
    pub fn allocate(&mut self, size: u32) -> u32 {
        let address = self.heap.allocate(size);
        trace!(size; "Heap allocation returned {address:#010x}");
        address
    }

    /// Frees a live allocation, zeroing its payload bytes.
    pub fn free(&mut self, address: u32) -> Result<(), HeapError> {
        let size = self.heap.release(address)?;
        trace!(size; "Freeing heap allocation at {address:#010x}");
        let range = span(address, size as usize).expect("live allocation spans are valid");
        let segment = self
            .segments
            .iter_mut()
            .find(|segment| segment.range.contains_range(range))
            .expect("live allocations lie in the heap segment");
        segment.slice_mut(range).fill(0);
        Ok(())
    }

    /// Resizes a live allocation by allocating a new block, copying
    /// `min(old_size, new_size)` bytes, and freeing the old block.
    ///
    /// With `old == 0` this behaves as [`Self::allocate`]. Returns the new address, or 0 on
    /// failure, in which case the old allocation is left intact.
    pub fn reallocate(&mut self, old: u32, new_size: u32) -> u32 {
        if old == 0 {
            return self.allocate(new_size);
        }
        let Some(old_size) = self.heap.size_of(old) else {
            debug!("Reallocate of {old:#010x}, which is not a live allocation");
            return 0;
        };
        let new = self.allocate(new_size);
        if new == 0 {
            return 0;
        }
        let mut payload = vec![0u8; old_size.min(new_size) as usize];
        // Both spans were validated when their blocks were carved out of the heap segment.
        self.read_bytes(old, &mut payload).unwrap();
        self.write_bytes(new, &payload).unwrap();
        self.free(old).unwrap();
        new
    }

    /// Clears all live allocations and returns the bump pointer to the heap base. The backing
    /// bytes are not scrubbed.
    pub fn reset_heap(&mut self) {
        self.heap.reset();
    }

    /// The number of live heap allocations. Diagnostic only.
    pub fn live_allocations(&self) -> usize {
        self.heap.live.len()
    }
}

/// Heap bookkeeping: a bump pointer, the live-allocation index, and a free list of reusable
/// blocks. The payload bytes themselves live in the heap segment.
#[derive(Debug, Clone)]
struct Heap {
    range: AddressRange,
    next: u32,
    /// Live allocations, address → requested size.
    live: BTreeMap<u32, u32>,
    /// Freed blocks, `(address, rounded capacity)`. Never coalesced.
    free: Vec<(u32, u32)>,
}

impl Heap {
    fn new(range: AddressRange) -> Self {
        Self {
            range,
            next: range.start(),
            live: BTreeMap::new(),
            free: Vec::new(),
        }
    }

    fn allocate(&mut self, size: u32) -> u32 {
        if size == 0 {
            return 0;
        }
        let Some(rounded) = size.checked_add(3).map(|s| s & !3) else {
            return 0;
        };
        if let Some(index) = self
            .free
            .iter()
            .position(|&(_, capacity)| capacity >= rounded)
        {
            let (address, _) = self.free.swap_remove(index);
            self.live.insert(address, size);
            return address;
        }
        let address = self.next;
        let Some(end) = address.checked_add(rounded) else {
            return 0;
        };
        // end is exclusive; it may sit one past the segment, but no further.
        if end - 1 > self.range.end() {
            return 0;
        }
        self.next = end;
        self.live.insert(address, size);
        address
    }

    /// Removes a live allocation, returning the rounded payload size that should be zeroed.
    fn release(&mut self, address: u32) -> Result<u32, HeapError> {
        let size = self
            .live
            .remove(&address)
            .ok_or(HeapError::UnknownAddress { address })?;
        let rounded = (size + 3) & !3;
        self.free.push((address, rounded));
        Ok(rounded)
    }

    fn size_of(&self, address: u32) -> Option<u32> {
        self.live.get(&address).copied()
    }

    fn reset(&mut self) {
        self.next = self.range.start();
        self.live.clear();
        self.free.clear();
    }
}

/// Builds the inclusive range covered by a `len`-byte access at `address`, rejecting spans that
/// wrap around the address space.
fn span(address: u32, len: usize) -> Result<AddressRange, MemoryError> {
    let len = u32::try_from(len).map_err(|_| MemoryError::WrapAround { address })?;
    let delta = len.checked_sub(1).ok_or(MemoryError::AccessFault { address })?;
    let end = address
        .checked_add(delta)
        .ok_or(MemoryError::WrapAround { address })?;
    Ok(AddressRange::new(address, end).unwrap())
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum MemoryError {
    #[error("misaligned access at {address:#010x}")]
    MisalignedAccess { address: u32 },
    #[error("access fault at {address:#010x}: no segment covers the requested span")]
    AccessFault { address: u32 },
    #[error("permission denied for {access} at {address:#010x}")]
    PermissionDenied { address: u32, access: AccessType },
    #[error("access at {address:#010x} wraps around the address space")]
    WrapAround { address: u32 },
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum HeapError {
    #[error("address {address:#010x} is not a live heap allocation")]
    UnknownAddress { address: u32 },
}
