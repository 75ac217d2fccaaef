//! Raw byte arena: untyped allocations behind `rt_alloc`/`rt_free`.
//!
//! A handle space separate from the typed heap; allocations are plain byte
//! buffers with a recorded alignment and no reference counting. Freeing
//! validates that the caller's size and alignment match the allocation.

use crate::error::{PanicKind, VmError, err};
use crate::value::RawHandle;

#[derive(Debug)]
struct RawBlock {
    bytes: Vec<u8>,
    align: u64,
    freed: bool,
}

#[derive(Debug, Default)]
pub struct RawMemory {
    blocks: Vec<RawBlock>,
}

impl RawMemory {
    pub fn new() -> Self {
        RawMemory::default()
    }

    pub fn alloc(&mut self, size: u64, align: u64) -> Result<RawHandle, VmError> {
        if align == 0 || !align.is_power_of_two() {
            return Err(err(
                PanicKind::InvalidNumericConversion,
                format!("invalid alignment {align}"),
            ));
        }
        self.blocks.push(RawBlock {
            bytes: vec![0; size as usize],
            align,
            freed: false,
        });
        Ok(RawHandle(self.blocks.len() as u64))
    }

    fn block(&self, h: RawHandle) -> Result<&RawBlock, VmError> {
        if h.0 == 0 {
            return Err(err(PanicKind::InvalidHandle, "invalid raw handle 0"));
        }
        self.blocks.get(h.0 as usize - 1).ok_or_else(|| {
            err(
                PanicKind::InvalidHandle,
                format!("invalid raw handle {}", h.0),
            )
        })
    }

    fn live_block_mut(&mut self, h: RawHandle) -> Result<&mut RawBlock, VmError> {
        if h.0 == 0 {
            return Err(err(PanicKind::InvalidHandle, "invalid raw handle 0"));
        }
        let block = self.blocks.get_mut(h.0 as usize - 1).ok_or_else(|| {
            err(
                PanicKind::InvalidHandle,
                format!("invalid raw handle {}", h.0),
            )
        })?;
        if block.freed {
            return Err(err(
                PanicKind::UseAfterFreeHeap,
                format!("use of freed raw allocation {}", h.0),
            ));
        }
        Ok(block)
    }

    /// Free a block; the declared size and alignment must match the
    /// allocation exactly.
    pub fn free(&mut self, h: RawHandle, size: u64, align: u64) -> Result<(), VmError> {
        let block = {
            let b = self.block(h)?;
            if b.freed {
                return Err(err(
                    PanicKind::DoubleFree,
                    format!("double free of raw allocation {}", h.0),
                ));
            }
            (b.bytes.len() as u64, b.align)
        };
        if block.0 != size || block.1 != align {
            return Err(err(
                PanicKind::InvalidNumericConversion,
                format!(
                    "free of raw allocation {} with size {size} align {align}, allocated with size {} align {}",
                    h.0, block.0, block.1
                ),
            ));
        }
        let b = self.live_block_mut(h)?;
        b.bytes = Vec::new();
        b.freed = true;
        Ok(())
    }

    /// Fresh allocation of `new_size`, copy of `min(old_size, new_size)`
    /// bytes, free of the old block.
    pub fn realloc(
        &mut self,
        h: RawHandle,
        old_size: u64,
        new_size: u64,
        align: u64,
    ) -> Result<RawHandle, VmError> {
        let copy_len = old_size.min(new_size) as usize;
        let prefix = {
            let b = self.live_block_mut(h)?;
            if b.bytes.len() < copy_len {
                return Err(err(
                    PanicKind::OutOfBounds,
                    format!("realloc reads {copy_len} bytes from a {}-byte block", b.bytes.len()),
                ));
            }
            b.bytes[..copy_len].to_vec()
        };
        let new = self.alloc(new_size, align)?;
        self.live_block_mut(new)?.bytes[..copy_len].copy_from_slice(&prefix);
        self.free(h, old_size, align)?;
        Ok(new)
    }

    pub fn read(&self, h: RawHandle, offset: u64, len: u64) -> Result<&[u8], VmError> {
        let b = self.block(h)?;
        if b.freed {
            return Err(err(
                PanicKind::UseAfterFreeHeap,
                format!("use of freed raw allocation {}", h.0),
            ));
        }
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= b.bytes.len() as u64)
            .ok_or_else(|| {
                err(
                    PanicKind::OutOfBounds,
                    format!(
                        "raw read of {len} bytes at offset {offset} exceeds {}-byte block",
                        b.bytes.len()
                    ),
                )
            })?;
        Ok(&b.bytes[offset as usize..end as usize])
    }

    pub fn write(&mut self, h: RawHandle, offset: u64, data: &[u8]) -> Result<(), VmError> {
        let b = self.live_block_mut(h)?;
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= b.bytes.len() as u64)
            .ok_or_else(|| {
                err(
                    PanicKind::OutOfBounds,
                    format!(
                        "raw write of {} bytes at offset {offset} exceeds {}-byte block",
                        data.len(),
                        b.bytes.len()
                    ),
                )
            })?;
        b.bytes[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    /// `memmove` within the arena; correct for overlapping ranges.
    pub fn move_within(
        &mut self,
        dst: RawHandle,
        dst_off: u64,
        src: RawHandle,
        src_off: u64,
        len: u64,
    ) -> Result<(), VmError> {
        // copy_within handles overlap when source and destination share a
        // block; distinct blocks cannot overlap.
        if dst == src {
            let b = self.live_block_mut(dst)?;
            let size = b.bytes.len() as u64;
            let src_end = src_off.checked_add(len).filter(|e| *e <= size);
            let dst_end = dst_off.checked_add(len).filter(|e| *e <= size);
            if src_end.is_none() || dst_end.is_none() {
                return Err(err(
                    PanicKind::OutOfBounds,
                    format!("memmove of {len} bytes exceeds {size}-byte block"),
                ));
            }
            b.bytes
                .copy_within(src_off as usize..(src_off + len) as usize, dst_off as usize);
            Ok(())
        } else {
            let data = self.read(src, src_off, len)?.to_vec();
            self.write(dst, dst_off, &data)
        }
    }

    pub fn size_of(&self, h: RawHandle) -> Result<u64, VmError> {
        Ok(self.block(h)?.bytes.len() as u64)
    }
}
