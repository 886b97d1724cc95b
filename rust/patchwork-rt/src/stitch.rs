//! Stitching specialized boilerplates into one contiguous code buffer.
//!
//! Callees are emitted before their callers so that a callee's final address
//! can be handed to the caller as a boilerplate-pointer fixup value.

use patchwork_core::Blueprint;
use tracing::debug;

use crate::exec_buffer::{ExecMemoryError, ExecutableBuffer, Sealed, Writable};
use crate::specialize::{specialize, FixupValues, SpecializeError};

/// Where one specialized piece landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmittedCode {
    /// Offset from the start of the buffer.
    pub offset: usize,
    /// Absolute address; pass this as a fixup value to callers.
    pub address: u64,
    pub len: usize,
}

#[derive(Debug)]
pub struct CodeStitcher {
    buffer: ExecutableBuffer<Writable>,
    len: usize,
}

impl CodeStitcher {
    pub fn with_capacity(bytes: usize) -> Result<Self, ExecMemoryError> {
        Ok(Self {
            buffer: ExecutableBuffer::new(bytes)?,
            len: 0,
        })
    }

    /// Specialize `blueprint` at the current end of the buffer.
    pub fn emit(
        &mut self,
        blueprint: &Blueprint<'_>,
        values: &FixupValues,
    ) -> Result<EmittedCode, SpecializeError> {
        let packed = values.pack(blueprint)?;
        self.emit_packed(blueprint, &packed)
    }

    /// Like [`CodeStitcher::emit`] with values already in packed order.
    pub fn emit_packed(
        &mut self,
        blueprint: &Blueprint<'_>,
        packed: &[u64],
    ) -> Result<EmittedCode, SpecializeError> {
        let offset = self.len;
        let address = self.buffer.base_address() + offset as u64;
        let written = specialize(
            blueprint,
            packed,
            &mut self.buffer.as_mut_slice()[offset..],
            address,
        )?;
        self.len += written;
        debug!(symbol = blueprint.symbol, offset, len = written, "emitted boilerplate");
        Ok(EmittedCode {
            offset,
            address,
            len: written,
        })
    }

    /// Bytes emitted so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining(&self) -> usize {
        self.buffer.capacity() - self.len
    }

    pub fn code(&self) -> &[u8] {
        &self.buffer.as_slice()[..self.len]
    }

    /// Seal the buffer; emitted code becomes callable and immutable.
    pub fn finish(self) -> Result<ExecutableBuffer<Sealed>, ExecMemoryError> {
        self.buffer.seal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchwork_core::{FixupCounts, FixupSite};

    static RET_CONST_CODE: [u8; 16] = [
        0x48, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0xc3, 0x0f, 0x1f, 0x44, 0x00, 0x00,
    ];

    static RET_CONST: Blueprint<'static> = Blueprint {
        symbol: "ret_const",
        code: &RET_CONST_CODE,
        unpadded_len: 11,
        self_relative32: &[],
        symbol32: &[],
        symbol64: &[FixupSite {
            offset: 2,
            ordinal: 0,
        }],
        thread_local32: &[],
        fixup_counts: FixupCounts {
            boilerplate_fns: 0,
            host_fns: 0,
            constants: 1,
        },
    };

    #[test]
    fn pieces_are_contiguous() {
        let mut stitcher = CodeStitcher::with_capacity(64).unwrap();
        let a = stitcher
            .emit(&RET_CONST, &FixupValues::new().constant(1))
            .unwrap();
        let b = stitcher
            .emit(&RET_CONST, &FixupValues::new().constant(2))
            .unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 16);
        assert_eq!(b.address, a.address + 16);
        assert_eq!(stitcher.len(), 32);
        assert_eq!(&stitcher.code()[18..26], &2u64.to_le_bytes());
    }

    #[test]
    fn overflow_is_reported() {
        let mut stitcher = CodeStitcher::with_capacity(1).unwrap();
        let capacity = stitcher.remaining();
        for _ in 0..capacity / 16 {
            stitcher
                .emit(&RET_CONST, &FixupValues::new().constant(0))
                .unwrap();
        }
        let err = stitcher
            .emit(&RET_CONST, &FixupValues::new().constant(0))
            .unwrap_err();
        assert!(matches!(err, SpecializeError::DestinationTooSmall { .. }));
    }
}
