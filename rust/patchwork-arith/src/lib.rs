//! Patchwork arith: a host crate that `include!`s a generated blueprint
//! library and JIT-compiles small arithmetic functions from it.

use patchwork_core::{PrimitiveType, TypeId};
use patchwork_rt::{
    CodeStitcher, ExecMemoryError, ExecutableBuffer, FixupValues, Sealed, SpecializeError,
};

/// The generated blueprint library.
#[allow(clippy::all)]
pub mod library {
    include!(concat!(env!("OUT_DIR"), "/patchwork_decls.rs"));
    include!(concat!(env!("OUT_DIR"), "/patchwork_library.rs"));
}

#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error(transparent)]
    Specialize(#[from] SpecializeError),
    #[error(transparent)]
    Memory(#[from] ExecMemoryError),
}

/// A sealed function computing `lhs + rhs` at `width`.
pub struct ConstantSum {
    buffer: ExecutableBuffer<Sealed>,
    offset: usize,
}

impl ConstantSum {
    pub fn compile(width: PrimitiveType, lhs: u64, rhs: u64) -> Result<Self, JitError> {
        let blueprint = library::select_add_blueprint(TypeId::Value(width));
        let mut stitcher = CodeStitcher::with_capacity(blueprint.code.len())?;
        let emitted = stitcher.emit(blueprint, &FixupValues::new().constant(lhs).constant(rhs))?;
        Ok(Self {
            buffer: stitcher.finish()?,
            offset: emitted.offset,
        })
    }

    /// Run the compiled code.
    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    pub fn call(&self) -> u64 {
        // SAFETY: the code at `offset` is a complete `add_*` blueprint taking
        // no arguments and returning in rax.
        let f: extern "C" fn() -> u64 = unsafe { self.buffer.function(self.offset) };
        f()
    }
}
