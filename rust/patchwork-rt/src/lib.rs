//! Patchwork RT: the run-time half of the copy-and-patch JIT.
//!
//! Selected blueprints are copied into a writable code buffer, patched with
//! call-site values, stitched together, and sealed into executable memory.
//! The frame planner and operand stack decide where temporaries and locals
//! of the generated function live.
#![warn(clippy::all)]

pub mod exec_buffer;
pub mod frame;
pub mod operand;
pub mod specialize;
pub mod stitch;
pub mod thread_pointer;

pub use exec_buffer::{ExecMemoryError, ExecutableBuffer, Sealed, Writable};
pub use frame::StackFramePlanner;
pub use operand::{OperandClass, OperandLocation, OperandStack};
pub use specialize::{specialize, FixupValues, SpecializeError};
pub use stitch::{CodeStitcher, EmittedCode};
