//! Patchwork build: the template compiler of the copy-and-patch JIT.
//!
//! Takes pairs of (module manifest, compiled object file), enumerates every
//! legal parameter tuple of every boilerplate family, extracts the machine
//! code of each specialized body together with its fixups, builds a
//! perfect-hash index per family, and emits the whole library as Rust
//! source for the runtime to `include!`.
#![warn(clippy::all)]

pub mod cache;
pub mod compiled;
pub mod config;
pub mod emit;
pub mod error;
pub mod extract;
pub mod family;
pub mod host;
pub mod manifest;
pub mod perfect_hash;
pub mod session;

pub use compiled::{CompiledFamily, CompiledModule, CompiledVariant};
pub use config::{BuildArgs, BuildConfig, ModuleInput};
pub use emit::{generate, GeneratedSources, DECLS_FILE, LIBRARY_FILE};
pub use error::BuildError;
pub use extract::ExtractedCode;
pub use host::{DlsymResolver, NoProcessSymbols, ProcessSymbols};
pub use manifest::ModuleManifest;
pub use perfect_hash::PerfectHashTable;
pub use session::{compile_module, BuildSession, BuildSummary};
