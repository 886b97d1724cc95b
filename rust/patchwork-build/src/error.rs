//! Build-time failures.
//!
//! Every variant is fatal: the template compiler runs once, in a controlled
//! environment, and a bad input must stop the build instead of producing a
//! subtly wrong blueprint library.

use std::path::PathBuf;

use patchwork_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{manifests} manifest(s) but {objects} object file(s); the lists pair up by index")]
    InputCountMismatch { manifests: usize, objects: usize },

    #[error("malformed module `{module}`: {reason}")]
    MalformedModule { module: String, reason: String },

    #[error("malformed object for module `{module}`: {reason}")]
    MalformedObject { module: String, reason: String },

    #[error("module `{module}`: unsupported object format ({format}); expected 64-bit little-endian x86-64 ELF")]
    UnsupportedObjectFormat { module: String, format: String },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("module `{module}`, family `{family}`: body `{symbol}` is {state}")]
    UnknownBodySymbol {
        module: String,
        family: String,
        symbol: String,
        /// `"not declared"` or `"declared but not defined"`.
        state: &'static str,
    },

    #[error("module `{module}`: address {address:#x} maps to several symbols: {}", .symbols.join(", "))]
    AmbiguousAddress {
        module: String,
        address: u64,
        symbols: Vec<String>,
    },

    #[error("module `{module}`: address {address:#x} maps to no defined symbol")]
    UnresolvedAddress { module: String, address: u64 },

    #[error("module `{module}`: no code section `.text.{symbol}` for boilerplate `{symbol}`")]
    MissingCodeSection { module: String, symbol: String },

    #[error("`{symbol}`+{offset:#x}: unsupported relocation {kind}")]
    UnsupportedRelocation {
        symbol: String,
        offset: u32,
        kind: String,
    },

    #[error("`{symbol}`+{offset:#x}: unsupported relocation target {target}")]
    UnsupportedRelocationTarget {
        symbol: String,
        offset: u32,
        target: String,
    },

    #[error("`{symbol}`+{offset:#x}: addend {addend} does not fit the relocation field")]
    AddendOutOfRange {
        symbol: String,
        offset: u32,
        addend: i64,
    },

    #[error("family `{family}`: no perfect hash found after {attempts} attempts")]
    PerfectHashExhausted { family: String, attempts: usize },

    #[error("family `{family}`: perfect hash verification failed: {reason}")]
    PerfectHashVerification { family: String, reason: String },

    #[error("family `{family}` is defined by both `{first}` and `{second}`")]
    DuplicateFamily {
        family: String,
        first: String,
        second: String,
    },

    #[error("failed to spawn prepare worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("checksum cache {}: {source}", .path.display())]
    Cache {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl BuildError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
