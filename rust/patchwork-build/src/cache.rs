//! Checksum cache for incremental builds.
//!
//! ```text
//! <out_dir>/.patchwork-cache/
//! ├── checksums.json     # tool hash, hash seed, per-input SHA-256
//! └── <module>.json      # compiled record of each module
//! ```
//!
//! A module whose (manifest, object) checksum is unchanged, built by the
//! same tool binary with the same hash seed, is reloaded from its record
//! instead of being prepared and post-processed again.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::compiled::CompiledModule;
use crate::emit::write_atomic;
use crate::error::BuildError;

pub const CACHE_DIR: &str = ".patchwork-cache";
pub const CHECKSUMS_FILE: &str = "checksums.json";

/// Hex SHA-256 of a (manifest, object) pair.
pub fn input_checksum(manifest: &[u8], object: &[u8]) -> String {
    let mut hasher = Sha256::new();
    for part in [manifest, object] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

/// Hex SHA-256 of the running build tool, if its binary is readable.
pub fn tool_checksum() -> Option<String> {
    let exe = std::env::current_exe().ok()?;
    let bytes = fs::read(exe).ok()?;
    Some(hex::encode(Sha256::digest(&bytes)))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Checksums {
    #[serde(default)]
    tool: Option<String>,
    /// Base seed the perfect-hash tables were built with.
    #[serde(default)]
    seed: Option<u64>,
    /// Keyed by module name.
    #[serde(default)]
    modules: BTreeMap<String, ModuleChecksum>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ModuleChecksum {
    /// Input key: manifest path.
    input: String,
    checksum: String,
}

pub struct BuildCache {
    dir: PathBuf,
    tool: Option<String>,
    seed: Option<u64>,
    previous: Checksums,
    current: Checksums,
}

impl BuildCache {
    /// Open the cache under `out_dir`. An unreadable index starts empty.
    pub fn open(out_dir: &Path, tool: Option<String>, seed: Option<u64>) -> Self {
        let dir = out_dir.join(CACHE_DIR);
        let index = dir.join(CHECKSUMS_FILE);
        let previous = match fs::read(&index) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %index.display(), error = %e, "ignoring corrupt checksum cache");
                Checksums::default()
            }),
            Err(_) => Checksums::default(),
        };
        Self {
            dir,
            current: Checksums {
                tool: tool.clone(),
                seed,
                modules: BTreeMap::new(),
            },
            tool,
            seed,
            previous,
        }
    }

    fn record_path(&self, module: &str) -> PathBuf {
        self.dir.join(format!("{module}.json"))
    }

    /// The cached record for an input, if its checksum, the tool and the
    /// hash seed are unchanged.
    pub fn lookup(&self, input: &str, checksum: &str) -> Option<CompiledModule> {
        if self.tool.is_none() || self.previous.tool != self.tool {
            return None;
        }
        if self.previous.seed != self.seed {
            debug!(previous = ?self.previous.seed, current = ?self.seed, "hash seed changed");
            return None;
        }
        let (module, _) = self
            .previous
            .modules
            .iter()
            .find(|(_, m)| m.input == input && m.checksum == checksum)?;
        let path = self.record_path(module);
        let record: CompiledModule = match fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        {
            Some(record) => record,
            None => {
                debug!(module = %module, "cache record missing or unreadable");
                return None;
            }
        };
        (record.module == *module).then_some(record)
    }

    /// Store a freshly compiled module.
    pub fn store(
        &mut self,
        input: &str,
        checksum: &str,
        module: &CompiledModule,
    ) -> Result<(), BuildError> {
        fs::create_dir_all(&self.dir).map_err(|e| BuildError::io(&self.dir, e))?;
        let path = self.record_path(&module.module);
        let json = serde_json::to_vec(module).map_err(|source| BuildError::Cache {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &json)?;
        self.keep(input, checksum, &module.module);
        Ok(())
    }

    /// Carry a reused module's entry into the new index.
    pub fn keep(&mut self, input: &str, checksum: &str, module: &str) {
        self.current.modules.insert(
            module.to_string(),
            ModuleChecksum {
                input: input.to_string(),
                checksum: checksum.to_string(),
            },
        );
    }

    /// Write the index for this build.
    pub fn save(&self) -> Result<(), BuildError> {
        fs::create_dir_all(&self.dir).map_err(|e| BuildError::io(&self.dir, e))?;
        let path = self.dir.join(CHECKSUMS_FILE);
        let json = serde_json::to_vec_pretty(&self.current).map_err(|source| BuildError::Cache {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &json)
    }
}
