//! Build configuration and its command-line form.

use std::path::PathBuf;

use clap::Parser;
use sha2::{Digest, Sha256};

use crate::error::BuildError;

/// Cores left free for the rest of the build when sizing the worker pool.
pub const WORKER_RESERVE: usize = 2;
/// Worker count when available parallelism is unknown.
pub const FALLBACK_WORKER_COUNT: usize = 4;

#[derive(Debug, Parser)]
#[command(
    name = "patchwork-build",
    version,
    about = "Extract boilerplate blueprints from compiled modules into a Rust library"
)]
pub struct BuildArgs {
    /// Semicolon-separated module manifests (.toml)
    #[arg()]
    pub manifests: String,

    /// Semicolon-separated object files, paired with the manifests by index
    #[arg()]
    pub objects: String,

    /// Directory receiving patchwork_decls.rs and patchwork_library.rs
    #[arg()]
    pub out_dir: PathBuf,

    /// Prepare workers (default: available parallelism minus 2)
    #[arg(long, short)]
    pub jobs: Option<usize>,

    /// Base seed for perfect-hash construction
    #[arg(long)]
    pub seed: Option<u64>,

    /// Reprocess every module, ignoring the checksum cache
    #[arg(long)]
    pub force: bool,
}

impl BuildArgs {
    pub fn into_config(self) -> Result<BuildConfig, BuildError> {
        let mut config = BuildConfig::from_lists(&self.manifests, &self.objects, self.out_dir)?;
        config.jobs = self.jobs;
        config.seed = self.seed;
        config.force = self.force;
        Ok(config)
    }
}

/// One input module: its manifest and the object compiled from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInput {
    pub manifest: PathBuf,
    pub object: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub inputs: Vec<ModuleInput>,
    pub out_dir: PathBuf,
    pub jobs: Option<usize>,
    pub seed: Option<u64>,
    pub force: bool,
}

impl BuildConfig {
    pub fn new(inputs: Vec<ModuleInput>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            inputs,
            out_dir: out_dir.into(),
            jobs: None,
            seed: None,
            force: false,
        }
    }

    /// Pair semicolon-separated manifest and object lists by index.
    pub fn from_lists(
        manifests: &str,
        objects: &str,
        out_dir: impl Into<PathBuf>,
    ) -> Result<Self, BuildError> {
        let manifests = split_list(manifests);
        let objects = split_list(objects);
        if manifests.len() != objects.len() {
            return Err(BuildError::InputCountMismatch {
                manifests: manifests.len(),
                objects: objects.len(),
            });
        }
        let inputs = manifests
            .into_iter()
            .zip(objects)
            .map(|(manifest, object)| ModuleInput { manifest, object })
            .collect();
        Ok(Self::new(inputs, out_dir))
    }

    pub fn workers(&self, tasks: usize) -> usize {
        worker_count(self.jobs, tasks)
    }
}

fn split_list(list: &str) -> Vec<PathBuf> {
    list.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Prepare workers for `tasks` modules.
pub fn worker_count(requested: Option<usize>, tasks: usize) -> usize {
    let workers = requested.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(WORKER_RESERVE))
            .unwrap_or(FALLBACK_WORKER_COUNT)
    });
    workers.clamp(1, tasks.max(1))
}

/// RNG seed for one family's perfect hash: derived from the family name so
/// every build of the same inputs produces the same tables.
pub fn family_seed(family: &str, base: Option<u64>) -> u64 {
    let digest = Sha256::digest(family.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes) ^ base.unwrap_or(0)
}
