//! The build session: Prepare in parallel, PostProcess in order, emit.
//!
//! Prepare parses each module's manifest, loads its object into a private
//! [`HostEnvironment`] and runs the module's registration, yielding the
//! `(tuple, address)` list of every family. PostProcess then maps addresses
//! back to symbols, extracts blueprints from the object and builds the
//! perfect hashes. Emission happens once every module is compiled, so a
//! failure anywhere leaves the previous outputs untouched.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::cache::{input_checksum, tool_checksum, BuildCache};
use crate::compiled::{CompiledFamily, CompiledModule, CompiledVariant};
use crate::config::{family_seed, BuildConfig};
use crate::emit::{generate, write_sources};
use crate::error::BuildError;
use crate::extract::{parse_object, Extractor};
use crate::family::{register_family, FamilyRegistration};
use crate::host::{DlsymResolver, HostEnvironment, ProcessSymbols, SymbolTable};
use crate::manifest::ModuleManifest;
use crate::perfect_hash::PerfectHashTable;

/// One module waiting for Prepare.
#[derive(Debug, Clone)]
pub struct PrepareTask {
    /// Position among the build's inputs.
    pub index: usize,
    /// Where the manifest came from, for diagnostics and cache keys.
    pub origin: String,
    pub manifest: String,
    pub object: Vec<u8>,
}

/// A module after Prepare.
#[derive(Debug)]
pub struct PreparedModule {
    pub index: usize,
    pub origin: String,
    pub manifest: ModuleManifest,
    pub object: Vec<u8>,
    pub symbols: SymbolTable,
    pub registrations: Vec<FamilyRegistration>,
}

impl PreparedModule {
    pub fn name(&self) -> &str {
        &self.manifest.module
    }
}

/// Prepare one module against `resolver`.
pub fn prepare_module<R: ProcessSymbols + ?Sized>(
    task: PrepareTask,
    resolver: &R,
) -> Result<PreparedModule, BuildError> {
    let manifest = ModuleManifest::parse(&task.origin, &task.manifest)?;
    let module = manifest.module.as_str();
    let file = parse_object(module, &task.object)?;
    let mut env = HostEnvironment::new(module, resolver);
    env.load(&file)?;

    let mut registrations = Vec::with_capacity(manifest.families.len());
    for decl in &manifest.families {
        let registration = register_family(module, decl, &env)?;
        debug!(
            module,
            family = %decl.name,
            variants = registration.len(),
            "registered family"
        );
        registrations.push(registration);
    }
    drop(file);

    let symbols = env.into_symbol_table();
    Ok(PreparedModule {
        index: task.index,
        origin: task.origin,
        manifest,
        object: task.object,
        symbols,
        registrations,
    })
}

/// Prepare every task on `workers` scoped threads.
///
/// Each worker pulls tasks from a shared queue and prepares them in its own
/// host environment. Results come back in task-index order; the first
/// failure (by index) is returned and stops workers from starting new tasks.
pub fn prepare_all<R: ProcessSymbols + Sync + ?Sized>(
    tasks: Vec<PrepareTask>,
    workers: usize,
    resolver: &R,
) -> Result<Vec<PreparedModule>, BuildError> {
    let total = tasks.len();
    if total == 0 {
        return Ok(Vec::new());
    }
    let queue = Mutex::new(tasks.into_iter().collect::<VecDeque<_>>());
    let failed = AtomicBool::new(false);
    let (tx, rx) = crossbeam_channel::unbounded();

    std::thread::scope(|scope| -> Result<(), BuildError> {
        for worker in 0..workers.max(1) {
            let tx = tx.clone();
            let queue = &queue;
            let failed = &failed;
            std::thread::Builder::new()
                .name(format!("patchwork-prepare-{worker}"))
                .spawn_scoped(scope, move || loop {
                    if failed.load(Ordering::Relaxed) {
                        break;
                    }
                    let next = queue
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .pop_front();
                    let Some(task) = next else { break };
                    let index = task.index;
                    let result = prepare_module(task, resolver);
                    if result.is_err() {
                        failed.store(true, Ordering::Relaxed);
                    }
                    if tx.send((index, result)).is_err() {
                        break;
                    }
                })
                .map_err(BuildError::WorkerSpawn)?;
        }
        Ok(())
    })?;
    drop(tx);

    let mut results: Vec<(usize, Result<PreparedModule, BuildError>)> = rx.iter().collect();
    results.sort_by_key(|(index, _)| *index);
    let mut prepared = Vec::with_capacity(total);
    for (_, result) in results {
        prepared.push(result?);
    }
    Ok(prepared)
}

/// Extract every registered variant and build each family's perfect hash.
pub fn post_process(
    prepared: &PreparedModule,
    seed: Option<u64>,
) -> Result<CompiledModule, BuildError> {
    let module = prepared.name();
    let file = parse_object(module, &prepared.object)?;
    let extractor = Extractor::new(module, &file)?;

    let mut families = Vec::with_capacity(prepared.registrations.len());
    for (decl, registration) in prepared.manifest.families.iter().zip(&prepared.registrations) {
        let mut variants = Vec::with_capacity(registration.len());
        for (tuple, address) in registration.entries() {
            let symbol = prepared.symbols.resolve(module, *address)?;
            let code = extractor.extract(symbol)?;
            variants.push(CompiledVariant {
                tuple: tuple.clone(),
                code,
            });
        }
        if variants.is_empty() {
            warn!(module, family = %decl.name, "family has no variants");
        }

        let tuples: Vec<_> = variants.iter().map(|v| v.tuple.clone()).collect();
        let mut rng = StdRng::seed_from_u64(family_seed(&decl.name, seed));
        let hash = PerfectHashTable::build(&decl.name, decl.axes.len(), &tuples, &mut rng)?;
        families.push(CompiledFamily {
            name: decl.name.clone(),
            signature: decl.signature.clone(),
            variants,
            hash,
        });
    }

    let compiled = CompiledModule {
        module: module.to_string(),
        families,
    };
    info!(
        module,
        families = compiled.families.len(),
        variants = compiled.variant_count(),
        "compiled module"
    );
    Ok(compiled)
}

/// Prepare and post-process one in-memory module.
pub fn compile_module<R: ProcessSymbols + ?Sized>(
    origin: &str,
    manifest: &str,
    object: &[u8],
    resolver: &R,
    seed: Option<u64>,
) -> Result<CompiledModule, BuildError> {
    let task = PrepareTask {
        index: 0,
        origin: origin.to_string(),
        manifest: manifest.to_string(),
        object: object.to_vec(),
    };
    post_process(&prepare_module(task, resolver)?, seed)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSummary {
    pub modules: usize,
    pub reused: usize,
    pub families: usize,
    pub variants: usize,
}

pub struct BuildSession {
    config: BuildConfig,
}

impl BuildSession {
    pub fn new(config: BuildConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Run the build, resolving externals against this process.
    pub fn run(&self) -> Result<BuildSummary, BuildError> {
        self.run_with(&DlsymResolver)
    }

    pub fn run_with<R: ProcessSymbols + Sync + ?Sized>(
        &self,
        resolver: &R,
    ) -> Result<BuildSummary, BuildError> {
        let config = &self.config;
        let mut cache = BuildCache::open(&config.out_dir, tool_checksum(), config.seed);
        let mut compiled: Vec<Option<CompiledModule>> = vec![None; config.inputs.len()];
        let mut checksums = Vec::with_capacity(config.inputs.len());
        let mut tasks = Vec::new();
        let mut reused = 0;

        for (index, input) in config.inputs.iter().enumerate() {
            let manifest = fs::read_to_string(&input.manifest)
                .map_err(|e| BuildError::io(&input.manifest, e))?;
            let object = fs::read(&input.object).map_err(|e| BuildError::io(&input.object, e))?;
            let origin = input.manifest.display().to_string();
            let checksum = input_checksum(manifest.as_bytes(), &object);

            if !config.force {
                if let Some(record) = cache.lookup(&origin, &checksum) {
                    info!(module = %record.module, "unchanged, reusing cached blueprints");
                    compiled[index] = Some(record);
                    reused += 1;
                    checksums.push((origin, checksum));
                    continue;
                }
            }
            checksums.push((origin.clone(), checksum));
            tasks.push(PrepareTask {
                index,
                origin,
                manifest,
                object,
            });
        }

        let workers = config.workers(tasks.len());
        if !tasks.is_empty() {
            info!(modules = tasks.len(), workers, "preparing modules");
        }
        for prepared in prepare_all(tasks, workers, resolver)? {
            let index = prepared.index;
            compiled[index] = Some(post_process(&prepared, config.seed)?);
        }

        let modules: Vec<CompiledModule> = compiled.into_iter().flatten().collect();
        let mut names: HashMap<&str, usize> = HashMap::new();
        for (index, module) in modules.iter().enumerate() {
            if let Some(first) = names.insert(&module.module, index) {
                return Err(BuildError::MalformedModule {
                    module: module.module.clone(),
                    reason: format!(
                        "module name used by both {} and {}",
                        checksums[first].0, checksums[index].0
                    ),
                });
            }
        }

        let sources = generate(&modules)?;
        write_sources(&config.out_dir, &sources)?;

        for (module, (origin, checksum)) in modules.iter().zip(&checksums) {
            cache.store(origin, checksum, module)?;
        }
        cache.save()?;

        let summary = BuildSummary {
            modules: modules.len(),
            reused,
            families: modules.iter().map(|m| m.families.len()).sum(),
            variants: modules.iter().map(CompiledModule::variant_count).sum(),
        };
        info!(
            modules = summary.modules,
            reused = summary.reused,
            families = summary.families,
            variants = summary.variants,
            "build finished"
        );
        Ok(summary)
    }
}
