//! The output of PostProcess: everything emission needs for one module.
//!
//! These records are also what the checksum cache stores, so an unchanged
//! module is reloaded here instead of being prepared again.

use patchwork_core::{AxisKind, BoilerplateFamily, ParameterTuple};
use serde::{Deserialize, Serialize};

use crate::extract::ExtractedCode;
use crate::manifest::AxisSignature;
use crate::perfect_hash::PerfectHashTable;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledVariant {
    pub tuple: ParameterTuple,
    pub code: ExtractedCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledFamily {
    pub name: String,
    pub signature: Vec<AxisSignature>,
    pub variants: Vec<CompiledVariant>,
    pub hash: PerfectHashTable,
}

impl CompiledFamily {
    pub fn axis_kinds(&self) -> Vec<AxisKind> {
        self.signature.iter().map(|s| s.kind).collect()
    }

    /// The variant registered for `tuple`, through the perfect hash.
    pub fn find(&self, tuple: &[u64]) -> Option<&CompiledVariant> {
        let ordinal = self.hash.as_index().lookup(tuple)?;
        self.variants.get(ordinal as usize)
    }

    pub fn uses_thread_local_base(&self) -> bool {
        self.variants
            .iter()
            .any(|v| !v.code.thread_local32.is_empty())
    }

    /// Run `f` with this family viewed as a runtime [`BoilerplateFamily`].
    pub fn with_family<T>(&self, f: impl FnOnce(&BoilerplateFamily<'_>) -> T) -> T {
        let axes = self.axis_kinds();
        let blueprints: Vec<_> = self.variants.iter().map(|v| v.code.as_blueprint()).collect();
        let refs: Vec<_> = blueprints.iter().collect();
        let family = BoilerplateFamily {
            name: &self.name,
            axes: &axes,
            index: self.hash.as_index(),
            variants: &refs,
        };
        f(&family)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledModule {
    pub module: String,
    pub families: Vec<CompiledFamily>,
}

impl CompiledModule {
    pub fn family(&self, name: &str) -> Option<&CompiledFamily> {
        self.families.iter().find(|f| f.name == name)
    }

    pub fn variant_count(&self) -> usize {
        self.families.iter().map(|f| f.variants.len()).sum()
    }
}
