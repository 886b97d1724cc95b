//! Variant registration for one family.

use std::collections::HashSet;

use patchwork_core::{enumerate, CoreError, ParameterTuple};

use crate::error::BuildError;
use crate::host::{HostEnvironment, ProcessSymbols};
use crate::manifest::FamilyDecl;

/// The `(tuple, address)` pairs registered for one family, in registration
/// order.
#[derive(Debug, Clone)]
pub struct FamilyRegistration {
    pub family: String,
    pub arity: usize,
    entries: Vec<(ParameterTuple, u64)>,
    seen: HashSet<ParameterTuple>,
}

impl FamilyRegistration {
    pub fn new(family: impl Into<String>, arity: usize) -> Self {
        Self {
            family: family.into(),
            arity,
            entries: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Register the body address for `tuple`.
    pub fn register(&mut self, tuple: ParameterTuple, address: u64) -> Result<(), CoreError> {
        if tuple.len() != self.arity {
            return Err(CoreError::ParameterCountMismatch {
                family: self.family.clone(),
                expected: self.arity,
                found: tuple.len(),
            });
        }
        if !self.seen.insert(tuple.clone()) {
            return Err(CoreError::DuplicateTuple {
                family: self.family.clone(),
                tuple,
            });
        }
        self.entries.push((tuple, address));
        Ok(())
    }

    pub fn entries(&self) -> &[(ParameterTuple, u64)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Run a family's registration against a loaded environment: enumerate its
/// legal tuples and resolve each tuple's rendered body symbol.
pub fn register_family<R: ProcessSymbols + ?Sized>(
    module: &str,
    decl: &FamilyDecl,
    env: &HostEnvironment<'_, R>,
) -> Result<FamilyRegistration, BuildError> {
    let found = enumerate(&decl.axes, &decl.constraints, |tuple: &[u64]| {
        let symbol = decl.body_symbol(tuple);
        env.address_of(&symbol)
            .ok_or_else(|| BuildError::UnknownBodySymbol {
                module: module.to_string(),
                family: decl.name.clone(),
                state: if env.is_declared(&symbol) {
                    "declared but not defined"
                } else {
                    "not declared"
                },
                symbol,
            })
    })?;
    let mut registration = FamilyRegistration::new(&decl.name, decl.axes.len());
    for (tuple, address) in found {
        registration.register(tuple, address)?;
    }
    Ok(registration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicates_and_wrong_arity() {
        let mut reg = FamilyRegistration::new("add", 2);
        reg.register(vec![1, 0], 0x10).unwrap();
        assert_eq!(
            reg.register(vec![1, 0], 0x20),
            Err(CoreError::DuplicateTuple {
                family: "add".to_string(),
                tuple: vec![1, 0]
            })
        );
        assert_eq!(
            reg.register(vec![1], 0x20),
            Err(CoreError::ParameterCountMismatch {
                family: "add".to_string(),
                expected: 2,
                found: 1
            })
        );
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.entries()[0], (vec![1, 0], 0x10));
    }
}
