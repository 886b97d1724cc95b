//! The host environment a module is loaded into during Prepare.
//!
//! Registration needs the address of every specialized body. The
//! environment gives each defined function symbol of the object a load
//! address in a synthetic layout private to the environment, and resolves
//! the object's undefined externals first against the running process and
//! otherwise to unique synthetic addresses. Nothing is ever executed at
//! these addresses; they only have to be stable and unique so PostProcess
//! can map them back to symbol names.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ffi::CString;

use object::{Object, ObjectSection, ObjectSymbol, SymbolKind, SymbolSection};
use tracing::debug;

use crate::error::BuildError;

/// Start of the synthetic layout for defined code.
pub const SYNTHETIC_CODE_BASE: u64 = 0x7000_0000_0000;
/// Start of the synthetic addresses handed to unresolved externals.
pub const SYNTHETIC_EXTERNAL_BASE: u64 = 0x7800_0000_0000;

const SECTION_ALIGN: u64 = 16;

/// Looks up symbols already present in the running process.
pub trait ProcessSymbols {
    fn lookup(&self, name: &str) -> Option<u64>;
}

/// Resolves through `dlsym(RTLD_DEFAULT, ..)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DlsymResolver;

impl ProcessSymbols for DlsymResolver {
    fn lookup(&self, name: &str) -> Option<u64> {
        let name = CString::new(name).ok()?;
        // SAFETY: `name` is NUL-terminated and outlives the call.
        let ptr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
        if ptr.is_null() {
            None
        } else {
            Some(ptr as u64)
        }
    }
}

/// Resolves nothing, so every external gets a synthetic address.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProcessSymbols;

impl ProcessSymbols for NoProcessSymbols {
    fn lookup(&self, _name: &str) -> Option<u64> {
        None
    }
}

pub struct HostEnvironment<'r, R: ?Sized> {
    module: String,
    resolver: &'r R,
    next_section_base: u64,
    next_external: u64,
    declared: BTreeSet<String>,
    defined: HashMap<String, u64>,
    externals: HashMap<String, u64>,
}

impl<'r, R: ProcessSymbols + ?Sized> HostEnvironment<'r, R> {
    pub fn new(module: impl Into<String>, resolver: &'r R) -> Self {
        Self {
            module: module.into(),
            resolver,
            next_section_base: SYNTHETIC_CODE_BASE,
            next_external: SYNTHETIC_EXTERNAL_BASE,
            declared: BTreeSet::new(),
            defined: HashMap::new(),
            externals: HashMap::new(),
        }
    }

    /// Lay out the object's sections and record its symbols.
    pub fn load(&mut self, object: &object::File<'_>) -> Result<(), BuildError> {
        let mut section_base = HashMap::new();
        for section in object.sections() {
            let align = section.align().max(SECTION_ALIGN);
            let base = self.next_section_base.next_multiple_of(align);
            // Keep even empty sections apart so no two symbols share an address.
            self.next_section_base = base + section.size().max(1);
            section_base.insert(section.index(), (base, section.address()));
        }

        for symbol in object.symbols() {
            if !symbol.is_global() {
                continue;
            }
            let name = symbol.name().map_err(|e| BuildError::MalformedObject {
                module: self.module.clone(),
                reason: e.to_string(),
            })?;
            if name.is_empty() {
                continue;
            }
            match symbol.section() {
                SymbolSection::Undefined => {
                    self.declared.insert(name.to_string());
                    self.resolve_external(name);
                }
                SymbolSection::Section(index) if symbol.kind() == SymbolKind::Text => {
                    let Some(&(base, section_address)) = section_base.get(&index) else {
                        continue;
                    };
                    let address = base + (symbol.address() - section_address);
                    self.declared.insert(name.to_string());
                    self.defined.insert(name.to_string(), address);
                }
                _ => {}
            }
        }
        debug!(
            module = %self.module,
            defined = self.defined.len(),
            externals = self.externals.len(),
            "loaded object into host environment"
        );
        Ok(())
    }

    fn resolve_external(&mut self, name: &str) -> u64 {
        if let Some(&address) = self.externals.get(name) {
            return address;
        }
        let address = match self.resolver.lookup(name) {
            Some(address) => address,
            None => {
                let address = self.next_external;
                self.next_external += SECTION_ALIGN;
                address
            }
        };
        self.externals.insert(name.to_string(), address);
        address
    }

    /// Load address of a defined function symbol.
    pub fn address_of(&self, symbol: &str) -> Option<u64> {
        self.defined.get(symbol).copied()
    }

    pub fn is_declared(&self, symbol: &str) -> bool {
        self.declared.contains(symbol)
    }

    pub fn external_address(&self, symbol: &str) -> Option<u64> {
        self.externals.get(symbol).copied()
    }

    /// Reverse map of the defined symbols, for PostProcess.
    pub fn into_symbol_table(self) -> SymbolTable {
        let mut by_address: BTreeMap<u64, Vec<String>> = BTreeMap::new();
        for (name, address) in self.defined {
            by_address.entry(address).or_default().push(name);
        }
        for names in by_address.values_mut() {
            names.sort();
        }
        SymbolTable { by_address }
    }
}

/// Defined symbols of one loaded module, keyed by load address.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    by_address: BTreeMap<u64, Vec<String>>,
}

impl SymbolTable {
    /// The unique defined symbol at `address`.
    pub fn resolve(&self, module: &str, address: u64) -> Result<&str, BuildError> {
        match self.by_address.get(&address).map(Vec::as_slice) {
            Some([name]) => Ok(name.as_str()),
            Some(names) if !names.is_empty() => Err(BuildError::AmbiguousAddress {
                module: module.to_string(),
                address,
                symbols: names.to_vec(),
            }),
            _ => Err(BuildError::UnresolvedAddress {
                module: module.to_string(),
                address,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.by_address.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}
