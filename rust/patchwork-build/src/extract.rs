//! Blueprint extraction from the real object file.
//!
//! For each variant symbol this reads the bytes of its `.text.<symbol>`
//! section, pads them with multi-byte NOPs to a 16-byte boundary, and turns
//! every relocation into a fixup: the relocation type decides the patch
//! kind, the placeholder name decides the value class, and the constant part
//! of the relocation is baked into the bytes so the runtime only adds (and
//! for self-relative fixups subtracts) per-call-site values.

use std::collections::HashMap;

use object::elf::{R_X86_64_64, R_X86_64_PLT32, R_X86_64_TPOFF32};
use object::{
    Architecture, BinaryFormat, Object, ObjectKind, ObjectSection, ObjectSymbol, RelocationFlags,
    RelocationTarget, SectionIndex, SymbolSection,
};
use patchwork_core::{
    parse_placeholder, Blueprint, FixupCounts, FixupRecord, FixupSite, RelocationKind,
    SymbolClass, CODE_SECTION_PREFIX,
};
use serde::{Deserialize, Serialize};

use crate::error::BuildError;

/// Code is padded to a multiple of this many bytes.
pub const CODE_ALIGN: usize = 16;

/// Recommended x86-64 NOP encodings, indexed by length - 1.
const NOPS: [&[u8]; 9] = [
    &[0x90],
    &[0x66, 0x90],
    &[0x0f, 0x1f, 0x00],
    &[0x0f, 0x1f, 0x40, 0x00],
    &[0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x0f, 0x1f, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

/// Append NOPs until `code.len()` is a multiple of [`CODE_ALIGN`].
pub fn pad_with_nops(code: &mut Vec<u8>) {
    let mut missing = (CODE_ALIGN - code.len() % CODE_ALIGN) % CODE_ALIGN;
    while missing > 0 {
        let n = missing.min(NOPS.len());
        code.extend_from_slice(NOPS[n - 1]);
        missing -= n;
    }
}

/// Parse `bytes` and check it is a 64-bit little-endian x86-64 ELF
/// relocatable object.
pub fn parse_object<'data>(
    module: &str,
    bytes: &'data [u8],
) -> Result<object::File<'data>, BuildError> {
    let file = object::File::parse(bytes).map_err(|e| BuildError::MalformedObject {
        module: module.to_string(),
        reason: e.to_string(),
    })?;
    let supported = file.format() == BinaryFormat::Elf
        && file.architecture() == Architecture::X86_64
        && file.is_64()
        && file.is_little_endian()
        && file.kind() == ObjectKind::Relocatable;
    if !supported {
        return Err(BuildError::UnsupportedObjectFormat {
            module: module.to_string(),
            format: format!(
                "{:?} {:?} {:?}{}",
                file.format(),
                file.architecture(),
                file.kind(),
                if file.is_64() { "" } else { " 32-bit" }
            ),
        });
    }
    Ok(file)
}

// ---------------------------------------------------------------------------
// Relocation map
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum RawTarget {
    Symbol(String),
    Other(String),
}

#[derive(Debug, Clone)]
struct RawRelocation {
    offset: u64,
    r_type: Option<u32>,
    flags: String,
    target: RawTarget,
    addend: i64,
    implicit_addend: bool,
}

/// Every section's relocations, read once per object.
pub struct SectionRelocations {
    by_section: HashMap<SectionIndex, Vec<RawRelocation>>,
}

impl SectionRelocations {
    pub fn collect(module: &str, file: &object::File<'_>) -> Result<Self, BuildError> {
        let malformed = |reason: String| BuildError::MalformedObject {
            module: module.to_string(),
            reason,
        };
        let mut by_section = HashMap::new();
        for section in file.sections() {
            let mut relocations = Vec::new();
            for (offset, relocation) in section.relocations() {
                let target = match relocation.target() {
                    RelocationTarget::Symbol(index) => {
                        let symbol = file
                            .symbol_by_index(index)
                            .map_err(|e| malformed(e.to_string()))?;
                        let name = symbol.name().map_err(|e| malformed(e.to_string()))?;
                        if name.is_empty() || !matches!(symbol.section(), SymbolSection::Undefined) {
                            RawTarget::Other(format!("{:?} symbol `{name}`", symbol.kind()))
                        } else {
                            RawTarget::Symbol(name.to_string())
                        }
                    }
                    RelocationTarget::Section(index) => {
                        RawTarget::Other(format!("section {}", index.0))
                    }
                    other => RawTarget::Other(format!("{other:?}")),
                };
                let flags = relocation.flags();
                let r_type = match flags {
                    RelocationFlags::Elf { r_type } => Some(r_type),
                    _ => None,
                };
                relocations.push(RawRelocation {
                    offset,
                    r_type,
                    flags: format!("{flags:?}"),
                    target,
                    addend: relocation.addend(),
                    implicit_addend: relocation.has_implicit_addend(),
                });
            }
            if !relocations.is_empty() {
                by_section.insert(section.index(), relocations);
            }
        }
        Ok(Self { by_section })
    }

    fn of(&self, section: SectionIndex) -> &[RawRelocation] {
        self.by_section.get(&section).map_or(&[], Vec::as_slice)
    }
}

// ---------------------------------------------------------------------------
// Extracted variants
// ---------------------------------------------------------------------------

/// One variant's code and fixup tables, owned by the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedCode {
    pub symbol: String,
    /// Padded code with constant relocation parts pre-baked.
    pub code: Vec<u8>,
    pub unpadded_len: u32,
    /// Fixups in offset order, with packed ordinals.
    pub fixups: Vec<FixupRecord>,
    pub fixup_counts: FixupCounts,
    pub self_relative32: Vec<u32>,
    pub symbol32: Vec<FixupSite>,
    pub symbol64: Vec<FixupSite>,
    pub thread_local32: Vec<u32>,
}

impl ExtractedCode {
    /// Borrow as the runtime blueprint view.
    pub fn as_blueprint(&self) -> Blueprint<'_> {
        Blueprint {
            symbol: &self.symbol,
            code: &self.code,
            unpadded_len: self.unpadded_len,
            self_relative32: &self.self_relative32,
            symbol32: &self.symbol32,
            symbol64: &self.symbol64,
            thread_local32: &self.thread_local32,
            fixup_counts: self.fixup_counts,
        }
    }
}

/// Where a function symbol lives inside the object.
#[derive(Debug, Clone, Copy)]
struct SymbolRange {
    section: SectionIndex,
    start: u64,
    size: u64,
}

/// Extracts variants from one parsed object.
pub struct Extractor<'a, 'data> {
    module: &'a str,
    file: &'a object::File<'data>,
    relocations: SectionRelocations,
    functions: HashMap<&'a str, SymbolRange>,
}

impl<'a, 'data> Extractor<'a, 'data> {
    pub fn new(module: &'a str, file: &'a object::File<'data>) -> Result<Self, BuildError> {
        let relocations = SectionRelocations::collect(module, file)?;
        let mut functions = HashMap::new();
        for symbol in file.symbols() {
            let (Ok(name), SymbolSection::Section(section)) = (symbol.name(), symbol.section())
            else {
                continue;
            };
            if name.is_empty() || !symbol.is_definition() {
                continue;
            }
            let start = file
                .section_by_index(section)
                .map(|s| symbol.address() - s.address())
                .unwrap_or(symbol.address());
            functions.insert(
                name,
                SymbolRange {
                    section,
                    start,
                    size: symbol.size(),
                },
            );
        }
        Ok(Self {
            module,
            file,
            relocations,
            functions,
        })
    }

    /// Extract the variant whose body is `symbol`.
    pub fn extract(&self, symbol: &str) -> Result<ExtractedCode, BuildError> {
        let missing = || BuildError::MissingCodeSection {
            module: self.module.to_string(),
            symbol: symbol.to_string(),
        };
        let section_name = format!("{CODE_SECTION_PREFIX}{symbol}");
        let section = self.file.section_by_name(&section_name).ok_or_else(missing)?;
        let data = section.data().map_err(|e| BuildError::MalformedObject {
            module: self.module.to_string(),
            reason: format!("{section_name}: {e}"),
        })?;

        // The symbol normally spans its whole section; honor its recorded
        // extent when it does not.
        let (start, end) = match self.functions.get(symbol) {
            Some(range) if range.section == section.index() => {
                let start = range.start as usize;
                let end = if range.size == 0 {
                    data.len()
                } else {
                    start + range.size as usize
                };
                (start, end)
            }
            _ => (0, data.len()),
        };
        if start > end || end > data.len() {
            return Err(BuildError::MalformedObject {
                module: self.module.to_string(),
                reason: format!("`{symbol}` extends beyond {section_name}"),
            });
        }

        let mut code = data[start..end].to_vec();
        let mut raw_fixups = Vec::new();
        for relocation in self.relocations.of(section.index()) {
            if relocation.offset < start as u64 || relocation.offset >= end as u64 {
                continue;
            }
            let offset = (relocation.offset - start as u64) as u32;
            raw_fixups.push(self.bake(symbol, &mut code, offset, relocation)?);
        }
        let unpadded_len = code.len() as u32;
        pad_with_nops(&mut code);
        Ok(finish(symbol.to_string(), code, unpadded_len, raw_fixups))
    }

    /// Classify one relocation and pre-bake its constant part.
    fn bake(
        &self,
        symbol: &str,
        code: &mut [u8],
        offset: u32,
        relocation: &RawRelocation,
    ) -> Result<FixupRecord, BuildError> {
        let kind = match relocation.r_type {
            Some(R_X86_64_64) => RelocationKind::Absolute64,
            Some(R_X86_64_PLT32) => RelocationKind::SelfRelative32,
            Some(R_X86_64_TPOFF32) => RelocationKind::ThreadLocalOffset32,
            _ => {
                return Err(BuildError::UnsupportedRelocation {
                    symbol: symbol.to_string(),
                    offset,
                    kind: relocation.flags.clone(),
                })
            }
        };
        let bad_target = |target: &str| BuildError::UnsupportedRelocationTarget {
            symbol: symbol.to_string(),
            offset,
            target: target.to_string(),
        };
        let (class, ordinal) = match &relocation.target {
            RawTarget::Symbol(name) => parse_placeholder(name)?.ok_or_else(|| bad_target(name))?,
            RawTarget::Other(description) => return Err(bad_target(description)),
        };
        let is_tls_kind = kind == RelocationKind::ThreadLocalOffset32;
        let is_tls_class = class == SymbolClass::ThreadLocalBase;
        if is_tls_kind != is_tls_class {
            let name = match &relocation.target {
                RawTarget::Symbol(name) => name.as_str(),
                RawTarget::Other(description) => description.as_str(),
            };
            return Err(bad_target(&format!("`{name}` for {kind:?}")));
        }

        let start = offset as usize;
        let end = start + kind.width() as usize;
        let field = code.get_mut(start..end).ok_or_else(|| BuildError::MalformedObject {
            module: self.module.to_string(),
            reason: format!("relocation at `{symbol}`+{offset:#x} runs past the code"),
        })?;
        let addend = if relocation.implicit_addend {
            read_field(field)
        } else {
            relocation.addend
        };
        let out_of_range = || BuildError::AddendOutOfRange {
            symbol: symbol.to_string(),
            offset,
            addend,
        };
        match kind {
            RelocationKind::SelfRelative32 => {
                let baked = addend.checked_sub(i64::from(offset)).ok_or_else(out_of_range)?;
                let baked = i32::try_from(baked).map_err(|_| out_of_range())?;
                field.copy_from_slice(&baked.to_le_bytes());
            }
            RelocationKind::Absolute64 => field.copy_from_slice(&addend.to_le_bytes()),
            RelocationKind::ThreadLocalOffset32 => {
                let baked = i32::try_from(addend).map_err(|_| out_of_range())?;
                field.copy_from_slice(&baked.to_le_bytes());
            }
        }
        Ok(FixupRecord {
            offset,
            kind,
            class,
            ordinal,
        })
    }
}

fn read_field(field: &[u8]) -> i64 {
    match field.len() {
        4 => i64::from(i32::from_le_bytes([field[0], field[1], field[2], field[3]])),
        _ => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&field[..8]);
            i64::from_le_bytes(bytes)
        }
    }
}

/// Renumber ordinals so classes pack contiguously and build the tables.
fn finish(
    symbol: String,
    code: Vec<u8>,
    unpadded_len: u32,
    mut fixups: Vec<FixupRecord>,
) -> ExtractedCode {
    let count = |class: SymbolClass| {
        fixups
            .iter()
            .filter(|f| f.class == class)
            .map(|f| f.ordinal + 1)
            .max()
            .unwrap_or(0)
    };
    let fixup_counts = FixupCounts {
        boilerplate_fns: count(SymbolClass::BoilerplateFunctionPointer),
        host_fns: count(SymbolClass::HostFunctionPointer),
        constants: count(SymbolClass::U64Constant),
    };
    for fixup in &mut fixups {
        fixup.ordinal = match fixup_counts.base_of(fixup.class) {
            Some(base) => base + fixup.ordinal,
            None => 0,
        };
    }
    fixups.sort_by_key(|f| f.offset);

    let mut code = ExtractedCode {
        symbol,
        code,
        unpadded_len,
        fixups: Vec::new(),
        fixup_counts,
        self_relative32: Vec::new(),
        symbol32: Vec::new(),
        symbol64: Vec::new(),
        thread_local32: Vec::new(),
    };
    for fixup in &fixups {
        let site = FixupSite {
            offset: fixup.offset,
            ordinal: fixup.ordinal,
        };
        match fixup.kind {
            RelocationKind::SelfRelative32 => {
                code.self_relative32.push(fixup.offset);
                code.symbol32.push(site);
            }
            RelocationKind::Absolute64 => code.symbol64.push(site),
            RelocationKind::ThreadLocalOffset32 => code.thread_local32.push(fixup.offset),
        }
    }
    code.fixups = fixups;
    code
}
