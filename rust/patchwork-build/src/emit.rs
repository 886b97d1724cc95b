//! Rust source generation for the blueprint library.
//!
//! Two files are produced and are meant to be `include!`d side by side into
//! one module of the host crate:
//!
//! - `patchwork_decls.rs`: forward declarations (named enum-axis types,
//!   each family's axis layout, the family list);
//! - `patchwork_library.rs`: code bytes, fixup tables, perfect-hash tables,
//!   one `pub mod <family>` of statics per family, and the
//!   `select_<family>_blueprint` accessors.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use patchwork_core::{AxisKind, FixupSite, HashSlot, TypeId};
use tracing::info;

use crate::compiled::{CompiledFamily, CompiledModule};
use crate::error::BuildError;
use crate::manifest::AxisSignature;

pub const DECLS_FILE: &str = "patchwork_decls.rs";
pub const LIBRARY_FILE: &str = "patchwork_library.rs";

const CORE: &str = "::patchwork_core";

/// Generated source text of both files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedSources {
    pub decls: String,
    pub library: String,
}

/// Generate both sources for `modules`, in module then family order.
pub fn generate(modules: &[CompiledModule]) -> Result<GeneratedSources, BuildError> {
    let mut owner: HashMap<&str, &str> = HashMap::new();
    let mut families = Vec::new();
    for module in modules {
        for family in &module.families {
            if let Some(first) = owner.insert(&family.name, &module.module) {
                return Err(BuildError::DuplicateFamily {
                    family: family.name.clone(),
                    first: first.to_string(),
                    second: module.module.clone(),
                });
            }
            families.push((module.module.as_str(), family));
        }
    }

    let mut type_owner: HashMap<String, String> = HashMap::new();
    let mut enum_types = Vec::with_capacity(families.len());
    for (module, family) in &families {
        let types: Vec<Option<String>> = family
            .signature
            .iter()
            .map(|axis| enum_type_name(&family.name, axis))
            .collect();
        for name in types.iter().flatten() {
            if let Some(other) = type_owner.insert(name.clone(), family.name.clone()) {
                return Err(BuildError::MalformedModule {
                    module: module.to_string(),
                    reason: format!(
                        "generated type `{name}` of family `{}` collides with family `{other}`",
                        family.name
                    ),
                });
            }
        }
        enum_types.push(types);
    }

    let module_names: Vec<&str> = modules.iter().map(|m| m.module.as_str()).collect();
    let uses_tls = families.iter().any(|(_, f)| f.uses_thread_local_base());

    let mut decls = header(&module_names);
    let mut library = header(&module_names);
    library.push_str("// Requires the items of patchwork_decls.rs in the same module.\n\n");

    for ((_, family), types) in families.iter().zip(&enum_types) {
        emit_decls(&mut decls, family, types);
        emit_family(&mut library, family, types);
    }

    decls.push_str("/// Every family in the library, in generation order.\n");
    decls.push_str("pub const FAMILY_NAMES: &[&str] = &[\n");
    for (_, family) in &families {
        decls.push_str(&format!("    \"{}\",\n", family.name));
    }
    decls.push_str("];\n\n");
    decls.push_str("/// Whether any blueprint carries thread-local fixups.\n");
    decls.push_str(&format!(
        "pub const USES_THREAD_LOCAL_BASE: bool = {uses_tls};\n"
    ));

    library.push_str("/// Every family in the library, in generation order.\n");
    library.push_str(&format!(
        "pub static FAMILIES: &[&{CORE}::BoilerplateFamily<'static>] = &[\n"
    ));
    for (_, family) in &families {
        library.push_str(&format!("    &{}::FAMILY,\n", rust_ident(&family.name)));
    }
    library.push_str("];\n");

    if uses_tls {
        library.push_str("\n/// Record the thread-pointer-relative offset of the host's thread-local base.\n");
        library.push_str("///\n");
        library.push_str("/// Call once at start-up, before specializing any blueprint with\n");
        library.push_str("/// thread-local fixups. Returns `false` if a different offset is installed.\n");
        library.push_str("pub fn install_thread_local_base(offset: i32) -> bool {\n");
        library.push_str(&format!(
            "    {CORE}::tls::install_thread_local_base(offset)\n"
        ));
        library.push_str("}\n");
    }

    Ok(GeneratedSources { decls, library })
}

fn header(modules: &[&str]) -> String {
    let mut out = String::new();
    out.push_str("// @generated by patchwork-build. DO NOT EDIT BY HAND.\n");
    out.push_str(&format!("// Modules: {}\n\n", modules.join(", ")));
    out
}

fn emit_decls(out: &mut String, family: &CompiledFamily, types: &[Option<String>]) {
    for (axis, ty) in family.signature.iter().zip(types) {
        let Some(ty) = ty else { continue };
        out.push_str(&format!(
            "/// Values of axis `{}` of family `{}`.\n",
            axis.name, family.name
        ));
        out.push_str("#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]\n");
        out.push_str("#[repr(u64)]\n");
        out.push_str(&format!("pub enum {ty} {{\n"));
        for (value, variant) in variant_names(&axis.variants).iter().enumerate() {
            out.push_str(&format!("    {variant} = {value},\n"));
        }
        out.push_str("}\n\n");
    }

    let params: Vec<String> = family
        .signature
        .iter()
        .zip(types)
        .map(|(axis, ty)| format!("{}: {}", axis.name, param_type(axis, ty.as_deref())))
        .collect();
    out.push_str(&format!(
        "/// Axis layout of family `{}`: `({})`.\n",
        family.name,
        params.join(", ")
    ));
    out.push_str(&format!(
        "pub const {}_AXES: &[{CORE}::AxisKind] = &[",
        family.name.to_uppercase()
    ));
    let kinds: Vec<String> = family.signature.iter().map(|a| axis_kind_expr(a.kind)).collect();
    out.push_str(&kinds.join(", "));
    out.push_str("];\n\n");
}

fn emit_family(out: &mut String, family: &CompiledFamily, types: &[Option<String>]) {
    let module = rust_ident(&family.name);
    out.push_str(&format!(
        "/// Blueprints of family `{}` ({} variants).\n",
        family.name,
        family.variants.len()
    ));
    out.push_str(&format!("pub mod {module} {{\n"));

    for (i, variant) in family.variants.iter().enumerate() {
        let code = &variant.code;
        out.push_str(&format!(
            "    static V{i}_CODE: [u8; {}] = [\n",
            code.code.len()
        ));
        for chunk in code.code.chunks(16) {
            out.push_str("        ");
            let bytes: Vec<String> = chunk.iter().map(|b| format!("0x{b:02x}")).collect();
            out.push_str(&bytes.join(", "));
            out.push_str(",\n");
        }
        out.push_str("    ];\n");
        out.push_str(&format!(
            "    /// `{}` for `({})`.\n",
            code.symbol,
            describe_tuple(&family.signature, &variant.tuple)
        ));
        out.push_str(&format!(
            "    pub static V{i}: {CORE}::Blueprint<'static> = {CORE}::Blueprint {{\n"
        ));
        out.push_str(&format!("        symbol: \"{}\",\n", code.symbol));
        out.push_str(&format!("        code: &V{i}_CODE,\n"));
        out.push_str(&format!("        unpadded_len: {},\n", code.unpadded_len));
        out.push_str(&format!(
            "        self_relative32: &{},\n",
            u32_list(&code.self_relative32)
        ));
        out.push_str(&format!("        symbol32: &{},\n", site_list(&code.symbol32)));
        out.push_str(&format!("        symbol64: &{},\n", site_list(&code.symbol64)));
        out.push_str(&format!(
            "        thread_local32: &{},\n",
            u32_list(&code.thread_local32)
        ));
        let counts = code.fixup_counts;
        out.push_str(&format!(
            "        fixup_counts: {CORE}::FixupCounts {{ boilerplate_fns: {}, host_fns: {}, constants: {} }},\n",
            counts.boilerplate_fns, counts.host_fns, counts.constants
        ));
        out.push_str("    };\n\n");
    }

    let hash = &family.hash;
    out.push_str(&format!(
        "    static SLOTS: [{CORE}::HashSlot; {}] = [\n",
        hash.slots.len()
    ));
    for slot in &hash.slots {
        out.push_str(&format!("        {},\n", slot_expr(slot)));
    }
    out.push_str("    ];\n\n");

    out.push_str(&format!(
        "    pub static FAMILY: {CORE}::BoilerplateFamily<'static> = {CORE}::BoilerplateFamily {{\n"
    ));
    out.push_str(&format!("        name: \"{}\",\n", family.name));
    out.push_str(&format!(
        "        axes: super::{}_AXES,\n",
        family.name.to_uppercase()
    ));
    out.push_str(&format!("        index: {CORE}::PerfectHashIndex {{\n"));
    out.push_str(&format!("            h1: &{},\n", u32_list(&hash.h1)));
    out.push_str(&format!("            h2: &{},\n", u32_list(&hash.h2)));
    out.push_str(&format!("            h3: &{},\n", u32_list(&hash.h3)));
    out.push_str("            slots: &SLOTS,\n");
    out.push_str("        },\n");
    let refs: Vec<String> = (0..family.variants.len()).map(|i| format!("&V{i}")).collect();
    out.push_str(&format!("        variants: &[{}],\n", refs.join(", ")));
    out.push_str("    };\n");
    out.push_str("}\n\n");

    // Accessor.
    let params: Vec<String> = family
        .signature
        .iter()
        .zip(types)
        .map(|(axis, ty)| {
            format!(
                "{}: {}",
                rust_ident(&axis.name),
                param_type(axis, ty.as_deref())
            )
        })
        .collect();
    let encoded: Vec<String> = family
        .signature
        .iter()
        .map(|axis| {
            let name = rust_ident(&axis.name);
            match axis.kind {
                AxisKind::Type => format!("{name}.encode()"),
                AxisKind::Bool => format!("u64::from({name})"),
                AxisKind::Enum { .. } if axis.variants.is_empty() => name,
                AxisKind::Enum { .. } => format!("{name} as u64"),
            }
        })
        .collect();
    out.push_str(&format!(
        "/// Select the `{}` blueprint for a parameter tuple.\n",
        family.name
    ));
    out.push_str("///\n");
    out.push_str("/// Panics if the tuple was excluded when the library was built.\n");
    out.push_str(&format!(
        "pub fn select_{}_blueprint({}) -> &'static {CORE}::Blueprint<'static> {{\n",
        family.name,
        params.join(", ")
    ));
    out.push_str(&format!(
        "    {module}::FAMILY.select(&[{}])\n",
        encoded.join(", ")
    ));
    out.push_str("}\n\n");
}

fn param_type(axis: &AxisSignature, enum_type: Option<&str>) -> String {
    match (axis.kind, enum_type) {
        (AxisKind::Type, _) => format!("{CORE}::TypeId"),
        (AxisKind::Bool, _) => "bool".to_string(),
        (AxisKind::Enum { .. }, Some(ty)) => ty.to_string(),
        (AxisKind::Enum { .. }, None) => "u64".to_string(),
    }
}

fn axis_kind_expr(kind: AxisKind) -> String {
    match kind {
        AxisKind::Type => format!("{CORE}::AxisKind::Type"),
        AxisKind::Bool => format!("{CORE}::AxisKind::Bool"),
        AxisKind::Enum { count } => format!("{CORE}::AxisKind::Enum {{ count: {count} }}"),
    }
}

fn u32_list(values: &[u32]) -> String {
    let items: Vec<String> = values.iter().map(u32::to_string).collect();
    format!("[{}]", items.join(", "))
}

fn site_list(sites: &[FixupSite]) -> String {
    let items: Vec<String> = sites
        .iter()
        .map(|s| {
            format!(
                "{CORE}::FixupSite {{ offset: {}, ordinal: {} }}",
                s.offset, s.ordinal
            )
        })
        .collect();
    format!("[{}]", items.join(", "))
}

fn slot_expr(slot: &HashSlot) -> String {
    if slot.is_empty() {
        format!("{CORE}::EMPTY_SLOT")
    } else {
        format!(
            "{CORE}::HashSlot {{ ordinal: {}, fingerprint: {:#x} }}",
            slot.ordinal, slot.fingerprint
        )
    }
}

fn describe_tuple(signature: &[AxisSignature], tuple: &[u64]) -> String {
    let parts: Vec<String> = signature
        .iter()
        .zip(tuple)
        .map(|(axis, &value)| {
            let shown = match axis.kind {
                AxisKind::Type => TypeId::decode(value)
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| value.to_string()),
                AxisKind::Bool => (value != 0).to_string(),
                AxisKind::Enum { .. } => axis
                    .variants
                    .get(value as usize)
                    .cloned()
                    .unwrap_or_else(|| value.to_string()),
            };
            format!("{} = {shown}", axis.name)
        })
        .collect();
    parts.join(", ")
}

fn pascal_case(name: &str) -> String {
    name.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

/// `Family` + `Axis` for a named enum axis, `None` otherwise.
fn enum_type_name(family: &str, axis: &AxisSignature) -> Option<String> {
    match axis.kind {
        AxisKind::Enum { .. } if !axis.variants.is_empty() => {
            Some(format!("{}{}", pascal_case(family), pascal_case(&axis.name)))
        }
        _ => None,
    }
}

/// PascalCase variant names, made valid and unique.
fn variant_names(variants: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(variants.len());
    for (i, variant) in variants.iter().enumerate() {
        let mut name = pascal_case(variant);
        if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
            name = format!("V{name}");
        }
        if out.contains(&name) || name == "Self" {
            name = format!("{name}{i}");
        }
        out.push(name);
    }
    out
}

/// Escape Rust keywords so manifest names can be used as identifiers.
fn rust_ident(name: &str) -> String {
    const RESERVED: &[&str] = &[
        "as", "async", "await", "break", "const", "continue", "dyn", "else", "enum", "extern",
        "false", "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod", "move", "mut",
        "pub", "ref", "return", "static", "struct", "trait", "true", "type", "unsafe", "use",
        "where", "while", "abstract", "become", "box", "do", "final", "gen", "macro",
        "override", "priv", "try", "typeof", "unsized", "virtual", "yield",
    ];
    match name {
        "self" | "super" | "crate" => format!("{name}_"),
        _ if RESERVED.contains(&name) => format!("r#{name}"),
        _ => name.to_string(),
    }
}

/// Write `contents` to `path` through a `.tmp` sibling and a rename, so a
/// reader never observes a half-written file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), BuildError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents).map_err(|e| BuildError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| BuildError::io(path, e))
}

/// Write both generated files into `out_dir`.
pub fn write_sources(out_dir: &Path, sources: &GeneratedSources) -> Result<(), BuildError> {
    fs::create_dir_all(out_dir).map_err(|e| BuildError::io(out_dir, e))?;
    write_atomic(&out_dir.join(DECLS_FILE), sources.decls.as_bytes())?;
    write_atomic(&out_dir.join(LIBRARY_FILE), sources.library.as_bytes())?;
    info!(out_dir = %out_dir.display(), "wrote blueprint library");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiled::CompiledVariant;
    use crate::extract::ExtractedCode;
    use crate::perfect_hash::PerfectHashTable;
    use patchwork_core::{FixupCounts, PrimitiveType};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn variant(symbol: &str, tuple: Vec<u64>) -> CompiledVariant {
        CompiledVariant {
            tuple,
            code: ExtractedCode {
                symbol: symbol.to_string(),
                code: vec![0xc3; 16],
                unpadded_len: 1,
                fixups: Vec::new(),
                fixup_counts: FixupCounts::default(),
                self_relative32: Vec::new(),
                symbol32: Vec::new(),
                symbol64: Vec::new(),
                thread_local32: Vec::new(),
            },
        }
    }

    fn module() -> CompiledModule {
        let u8 = TypeId::Value(PrimitiveType::U8).encode();
        let u64 = TypeId::Value(PrimitiveType::U64).encode();
        let tuples = vec![vec![u8, 0], vec![u64, 1]];
        let hash =
            PerfectHashTable::build("type", 2, &tuples, &mut StdRng::seed_from_u64(0)).unwrap();
        CompiledModule {
            module: "arith".to_string(),
            families: vec![CompiledFamily {
                name: "type".to_string(),
                signature: vec![
                    AxisSignature {
                        name: "lhs".to_string(),
                        kind: AxisKind::Type,
                        variants: Vec::new(),
                    },
                    AxisSignature {
                        name: "op".to_string(),
                        kind: AxisKind::Enum { count: 2 },
                        variants: vec!["add".to_string(), "self".to_string()],
                    },
                ],
                variants: vec![variant("type_u8_add", tuples[0].clone()), variant("type_u64_self", tuples[1].clone())],
                hash,
            }],
        }
    }

    #[test]
    fn generates_accessor_and_types() {
        let sources = generate(&[module()]).unwrap();
        assert!(sources.decls.contains("pub enum TypeOp {"));
        assert!(sources.decls.contains("    Add = 0,"));
        assert!(sources.decls.contains("    Self1 = 1,"));
        assert!(sources.decls.contains("pub const TYPE_AXES"));
        assert!(sources.decls.contains("pub const USES_THREAD_LOCAL_BASE: bool = false;"));
        assert!(sources.library.contains("pub mod r#type {"));
        assert!(sources.library.contains(
            "pub fn select_type_blueprint(lhs: ::patchwork_core::TypeId, op: TypeOp)"
        ));
        assert!(sources.library.contains("r#type::FAMILY.select(&[lhs.encode(), op as u64])"));
        assert!(sources.library.contains("/// `type_u8_add` for `(lhs = u8, op = add)`."));
        assert!(!sources.library.contains("install_thread_local_base"));
    }

    #[test]
    fn thread_local_fixups_emit_installer() {
        let mut m = module();
        m.families[0].variants[0].code.thread_local32 = vec![4];
        let sources = generate(&[m]).unwrap();
        assert!(sources.library.contains("pub fn install_thread_local_base(offset: i32) -> bool"));
        assert!(sources.decls.contains("USES_THREAD_LOCAL_BASE: bool = true"));
    }

    #[test]
    fn duplicate_family_across_modules_fails() {
        let mut other = module();
        other.module = "other".to_string();
        let err = generate(&[module(), other]).unwrap_err();
        assert!(matches!(err, BuildError::DuplicateFamily { family, .. } if family == "type"));
    }

    #[test]
    fn identifiers_are_made_valid() {
        assert_eq!(pascal_case("shift_left"), "ShiftLeft");
        assert_eq!(variant_names(&["_1".to_string(), "a".to_string()]), vec!["V1", "A"]);
        assert_eq!(rust_ident("match"), "r#match");
        assert_eq!(rust_ident("self"), "self_");
        assert_eq!(rust_ident("lhs"), "lhs");
    }

    #[test]
    fn atomic_write_leaves_no_tmp() {
        let dir = std::env::temp_dir().join(format!(
            "patchwork_emit_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let sources = generate(&[module()]).unwrap();
        write_sources(&dir, &sources).unwrap();
        assert_eq!(
            fs::read_to_string(dir.join(LIBRARY_FILE)).unwrap(),
            sources.library
        );
        assert!(!dir.join("patchwork_library.rs.tmp").exists());
        fs::remove_dir_all(&dir).ok();
    }
}
