//! Generates the blueprint library of this crate.
//!
//! The boilerplate object is assembled in memory rather than compiled from
//! source, so the build does not depend on a particular compiler's output.
//! It is run through the same `compile_module` and `generate` path as the
//! `patchwork-build` CLI, and the two generated files land in `OUT_DIR`.
//!
//! Families:
//! - `add(width: type)`: `add_u8`, `add_u64` sum constants 0 and 1
//! - `ret_const()`: returns constant 0
//! - `call_first()`: calls boilerplate function 0 and returns its result

use std::env;
use std::path::PathBuf;

use object::elf::{R_X86_64_64, R_X86_64_PLT32};
use object::write::{Object, Relocation, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationFlags, SectionKind, SymbolFlags, SymbolKind,
    SymbolScope,
};
use patchwork_build::emit::write_sources;
use patchwork_build::{compile_module, generate, NoProcessSymbols};

const MANIFEST: &str = r#"
module = "arith"

[[family]]
name = "add"
body = "add_{width}"
axes = [ { name = "width", kind = "type", values = ["u8", "u64"] } ]

[[family]]
name = "ret_const"
body = "ret_const"

[[family]]
name = "call_first"
body = "call_first"
"#;

/// `(offset, r_type, target, addend)`
type Reloc = (u64, u32, &'static str, i64);

fn add_function(obj: &mut Object<'static>, name: &str, code: &[u8], relocs: &[Reloc]) {
    let section = obj.add_section(
        Vec::new(),
        format!(".text.{name}").into_bytes(),
        SectionKind::Text,
    );
    obj.append_section_data(section, code, 16);
    obj.add_symbol(Symbol {
        name: name.as_bytes().to_vec(),
        value: 0,
        size: code.len() as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(section),
        flags: SymbolFlags::None,
    });
    for &(offset, r_type, target, addend) in relocs {
        let symbol = match obj.symbol_id(target.as_bytes()) {
            Some(id) => id,
            None => obj.add_symbol(Symbol {
                name: target.as_bytes().to_vec(),
                value: 0,
                size: 0,
                kind: SymbolKind::Unknown,
                scope: SymbolScope::Dynamic,
                weak: false,
                section: SymbolSection::Undefined,
                flags: SymbolFlags::None,
            }),
        };
        obj.add_relocation(
            section,
            Relocation {
                offset,
                symbol,
                addend,
                flags: RelocationFlags::Elf { r_type },
            },
        )
        .unwrap();
    }
}

fn boilerplate_object() -> Vec<u8> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let two_constants = [
        (2, R_X86_64_64, "__patchwork_const_0", 0),
        (12, R_X86_64_64, "__patchwork_const_1", 0),
    ];

    // mov rax, imm64; mov rcx, imm64; add al, cl; movzx eax, al; ret
    let add_u8 = [
        0x48, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0x48, 0xb9, 0, 0, 0, 0, 0, 0, 0, 0, 0x00, 0xc8, 0x0f,
        0xb6, 0xc0, 0xc3,
    ];
    add_function(&mut obj, "add_u8", &add_u8, &two_constants);

    // mov rax, imm64; mov rcx, imm64; add rax, rcx; ret
    let add_u64 = [
        0x48, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0x48, 0xb9, 0, 0, 0, 0, 0, 0, 0, 0, 0x48, 0x01, 0xc8,
        0xc3,
    ];
    add_function(&mut obj, "add_u64", &add_u64, &two_constants);

    // mov rax, imm64; ret
    let ret_const = [0x48, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0xc3];
    add_function(
        &mut obj,
        "ret_const",
        &ret_const,
        &[(2, R_X86_64_64, "__patchwork_const_0", 0)],
    );

    // call rel32; ret
    let call_first = [0xe8, 0, 0, 0, 0, 0xc3];
    add_function(
        &mut obj,
        "call_first",
        &call_first,
        &[(1, R_X86_64_PLT32, "__patchwork_boilerplate_fn_0", -4)],
    );

    obj.write().unwrap()
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let module = compile_module(
        "arith.toml",
        MANIFEST,
        &boilerplate_object(),
        &NoProcessSymbols,
        Some(1),
    )
    .unwrap_or_else(|e| panic!("compiling the arith blueprints failed: {e}"));
    let sources = generate(&[module]).unwrap_or_else(|e| panic!("generating sources failed: {e}"));
    write_sources(&out_dir, &sources).unwrap_or_else(|e| panic!("writing sources failed: {e}"));
}
