//! Copy-and-patch specialization.
//!
//! A blueprint's bytes are copied into the destination and each fixup site
//! is patched with the value this call site supplies. The constant part of
//! every relocation (addend, and for self-relative sites the distance from
//! the start of the blueprint) is already baked into the bytes at build
//! time, so patching is additive:
//!
//! ```text
//! symbol32        field += (u32) value[ordinal]
//! self_relative32 field -= (u32) destination address
//! symbol64        field += value[ordinal]
//! thread_local32  field += start-up thread-local offset
//! ```
//!
//! The routine touches nothing but the destination slice.

use patchwork_core::{tls, Blueprint, FixupCounts, SymbolClass};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpecializeError {
    #[error("destination holds {available} bytes but blueprint `{symbol}` needs {needed}")]
    DestinationTooSmall {
        symbol: String,
        needed: usize,
        available: usize,
    },

    #[error("blueprint `{symbol}` needs {expected} fixup values, got {supplied}")]
    FixupValueCount {
        symbol: String,
        expected: usize,
        supplied: usize,
    },

    #[error("blueprint `{symbol}` expects {expected} {class:?} values, got {supplied}")]
    FixupClassCount {
        symbol: String,
        class: SymbolClass,
        expected: u32,
        supplied: usize,
    },

    #[error("blueprint `{symbol}` has thread-local fixups but no thread-local base is installed")]
    ThreadLocalBaseMissing { symbol: String },

    #[error("self-relative target of blueprint `{symbol}` at offset {offset} is out of 32-bit range")]
    DisplacementOutOfRange { symbol: String, offset: u32 },
}

/// Per-class fixup values for one call site.
///
/// Values are listed in placeholder-ordinal order within each class;
/// [`FixupValues::pack`] lays them out in the packed order a blueprint's
/// ordinals refer to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixupValues {
    pub boilerplate_fns: Vec<u64>,
    pub host_fns: Vec<u64>,
    pub constants: Vec<u64>,
}

impl FixupValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address of an already specialized callee boilerplate.
    pub fn boilerplate_fn(mut self, address: u64) -> Self {
        self.boilerplate_fns.push(address);
        self
    }

    pub fn host_fn(mut self, address: u64) -> Self {
        self.host_fns.push(address);
        self
    }

    pub fn constant(mut self, value: u64) -> Self {
        self.constants.push(value);
        self
    }

    /// Flatten into packed-ordinal order, checking each class count.
    pub fn pack(&self, blueprint: &Blueprint<'_>) -> Result<Vec<u64>, SpecializeError> {
        let counts: FixupCounts = blueprint.fixup_counts;
        for (class, supplied) in [
            (SymbolClass::BoilerplateFunctionPointer, &self.boilerplate_fns),
            (SymbolClass::HostFunctionPointer, &self.host_fns),
            (SymbolClass::U64Constant, &self.constants),
        ] {
            if counts.count_of(class) as usize != supplied.len() {
                return Err(SpecializeError::FixupClassCount {
                    symbol: blueprint.symbol.to_string(),
                    class,
                    expected: counts.count_of(class),
                    supplied: supplied.len(),
                });
            }
        }
        let mut packed = Vec::with_capacity(counts.total() as usize);
        packed.extend_from_slice(&self.boilerplate_fns);
        packed.extend_from_slice(&self.host_fns);
        packed.extend_from_slice(&self.constants);
        Ok(packed)
    }
}

/// Copy `blueprint` into `dest` and patch it for execution at
/// `dest_address` (the address `dest[0]` will have when the code runs).
///
/// `values` is indexed by packed ordinal. Returns the number of bytes
/// written.
pub fn specialize(
    blueprint: &Blueprint<'_>,
    values: &[u64],
    dest: &mut [u8],
    dest_address: u64,
) -> Result<usize, SpecializeError> {
    let len = blueprint.code.len();
    if dest.len() < len {
        return Err(SpecializeError::DestinationTooSmall {
            symbol: blueprint.symbol.to_string(),
            needed: len,
            available: dest.len(),
        });
    }
    if values.len() != blueprint.fixup_value_count() {
        return Err(SpecializeError::FixupValueCount {
            symbol: blueprint.symbol.to_string(),
            expected: blueprint.fixup_value_count(),
            supplied: values.len(),
        });
    }
    let thread_local_base = if blueprint.needs_thread_local_base() {
        Some(
            tls::thread_local_base().ok_or_else(|| SpecializeError::ThreadLocalBaseMissing {
                symbol: blueprint.symbol.to_string(),
            })?,
        )
    } else {
        None
    };

    let code = &mut dest[..len];
    code.copy_from_slice(blueprint.code);

    for site in blueprint.symbol32 {
        let value = values[site.ordinal as usize];
        if blueprint.self_relative32.contains(&site.offset) {
            check_displacement(blueprint, site.offset, value, dest_address)?;
        }
        patch_u32(code, site.offset, |field| field.wrapping_add(value as u32));
    }
    for &offset in blueprint.self_relative32 {
        patch_u32(code, offset, |field| field.wrapping_sub(dest_address as u32));
    }
    for site in blueprint.symbol64 {
        let value = values[site.ordinal as usize];
        patch_u64(code, site.offset, |field| field.wrapping_add(value));
    }
    if let Some(base) = thread_local_base {
        for &offset in blueprint.thread_local32 {
            patch_u32(code, offset, |field| field.wrapping_add(base as u32));
        }
    }
    Ok(len)
}

/// The baked field holds `addend - offset`; the final displacement is that
/// plus `target - dest_address` and must fit a signed 32-bit field.
fn check_displacement(
    blueprint: &Blueprint<'_>,
    offset: u32,
    target: u64,
    dest_address: u64,
) -> Result<(), SpecializeError> {
    let at = offset as usize;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&blueprint.code[at..at + 4]);
    let baked = i64::from(i32::from_le_bytes(raw));
    let displacement = i128::from(baked) + i128::from(target) - i128::from(dest_address);
    if i32::try_from(displacement).is_err() {
        return Err(SpecializeError::DisplacementOutOfRange {
            symbol: blueprint.symbol.to_string(),
            offset,
        });
    }
    Ok(())
}

fn patch_u32(code: &mut [u8], offset: u32, f: impl FnOnce(u32) -> u32) {
    let at = offset as usize;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&code[at..at + 4]);
    code[at..at + 4].copy_from_slice(&f(u32::from_le_bytes(raw)).to_le_bytes());
}

fn patch_u64(code: &mut [u8], offset: u32, f: impl FnOnce(u64) -> u64) {
    let at = offset as usize;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&code[at..at + 8]);
    code[at..at + 8].copy_from_slice(&f(u64::from_le_bytes(raw)).to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchwork_core::FixupSite;

    /// movabs rax, imm64 ; ret
    const RETURN_CONSTANT: [u8; 16] = [
        0x48, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0xc3, 0x0f, 0x1f, 0x44, 0x00, 0x00,
    ];

    fn return_constant() -> Blueprint<'static> {
        Blueprint {
            symbol: "return_constant",
            code: &RETURN_CONSTANT,
            unpadded_len: 11,
            self_relative32: &[],
            symbol32: &[],
            symbol64: &[FixupSite {
                offset: 2,
                ordinal: 0,
            }],
            thread_local32: &[],
            fixup_counts: FixupCounts {
                boilerplate_fns: 0,
                host_fns: 0,
                constants: 1,
            },
        }
    }

    #[test]
    fn patches_absolute_constant() {
        let bp = return_constant();
        let mut dest = [0u8; 32];
        let n = specialize(&bp, &[0x1234], &mut dest, 0x10_0000).unwrap();
        assert_eq!(n, 16);
        assert_eq!(&dest[2..10], &0x1234u64.to_le_bytes());
        assert_eq!(dest[10], 0xc3);
        assert_eq!(&dest[16..], &[0u8; 16]);
    }

    #[test]
    fn self_relative_call_resolves_to_target() {
        // call rel32 ; ret -- baked field is addend(-4) - offset(1) = -5
        static CODE: [u8; 6] = [0xe8, 0xfb, 0xff, 0xff, 0xff, 0xc3];
        let bp = Blueprint {
            symbol: "caller",
            code: &CODE,
            unpadded_len: 6,
            self_relative32: &[1],
            symbol32: &[FixupSite {
                offset: 1,
                ordinal: 0,
            }],
            symbol64: &[],
            thread_local32: &[],
            fixup_counts: FixupCounts {
                boilerplate_fns: 1,
                host_fns: 0,
                constants: 0,
            },
        };
        let dest_address = 0x7000_0000u64;
        let target = 0x7000_1000u64;
        let mut dest = [0u8; 6];
        specialize(&bp, &[target], &mut dest, dest_address).unwrap();
        let rel = i32::from_le_bytes([dest[1], dest[2], dest[3], dest[4]]);
        // Displacement is taken from the end of the 5-byte call.
        assert_eq!(dest_address as i64 + 5 + i64::from(rel), target as i64);
    }

    #[test]
    fn far_self_relative_target_is_rejected() {
        static CODE: [u8; 5] = [0xe8, 0xfb, 0xff, 0xff, 0xff];
        let bp = Blueprint {
            symbol: "far",
            code: &CODE,
            unpadded_len: 5,
            self_relative32: &[1],
            symbol32: &[FixupSite {
                offset: 1,
                ordinal: 0,
            }],
            symbol64: &[],
            thread_local32: &[],
            fixup_counts: FixupCounts {
                boilerplate_fns: 0,
                host_fns: 1,
                constants: 0,
            },
        };
        let mut dest = [0u8; 5];
        let err = specialize(&bp, &[0x7fff_0000_0000], &mut dest, 0x1000).unwrap_err();
        assert!(matches!(err, SpecializeError::DisplacementOutOfRange { offset: 1, .. }));
    }

    #[test]
    fn destination_too_small() {
        let bp = return_constant();
        let mut dest = [0u8; 8];
        let err = specialize(&bp, &[1], &mut dest, 0).unwrap_err();
        assert!(matches!(
            err,
            SpecializeError::DestinationTooSmall {
                needed: 16,
                available: 8,
                ..
            }
        ));
    }

    #[test]
    fn wrong_value_count() {
        let bp = return_constant();
        let mut dest = [0u8; 16];
        assert!(specialize(&bp, &[], &mut dest, 0).is_err());
        assert!(specialize(&bp, &[1, 2], &mut dest, 0).is_err());
    }

    #[test]
    fn pack_orders_classes() {
        static CODE: [u8; 0] = [];
        let bp = Blueprint {
            symbol: "mixed",
            code: &CODE,
            unpadded_len: 0,
            self_relative32: &[],
            symbol32: &[],
            symbol64: &[],
            thread_local32: &[],
            fixup_counts: FixupCounts {
                boilerplate_fns: 1,
                host_fns: 2,
                constants: 1,
            },
        };
        let values = FixupValues::new()
            .constant(9)
            .host_fn(20)
            .boilerplate_fn(10)
            .host_fn(21);
        assert_eq!(values.pack(&bp).unwrap(), vec![10, 20, 21, 9]);
        let short = FixupValues::new().boilerplate_fn(1);
        assert!(matches!(
            short.pack(&bp),
            Err(SpecializeError::FixupClassCount {
                class: SymbolClass::HostFunctionPointer,
                ..
            })
        ));
    }

    #[test]
    fn thread_local_sites_use_installed_base() {
        static CODE: [u8; 8] = [0x64, 0x8b, 0x04, 0x25, 0x10, 0, 0, 0];
        let bp = Blueprint {
            symbol: "tls_load",
            code: &CODE,
            unpadded_len: 8,
            self_relative32: &[],
            symbol32: &[],
            symbol64: &[],
            thread_local32: &[4],
            fixup_counts: FixupCounts::default(),
        };
        tls::install_thread_local_base(-0x100);
        let base = tls::thread_local_base().unwrap();
        let mut dest = [0u8; 8];
        specialize(&bp, &[], &mut dest, 0).unwrap();
        let field = i32::from_le_bytes([dest[4], dest[5], dest[6], dest[7]]);
        assert_eq!(field, 0x10 + base);
    }
}
