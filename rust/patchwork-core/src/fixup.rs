//! Fixup records and the placeholder naming convention.
//!
//! A boilerplate body refers to values it only learns at specialization time
//! through undefined placeholder symbols. The symbol name encodes what the
//! value is (its class) and which one (its ordinal):
//!
//! ```text
//! __patchwork_boilerplate_fn_<N>   address of another specialized boilerplate
//! __patchwork_host_fn_<N>          address of a host function
//! __patchwork_const_<N>            an arbitrary 64-bit constant
//! __patchwork_thread_local_base    the host's thread-local block (TPOFF32 only)
//! ```

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub const BOILERPLATE_FN_PREFIX: &str = "__patchwork_boilerplate_fn_";
pub const HOST_FN_PREFIX: &str = "__patchwork_host_fn_";
pub const CONSTANT_PREFIX: &str = "__patchwork_const_";
pub const THREAD_LOCAL_BASE_SYMBOL: &str = "__patchwork_thread_local_base";

/// Boilerplate bodies live in `.text.<symbol>` (one section per function).
pub const CODE_SECTION_PREFIX: &str = ".text.";

/// Placeholder ordinals have at most this many decimal digits.
pub const MAX_ORDINAL_DIGITS: usize = 8;

/// How the bytes at a fixup site are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelocationKind {
    /// 32-bit displacement from the end of the field (PLT-style calls/jumps).
    SelfRelative32,
    /// Full 64-bit value.
    Absolute64,
    /// 32-bit offset from the thread pointer.
    ThreadLocalOffset32,
}

impl RelocationKind {
    /// Width of the patched field in bytes.
    pub fn width(self) -> u32 {
        match self {
            Self::SelfRelative32 | Self::ThreadLocalOffset32 => 4,
            Self::Absolute64 => 8,
        }
    }
}

/// What a fixup refers to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum SymbolClass {
    BoilerplateFunctionPointer,
    HostFunctionPointer,
    U64Constant,
    ThreadLocalBase,
}

impl SymbolClass {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::BoilerplateFunctionPointer => BOILERPLATE_FN_PREFIX,
            Self::HostFunctionPointer => HOST_FN_PREFIX,
            Self::U64Constant => CONSTANT_PREFIX,
            Self::ThreadLocalBase => THREAD_LOCAL_BASE_SYMBOL,
        }
    }
}

/// One patch site inside a variant's code.
///
/// `ordinal` is the packed position among all of the variant's fixup values
/// (see [`FixupCounts`]); it is 0 for thread-local fixups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FixupRecord {
    pub offset: u32,
    pub kind: RelocationKind,
    pub class: SymbolClass,
    pub ordinal: u32,
}

/// An `(offset, packed ordinal)` pair as stored in blueprint tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FixupSite {
    pub offset: u32,
    pub ordinal: u32,
}

/// Number of fixup values per class for one variant.
///
/// Packed ordinals number boilerplate pointers first, host function pointers
/// immediately after, then constants, so a call site passes one flat array.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FixupCounts {
    pub boilerplate_fns: u32,
    pub host_fns: u32,
    pub constants: u32,
}

impl FixupCounts {
    pub const fn total(&self) -> u32 {
        self.boilerplate_fns + self.host_fns + self.constants
    }

    /// First packed ordinal of `class`, or `None` for thread-local fixups.
    pub fn base_of(&self, class: SymbolClass) -> Option<u32> {
        match class {
            SymbolClass::BoilerplateFunctionPointer => Some(0),
            SymbolClass::HostFunctionPointer => Some(self.boilerplate_fns),
            SymbolClass::U64Constant => Some(self.boilerplate_fns + self.host_fns),
            SymbolClass::ThreadLocalBase => None,
        }
    }

    pub fn count_of(&self, class: SymbolClass) -> u32 {
        match class {
            SymbolClass::BoilerplateFunctionPointer => self.boilerplate_fns,
            SymbolClass::HostFunctionPointer => self.host_fns,
            SymbolClass::U64Constant => self.constants,
            SymbolClass::ThreadLocalBase => 0,
        }
    }
}

/// Classify a relocation target symbol.
///
/// Returns `Ok(None)` for names outside the convention and an error for a
/// placeholder prefix followed by something other than 1..=8 digits.
pub fn parse_placeholder(name: &str) -> Result<Option<(SymbolClass, u32)>, CoreError> {
    if name == THREAD_LOCAL_BASE_SYMBOL {
        return Ok(Some((SymbolClass::ThreadLocalBase, 0)));
    }
    for class in [
        SymbolClass::BoilerplateFunctionPointer,
        SymbolClass::HostFunctionPointer,
        SymbolClass::U64Constant,
    ] {
        if let Some(digits) = name.strip_prefix(class.prefix()) {
            if digits.is_empty()
                || digits.len() > MAX_ORDINAL_DIGITS
                || !digits.bytes().all(|b| b.is_ascii_digit())
            {
                return Err(CoreError::BadPlaceholderOrdinal(name.to_string()));
            }
            let ordinal = digits
                .parse::<u32>()
                .map_err(|_| CoreError::BadPlaceholderOrdinal(name.to_string()))?;
            return Ok(Some((class, ordinal)));
        }
    }
    Ok(None)
}

/// The placeholder symbol for `class` and `ordinal`.
pub fn placeholder_name(class: SymbolClass, ordinal: u32) -> String {
    match class {
        SymbolClass::ThreadLocalBase => THREAD_LOCAL_BASE_SYMBOL.to_string(),
        _ => format!("{}{}", class.prefix(), ordinal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_each_class() {
        assert_eq!(
            parse_placeholder("__patchwork_boilerplate_fn_3").unwrap(),
            Some((SymbolClass::BoilerplateFunctionPointer, 3))
        );
        assert_eq!(
            parse_placeholder("__patchwork_host_fn_0").unwrap(),
            Some((SymbolClass::HostFunctionPointer, 0))
        );
        assert_eq!(
            parse_placeholder("__patchwork_const_12345678").unwrap(),
            Some((SymbolClass::U64Constant, 12_345_678))
        );
        assert_eq!(
            parse_placeholder(THREAD_LOCAL_BASE_SYMBOL).unwrap(),
            Some((SymbolClass::ThreadLocalBase, 0))
        );
        assert_eq!(parse_placeholder("memcpy").unwrap(), None);
    }

    #[test]
    fn malformed_ordinals() {
        for bad in [
            "__patchwork_const_",
            "__patchwork_const_123456789",
            "__patchwork_host_fn_1a",
            "__patchwork_boilerplate_fn_-1",
        ] {
            assert!(parse_placeholder(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn name_round_trips_through_parse() {
        let name = placeholder_name(SymbolClass::HostFunctionPointer, 42);
        assert_eq!(name, "__patchwork_host_fn_42");
        assert_eq!(
            parse_placeholder(&name).unwrap(),
            Some((SymbolClass::HostFunctionPointer, 42))
        );
    }

    #[test]
    fn packed_bases() {
        let counts = FixupCounts {
            boilerplate_fns: 2,
            host_fns: 3,
            constants: 1,
        };
        assert_eq!(counts.base_of(SymbolClass::BoilerplateFunctionPointer), Some(0));
        assert_eq!(counts.base_of(SymbolClass::HostFunctionPointer), Some(2));
        assert_eq!(counts.base_of(SymbolClass::U64Constant), Some(5));
        assert_eq!(counts.base_of(SymbolClass::ThreadLocalBase), None);
        assert_eq!(counts.total(), 6);
    }
}
