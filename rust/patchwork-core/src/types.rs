//! The closed primitive type domain that type-axes range over.
//!
//! Every boilerplate family parameterized over operand types draws its
//! values from this set: the primitive scalars, one level of pointer to each
//! of them, and a catch-all `void**` standing in for every deeper pointer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{EnumCount, IntoEnumIterator};
use strum_macros::{EnumCount as EnumCountMacro, EnumIter, IntoStaticStr};

use crate::error::CoreError;

/// A primitive scalar type.
///
/// The discriminant order is part of the tuple encoding and must not change
/// once blueprints have been generated against it.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumIter,
    EnumCountMacro,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveType {
    Void,
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl PrimitiveType {
    /// Size in bytes of a value of this type (`void` is zero-sized).
    pub fn size(self) -> u32 {
        match self {
            Self::Void => 0,
            Self::Bool | Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }

    pub fn is_floating_point(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    pub fn name(self) -> &'static str {
        self.into()
    }

    fn from_index(index: u64) -> Option<Self> {
        Self::iter().nth(usize::try_from(index).ok()?)
    }
}

/// One member of the type domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeId {
    /// A primitive scalar.
    Value(PrimitiveType),
    /// A pointer to a primitive scalar.
    Pointer(PrimitiveType),
    /// `void**`, the catch-all for every pointer-to-pointer.
    OpaquePointerPointer,
}

impl TypeId {
    /// Number of members in the domain.
    pub const COUNT: u64 = PrimitiveType::COUNT as u64 * 2 + 1;

    /// Encode as the u64 axis value stored in parameter tuples.
    pub fn encode(self) -> u64 {
        match self {
            Self::Value(p) => p as u64 * 2,
            Self::Pointer(p) => p as u64 * 2 + 1,
            Self::OpaquePointerPointer => PrimitiveType::COUNT as u64 * 2,
        }
    }

    /// Inverse of [`TypeId::encode`].
    pub fn decode(value: u64) -> Option<Self> {
        if value == PrimitiveType::COUNT as u64 * 2 {
            return Some(Self::OpaquePointerPointer);
        }
        let base = PrimitiveType::from_index(value / 2)?;
        Some(if value % 2 == 0 {
            Self::Value(base)
        } else {
            Self::Pointer(base)
        })
    }

    /// Every member of the domain, in encoding order.
    pub fn all() -> impl Iterator<Item = TypeId> {
        (0..Self::COUNT).filter_map(Self::decode)
    }

    pub fn is_pointer(self) -> bool {
        !matches!(self, Self::Value(_))
    }

    pub fn is_floating_point(self) -> bool {
        matches!(self, Self::Value(p) if p.is_floating_point())
    }

    /// Integral scalars, `bool` included. Pointers are not integral.
    pub fn is_integral(self) -> bool {
        matches!(self, Self::Value(p) if p != PrimitiveType::Void && !p.is_floating_point())
    }

    /// Size in bytes of a value of this type on a 64-bit target.
    pub fn size(self) -> u32 {
        match self {
            Self::Value(p) => p.size(),
            Self::Pointer(_) | Self::OpaquePointerPointer => 8,
        }
    }

    /// A name usable inside a symbol: `u8`, `u8_ptr`, `void_ptr_ptr`.
    pub fn symbol_name(self) -> String {
        match self {
            Self::Value(p) => p.name().to_string(),
            Self::Pointer(p) => format!("{}_ptr", p.name()),
            Self::OpaquePointerPointer => "void_ptr_ptr".to_string(),
        }
    }

    /// The Rust expression that constructs this value, for generated code.
    pub fn rust_expr(self) -> String {
        match self {
            Self::Value(p) => format!("TypeId::Value(PrimitiveType::{:?})", p),
            Self::Pointer(p) => format!("TypeId::Pointer(PrimitiveType::{:?})", p),
            Self::OpaquePointerPointer => "TypeId::OpaquePointerPointer".to_string(),
        }
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(p) => write!(f, "{}", p.name()),
            Self::Pointer(p) => write!(f, "{}*", p.name()),
            Self::OpaquePointerPointer => write!(f, "void**"),
        }
    }
}

impl FromStr for TypeId {
    type Err = CoreError;

    /// Accepts both the display form (`u8*`) and the symbol form (`u8_ptr`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "void**" || s == "void_ptr_ptr" {
            return Ok(Self::OpaquePointerPointer);
        }
        let (base, pointer) = if let Some(b) = s.strip_suffix('*') {
            (b.trim_end(), true)
        } else if let Some(b) = s.strip_suffix("_ptr") {
            (b, true)
        } else {
            (s, false)
        };
        let prim = PrimitiveType::iter()
            .find(|p| p.name() == base)
            .ok_or_else(|| CoreError::UnknownTypeName(s.to_string()))?;
        Ok(if pointer {
            Self::Pointer(prim)
        } else {
            Self::Value(prim)
        })
    }
}
