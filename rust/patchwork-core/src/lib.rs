//! Patchwork core: the data model shared by the template compiler and the
//! copy-and-patch runtime.
//!
//! Defines parameter axes and the type domain, variant enumeration, fixup
//! records, blueprints, and the read-only perfect-hash index generated code
//! embeds.
#![warn(clippy::all)]

pub mod axis;
pub mod blueprint;
pub mod enumerate;
pub mod error;
pub mod fixup;
pub mod hash;
pub mod tls;
pub mod types;

pub use axis::{validate_axes, AxisKind, ParameterAxis, ParameterTuple};
pub use blueprint::{BoilerplateFamily, Blueprint};
pub use enumerate::{enumerate, AcceptAll, Predicate};
pub use error::CoreError;
pub use fixup::{
    parse_placeholder, placeholder_name, FixupCounts, FixupRecord, FixupSite, RelocationKind,
    SymbolClass, CODE_SECTION_PREFIX, THREAD_LOCAL_BASE_SYMBOL,
};
pub use hash::{hash_tuple, HashSlot, PerfectHashIndex, EMPTY_SLOT};
pub use types::{PrimitiveType, TypeId};
