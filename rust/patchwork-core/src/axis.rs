//! Parameter axes: the ordered dimensions a boilerplate family varies over.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::TypeId;

/// An ordered sequence of u64-encoded axis values.
pub type ParameterTuple = Vec<u64>;

/// The shape of an axis, without its domain data.
///
/// This is what generated family tables carry; the enumeration-time domain
/// lives in [`ParameterAxis`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AxisKind {
    Type,
    Bool,
    Enum { count: u64 },
}

impl AxisKind {
    pub fn is_type(self) -> bool {
        matches!(self, Self::Type)
    }
}

/// One axis of a family's parameter domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterAxis {
    /// A subset of the type domain, enumerated in the listed order.
    Type(Vec<TypeId>),
    /// `false`, then `true`.
    Bool,
    /// The index range `[0, count)`.
    Enum { count: u64 },
}

impl ParameterAxis {
    /// A type axis over the whole domain.
    pub fn all_types() -> Self {
        Self::Type(TypeId::all().collect())
    }

    pub fn kind(&self) -> AxisKind {
        match self {
            Self::Type(_) => AxisKind::Type,
            Self::Bool => AxisKind::Bool,
            Self::Enum { count } => AxisKind::Enum { count: *count },
        }
    }

    /// Number of values this axis can take.
    pub fn cardinality(&self) -> u64 {
        match self {
            Self::Type(domain) => domain.len() as u64,
            Self::Bool => 2,
            Self::Enum { count } => *count,
        }
    }
}

/// Check that every type axis precedes every non-type axis and that no type
/// axis lists a member twice.
pub fn validate_axes(axes: &[ParameterAxis]) -> Result<(), CoreError> {
    let mut first_non_type = None;
    for (position, axis) in axes.iter().enumerate() {
        match axis {
            ParameterAxis::Type(domain) => {
                if let Some(non_type) = first_non_type {
                    return Err(CoreError::MalformedAxisOrder { position: non_type });
                }
                for (i, ty) in domain.iter().enumerate() {
                    if domain[..i].contains(ty) {
                        return Err(CoreError::DuplicateDomainMember {
                            position,
                            ty: ty.to_string(),
                        });
                    }
                }
            }
            ParameterAxis::Bool | ParameterAxis::Enum { .. } => {
                first_non_type.get_or_insert(position);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrimitiveType;

    #[test]
    fn type_axes_first_is_accepted() {
        let axes = vec![
            ParameterAxis::all_types(),
            ParameterAxis::Type(vec![TypeId::Value(PrimitiveType::I32)]),
            ParameterAxis::Bool,
            ParameterAxis::Enum { count: 7 },
        ];
        assert!(validate_axes(&axes).is_ok());
    }

    #[test]
    fn non_type_before_type_is_rejected() {
        let axes = vec![
            ParameterAxis::Bool,
            ParameterAxis::Type(vec![TypeId::Value(PrimitiveType::I32)]),
        ];
        assert_eq!(
            validate_axes(&axes),
            Err(CoreError::MalformedAxisOrder { position: 0 })
        );
    }

    #[test]
    fn duplicate_domain_member_is_rejected() {
        let ty = TypeId::Value(PrimitiveType::U8);
        let axes = vec![ParameterAxis::Type(vec![ty, ty])];
        assert!(matches!(
            validate_axes(&axes),
            Err(CoreError::DuplicateDomainMember { position: 0, .. })
        ));
    }

    #[test]
    fn cardinality() {
        assert_eq!(ParameterAxis::all_types().cardinality(), TypeId::COUNT);
        assert_eq!(ParameterAxis::Bool.cardinality(), 2);
        assert_eq!(ParameterAxis::Enum { count: 5 }.kind(), AxisKind::Enum { count: 5 });
    }
}
