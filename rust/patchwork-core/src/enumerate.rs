//! Variant enumeration over a family's parameter domain.
//!
//! Walks the cross product of all axes depth-first. The predicate sees every
//! prefix before the walk descends into it, so a rejected prefix prunes its
//! whole subtree (e.g. ruling out floating-point operands for `mod` at the
//! operand axis instead of at the operator axis). Enum axes are split by
//! balanced binary subdivision, keeping the recursion depth logarithmic in
//! the axis size.

use crate::axis::{validate_axes, ParameterAxis, ParameterTuple};
use crate::error::CoreError;

/// Decides whether a tuple prefix may be extended.
pub trait Predicate {
    fn accepts(&self, prefix: &[u64]) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&[u64]) -> bool,
{
    fn accepts(&self, prefix: &[u64]) -> bool {
        self(prefix)
    }
}

/// Accepts every tuple.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl Predicate for AcceptAll {
    fn accepts(&self, _prefix: &[u64]) -> bool {
        true
    }
}

/// Enumerate every legal tuple of `axes` and pair it with the address the
/// `provider` reports for its specialized body.
///
/// Axis order is validated before anything is enumerated. Provider errors
/// abort the walk.
pub fn enumerate<P, F, E>(
    axes: &[ParameterAxis],
    predicate: &P,
    provider: F,
) -> Result<Vec<(ParameterTuple, u64)>, E>
where
    P: Predicate + ?Sized,
    F: FnMut(&[u64]) -> Result<u64, E>,
    E: From<CoreError>,
{
    validate_axes(axes)?;
    let mut walker = Walker {
        axes,
        predicate,
        provider,
        prefix: Vec::with_capacity(axes.len()),
        out: Vec::new(),
    };
    walker.walk_axis(0)?;
    Ok(walker.out)
}

struct Walker<'a, P: ?Sized, F> {
    axes: &'a [ParameterAxis],
    predicate: &'a P,
    provider: F,
    prefix: ParameterTuple,
    out: Vec<(ParameterTuple, u64)>,
}

impl<P, F, E> Walker<'_, P, F>
where
    P: Predicate + ?Sized,
    F: FnMut(&[u64]) -> Result<u64, E>,
{
    fn walk_axis(&mut self, depth: usize) -> Result<(), E> {
        let Some(axis) = self.axes.get(depth) else {
            let address = (self.provider)(&self.prefix)?;
            self.out.push((self.prefix.clone(), address));
            return Ok(());
        };
        match axis {
            ParameterAxis::Type(domain) => {
                for ty in domain {
                    self.visit(depth, ty.encode())?;
                }
                Ok(())
            }
            ParameterAxis::Bool => {
                self.visit(depth, 0)?;
                self.visit(depth, 1)
            }
            ParameterAxis::Enum { count } => self.walk_range(depth, 0, *count),
        }
    }

    /// Visit `[lo, hi)` by halving, so depth grows with log2 of the range.
    fn walk_range(&mut self, depth: usize, lo: u64, hi: u64) -> Result<(), E> {
        if lo >= hi {
            return Ok(());
        }
        if hi - lo == 1 {
            return self.visit(depth, lo);
        }
        let mid = lo + (hi - lo) / 2;
        self.walk_range(depth, lo, mid)?;
        self.walk_range(depth, mid, hi)
    }

    fn visit(&mut self, depth: usize, value: u64) -> Result<(), E> {
        self.prefix.push(value);
        let result = if self.predicate.accepts(&self.prefix) {
            self.walk_axis(depth + 1)
        } else {
            Ok(())
        };
        self.prefix.pop();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PrimitiveType, TypeId};
    use std::cell::RefCell;
    use std::collections::HashSet;

    fn fake_address(tuple: &[u64]) -> Result<u64, CoreError> {
        Ok(tuple.iter().fold(0x1000, |acc, v| acc * 31 + v))
    }

    #[test]
    fn full_cross_product() {
        let axes = vec![
            ParameterAxis::Type(vec![
                TypeId::Value(PrimitiveType::I32),
                TypeId::Value(PrimitiveType::F64),
            ]),
            ParameterAxis::Bool,
            ParameterAxis::Enum { count: 3 },
        ];
        let out = enumerate(&axes, &AcceptAll, fake_address).unwrap();
        assert_eq!(out.len(), 2 * 2 * 3);
        let distinct: HashSet<&[u64]> = out.iter().map(|(t, _)| t.as_slice()).collect();
        assert_eq!(distinct.len(), out.len());
        assert_eq!(out[0].0, vec![TypeId::Value(PrimitiveType::I32).encode(), 0, 0]);
    }

    #[test]
    fn enum_axis_visits_in_order() {
        let axes = vec![ParameterAxis::Enum { count: 37 }];
        let out = enumerate(&axes, &AcceptAll, fake_address).unwrap();
        let values: Vec<u64> = out.iter().map(|(t, _)| t[0]).collect();
        assert_eq!(values, (0..37).collect::<Vec<_>>());
    }

    #[test]
    fn empty_enum_axis_yields_nothing() {
        let axes = vec![ParameterAxis::Bool, ParameterAxis::Enum { count: 0 }];
        let out = enumerate(&axes, &AcceptAll, fake_address).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn prefix_rejection_prunes_subtree() {
        let float = TypeId::Value(PrimitiveType::F64).encode();
        let axes = vec![
            ParameterAxis::Type(vec![
                TypeId::Value(PrimitiveType::I32),
                TypeId::Value(PrimitiveType::F64),
            ]),
            ParameterAxis::Enum { count: 1000 },
        ];
        let calls = RefCell::new(0usize);
        let predicate = |prefix: &[u64]| {
            *calls.borrow_mut() += 1;
            prefix[0] != float
        };
        let out = enumerate(&axes, &predicate, fake_address).unwrap();
        assert_eq!(out.len(), 1000);
        assert!(out.iter().all(|(t, _)| t[0] != float));
        // One call per type value plus one per enum value under the surviving type.
        assert_eq!(*calls.borrow(), 2 + 1000);
    }

    #[test]
    fn malformed_order_fails_before_enumeration() {
        let axes = vec![ParameterAxis::Bool, ParameterAxis::all_types()];
        let result = enumerate(&axes, &AcceptAll, |_: &[u64]| -> Result<u64, CoreError> {
            panic!("provider must not run")
        });
        assert_eq!(result, Err(CoreError::MalformedAxisOrder { position: 0 }));
    }

    #[test]
    fn provider_error_propagates() {
        let axes = vec![ParameterAxis::Bool];
        let result = enumerate(&axes, &AcceptAll, |_: &[u64]| -> Result<u64, CoreError> {
            Err(CoreError::UnknownTypeName("x".into()))
        });
        assert!(result.is_err());
    }
}
