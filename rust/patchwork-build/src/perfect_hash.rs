//! Perfect-hash construction for a family's parameter tuples.
//!
//! 2-choice hashing: every tuple has two candidate slots, from coefficient
//! vectors `h1` and `h2`, and lives in one of them. A third vector `h3`
//! gives each tuple a fingerprint that is unique within the family, so a
//! lookup checks both candidates and accepts the one whose fingerprint
//! matches. Lookup itself lives in [`patchwork_core::PerfectHashIndex`].

use std::collections::HashSet;

use patchwork_core::hash::EMPTY_FINGERPRINT;
use patchwork_core::{hash_tuple, HashSlot, ParameterTuple, PerfectHashIndex, EMPTY_SLOT};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BuildError;

/// Fewest slots a table ever has.
pub const MIN_TABLE_SIZE: usize = 5;
/// Longest eviction chain tried before redrawing `h1` and `h2`.
pub const MAX_DISPLACEMENT_DEPTH: usize = 1000;
/// Coefficient draws allowed before construction gives up.
pub const MAX_HASH_ATTEMPTS: usize = 10_000;

/// Number of slots for `n` tuples: the smallest prime at least
/// `max(5, ceil(n / 0.4))`.
pub fn table_size(n: usize) -> usize {
    let target = (5 * n).div_ceil(2).max(MIN_TABLE_SIZE);
    next_prime(target)
}

fn next_prime(mut n: usize) -> usize {
    while !is_prime(n) {
        n += 1;
    }
    n
}

fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    let mut d = 2;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 1;
    }
    true
}

/// An owned perfect-hash table, as built and as cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfectHashTable {
    pub h1: Vec<u32>,
    pub h2: Vec<u32>,
    pub h3: Vec<u32>,
    pub slots: Vec<HashSlot>,
}

impl PerfectHashTable {
    /// Build a table where `tuples[i]` maps to ordinal `i`.
    ///
    /// `tuples` must be distinct and all of length `arity`.
    pub fn build<R: Rng + ?Sized>(
        family: &str,
        arity: usize,
        tuples: &[ParameterTuple],
        rng: &mut R,
    ) -> Result<Self, BuildError> {
        let m = table_size(tuples.len());
        let mut attempts = 0;
        while attempts < MAX_HASH_ATTEMPTS {
            attempts += 1;
            let h1 = draw(rng, arity);
            let h2 = draw(rng, arity);
            let Some(placement) = place(tuples, &h1, &h2, m) else {
                continue;
            };

            while attempts < MAX_HASH_ATTEMPTS {
                attempts += 1;
                let h3 = draw(rng, arity);
                if !fingerprints_are_unique(tuples, &h3) {
                    continue;
                }
                let slots = placement
                    .iter()
                    .map(|entry| match entry {
                        Some(ordinal) => HashSlot {
                            ordinal: *ordinal,
                            fingerprint: hash_tuple(&h3, &tuples[*ordinal as usize]),
                        },
                        None => EMPTY_SLOT,
                    })
                    .collect();
                let table = Self { h1, h2, h3, slots };
                table.verify(family, tuples)?;
                debug!(
                    family,
                    variants = tuples.len(),
                    slots = m,
                    attempts,
                    "built perfect hash"
                );
                return Ok(table);
            }
        }
        Err(BuildError::PerfectHashExhausted {
            family: family.to_string(),
            attempts,
        })
    }

    pub fn as_index(&self) -> PerfectHashIndex<'_> {
        PerfectHashIndex {
            h1: &self.h1,
            h2: &self.h2,
            h3: &self.h3,
            slots: &self.slots,
        }
    }

    /// Check that every tuple resolves to its own ordinal and that no
    /// candidate slot pair holds two matching fingerprints.
    pub fn verify(&self, family: &str, tuples: &[ParameterTuple]) -> Result<(), BuildError> {
        let fail = |reason: String| BuildError::PerfectHashVerification {
            family: family.to_string(),
            reason,
        };
        let index = self.as_index();
        for (ordinal, tuple) in tuples.iter().enumerate() {
            let (a, b) = index.candidate_slots(tuple);
            let fingerprint = index.fingerprint(tuple);
            let mut candidates = vec![a];
            if b != a {
                candidates.push(b);
            }
            let matches: Vec<&HashSlot> = candidates
                .iter()
                .map(|&slot| &self.slots[slot])
                .filter(|slot| slot.fingerprint == fingerprint)
                .collect();
            match matches.as_slice() {
                [slot] if slot.ordinal as usize == ordinal => {}
                [slot] => {
                    return Err(fail(format!(
                        "{tuple:?} resolves to ordinal {} instead of {ordinal}",
                        slot.ordinal
                    )))
                }
                [] => return Err(fail(format!("{tuple:?} is in neither candidate slot"))),
                _ => return Err(fail(format!("{tuple:?} matches both candidate slots"))),
            }
        }
        Ok(())
    }
}

fn draw<R: Rng + ?Sized>(rng: &mut R, arity: usize) -> Vec<u32> {
    (0..arity).map(|_| rng.gen()).collect()
}

fn slot_of(h: &[u32], tuple: &[u64], m: usize) -> usize {
    (hash_tuple(h, tuple) % m as u64) as usize
}

/// 2-choice placement with bounded eviction chains.
///
/// Returns `None` when a chain exceeds [`MAX_DISPLACEMENT_DEPTH`] or an
/// evicted tuple has nowhere else to go.
fn place(tuples: &[ParameterTuple], h1: &[u32], h2: &[u32], m: usize) -> Option<Vec<Option<u32>>> {
    let mut table: Vec<Option<u32>> = vec![None; m];
    let slots = |ordinal: u32| {
        let tuple = &tuples[ordinal as usize];
        (slot_of(h1, tuple, m), slot_of(h2, tuple, m))
    };
    for ordinal in 0..tuples.len() as u32 {
        let (a, b) = slots(ordinal);
        if table[a].is_none() {
            table[a] = Some(ordinal);
            continue;
        }
        if table[b].is_none() {
            table[b] = Some(ordinal);
            continue;
        }
        let mut carried = ordinal;
        let mut slot = a;
        let mut depth = 0;
        while let Some(evicted) = table[slot].replace(carried) {
            depth += 1;
            if depth > MAX_DISPLACEMENT_DEPTH {
                return None;
            }
            let (ea, eb) = slots(evicted);
            let other = if ea == slot { eb } else { ea };
            if other == slot {
                return None;
            }
            carried = evicted;
            slot = other;
        }
    }
    Some(table)
}

fn fingerprints_are_unique(tuples: &[ParameterTuple], h3: &[u32]) -> bool {
    let mut seen = HashSet::with_capacity(tuples.len());
    tuples.iter().all(|tuple| {
        let fingerprint = hash_tuple(h3, tuple);
        fingerprint != EMPTY_FINGERPRINT && seen.insert(fingerprint)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn grid(dims: &[u64]) -> Vec<ParameterTuple> {
        let mut out = vec![Vec::new()];
        for &d in dims {
            out = out
                .into_iter()
                .flat_map(|prefix| {
                    (0..d).map(move |v| {
                        let mut t = prefix.clone();
                        t.push(v);
                        t
                    })
                })
                .collect();
        }
        out
    }

    #[test]
    fn sizes_are_prime_and_large_enough() {
        assert_eq!(table_size(0), 5);
        assert_eq!(table_size(1), 5);
        assert_eq!(table_size(2), 5);
        assert_eq!(table_size(3), 11);
        assert_eq!(table_size(100), 251);
        for n in 0..500 {
            let m = table_size(n);
            assert!(is_prime(m));
            assert!(m >= MIN_TABLE_SIZE);
            assert!(m as f64 >= n as f64 / 0.4);
        }
    }

    #[test]
    fn every_tuple_finds_itself() {
        let tuples = grid(&[25, 2, 4, 3]);
        let mut rng = StdRng::seed_from_u64(7);
        let table = PerfectHashTable::build("grid", 4, &tuples, &mut rng).unwrap();
        assert_eq!(table.slots.len(), table_size(tuples.len()));
        let index = table.as_index();
        assert_eq!(index.occupied(), tuples.len());
        for (ordinal, tuple) in tuples.iter().enumerate() {
            assert_eq!(index.lookup(tuple), Some(ordinal as u32));
        }
        assert_eq!(index.lookup(&[25, 0, 0, 0]), None);
        assert_eq!(index.lookup(&[0, 0, 0]), None);
    }

    #[test]
    fn same_seed_same_table() {
        let tuples = grid(&[6, 6]);
        let a = PerfectHashTable::build("f", 2, &tuples, &mut StdRng::seed_from_u64(1)).unwrap();
        let b = PerfectHashTable::build("f", 2, &tuples, &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn zero_arity_family_has_one_variant() {
        let tuples = vec![Vec::new()];
        let table =
            PerfectHashTable::build("nullary", 0, &tuples, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(table.as_index().lookup(&[]), Some(0));
    }

    #[test]
    fn verification_catches_corruption() {
        let tuples = grid(&[4, 4]);
        let mut table =
            PerfectHashTable::build("f", 2, &tuples, &mut StdRng::seed_from_u64(9)).unwrap();
        let slot = table
            .slots
            .iter()
            .position(|s| !s.is_empty())
            .unwrap();
        table.slots[slot].ordinal ^= 1;
        assert!(matches!(
            table.verify("f", &tuples),
            Err(BuildError::PerfectHashVerification { .. })
        ));
    }

    #[test]
    fn unplaceable_input_exhausts() {
        // Identical tuples can never get distinct fingerprints.
        let tuples = vec![vec![1], vec![1]];
        let err = PerfectHashTable::build("dup", 1, &tuples, &mut StdRng::seed_from_u64(0))
            .unwrap_err();
        assert!(matches!(
            err,
            BuildError::PerfectHashExhausted { attempts: MAX_HASH_ATTEMPTS, .. }
        ));
    }
}
