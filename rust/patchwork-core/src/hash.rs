//! Run-time side of the perfect-hash variant index.
//!
//! The table is a 2-choice hash: every registered tuple sits in one of its
//! two candidate slots (`h1·params mod M`, `h2·params mod M`), and a third
//! hash (`h3·params`) stored in the slot tells the two candidates apart
//! without keeping the full tuple. Lookup cost depends on the axis count
//! only. Construction lives in the build crate.

use serde::{Deserialize, Serialize};

/// Fingerprint value reserved for empty slots.
pub const EMPTY_FINGERPRINT: u64 = u64::MAX;

/// Ordinal stored in empty slots.
pub const EMPTY_ORDINAL: u32 = u32::MAX;

pub const EMPTY_SLOT: HashSlot = HashSlot {
    ordinal: EMPTY_ORDINAL,
    fingerprint: EMPTY_FINGERPRINT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashSlot {
    pub ordinal: u32,
    pub fingerprint: u64,
}

impl HashSlot {
    pub fn is_empty(&self) -> bool {
        self.fingerprint == EMPTY_FINGERPRINT
    }
}

/// Dot product of per-axis coefficients and tuple values, wrapping in u64.
#[inline]
pub fn hash_tuple(coefficients: &[u32], params: &[u64]) -> u64 {
    coefficients
        .iter()
        .zip(params)
        .fold(0u64, |acc, (&h, &p)| acc.wrapping_add(u64::from(h).wrapping_mul(p)))
}

/// A read-only perfect-hash index. The table size `M` is `slots.len()`.
#[derive(Debug, Clone, Copy)]
pub struct PerfectHashIndex<'a> {
    pub h1: &'a [u32],
    pub h2: &'a [u32],
    pub h3: &'a [u32],
    pub slots: &'a [HashSlot],
}

impl<'a> PerfectHashIndex<'a> {
    /// Number of axes the index was built for.
    pub fn arity(&self) -> usize {
        self.h1.len()
    }

    pub fn table_size(&self) -> usize {
        self.slots.len()
    }

    /// The two candidate slots of `params`.
    #[inline]
    pub fn candidate_slots(&self, params: &[u64]) -> (usize, usize) {
        let m = self.slots.len() as u64;
        (
            (hash_tuple(self.h1, params) % m) as usize,
            (hash_tuple(self.h2, params) % m) as usize,
        )
    }

    #[inline]
    pub fn fingerprint(&self, params: &[u64]) -> u64 {
        hash_tuple(self.h3, params)
    }

    /// Variant ordinal registered for `params`, or `None` if the tuple was
    /// never registered (or has the wrong length).
    #[inline]
    pub fn lookup(&self, params: &[u64]) -> Option<u32> {
        if params.len() != self.arity() || self.slots.is_empty() {
            return None;
        }
        let fingerprint = self.fingerprint(params);
        if fingerprint == EMPTY_FINGERPRINT {
            return None;
        }
        let (a, b) = self.candidate_slots(params);
        if self.slots[a].fingerprint == fingerprint {
            Some(self.slots[a].ordinal)
        } else if self.slots[b].fingerprint == fingerprint {
            Some(self.slots[b].ordinal)
        } else {
            None
        }
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_empty()).count()
    }
}
