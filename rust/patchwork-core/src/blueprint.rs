//! Blueprints and boilerplate families.
//!
//! A [`Blueprint`] is the frozen form of one variant: its padded code bytes
//! and the fixup tables the specialization engine walks. Generated code
//! declares them as `'static` constants; the build pipeline hands out
//! borrowed views over its owned records with the same type.

use crate::axis::AxisKind;
use crate::fixup::{FixupCounts, FixupSite};
use crate::hash::PerfectHashIndex;

#[derive(Debug, Clone, Copy)]
pub struct Blueprint<'a> {
    /// Symbol the variant was extracted from.
    pub symbol: &'a str,
    /// Code bytes, padded to the blueprint alignment.
    pub code: &'a [u8],
    /// Length of the code before padding.
    pub unpadded_len: u32,
    /// Self-relative sites: the destination address is subtracted here.
    pub self_relative32: &'a [u32],
    /// 32-bit sites: the low half of the fixup value is added here.
    pub symbol32: &'a [FixupSite],
    /// 64-bit sites: the fixup value is added here.
    pub symbol64: &'a [FixupSite],
    /// Thread-local sites: the start-up thread-local offset is added here.
    pub thread_local32: &'a [u32],
    pub fixup_counts: FixupCounts,
}

impl<'a> Blueprint<'a> {
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Number of values a call site must supply.
    pub fn fixup_value_count(&self) -> usize {
        self.fixup_counts.total() as usize
    }

    pub fn needs_thread_local_base(&self) -> bool {
        !self.thread_local32.is_empty()
    }
}

/// All variants of one boilerplate shape plus the index that selects them.
#[derive(Debug, Clone, Copy)]
pub struct BoilerplateFamily<'a> {
    pub name: &'a str,
    pub axes: &'a [AxisKind],
    pub index: PerfectHashIndex<'a>,
    /// Indexed by the ordinals stored in `index`.
    pub variants: &'a [&'a Blueprint<'a>],
}

impl<'a> BoilerplateFamily<'a> {
    /// The blueprint registered for `params`, if any.
    pub fn find(&self, params: &[u64]) -> Option<&'a Blueprint<'a>> {
        let ordinal = self.index.lookup(params)?;
        self.variants.get(ordinal as usize).copied()
    }

    /// The blueprint registered for `params`.
    ///
    /// # Panics
    /// Panics if the tuple was never registered. Every tuple a correct
    /// code generator asks for is registered at build time, so a miss is an
    /// internal-consistency violation.
    pub fn select(&self, params: &[u64]) -> &'a Blueprint<'a> {
        match self.find(params) {
            Some(bp) => bp,
            None => panic!(
                "boilerplate family `{}` has no variant for parameters {:?}",
                self.name, params
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{HashSlot, EMPTY_SLOT};

    static RET_CODE: [u8; 1] = [0xc3];

    static RET: Blueprint<'static> = Blueprint {
        symbol: "ret",
        code: &RET_CODE,
        unpadded_len: 1,
        self_relative32: &[],
        symbol32: &[],
        symbol64: &[],
        thread_local32: &[],
        fixup_counts: FixupCounts {
            boilerplate_fns: 0,
            host_fns: 0,
            constants: 0,
        },
    };

    static SLOTS: [HashSlot; 5] = [
        EMPTY_SLOT,
        EMPTY_SLOT,
        EMPTY_SLOT,
        HashSlot {
            ordinal: 0,
            fingerprint: 7,
        },
        EMPTY_SLOT,
    ];

    static FAMILY: BoilerplateFamily<'static> = BoilerplateFamily {
        name: "ret",
        axes: &[AxisKind::Bool],
        index: PerfectHashIndex {
            h1: &[3],
            h2: &[3],
            h3: &[7],
            slots: &SLOTS,
        },
        variants: &[&RET],
    };

    #[test]
    fn static_family_select() {
        let bp = FAMILY.select(&[1]);
        assert_eq!(bp.symbol, "ret");
        assert_eq!(bp.fixup_value_count(), 0);
        assert!(FAMILY.find(&[0]).is_none());
    }

    #[test]
    #[should_panic(expected = "has no variant")]
    fn select_miss_is_fatal() {
        FAMILY.select(&[0]);
    }
}
