use serde::{Deserialize, Serialize};

/// Largest cluster index that fits in a tag field.
pub const MAX_CLUSTER_INDEX: u32 = 0xFFFE;
/// Number of distinct cluster indices a tag can address.
pub const MAX_CLUSTERS: usize = MAX_CLUSTER_INDEX as usize + 1;

const INDEX_MASK: u64 = 0xFFFF;
const INVALID_INDEX: u64 = 0xFFFF;
const SECONDARY_SHIFT: u32 = 16;
const WEIGHT_SHIFT: u32 = 32;

/// Per-cell cluster assignment packed into 64 bits.
///
/// Layout: bits 0-15 primary cluster index, bits 16-31 secondary cluster index,
/// bits 32-63 the IEEE-754 pattern of the secondary weight. A zero weight pattern
/// means the cell is not shared, so a real shared weight that would pack to zero is
/// stored as pattern `1` instead (the smallest subnormal).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterTag(pub u64);

/// Unpacked view of a [`ClusterTag`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TagState {
    Invalid,
    Exclusive(u32),
    Shared {
        primary: u32,
        secondary: u32,
        secondary_weight: f32,
    },
}

impl ClusterTag {
    pub const INVALID: ClusterTag = ClusterTag(INVALID_INDEX);

    #[inline]
    pub fn exclusive(cluster: u32) -> Self {
        debug_assert!(cluster <= MAX_CLUSTER_INDEX);
        ClusterTag(cluster as u64 & INDEX_MASK)
    }

    /// Shared tag. `secondary_weight` is the weight of `secondary`; the primary
    /// implicitly carries `1 - secondary_weight`.
    #[inline]
    pub fn shared(primary: u32, secondary: u32, secondary_weight: f32) -> Self {
        debug_assert!(primary <= MAX_CLUSTER_INDEX && secondary <= MAX_CLUSTER_INDEX);
        debug_assert!(primary != secondary);
        let mut bits = secondary_weight.to_bits();
        if bits == 0 {
            bits = 1;
        }
        ClusterTag(
            (primary as u64 & INDEX_MASK)
                | ((secondary as u64 & INDEX_MASK) << SECONDARY_SHIFT)
                | ((bits as u64) << WEIGHT_SHIFT),
        )
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 & INDEX_MASK != INVALID_INDEX
    }

    #[inline]
    pub fn is_shared(self) -> bool {
        self.is_valid() && (self.0 >> WEIGHT_SHIFT) != 0
    }

    #[inline]
    pub fn primary(self) -> Option<u32> {
        if self.is_valid() { Some((self.0 & INDEX_MASK) as u32) } else { None }
    }

    #[inline]
    pub fn secondary(self) -> Option<u32> {
        if self.is_shared() {
            Some(((self.0 >> SECONDARY_SHIFT) & INDEX_MASK) as u32)
        } else {
            None
        }
    }

    #[inline]
    pub fn secondary_weight(self) -> f32 {
        if self.is_shared() { f32::from_bits((self.0 >> WEIGHT_SHIFT) as u32) } else { 0.0 }
    }

    pub fn state(self) -> TagState {
        if !self.is_valid() {
            return TagState::Invalid;
        }
        let primary = (self.0 & INDEX_MASK) as u32;
        if !self.is_shared() {
            return TagState::Exclusive(primary);
        }
        TagState::Shared {
            primary,
            secondary: ((self.0 >> SECONDARY_SHIFT) & INDEX_MASK) as u32,
            secondary_weight: f32::from_bits((self.0 >> WEIGHT_SHIFT) as u32),
        }
    }

    /// `(cluster, weight)` memberships of this cell, primary first.
    pub fn memberships(self) -> impl Iterator<Item = (u32, f32)> {
        let pair = match self.state() {
            TagState::Invalid => [None, None],
            TagState::Exclusive(c) => [Some((c, 1.0)), None],
            TagState::Shared { primary, secondary, secondary_weight } => {
                [Some((primary, 1.0 - secondary_weight)), Some((secondary, secondary_weight))]
            }
        };
        pair.into_iter().flatten()
    }

    /// Rewrite the cluster indices through `map`. A primary that maps to `None`
    /// invalidates the tag; a lost secondary leaves the primary exclusive.
    pub fn remap<F: Fn(u32) -> Option<u32>>(self, map: F) -> ClusterTag {
        match self.state() {
            TagState::Invalid => ClusterTag::INVALID,
            TagState::Exclusive(c) => map(c).map_or(ClusterTag::INVALID, ClusterTag::exclusive),
            TagState::Shared { primary, secondary, secondary_weight } => {
                match (map(primary), map(secondary)) {
                    (Some(p), Some(s)) if p != s => ClusterTag::shared(p, s, secondary_weight),
                    (Some(p), _) => ClusterTag::exclusive(p),
                    (None, Some(s)) => ClusterTag::exclusive(s),
                    (None, None) => ClusterTag::INVALID,
                }
            }
        }
    }
}

impl Default for ClusterTag {
    fn default() -> Self {
        ClusterTag::INVALID
    }
}

impl std::fmt::Debug for ClusterTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClusterTag({:?})", self.state())
    }
}

impl From<TagState> for ClusterTag {
    fn from(state: TagState) -> Self {
        match state {
            TagState::Invalid => ClusterTag::INVALID,
            TagState::Exclusive(c) => ClusterTag::exclusive(c),
            TagState::Shared { primary, secondary, secondary_weight } => {
                ClusterTag::shared(primary, secondary, secondary_weight)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_and_exclusive() {
        assert!(!ClusterTag::INVALID.is_valid());
        assert_eq!(ClusterTag::default().state(), TagState::Invalid);
        let t = ClusterTag::exclusive(42);
        assert_eq!(t.state(), TagState::Exclusive(42));
        assert_eq!(t.primary(), Some(42));
        assert_eq!(t.secondary(), None);
        assert_eq!(t.memberships().collect::<Vec<_>>(), vec![(42, 1.0)]);
        assert_eq!(ClusterTag::exclusive(MAX_CLUSTER_INDEX).primary(), Some(0xFFFE));
    }

    #[test]
    fn test_shared_layout() {
        let t = ClusterTag::shared(3, 7, 0.25);
        assert_eq!(t.0 & 0xFFFF, 3);
        assert_eq!((t.0 >> 16) & 0xFFFF, 7);
        assert_eq!((t.0 >> 32) as u32, 0.25f32.to_bits());
        let m: Vec<_> = t.memberships().collect();
        assert_eq!(m, vec![(3, 0.75), (7, 0.25)]);
    }

    #[test]
    fn test_zero_weight_is_still_shared() {
        let t = ClusterTag::shared(1, 2, 0.0);
        assert!(t.is_shared());
        assert_eq!((t.0 >> 32) as u32, 1);
        assert_eq!(t.secondary(), Some(2));
        assert!(t.secondary_weight() > 0.0 && t.secondary_weight() < 1e-40);
    }

    #[test]
    fn test_remap() {
        let t = ClusterTag::shared(4, 9, 0.4);
        let r = t.remap(|c| if c == 4 { Some(0) } else if c == 9 { Some(1) } else { None });
        assert_eq!(r.state(), TagState::Shared { primary: 0, secondary: 1, secondary_weight: 0.4 });
        let lost_secondary = t.remap(|c| if c == 4 { Some(2) } else { None });
        assert_eq!(lost_secondary.state(), TagState::Exclusive(2));
        assert!(!ClusterTag::exclusive(5).remap(|_| None).is_valid());
    }

    #[test]
    fn test_state_conversion() {
        let s = TagState::Shared { primary: 10, secondary: 11, secondary_weight: 0.5 };
        assert_eq!(ClusterTag::from(s).state(), s);
        assert_eq!(ClusterTag::from(TagState::Invalid), ClusterTag::INVALID);
    }
}
