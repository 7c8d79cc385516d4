use std::fmt;
use serde::{Deserialize, Serialize};

/// Calorimeter sampling layers, numbered as in the detector description.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum CaloSampling {
    PreSamplerB = 0,
    EMB1 = 1,
    EMB2 = 2,
    EMB3 = 3,
    PreSamplerE = 4,
    EME1 = 5,
    EME2 = 6,
    EME3 = 7,
    HEC0 = 8,
    HEC1 = 9,
    HEC2 = 10,
    HEC3 = 11,
    TileBar0 = 12,
    TileBar1 = 13,
    TileBar2 = 14,
    TileGap1 = 15,
    TileGap2 = 16,
    TileGap3 = 17,
    TileExt0 = 18,
    TileExt1 = 19,
    TileExt2 = 20,
    FCAL0 = 21,
    FCAL1 = 22,
    FCAL2 = 23,
    Unknown = 24,
}

/// Number of real (named) samplings.
pub const NUM_SAMPLINGS: usize = 24;

pub const ALL_SAMPLINGS: [CaloSampling; NUM_SAMPLINGS] = [
    CaloSampling::PreSamplerB,
    CaloSampling::EMB1,
    CaloSampling::EMB2,
    CaloSampling::EMB3,
    CaloSampling::PreSamplerE,
    CaloSampling::EME1,
    CaloSampling::EME2,
    CaloSampling::EME3,
    CaloSampling::HEC0,
    CaloSampling::HEC1,
    CaloSampling::HEC2,
    CaloSampling::HEC3,
    CaloSampling::TileBar0,
    CaloSampling::TileBar1,
    CaloSampling::TileBar2,
    CaloSampling::TileGap1,
    CaloSampling::TileGap2,
    CaloSampling::TileGap3,
    CaloSampling::TileExt0,
    CaloSampling::TileExt1,
    CaloSampling::TileExt2,
    CaloSampling::FCAL0,
    CaloSampling::FCAL1,
    CaloSampling::FCAL2,
];

impl CaloSampling {
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> CaloSampling {
        ALL_SAMPLINGS.get(index).copied().unwrap_or(CaloSampling::Unknown)
    }

    pub fn name(self) -> &'static str {
        match self {
            CaloSampling::PreSamplerB => "PreSamplerB",
            CaloSampling::EMB1 => "EMB1",
            CaloSampling::EMB2 => "EMB2",
            CaloSampling::EMB3 => "EMB3",
            CaloSampling::PreSamplerE => "PreSamplerE",
            CaloSampling::EME1 => "EME1",
            CaloSampling::EME2 => "EME2",
            CaloSampling::EME3 => "EME3",
            CaloSampling::HEC0 => "HEC0",
            CaloSampling::HEC1 => "HEC1",
            CaloSampling::HEC2 => "HEC2",
            CaloSampling::HEC3 => "HEC3",
            CaloSampling::TileBar0 => "TileBar0",
            CaloSampling::TileBar1 => "TileBar1",
            CaloSampling::TileBar2 => "TileBar2",
            CaloSampling::TileGap1 => "TileGap1",
            CaloSampling::TileGap2 => "TileGap2",
            CaloSampling::TileGap3 => "TileGap3",
            CaloSampling::TileExt0 => "TileExt0",
            CaloSampling::TileExt1 => "TileExt1",
            CaloSampling::TileExt2 => "TileExt2",
            CaloSampling::FCAL0 => "FCAL0",
            CaloSampling::FCAL1 => "FCAL1",
            CaloSampling::FCAL2 => "FCAL2",
            CaloSampling::Unknown => "Unknown",
        }
    }

    /// Parse a sampling name. Returns `None` for anything that is not one of the
    /// 24 named samplings (including "Unknown").
    pub fn from_name(name: &str) -> Option<CaloSampling> {
        ALL_SAMPLINGS.iter().copied().find(|s| s.name() == name.trim())
    }

    pub fn sub_calo(self) -> SubCalo {
        match self.index() {
            0..=7 => SubCalo::LArEM,
            8..=11 => SubCalo::LArHEC,
            12..=20 => SubCalo::Tile,
            21..=23 => SubCalo::LArFCal,
            _ => SubCalo::Unknown,
        }
    }

    #[inline]
    pub fn is_presampler(self) -> bool {
        matches!(self, CaloSampling::PreSamplerB | CaloSampling::PreSamplerE)
    }

    #[inline]
    pub fn is_tile(self) -> bool {
        self.sub_calo() == SubCalo::Tile
    }
}

impl fmt::Display for CaloSampling {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Sub-calorimeters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SubCalo {
    LArEM = 0,
    LArHEC = 1,
    LArFCal = 2,
    Tile = 3,
    Unknown = 4,
}

/// Set of samplings packed into a 64-bit word (bit `i` = sampling index `i`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SamplingMask(pub u64);

impl SamplingMask {
    pub const EMPTY: SamplingMask = SamplingMask(0);

    pub fn all() -> Self {
        SamplingMask((1u64 << NUM_SAMPLINGS) - 1)
    }

    pub fn from_samplings(samplings: &[CaloSampling]) -> Self {
        let mut mask = SamplingMask::EMPTY;
        for &s in samplings {
            mask.insert(s);
        }
        mask
    }

    /// Build a mask from names, best effort: names that do not resolve are returned
    /// alongside the mask and are otherwise ignored.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> (Self, Vec<String>) {
        let mut mask = SamplingMask::EMPTY;
        let mut unknown = Vec::new();
        for name in names {
            match CaloSampling::from_name(name.as_ref()) {
                Some(s) => mask.insert(s),
                None => unknown.push(name.as_ref().to_string()),
            }
        }
        (mask, unknown)
    }

    #[inline]
    pub fn insert(&mut self, s: CaloSampling) {
        if s != CaloSampling::Unknown {
            self.0 |= 1u64 << s.index();
        }
    }

    #[inline]
    pub fn contains(&self, s: CaloSampling) -> bool {
        s != CaloSampling::Unknown && (self.0 >> s.index()) & 1 == 1
    }

    #[inline]
    pub fn union(self, other: SamplingMask) -> SamplingMask {
        SamplingMask(self.0 | other.0)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn samplings(&self) -> Vec<CaloSampling> {
        ALL_SAMPLINGS.iter().copied().filter(|&s| self.contains(s)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip() {
        for s in ALL_SAMPLINGS {
            assert_eq!(CaloSampling::from_name(s.name()), Some(s));
            assert_eq!(CaloSampling::from_index(s.index()), s);
        }
        assert_eq!(CaloSampling::from_name("Unknown"), None);
        assert_eq!(CaloSampling::from_index(99), CaloSampling::Unknown);
    }

    #[test]
    fn test_sub_calo() {
        assert_eq!(CaloSampling::EMB2.sub_calo(), SubCalo::LArEM);
        assert_eq!(CaloSampling::HEC3.sub_calo(), SubCalo::LArHEC);
        assert_eq!(CaloSampling::TileGap2.sub_calo(), SubCalo::Tile);
        assert_eq!(CaloSampling::FCAL0.sub_calo(), SubCalo::LArFCal);
        assert!(CaloSampling::PreSamplerE.is_presampler());
        assert!(!CaloSampling::EME1.is_presampler());
    }

    #[test]
    fn test_mask_from_names_drops_misspelled() {
        let (mask, unknown) = SamplingMask::from_names(&["EMB2", "EMB3", "EMB4", "FCAL0"]);
        assert!(mask.contains(CaloSampling::EMB2));
        assert!(mask.contains(CaloSampling::EMB3));
        assert!(mask.contains(CaloSampling::FCAL0));
        assert!(!mask.contains(CaloSampling::EMB1));
        assert_eq!(unknown, vec!["EMB4".to_string()]);
        assert_eq!(mask.samplings().len(), 3);
    }

    #[test]
    fn test_all_mask() {
        let all = SamplingMask::all();
        for s in ALL_SAMPLINGS {
            assert!(all.contains(s));
        }
        assert!(!all.contains(CaloSampling::Unknown));
    }
}
