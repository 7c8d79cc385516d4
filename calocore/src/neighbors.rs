//! Neighbor relations between calorimeter cells.
//!
//! Every cell stores its neighbors contiguously, grouped by base neighbor option in
//! storage order. A single 64-bit [`NeighOffsets`] word per cell records how many
//! neighbors each option contributes, so any subset of options can be mapped to
//! sub-ranges of the cell's list without per-option arrays.

use std::fmt;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{CaloError, Result};

/// Number of base neighbor options.
pub const NUM_NEIGH_OPTIONS: usize = 12;

/// Base neighbor options, in storage order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum NeighborOption {
    PrevInPhi = 0,
    NextInPhi = 1,
    PrevInEta = 2,
    NextInEta = 3,
    Corners2D = 4,
    PrevInSamp = 5,
    NextInSamp = 6,
    PrevSubDet = 7,
    NextSubDet = 8,
    Corners3D = 9,
    PrevSuperCalo = 10,
    NextSuperCalo = 11,
}

pub const ALL_NEIGH_OPTIONS: [NeighborOption; NUM_NEIGH_OPTIONS] = [
    NeighborOption::PrevInPhi,
    NeighborOption::NextInPhi,
    NeighborOption::PrevInEta,
    NeighborOption::NextInEta,
    NeighborOption::Corners2D,
    NeighborOption::PrevInSamp,
    NeighborOption::NextInSamp,
    NeighborOption::PrevSubDet,
    NeighborOption::NextSubDet,
    NeighborOption::Corners3D,
    NeighborOption::PrevSuperCalo,
    NeighborOption::NextSuperCalo,
];

impl NeighborOption {
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn mask(self) -> NeighborMask {
        NeighborMask(1u32 << self.index())
    }
}

/// A set of neighbor options. Bit values follow the detector-description convention
/// (`prevInPhi = 0x1` ... `nextSuperCalo = 0x800`).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NeighborMask(pub u32);

impl NeighborMask {
    pub const NONE: NeighborMask = NeighborMask(0);
    pub const PREV_IN_PHI: NeighborMask = NeighborMask(0x0001);
    pub const NEXT_IN_PHI: NeighborMask = NeighborMask(0x0002);
    pub const PREV_IN_ETA: NeighborMask = NeighborMask(0x0004);
    pub const NEXT_IN_ETA: NeighborMask = NeighborMask(0x0008);
    pub const FACES_2D: NeighborMask = NeighborMask(0x000F);
    pub const CORNERS_2D: NeighborMask = NeighborMask(0x0010);
    pub const ALL_2D: NeighborMask = NeighborMask(0x001F);
    pub const PREV_IN_SAMP: NeighborMask = NeighborMask(0x0020);
    pub const NEXT_IN_SAMP: NeighborMask = NeighborMask(0x0040);
    pub const UP_AND_DOWN: NeighborMask = NeighborMask(0x0060);
    pub const PREV_SUB_DET: NeighborMask = NeighborMask(0x0080);
    pub const NEXT_SUB_DET: NeighborMask = NeighborMask(0x0100);
    pub const ALL_3D: NeighborMask = NeighborMask(0x01FF);
    pub const CORNERS_3D: NeighborMask = NeighborMask(0x0200);
    pub const ALL_3D_WITH_CORNERS: NeighborMask = NeighborMask(0x03FF);
    pub const PREV_SUPER_CALO: NeighborMask = NeighborMask(0x0400);
    pub const NEXT_SUPER_CALO: NeighborMask = NeighborMask(0x0800);
    pub const SUPER_3D: NeighborMask = NeighborMask(0x0DFF);

    const NAMED: [(&'static str, NeighborMask); 18] = [
        ("prevInPhi", NeighborMask::PREV_IN_PHI),
        ("nextInPhi", NeighborMask::NEXT_IN_PHI),
        ("prevInEta", NeighborMask::PREV_IN_ETA),
        ("nextInEta", NeighborMask::NEXT_IN_ETA),
        ("faces2D", NeighborMask::FACES_2D),
        ("corners2D", NeighborMask::CORNERS_2D),
        ("all2D", NeighborMask::ALL_2D),
        ("prevInSamp", NeighborMask::PREV_IN_SAMP),
        ("nextInSamp", NeighborMask::NEXT_IN_SAMP),
        ("upAndDown", NeighborMask::UP_AND_DOWN),
        ("prevSubDet", NeighborMask::PREV_SUB_DET),
        ("nextSubDet", NeighborMask::NEXT_SUB_DET),
        ("all3D", NeighborMask::ALL_3D),
        ("corners3D", NeighborMask::CORNERS_3D),
        ("all3DwithCorners", NeighborMask::ALL_3D_WITH_CORNERS),
        ("prevSuperCalo", NeighborMask::PREV_SUPER_CALO),
        ("nextSuperCalo", NeighborMask::NEXT_SUPER_CALO),
        ("super3D", NeighborMask::SUPER_3D),
    ];

    pub fn from_name(name: &str) -> Option<NeighborMask> {
        Self::NAMED
            .iter()
            .find(|(n, _)| *n == name.trim())
            .map(|&(_, m)| m)
    }

    pub fn name(self) -> Option<&'static str> {
        Self::NAMED.iter().find(|(_, m)| *m == self).map(|&(n, _)| n)
    }

    #[inline]
    pub fn contains(self, opt: NeighborOption) -> bool {
        (self.0 >> opt.index()) & 1 == 1
    }

    #[inline]
    pub fn intersect(self, other: NeighborMask) -> NeighborMask {
        NeighborMask(self.0 & other.0)
    }

    #[inline]
    pub fn union(self, other: NeighborMask) -> NeighborMask {
        NeighborMask(self.0 | other.0)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 & 0x0FFF == 0
    }

    pub fn options(self) -> impl Iterator<Item = NeighborOption> {
        ALL_NEIGH_OPTIONS.into_iter().filter(move |&o| self.contains(o))
    }
}

impl fmt::Debug for NeighborMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(n) => write!(f, "NeighborMask({})", n),
            None => write!(f, "NeighborMask({:#06x})", self.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Offset encoding
// ---------------------------------------------------------------------------

const FIELD_SHIFT: [u32; NUM_NEIGH_OPTIONS] = [0, 5, 10, 15, 20, 25, 30, 35, 40, 45, 50, 56];
const FIELD_BITS: [u32; NUM_NEIGH_OPTIONS] = [5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 6, 6];

const LIMITED_HEC_IW_FCAL_BIT: u64 = 1u64 << 62;
const LIMITED_PS_BIT: u64 = 1u64 << 63;

/// Per-cell packed neighbor counts: 5-bit fields for options 0..=9, 6-bit fields
/// for the two super-calo options, and two flag bits marking cells whose neighbors
/// may be restricted (HEC inner wheel / FCal, presampler).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NeighOffsets(pub u64);

impl NeighOffsets {
    #[inline]
    pub fn offset_delta(opt: NeighborOption) -> u64 {
        1u64 << FIELD_SHIFT[opt.index()]
    }

    #[inline]
    pub fn max_count(opt: NeighborOption) -> usize {
        (1usize << FIELD_BITS[opt.index()]) - 1
    }

    #[inline]
    pub fn count(self, opt: NeighborOption) -> usize {
        let i = opt.index();
        ((self.0 >> FIELD_SHIFT[i]) & ((1u64 << FIELD_BITS[i]) - 1)) as usize
    }

    pub fn with_count(self, opt: NeighborOption, count: usize) -> NeighOffsets {
        debug_assert!(count <= Self::max_count(opt));
        let i = opt.index();
        let field = ((1u64 << FIELD_BITS[i]) - 1) << FIELD_SHIFT[i];
        let count = count.min(Self::max_count(opt)) as u64;
        NeighOffsets((self.0 & !field) | (count << FIELD_SHIFT[i]))
    }

    pub fn with_limits(self, hec_iw_or_fcal: bool, presampler: bool) -> NeighOffsets {
        let mut v = self.0 & !(LIMITED_HEC_IW_FCAL_BIT | LIMITED_PS_BIT);
        if hec_iw_or_fcal {
            v |= LIMITED_HEC_IW_FCAL_BIT;
        }
        if presampler {
            v |= LIMITED_PS_BIT;
        }
        NeighOffsets(v)
    }

    #[inline]
    pub fn is_limited_hec_iw_fcal(self) -> bool {
        self.0 & LIMITED_HEC_IW_FCAL_BIT != 0
    }

    #[inline]
    pub fn is_limited_ps(self) -> bool {
        self.0 & LIMITED_PS_BIT != 0
    }

    /// Position of the first neighbor of `opt` inside the cell's list.
    #[inline]
    pub fn start_of(self, opt: NeighborOption) -> usize {
        ALL_NEIGH_OPTIONS[..opt.index()].iter().map(|&o| self.count(o)).sum()
    }

    #[inline]
    pub fn total(self) -> usize {
        ALL_NEIGH_OPTIONS.iter().map(|&o| self.count(o)).sum()
    }

    /// Contiguous `[lo, hi)` ranges (relative to the cell's start) covered by `mask`,
    /// with adjacent options merged into a single range.
    pub fn ranges(self, mask: NeighborMask) -> Vec<(usize, usize)> {
        let mut out: Vec<(usize, usize)> = Vec::new();
        let mut pos = 0usize;
        for opt in ALL_NEIGH_OPTIONS {
            let n = self.count(opt);
            if n > 0 && mask.contains(opt) {
                match out.last_mut() {
                    Some(last) if last.1 == pos => last.1 = pos + n,
                    _ => out.push((pos, pos + n)),
                }
            }
            pos += n;
        }
        out
    }
}

impl fmt::Debug for NeighOffsets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: Vec<usize> = ALL_NEIGH_OPTIONS.iter().map(|&o| self.count(o)).collect();
        f.debug_struct("NeighOffsets")
            .field("counts", &counts)
            .field("limited_hec_iw_fcal", &self.is_limited_hec_iw_fcal())
            .field("limited_ps", &self.is_limited_ps())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Neighbor table
// ---------------------------------------------------------------------------

/// CSR-style neighbor table: `cells[starts[c]..starts[c + 1]]` holds the neighbors
/// of cell `c`, ordered by base option as described by `offsets[c]`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NeighborTable {
    starts: Vec<u32>,
    offsets: Vec<NeighOffsets>,
    cells: Vec<u32>,
}

impl NeighborTable {
    /// Assemble a table from raw parts, validating that the offset words agree with
    /// the row lengths and that every neighbor index is in range.
    pub fn from_parts(starts: Vec<u32>, offsets: Vec<NeighOffsets>, cells: Vec<u32>) -> Result<Self> {
        let n = offsets.len();
        if starts.len() != n + 1 {
            return Err(CaloError::SizeMismatch { what: "neighbor row starts", expected: n + 1, got: starts.len() });
        }
        if starts[n] as usize != cells.len() {
            return Err(CaloError::SizeMismatch { what: "neighbor cells", expected: starts[n] as usize, got: cells.len() });
        }
        for c in 0..n {
            if starts[c + 1] < starts[c] {
                return Err(CaloError::SizeMismatch {
                    what: "neighbor row starts (decreasing)",
                    expected: starts[c] as usize,
                    got: starts[c + 1] as usize,
                });
            }
            let row = (starts[c + 1] - starts[c]) as usize;
            if row != offsets[c].total() {
                return Err(CaloError::SizeMismatch { what: "neighbor offsets", expected: row, got: offsets[c].total() });
            }
        }
        if let Some(&bad) = cells.iter().find(|&&x| x as usize >= n) {
            return Err(CaloError::InvalidCell { id: bad as usize, n_cells: n });
        }
        Ok(NeighborTable { starts, offsets, cells })
    }

    #[inline]
    pub fn n_cells(&self) -> usize {
        self.offsets.len()
    }

    #[inline]
    pub fn offsets(&self, cell: u32) -> NeighOffsets {
        self.offsets[cell as usize]
    }

    #[inline]
    pub fn all(&self, cell: u32) -> &[u32] {
        let c = cell as usize;
        &self.cells[self.starts[c] as usize..self.starts[c + 1] as usize]
    }

    #[inline]
    pub fn option_slice(&self, cell: u32, opt: NeighborOption) -> &[u32] {
        let off = self.offsets(cell);
        let lo = off.start_of(opt);
        &self.all(cell)[lo..lo + off.count(opt)]
    }

    /// Neighbors of `cell` selected by `mask`, in storage order. Options that are
    /// adjacent in storage are read as one slice.
    pub fn neighbors(&self, cell: u32, mask: NeighborMask) -> impl Iterator<Item = u32> + '_ {
        let all = self.all(cell);
        self.offsets(cell)
            .ranges(mask)
            .into_iter()
            .flat_map(move |(lo, hi)| all[lo..hi].iter().copied())
    }

    pub fn neighbor_vec(&self, cell: u32, mask: NeighborMask) -> Vec<u32> {
        self.neighbors(cell, mask).collect()
    }

    pub fn total_neighbors(&self) -> usize {
        self.cells.len()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builds a [`NeighborTable`] one cell at a time.
///
/// Each option's list is de-duplicated against the cell itself and against every
/// lower option, and truncated to what its offset field can hold.
#[derive(Debug, Default)]
pub struct NeighborTableBuilder {
    starts: Vec<u32>,
    offsets: Vec<NeighOffsets>,
    cells: Vec<u32>,
    dropped: usize,
}

impl NeighborTableBuilder {
    pub fn with_capacity(n_cells: usize) -> Self {
        let mut starts = Vec::with_capacity(n_cells + 1);
        starts.push(0);
        NeighborTableBuilder {
            starts,
            offsets: Vec::with_capacity(n_cells),
            cells: Vec::new(),
            dropped: 0,
        }
    }

    /// Append the next cell. Returns the number of neighbors dropped for capacity.
    pub fn push_cell(
        &mut self,
        per_option: &[Vec<u32>; NUM_NEIGH_OPTIONS],
        limited_hec_iw_fcal: bool,
        limited_ps: bool,
    ) -> usize {
        let this_cell = self.offsets.len() as u32;
        let row_start = self.cells.len();
        let mut off = NeighOffsets::default().with_limits(limited_hec_iw_fcal, limited_ps);
        let mut dropped = 0usize;

        for opt in ALL_NEIGH_OPTIONS {
            let max = NeighOffsets::max_count(opt);
            let mut n = 0usize;
            for &cand in &per_option[opt.index()] {
                if cand == this_cell || self.cells[row_start..].contains(&cand) {
                    continue;
                }
                if n == max {
                    dropped += 1;
                    continue;
                }
                self.cells.push(cand);
                n += 1;
            }
            off = off.with_count(opt, n);
        }

        self.offsets.push(off);
        self.starts.push(self.cells.len() as u32);
        self.dropped += dropped;
        dropped
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn finish(self) -> NeighborTable {
        if self.dropped > 0 {
            log::warn!(
                "neighbor table: {} neighbor entries exceeded the per-option capacity and were dropped",
                self.dropped
            );
        }
        NeighborTable { starts: self.starts, offsets: self.offsets, cells: self.cells }
    }

    /// Build a table from a geometry helper that answers neighbor queries for an
    /// option mask.
    ///
    /// Plain options are queried one at a time. The two corner options are obtained
    /// as set differences of composite queries: `corners2D = all2D \ faces2D` and
    /// `corners3D = all3DwithCorners \ all3D`, which the per-option de-duplication
    /// performs since every lower option has already been inserted.
    pub fn from_query<Q, L>(n_cells: usize, query: Q, limits: L) -> NeighborTable
    where
        Q: Fn(u32, NeighborMask) -> Vec<u32> + Sync,
        L: Fn(u32) -> (bool, bool) + Sync,
    {
        let raw: Vec<([Vec<u32>; NUM_NEIGH_OPTIONS], (bool, bool))> = (0..n_cells as u32)
            .into_par_iter()
            .map(|cell| {
                let lists: [Vec<u32>; NUM_NEIGH_OPTIONS] = std::array::from_fn(|i| {
                    let opt = ALL_NEIGH_OPTIONS[i];
                    match opt {
                        NeighborOption::Corners2D => query(cell, NeighborMask::ALL_2D),
                        NeighborOption::Corners3D => query(cell, NeighborMask::ALL_3D_WITH_CORNERS),
                        _ => query(cell, opt.mask()),
                    }
                });
                (lists, limits(cell))
            })
            .collect();

        let mut builder = NeighborTableBuilder::with_capacity(n_cells);
        for (lists, (hec, ps)) in &raw {
            builder.push_cell(lists, *hec, *ps);
        }
        builder.finish()
    }
}
