use serde::{Deserialize, Serialize};

use crate::error::{CaloError, Result};

/// Gain state of a cell in one event.
///
/// The low bits hold the gain index into the noise table; [`GainState::INVALID`]
/// marks cells that are absent from the event or otherwise unusable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GainState(pub u8);

impl GainState {
    pub const INVALID: GainState = GainState(0xFF);

    #[inline]
    pub fn new(gain_index: u8) -> Self {
        debug_assert!(gain_index != 0xFF);
        GainState(gain_index)
    }

    #[inline]
    pub fn is_invalid(self) -> bool {
        self == GainState::INVALID
    }

    #[inline]
    pub fn gain_index(self) -> Option<usize> {
        if self.is_invalid() { None } else { Some(self.0 as usize) }
    }
}

impl Default for GainState {
    fn default() -> Self {
        GainState::INVALID
    }
}

/// Packed quality and provenance words of a cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualityProvenance {
    pub quality: u16,
    pub provenance: u16,
}

impl QualityProvenance {
    /// LAr: time and quality were computed for this channel.
    pub const LAR_TIME_AVAILABLE: u16 = 0x2000;
    /// Tile: time available (either PMT).
    pub const TILE_TIME_AVAILABLE: u16 = 0x8080;
    /// Channel flagged bad.
    pub const BAD_CELL: u16 = 0x0800;
    /// Bad flag set only because of an L1 noise-burst prediction.
    pub const L1_PREDICTED: u16 = 0x0200;

    pub fn new(quality: u16, provenance: u16) -> Self {
        QualityProvenance { quality, provenance }
    }

    #[inline]
    pub fn time_available(self, is_tile: bool) -> bool {
        let mask = if is_tile { Self::TILE_TIME_AVAILABLE } else { Self::LAR_TIME_AVAILABLE };
        self.provenance & mask != 0
    }

    #[inline]
    pub fn is_bad(self, treat_l1_predicted_as_good: bool) -> bool {
        if self.provenance & Self::BAD_CELL == 0 {
            return false;
        }
        !(treat_l1_predicted_as_good && self.provenance & Self::L1_PREDICTED != 0)
    }
}

/// Per-event cell data, indexed by fixed cell id.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CellInfo {
    pub energy: Vec<f32>,
    pub gain: Vec<GainState>,
    pub time: Vec<f32>,
    pub quality_provenance: Vec<QualityProvenance>,
}

/// One input record for the keyed (slow) normalization path.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CellRecord {
    pub id: u32,
    pub energy: f32,
    pub gain: GainState,
    pub time: f32,
    pub quality_provenance: QualityProvenance,
}

impl CellInfo {
    /// All cells absent (invalid gain, zero energy).
    pub fn empty(n_cells: usize) -> Self {
        CellInfo {
            energy: vec![0.0; n_cells],
            gain: vec![GainState::INVALID; n_cells],
            time: vec![0.0; n_cells],
            quality_provenance: vec![QualityProvenance::default(); n_cells],
        }
    }

    /// Fast path: the arrays are already indexed by cell id.
    pub fn from_dense(
        energy: Vec<f32>,
        gain: Vec<GainState>,
        time: Vec<f32>,
        quality_provenance: Vec<QualityProvenance>,
    ) -> Result<Self> {
        let n = energy.len();
        for (what, len) in [
            ("cell gain", gain.len()),
            ("cell time", time.len()),
            ("cell quality/provenance", quality_provenance.len()),
        ] {
            if len != n {
                return Err(CaloError::SizeMismatch { what, expected: n, got: len });
            }
        }
        Ok(CellInfo { energy, gain, time, quality_provenance })
    }

    /// Slow path: scatter keyed records into a dense array of `n_cells` entries.
    /// Cells without a record stay invalid; a record with an out-of-range id fails
    /// the whole event.
    pub fn from_records(n_cells: usize, records: &[CellRecord]) -> Result<Self> {
        let mut info = CellInfo::empty(n_cells);
        for r in records {
            let i = r.id as usize;
            if i >= n_cells {
                return Err(CaloError::InvalidCell { id: i, n_cells });
            }
            info.energy[i] = r.energy;
            info.gain[i] = r.gain;
            info.time[i] = r.time;
            info.quality_provenance[i] = r.quality_provenance;
        }
        Ok(info)
    }

    /// Overwrite this buffer with another event's data, reusing the allocations.
    pub fn copy_from(&mut self, other: &CellInfo) {
        self.energy.clear();
        self.energy.extend_from_slice(&other.energy);
        self.gain.clear();
        self.gain.extend_from_slice(&other.gain);
        self.time.clear();
        self.time.extend_from_slice(&other.time);
        self.quality_provenance.clear();
        self.quality_provenance.extend_from_slice(&other.quality_provenance);
    }

    #[inline]
    pub fn n_cells(&self) -> usize {
        self.energy.len()
    }

    #[inline]
    pub fn is_valid(&self, cell: u32) -> bool {
        !self.gain[cell as usize].is_invalid()
    }

    /// Sanity check used before any pass runs.
    pub fn validate(&self, expected_cells: usize) -> Result<()> {
        if self.energy.is_empty() && expected_cells > 0 {
            return Err(CaloError::MissingInput("cell energies"));
        }
        if self.n_cells() != expected_cells {
            return Err(CaloError::CellCountMismatch { expected: expected_cells, got: self.n_cells() });
        }
        for (what, len) in [
            ("cell gain", self.gain.len()),
            ("cell time", self.time.len()),
            ("cell quality/provenance", self.quality_provenance.len()),
        ] {
            if len != expected_cells {
                return Err(CaloError::SizeMismatch { what, expected: expected_cells, got: len });
            }
        }
        Ok(())
    }
}
