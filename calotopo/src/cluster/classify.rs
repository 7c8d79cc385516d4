// calotopo/src/cluster/classify.rs

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use calocore::cell_info::CellInfo;
use calocore::geometry::ConstantData;

use crate::cluster::options::TopoClusterOptions;

/// Role of a cell in cluster growing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellClass {
    Seed,
    Grow,
    Terminal,
    Ignored,
}

impl CellClass {
    /// Seed and growing cells form the connected core of a cluster.
    #[inline]
    pub fn is_growable(self) -> bool {
        matches!(self, CellClass::Seed | CellClass::Grow)
    }
}

impl Default for CellClass {
    fn default() -> Self {
        CellClass::Ignored
    }
}

/// Per-cell labels and signed signal-to-noise ratios.
#[derive(Clone, Debug, Default)]
pub struct Classification {
    pub labels: Vec<CellClass>,
    pub snr: Vec<f32>,
}

impl Classification {
    pub fn n_cells(&self) -> usize {
        self.labels.len()
    }

    pub fn count(&self, class: CellClass) -> usize {
        self.labels.iter().filter(|&&c| c == class).count()
    }
}

/// `energy / noise`, never NaN. A non-positive or non-finite noise gives `+inf`
/// for any non-zero energy, whatever its sign, and `0` otherwise.
#[inline]
pub fn signal_to_noise(energy: f32, noise: f32) -> f32 {
    if noise > 0.0 && noise.is_finite() {
        energy / noise
    } else if energy == 0.0 || energy.is_nan() {
        0.0
    } else {
        f32::INFINITY
    }
}

#[inline]
fn passes(snr: f32, threshold: f32, in_abs: bool) -> bool {
    let v = if in_abs { snr.abs() } else { snr };
    v > threshold
}

/// Classify a single cell. Returns the label and the signal-to-noise ratio.
pub fn classify_cell(
    cell: u32,
    cell_info: &CellInfo,
    constants: &ConstantData,
    options: &TopoClusterOptions,
) -> (CellClass, f32) {
    let c = cell as usize;
    let noise = match cell_info.gain[c].gain_index().and_then(|g| constants.noise.get(g, cell)) {
        Some(n) => n,
        None => return (CellClass::Ignored, 0.0),
    };

    let g = &options.growing;
    let t = &options.time_cut;
    let is_tile = constants.geometry.is_tile(cell);
    let qp = cell_info.quality_provenance[c];

    let snr = if qp.is_bad(t.treat_l1_predicted_cells_as_good) {
        0.0
    } else {
        signal_to_noise(cell_info.energy[c], noise)
    };

    if passes(snr, g.seed_threshold, g.seed_cuts_in_abs_e)
        && g.seed_samplings.contains(constants.geometry.sampling[c])
    {
        if !t.seed_cuts_in_t || !qp.time_available(is_tile) {
            return (CellClass::Seed, snr);
        }
        let in_time = cell_info.time[c].abs() < t.seed_threshold_on_t_abs;
        let rescued = t.use_time_cut_upper_limit && snr.abs() > t.time_cut_upper_limit;
        if in_time || rescued {
            return (CellClass::Seed, snr);
        }
        let demoted = if t.cut_oot_seed { CellClass::Ignored } else { CellClass::Grow };
        return (demoted, snr);
    }

    let class = if passes(snr, g.grow_threshold, g.grow_cuts_in_abs_e) {
        CellClass::Grow
    } else if passes(snr, g.terminal_threshold, g.terminal_cuts_in_abs_e) {
        CellClass::Terminal
    } else {
        CellClass::Ignored
    };
    (class, snr)
}

/// Classify every cell of an event into `out`, reusing its allocations.
pub fn classify_into(
    cell_info: &CellInfo,
    constants: &ConstantData,
    options: &TopoClusterOptions,
    out: &mut Classification,
) {
    let n = cell_info.n_cells();
    debug_assert_eq!(n, constants.n_cells());
    out.labels.resize(n, CellClass::Ignored);
    out.snr.resize(n, 0.0);

    out.labels
        .par_iter_mut()
        .zip(out.snr.par_iter_mut())
        .enumerate()
        .for_each(|(cell, (label, snr))| {
            let (l, s) = classify_cell(cell as u32, cell_info, constants, options);
            *label = l;
            *snr = s;
        });
}

/// Label every cell as seed, growing, terminal or ignored.
///
/// # Arguments
///
/// * `cell_info` - per-event energies, gains, times and quality words
/// * `constants` - geometry and noise
/// * `options` - thresholds and time-cut policy
///
/// # Returns
///
/// * `Classification` - labels and signal-to-noise, indexed by cell id
pub fn classify_and_score(
    cell_info: &CellInfo,
    constants: &ConstantData,
    options: &TopoClusterOptions,
) -> Classification {
    let mut out = Classification::default();
    classify_into(cell_info, constants, options, &mut out);
    out
}
