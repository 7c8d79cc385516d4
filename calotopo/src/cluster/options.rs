// calotopo/src/cluster/options.rs

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use calocore::error::Result;
use calocore::neighbors::{NeighOffsets, NeighborMask, NeighborTable};
use calocore::sampling::SamplingMask;
use calocore::tag::MAX_CLUSTERS;

// ---------------------------------------------------------------------------
// Serializable configuration
// ---------------------------------------------------------------------------

/// Seed / grow / terminal thresholds and neighbor policy for cluster growing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GrowingConfig {
    /// Signal-to-noise a seed cell must exceed
    pub seed_threshold: f32,              // e.g. 4.0
    /// Signal-to-noise a growing cell must exceed
    pub grow_threshold: f32,              // e.g. 2.0
    /// Signal-to-noise a terminal cell must exceed
    pub cell_threshold: f32,              // e.g. 0.0
    pub seed_cuts_in_abs_e: bool,
    pub neighbor_cuts_in_abs_e: bool,
    pub cell_cuts_in_abs_e: bool,
    /// Samplings allowed to hold seeds
    pub seed_sampling_names: Vec<String>,
    pub neighbor_option: String,          // e.g. "super3D"
    pub restrict_hec_iw_and_fcal_neighbors: bool,
    pub restrict_ps_neighbors: bool,
    pub two_gaussian_noise: bool,
    pub share_border_cells: bool,
    /// Transverse shower scale (mm) used by the border sharing weights
    pub em_shower_scale: f32,             // e.g. 50.0
}

impl Default for GrowingConfig {
    fn default() -> Self {
        Self {
            seed_threshold: 4.0,
            grow_threshold: 2.0,
            cell_threshold: 0.0,
            seed_cuts_in_abs_e: true,
            neighbor_cuts_in_abs_e: true,
            cell_cuts_in_abs_e: true,
            seed_sampling_names: SamplingMask::all().samplings().iter().map(|s| s.name().to_string()).collect(),
            neighbor_option: "super3D".to_string(),
            restrict_hec_iw_and_fcal_neighbors: false,
            restrict_ps_neighbors: true,
            two_gaussian_noise: false,
            share_border_cells: false,
            em_shower_scale: 50.0,
        }
    }
}

/// Timing requirements on seed cells.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeCutConfig {
    pub seed_cuts_in_t: bool,
    /// Out-of-time seeds are dropped entirely instead of demoted to growing cells
    pub cut_oot_seed: bool,
    pub use_time_cut_upper_limit: bool,
    /// Significance above which an out-of-time seed is kept anyway
    pub time_cut_upper_limit: f32,        // e.g. 20.0
    /// |t| (ns) at which a seed counts as out of time
    pub seed_threshold_on_t_abs: f32,     // e.g. 12.5
    pub treat_l1_predicted_cells_as_good: bool,
}

impl Default for TimeCutConfig {
    fn default() -> Self {
        Self {
            seed_cuts_in_t: false,
            cut_oot_seed: false,
            use_time_cut_upper_limit: false,
            time_cut_upper_limit: 20.0,
            seed_threshold_on_t_abs: 12.5,
            treat_l1_predicted_cells_as_good: true,
        }
    }
}

/// Local-maximum based cluster splitting.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitterConfig {
    pub enabled: bool,
    /// Minimum number of strictly lower neighbors of a local maximum
    pub number_of_cells_cut: usize,       // e.g. 4
    /// Minimum local maximum energy (MeV)
    pub energy_cut: f32,                  // e.g. 500.0
    pub sampling_names: Vec<String>,
    pub secondary_sampling_names: Vec<String>,
    pub share_border_cells: bool,
    pub em_shower_scale: f32,
    pub use_negative_clusters: bool,
    pub neighbor_option: String,
    pub restrict_hec_iw_and_fcal_neighbors: bool,
    pub restrict_ps_neighbors: bool,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        let names = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            enabled: true,
            number_of_cells_cut: 4,
            energy_cut: 500.0,
            sampling_names: names(&["EMB2", "EMB3", "EME2", "EME3", "FCAL0"]),
            secondary_sampling_names: names(&[
                "EMB1", "EME1", "TileBar0", "TileBar1", "TileBar2", "TileExt0", "TileExt1",
                "TileExt2", "HEC0", "HEC1", "HEC2", "HEC3", "FCAL1", "FCAL2",
            ]),
            share_border_cells: false,
            em_shower_scale: 50.0,
            use_negative_clusters: false,
            neighbor_option: "super3D".to_string(),
            restrict_hec_iw_and_fcal_neighbors: false,
            restrict_ps_neighbors: true,
        }
    }
}

/// Final cluster selection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub cluster_cuts_in_abs_et: bool,
    /// Clusters must have Et (or |Et|) strictly above this value (MeV)
    pub cluster_et_or_abs_et_cut: f32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            cluster_cuts_in_abs_et: true,
            cluster_et_or_abs_et_cut: 0.0,
        }
    }
}

/// Complete clustering configuration, as read from JSON.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TopoClusterConfig {
    pub growing: GrowingConfig,
    pub time_cut: TimeCutConfig,
    pub splitter: SplitterConfig,
    pub output: OutputConfig,
    /// Upper bound on cluster ids per event, clamped to what a tag can address
    pub max_clusters: usize,              // e.g. 65534
    /// Per-event working buffers created up front
    pub num_preallocated_buffers: usize,
    /// Create more buffers on demand instead of blocking
    pub allow_pool_growth: bool,
}

impl Default for TopoClusterConfig {
    fn default() -> Self {
        Self {
            growing: GrowingConfig::default(),
            time_cut: TimeCutConfig::default(),
            splitter: SplitterConfig::default(),
            output: OutputConfig::default(),
            max_clusters: 65534,
            num_preallocated_buffers: 0,
            allow_pool_growth: true,
        }
    }
}

impl TopoClusterConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Turn names into masks and sanity-check values.
    ///
    /// Nothing here is fatal: unresolvable entries are dropped or replaced by a
    /// fallback, each such decision is logged as a warning and returned as a
    /// [`ConfigIssue`].
    pub fn resolve(&self) -> (TopoClusterOptions, Vec<ConfigIssue>) {
        let mut issues = Vec::new();
        let g = &self.growing;
        let s = &self.splitter;
        let t = &self.time_cut;

        if g.two_gaussian_noise {
            issues.push(ConfigIssue::new(
                "growing.two_gaussian_noise",
                "two-gaussian noise is not supported, single-gaussian noise is used",
            ));
        }
        if !(g.seed_threshold >= g.grow_threshold && g.grow_threshold >= g.cell_threshold) {
            issues.push(ConfigIssue::new(
                "growing",
                format!(
                    "thresholds are not ordered (seed {}, grow {}, cell {})",
                    g.seed_threshold, g.grow_threshold, g.cell_threshold
                ),
            ));
        }

        let growing = GrowingOptions {
            seed_threshold: g.seed_threshold,
            grow_threshold: g.grow_threshold,
            terminal_threshold: g.cell_threshold,
            seed_cuts_in_abs_e: g.seed_cuts_in_abs_e,
            grow_cuts_in_abs_e: g.neighbor_cuts_in_abs_e,
            terminal_cuts_in_abs_e: g.cell_cuts_in_abs_e,
            seed_samplings: resolve_samplings("growing.seed_sampling_names", &g.seed_sampling_names, &mut issues),
            neighbors: NeighborSelection {
                mask: resolve_neighbor_option("growing.neighbor_option", &g.neighbor_option, &mut issues),
                restrict_hec_iw_and_fcal: g.restrict_hec_iw_and_fcal_neighbors,
                restrict_ps: g.restrict_ps_neighbors,
            },
            share_border_cells: g.share_border_cells,
            em_shower_scale: resolve_scale("growing.em_shower_scale", g.em_shower_scale, &mut issues),
        };

        let time_cut = TimeCutOptions {
            seed_cuts_in_t: t.seed_cuts_in_t,
            cut_oot_seed: t.cut_oot_seed,
            use_time_cut_upper_limit: t.use_time_cut_upper_limit,
            time_cut_upper_limit: t.time_cut_upper_limit,
            seed_threshold_on_t_abs: t.seed_threshold_on_t_abs,
            treat_l1_predicted_cells_as_good: t.treat_l1_predicted_cells_as_good,
        };

        let splitter = SplitterOptions {
            enabled: s.enabled,
            number_of_cells_cut: s.number_of_cells_cut,
            energy_cut: s.energy_cut,
            primary_samplings: resolve_samplings("splitter.sampling_names", &s.sampling_names, &mut issues),
            secondary_samplings: resolve_samplings(
                "splitter.secondary_sampling_names",
                &s.secondary_sampling_names,
                &mut issues,
            ),
            share_border_cells: s.share_border_cells,
            em_shower_scale: resolve_scale("splitter.em_shower_scale", s.em_shower_scale, &mut issues),
            use_negative_clusters: s.use_negative_clusters,
            neighbors: NeighborSelection {
                mask: resolve_neighbor_option("splitter.neighbor_option", &s.neighbor_option, &mut issues),
                restrict_hec_iw_and_fcal: s.restrict_hec_iw_and_fcal_neighbors,
                restrict_ps: s.restrict_ps_neighbors,
            },
        };

        let mut max_clusters = self.max_clusters;
        if max_clusters > MAX_CLUSTERS {
            issues.push(ConfigIssue::new(
                "max_clusters",
                format!("{} exceeds the tag capacity, clamped to {}", max_clusters, MAX_CLUSTERS),
            ));
            max_clusters = MAX_CLUSTERS;
        }

        let mut num_preallocated_buffers = self.num_preallocated_buffers;
        if num_preallocated_buffers == 0 && !self.allow_pool_growth {
            issues.push(ConfigIssue::new(
                "num_preallocated_buffers",
                "no buffers and pool growth disabled, using one buffer",
            ));
            num_preallocated_buffers = 1;
        }

        for issue in &issues {
            log::warn!("topo-cluster configuration: {}", issue);
        }

        let options = TopoClusterOptions {
            growing,
            time_cut,
            splitter,
            output: OutputOptions {
                cuts_in_abs_et: self.output.cluster_cuts_in_abs_et,
                et_cut: self.output.cluster_et_or_abs_et_cut,
            },
            max_clusters,
            num_preallocated_buffers,
            allow_pool_growth: self.allow_pool_growth,
        };
        (options, issues)
    }
}

fn resolve_samplings(field: &'static str, names: &[String], issues: &mut Vec<ConfigIssue>) -> SamplingMask {
    let (mask, unknown) = SamplingMask::from_names(names);
    for name in unknown {
        issues.push(ConfigIssue::new(field, format!("unknown sampling '{}' ignored", name)));
    }
    mask
}

fn resolve_neighbor_option(field: &'static str, name: &str, issues: &mut Vec<ConfigIssue>) -> NeighborMask {
    NeighborMask::from_name(name).unwrap_or_else(|| {
        issues.push(ConfigIssue::new(field, format!("unknown neighbor option '{}', using super3D", name)));
        NeighborMask::SUPER_3D
    })
}

fn resolve_scale(field: &'static str, scale: f32, issues: &mut Vec<ConfigIssue>) -> f32 {
    if scale.is_finite() && scale > 0.0 {
        scale
    } else {
        issues.push(ConfigIssue::new(field, format!("shower scale {} must be positive, using 50 mm", scale)));
        50.0
    }
}

/// A configuration entry that was ignored or replaced during [`TopoClusterConfig::resolve`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigIssue {
    pub field: &'static str,
    pub message: String,
}

impl ConfigIssue {
    fn new<S: Into<String>>(field: &'static str, message: S) -> Self {
        ConfigIssue { field, message: message.into() }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

// ---------------------------------------------------------------------------
// Resolved options
// ---------------------------------------------------------------------------

/// Which neighbor relations connect cells, and which cross-layer relations are
/// suppressed around flagged cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NeighborSelection {
    pub mask: NeighborMask,
    pub restrict_hec_iw_and_fcal: bool,
    pub restrict_ps: bool,
}

impl NeighborSelection {
    pub fn new(mask: NeighborMask) -> Self {
        NeighborSelection { mask, restrict_hec_iw_and_fcal: false, restrict_ps: false }
    }

    /// Whether `cell` carries a limitation flag whose restriction is enabled.
    #[inline]
    fn is_restricted(&self, cell: NeighOffsets) -> bool {
        (self.restrict_hec_iw_and_fcal && cell.is_limited_hec_iw_fcal()) || (self.restrict_ps && cell.is_limited_ps())
    }

    /// Selected neighbors of `cell`.
    ///
    /// In-layer neighbors are read as one range. The remaining options are skipped
    /// as a whole for a restricted `cell`, and filtered per neighbor otherwise.
    pub fn neighbors<'a>(&'a self, table: &'a NeighborTable, cell: u32) -> impl Iterator<Item = u32> + 'a {
        let in_layer = self.mask.intersect(NeighborMask::ALL_2D);
        let cross = if self.is_restricted(table.offsets(cell)) {
            NeighborMask::NONE
        } else {
            self.mask.intersect(NeighborMask(!NeighborMask::ALL_2D.0))
        };
        table.neighbors(cell, in_layer).chain(
            table
                .neighbors(cell, cross)
                .filter(move |&n| !self.is_restricted(table.offsets(n))),
        )
    }
}

#[derive(Clone, Debug)]
pub struct GrowingOptions {
    pub seed_threshold: f32,
    pub grow_threshold: f32,
    pub terminal_threshold: f32,
    pub seed_cuts_in_abs_e: bool,
    pub grow_cuts_in_abs_e: bool,
    pub terminal_cuts_in_abs_e: bool,
    pub seed_samplings: SamplingMask,
    pub neighbors: NeighborSelection,
    pub share_border_cells: bool,
    pub em_shower_scale: f32,
}

#[derive(Clone, Debug)]
pub struct TimeCutOptions {
    pub seed_cuts_in_t: bool,
    pub cut_oot_seed: bool,
    pub use_time_cut_upper_limit: bool,
    pub time_cut_upper_limit: f32,
    pub seed_threshold_on_t_abs: f32,
    pub treat_l1_predicted_cells_as_good: bool,
}

#[derive(Clone, Debug)]
pub struct SplitterOptions {
    pub enabled: bool,
    pub number_of_cells_cut: usize,
    pub energy_cut: f32,
    pub primary_samplings: SamplingMask,
    pub secondary_samplings: SamplingMask,
    pub share_border_cells: bool,
    pub em_shower_scale: f32,
    pub use_negative_clusters: bool,
    pub neighbors: NeighborSelection,
}

#[derive(Clone, Debug)]
pub struct OutputOptions {
    pub cuts_in_abs_et: bool,
    pub et_cut: f32,
}

/// Immutable options shared by every pass of the clustering chain.
#[derive(Clone, Debug)]
pub struct TopoClusterOptions {
    pub growing: GrowingOptions,
    pub time_cut: TimeCutOptions,
    pub splitter: SplitterOptions,
    pub output: OutputOptions,
    pub max_clusters: usize,
    pub num_preallocated_buffers: usize,
    pub allow_pool_growth: bool,
}

impl Default for TopoClusterOptions {
    fn default() -> Self {
        TopoClusterConfig::default().resolve().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calocore::sampling::CaloSampling;

    #[test]
    fn test_defaults_resolve_cleanly() {
        let (opts, issues) = TopoClusterConfig::default().resolve();
        assert!(issues.is_empty(), "{:?}", issues);
        assert_eq!(opts.growing.neighbors.mask, NeighborMask::SUPER_3D);
        assert_eq!(opts.growing.seed_samplings, SamplingMask::all());
        assert!(opts.splitter.primary_samplings.contains(CaloSampling::EMB2));
        assert!(opts.splitter.secondary_samplings.contains(CaloSampling::HEC3));
        assert!(!opts.splitter.primary_samplings.contains(CaloSampling::EMB1));
        assert_eq!(opts.max_clusters, 65534);
        assert!(opts.growing.neighbors.restrict_ps);
    }

    #[test]
    fn test_bad_entries_are_reported_and_replaced() {
        let mut cfg = TopoClusterConfig::default();
        cfg.growing.neighbor_option = "sideways".to_string();
        cfg.growing.seed_sampling_names = vec!["EMB2".into(), "EMB9".into()];
        cfg.growing.two_gaussian_noise = true;
        cfg.max_clusters = 1 << 20;
        let (opts, issues) = cfg.resolve();

        assert_eq!(opts.growing.neighbors.mask, NeighborMask::SUPER_3D);
        assert_eq!(opts.growing.seed_samplings, SamplingMask::from_samplings(&[CaloSampling::EMB2]));
        assert_eq!(opts.max_clusters, MAX_CLUSTERS);
        let fields: Vec<_> = issues.iter().map(|i| i.field).collect();
        assert!(fields.contains(&"growing.neighbor_option"));
        assert!(fields.contains(&"growing.seed_sampling_names"));
        assert!(fields.contains(&"growing.two_gaussian_noise"));
        assert!(fields.contains(&"max_clusters"));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg = TopoClusterConfig::from_json_str(
            r#"{ "growing": { "seed_threshold": 6.0, "neighbor_option": "all2D" }, "splitter": { "enabled": false } }"#,
        )
        .unwrap();
        assert_eq!(cfg.growing.seed_threshold, 6.0);
        assert_eq!(cfg.growing.grow_threshold, 2.0);
        assert!(!cfg.splitter.enabled);
        assert_eq!(cfg.splitter.number_of_cells_cut, 4);
        assert_eq!(cfg.max_clusters, 65534);

        let back = TopoClusterConfig::from_json_str(&cfg.to_json_pretty().unwrap()).unwrap();
        assert_eq!(back.growing.neighbor_option, "all2D");
    }

    #[test]
    fn test_pool_without_buffers_gets_one() {
        let mut cfg = TopoClusterConfig::default();
        cfg.allow_pool_growth = false;
        let (opts, issues) = cfg.resolve();
        assert_eq!(opts.num_preallocated_buffers, 1);
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn test_selection_restricts_cross_layer_only() {
        use calocore::neighbors::{NeighborOption, NeighborTableBuilder, NUM_NEIGH_OPTIONS};

        let cell = |relations: &[(NeighborOption, Vec<u32>)]| {
            let mut lists: [Vec<u32>; NUM_NEIGH_OPTIONS] = std::array::from_fn(|_| Vec::new());
            for (opt, cells) in relations {
                lists[opt.index()] = cells.clone();
            }
            lists
        };
        // cells 0 and 3 are presampler cells
        let mut b = NeighborTableBuilder::with_capacity(4);
        b.push_cell(&cell(&[(NeighborOption::NextInEta, vec![1]), (NeighborOption::NextInSamp, vec![2])]), false, true);
        b.push_cell(&cell(&[(NeighborOption::PrevInEta, vec![0]), (NeighborOption::NextInSamp, vec![2, 3])]), false, false);
        b.push_cell(&cell(&[(NeighborOption::PrevInSamp, vec![1])]), false, false);
        b.push_cell(&cell(&[(NeighborOption::PrevInSamp, vec![1])]), false, true);
        let table = b.finish();

        let open = NeighborSelection::new(NeighborMask::SUPER_3D);
        let restricted = NeighborSelection { restrict_ps: true, ..open };
        let collect = |sel: &NeighborSelection, c: u32| sel.neighbors(&table, c).collect::<Vec<u32>>();

        assert_eq!(collect(&open, 0), vec![1, 2]);
        assert_eq!(collect(&open, 1), vec![0, 2, 3]);
        // in-layer relations of a presampler cell survive, cross-layer ones do not
        assert_eq!(collect(&restricted, 0), vec![1]);
        assert_eq!(collect(&restricted, 1), vec![0, 2]);
        assert_eq!(collect(&restricted, 2), vec![1]);
        assert!(collect(&restricted, 3).is_empty());

        let hec_only = NeighborSelection { restrict_hec_iw_and_fcal: true, ..open };
        assert_eq!(collect(&hec_only, 1), vec![0, 2, 3]);
    }
}
