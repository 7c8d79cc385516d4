// calotopo/src/cluster/splitter.rs

use std::cmp::Reverse;

use ordered_float::OrderedFloat;
use rayon::prelude::*;

use calocore::cell_info::CellInfo;
use calocore::cluster::ClusterSummary;
use calocore::geometry::ConstantData;
use calocore::tag::{ClusterTag, TagState};

use crate::cluster::options::{SplitterOptions, TopoClusterOptions};
use crate::cluster::summary::compute_summaries;
use crate::cluster::utility::{order_shared, share_weight, Adjacency, Centroid};

const NOT_IN_PARENT: u32 = u32::MAX;

/// Cell tags and summaries after splitting.
#[derive(Clone, Debug, Default)]
pub struct SplitResult {
    pub tags: Vec<ClusterTag>,
    pub summaries: Vec<ClusterSummary>,
}

/// Assignment of a parent cell to the split clusters of that parent.
#[derive(Clone, Copy, Debug, PartialEq)]
enum LocalTag {
    Unassigned,
    Own(u32),
    Shared { primary: u32, secondary: u32, secondary_weight: f32 },
}

#[derive(Debug)]
enum ParentOutcome {
    /// Zero or one local maximum: the parent is kept as it is.
    Unchanged,
    Split {
        /// Local maxima (global cell ids), ascending
        maxima: Vec<u32>,
        /// Assignment per parent cell, in the parent's cell order
        local: Vec<LocalTag>,
        /// Index of the most energetic split cluster
        main: usize,
    },
}

/// Read-only view of one event shared by all parent tasks.
struct SplitContext<'a> {
    parent_of: &'a [u32],
    local_of: &'a [u32],
    cell_info: &'a CellInfo,
    constants: &'a ConstantData,
    options: &'a SplitterOptions,
}

impl SplitContext<'_> {
    #[inline]
    fn split_energy(&self, cell: u32) -> f64 {
        let e = self.cell_info.energy[cell as usize] as f64;
        if self.options.use_negative_clusters { e.abs() } else { e }
    }

    fn local_adjacency(&self, parent: u32, cells: &[u32]) -> Adjacency {
        let table = &self.constants.neighbors;
        let mut pairs = Vec::new();
        for (li, &cell) in cells.iter().enumerate() {
            for n in self.options.neighbors.neighbors(table, cell) {
                if self.parent_of[n as usize] == parent {
                    pairs.push((li as u32, self.local_of[n as usize]));
                }
            }
        }
        Adjacency::undirected(cells.len(), pairs)
    }

    fn find_maxima(&self, cells: &[u32], adj: &Adjacency, energy: &[f64]) -> Vec<u32> {
        let o = self.options;
        let samplings = o.primary_samplings.union(o.secondary_samplings);
        let geometry = &self.constants.geometry;

        let candidate: Vec<bool> = (0..cells.len())
            .map(|li| {
                let e = energy[li];
                if !(e > o.energy_cut as f64) || !samplings.contains(geometry.sampling[cells[li] as usize]) {
                    return false;
                }
                let nbs = adj.of(li as u32);
                if nbs.iter().any(|&nb| energy[nb as usize] > e) {
                    return false;
                }
                nbs.iter().filter(|&&nb| energy[nb as usize] < e).count() >= o.number_of_cells_cut
            })
            .collect();

        let is_max: Vec<bool> = (0..cells.len())
            .map(|li| {
                candidate[li]
                    && !adj
                        .of(li as u32)
                        .iter()
                        .any(|&nb| (nb as usize) < li && candidate[nb as usize] && energy[nb as usize] == energy[li])
            })
            .collect();

        let is_primary = |li: usize| o.primary_samplings.contains(geometry.sampling[cells[li] as usize]);
        (0..cells.len())
            .filter(|&li| is_max[li])
            .filter(|&li| {
                if is_primary(li) {
                    return true;
                }
                // a secondary-sampling maximum yields to a primary one within two steps
                let near_primary = adj.of(li as u32).iter().any(|&a| {
                    let a = a as usize;
                    (is_max[a] && is_primary(a))
                        || adj.of(a as u32).iter().any(|&b| is_max[b as usize] && is_primary(b as usize))
                });
                !near_primary
            })
            .map(|li| li as u32)
            .collect()
    }

    /// Energies and centroids of the split clusters under the current assignment.
    fn cluster_state(&self, cells: &[u32], energy: &[f64], local: &[LocalTag], n: usize) -> (Vec<f64>, Vec<Centroid>) {
        let geometry = &self.constants.geometry;
        let mut sums = vec![0.0f64; n];
        let mut centroids = vec![Centroid::default(); n];
        let mut add = |k: u32, li: usize, w: f64| {
            sums[k as usize] += w * energy[li];
            centroids[k as usize].add(geometry.position(cells[li]), w * energy[li].abs());
        };
        for (li, tag) in local.iter().enumerate() {
            match *tag {
                LocalTag::Unassigned => {}
                LocalTag::Own(k) => add(k, li, 1.0),
                LocalTag::Shared { primary, secondary, secondary_weight } => {
                    let w = secondary_weight as f64;
                    add(primary, li, 1.0 - w);
                    add(secondary, li, w);
                }
            }
        }
        (sums, centroids)
    }

    fn split_parent(&self, parent: u32, cells: &[u32]) -> ParentOutcome {
        let energy: Vec<f64> = cells.iter().map(|&c| self.split_energy(c)).collect();
        let adj = self.local_adjacency(parent, cells);
        let maxima = self.find_maxima(cells, &adj, &energy);
        if maxima.len() <= 1 {
            return ParentOutcome::Unchanged;
        }

        let n_split = maxima.len();
        let geometry = &self.constants.geometry;
        let mut local = vec![LocalTag::Unassigned; cells.len()];
        for (k, &li) in maxima.iter().enumerate() {
            local[li as usize] = LocalTag::Own(k as u32);
        }

        // synchronous growth from the maxima
        loop {
            let (sums, centroids) = self.cluster_state(cells, &energy, &local, n_split);
            let prev = local.clone();
            let mut changed = 0usize;
            for li in 0..cells.len() {
                if prev[li] != LocalTag::Unassigned {
                    continue;
                }
                let mut reach: Vec<u32> = adj
                    .of(li as u32)
                    .iter()
                    .filter_map(|&nb| match prev[nb as usize] {
                        LocalTag::Own(k) => Some(k),
                        _ => None,
                    })
                    .collect();
                reach.sort_unstable();
                reach.dedup();
                local[li] = match reach.len() {
                    0 => continue,
                    1 => LocalTag::Own(reach[0]),
                    _ => {
                        reach.sort_by_key(|&k| (Reverse(OrderedFloat(sums[k as usize])), k));
                        let (k1, k2) = (reach[0], reach[1]);
                        if self.options.share_border_cells {
                            let cell = cells[li];
                            let fallback = |k: u32| geometry.position(cells[maxima[k as usize] as usize]);
                            let d1 = geometry.distance_to(cell, centroids[k1 as usize].position_or(fallback(k1)));
                            let d2 = geometry.distance_to(cell, centroids[k2 as usize].position_or(fallback(k2)));
                            let w1 = share_weight(
                                sums[k1 as usize],
                                d1,
                                sums[k2 as usize],
                                d2,
                                self.options.em_shower_scale as f64,
                            );
                            let (primary, secondary, secondary_weight) = order_shared(k1, w1, k2);
                            LocalTag::Shared { primary, secondary, secondary_weight }
                        } else {
                            LocalTag::Own(k1)
                        }
                    }
                };
                changed += 1;
            }
            if changed == 0 {
                break;
            }
        }

        // refill cells the growth could not reach
        let (sums, _) = self.cluster_state(cells, &energy, &local, n_split);
        let by_energy = |k: &u32| (Reverse(OrderedFloat(sums[*k as usize])), *k);
        loop {
            let prev = local.clone();
            let mut changed = 0usize;
            for li in 0..cells.len() {
                if prev[li] != LocalTag::Unassigned {
                    continue;
                }
                let best = adj
                    .of(li as u32)
                    .iter()
                    .flat_map(|&nb| match prev[nb as usize] {
                        LocalTag::Unassigned => [None, None],
                        LocalTag::Own(k) => [Some(k), None],
                        LocalTag::Shared { primary, secondary, .. } => [Some(primary), Some(secondary)],
                    })
                    .flatten()
                    .min_by_key(by_energy);
                if let Some(k) = best {
                    local[li] = LocalTag::Own(k);
                    changed += 1;
                }
            }
            if changed == 0 {
                break;
            }
        }
        let main = (0..n_split as u32).min_by_key(by_energy).unwrap_or(0);
        for tag in local.iter_mut().filter(|t| **t == LocalTag::Unassigned) {
            *tag = LocalTag::Own(main);
        }

        ParentOutcome::Split {
            maxima: maxima.iter().map(|&li| cells[li as usize]).collect(),
            local,
            main: main as usize,
        }
    }
}

fn compose(primary: Option<u32>, secondary: Option<(Option<u32>, f32)>) -> ClusterTag {
    match (primary, secondary) {
        (Some(p), Some((Some(s), w))) if p != s => ClusterTag::shared(p, s, w),
        (Some(p), _) => ClusterTag::exclusive(p),
        (None, Some((Some(s), _))) => ClusterTag::exclusive(s),
        _ => ClusterTag::INVALID,
    }
}

/// Split clusters with several local energy maxima.
///
/// Each parent is handled independently: local maxima become the seeds of new
/// clusters which grow back through the parent's cells in synchronous rounds.
/// Parents with at most one maximum are passed through. Output ids are handed out
/// by ascending parent id, then ascending maximum cell; ids past `max_clusters`
/// are not allocated and their cells lose that membership.
///
/// # Arguments
///
/// * `tags` - cell tags from growing
/// * `summaries` - per-id summaries from growing
/// * `cell_info` - per-event cell data
/// * `constants` - geometry and neighbors
/// * `options` - splitter options and cluster capacity
///
/// # Returns
///
/// * `SplitResult` - new tags and summaries
pub fn split_clusters(
    tags: &[ClusterTag],
    summaries: &[ClusterSummary],
    cell_info: &CellInfo,
    constants: &ConstantData,
    options: &TopoClusterOptions,
) -> SplitResult {
    let n = tags.len();
    let n_parents = summaries.len();

    // cells are split within the parent holding their primary membership
    let mut parent_of = vec![NOT_IN_PARENT; n];
    let mut local_of = vec![NOT_IN_PARENT; n];
    let mut parent_cells: Vec<Vec<u32>> = vec![Vec::new(); n_parents];
    for (c, tag) in tags.iter().enumerate() {
        if let Some(p) = tag.primary() {
            if summaries.get(p as usize).is_some_and(|s| s.is_valid()) {
                parent_of[c] = p;
                local_of[c] = parent_cells[p as usize].len() as u32;
                parent_cells[p as usize].push(c as u32);
            }
        }
    }

    let ctx = SplitContext {
        parent_of: &parent_of,
        local_of: &local_of,
        cell_info,
        constants,
        options: &options.splitter,
    };
    let outcomes: Vec<ParentOutcome> = (0..n_parents as u32)
        .into_par_iter()
        .map(|p| {
            if !summaries[p as usize].is_valid() || parent_cells[p as usize].is_empty() {
                ParentOutcome::Unchanged
            } else {
                ctx.split_parent(p, &parent_cells[p as usize])
            }
        })
        .collect();

    // output ids in parent order
    let mut out_ids: Vec<Vec<Option<u32>>> = Vec::with_capacity(n_parents);
    let mut new_summaries: Vec<ClusterSummary> = Vec::new();
    let mut dropped = 0usize;
    let mut n_split = 0usize;
    for (p, outcome) in outcomes.iter().enumerate() {
        let seeds: Vec<u32> = match outcome {
            _ if !summaries[p].is_valid() => Vec::new(),
            ParentOutcome::Unchanged => vec![summaries[p].seed_cell as u32],
            ParentOutcome::Split { maxima, .. } => {
                n_split += 1;
                maxima.clone()
            }
        };
        let ids = seeds
            .into_iter()
            .map(|seed| {
                if new_summaries.len() < options.max_clusters {
                    new_summaries.push(ClusterSummary::seeded(seed));
                    Some((new_summaries.len() - 1) as u32)
                } else {
                    dropped += 1;
                    None
                }
            })
            .collect();
        out_ids.push(ids);
    }
    if dropped > 0 {
        log::warn!(
            "splitter: cluster capacity {} reached, {} clusters dropped",
            options.max_clusters,
            dropped
        );
    }

    // whole-parent output id, used for memberships inherited from growing
    let parent_main = |p: u32| -> Option<u32> {
        let ids = out_ids.get(p as usize)?;
        match &outcomes[p as usize] {
            ParentOutcome::Split { main, .. } => ids.get(*main).copied().flatten(),
            ParentOutcome::Unchanged => ids.first().copied().flatten(),
        }
    };

    let new_tags: Vec<ClusterTag> = (0..n)
        .into_par_iter()
        .map(|c| {
            let (p, inherited) = match tags[c].state() {
                TagState::Invalid => return ClusterTag::INVALID,
                TagState::Exclusive(p) => (p, None),
                TagState::Shared { primary, secondary, secondary_weight } => {
                    (primary, Some((parent_main(secondary), secondary_weight)))
                }
            };
            if parent_of[c] == NOT_IN_PARENT {
                return ClusterTag::INVALID;
            }
            match &outcomes[p as usize] {
                ParentOutcome::Unchanged => compose(parent_main(p), inherited),
                ParentOutcome::Split { local, .. } => {
                    let ids = &out_ids[p as usize];
                    match local[local_of[c] as usize] {
                        LocalTag::Own(k) => compose(ids[k as usize], inherited),
                        LocalTag::Shared { primary, secondary, secondary_weight } => {
                            compose(ids[primary as usize], Some((ids[secondary as usize], secondary_weight)))
                        }
                        LocalTag::Unassigned => ClusterTag::INVALID,
                    }
                }
            }
        })
        .collect();

    compute_summaries(&new_tags, &mut new_summaries, cell_info, &constants.geometry);
    log::debug!(
        "splitter: {} of {} parents split, {} clusters out",
        n_split,
        n_parents,
        new_summaries.len()
    );
    SplitResult { tags: new_tags, summaries: new_summaries }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calocore::sampling::CaloSampling;
    use crate::cluster::classify::classify_and_score;
    use crate::cluster::growing::grow_clusters;
    use crate::cluster::pairs::build_pairs;
    use crate::sim::event::{line_event, EventGenerator};
    use crate::sim::geometry::{SyntheticCalorimeter, SyntheticLayer};

    const TWO_PEAKS: [f32; 9] = [6.0, 8.0, 20.0, 8.0, 5.0, 8.0, 15.0, 8.0, 6.0];

    fn split_options() -> TopoClusterOptions {
        let mut opts = TopoClusterOptions::default();
        opts.splitter.number_of_cells_cut = 2;
        opts.splitter.energy_cut = 5.0;
        opts
    }

    fn grow_and_split(constants: &ConstantData, info: &CellInfo, opts: &TopoClusterOptions) -> (SplitResult, SplitResult) {
        let c = classify_and_score(info, constants, opts);
        let edges = build_pairs(&c.labels, &constants.neighbors, &opts.growing.neighbors);
        let g = grow_clusters(&c.labels, &edges, info, constants, opts);
        let s = split_clusters(&g.tags, &g.summaries, info, constants, opts);
        (SplitResult { tags: g.tags, summaries: g.summaries }, s)
    }

    fn line(n: usize) -> ConstantData {
        SyntheticCalorimeter::line(n, CaloSampling::EMB2).constant_data().unwrap()
    }

    #[test]
    fn test_two_peaks_split_without_sharing() {
        let constants = line(9);
        let (grown, split) = grow_and_split(&constants, &line_event(&TWO_PEAKS), &split_options());
        assert_eq!(grown.summaries.iter().filter(|s| s.is_valid()).count(), 1);

        assert_eq!(split.summaries.len(), 2);
        assert_eq!(split.summaries[0].seed_cell, 2);
        assert_eq!(split.summaries[1].seed_cell, 6);
        let owners: Vec<_> = split.tags.iter().map(|t| t.state()).collect();
        for cell in 0..5 {
            assert_eq!(owners[cell], TagState::Exclusive(0), "cell {}", cell);
        }
        for cell in 5..9 {
            assert_eq!(owners[cell], TagState::Exclusive(1), "cell {}", cell);
        }
        assert!((split.summaries[0].energy - 47.0).abs() < 1e-4);
        assert!((split.summaries[1].energy - 37.0).abs() < 1e-4);
    }

    #[test]
    fn test_two_peaks_split_with_sharing() {
        let constants = line(9);
        let mut opts = split_options();
        opts.splitter.share_border_cells = true;
        let (_, split) = grow_and_split(&constants, &line_event(&TWO_PEAKS), &opts);
        match split.tags[4].state() {
            TagState::Shared { primary, secondary, secondary_weight } => {
                assert_eq!((primary, secondary), (0, 1));
                assert!((1.0 - secondary_weight - 36.0 / 67.0).abs() < 1e-5);
            }
            other => panic!("cell 4 should be shared, got {:?}", other),
        }
        let total: f32 = split.summaries.iter().map(|s| s.energy).sum();
        assert!((total - 84.0).abs() < 1e-3);
    }

    #[test]
    fn test_equal_neighboring_maxima_keep_the_lower_cell() {
        let constants = line(8);
        let mut opts = split_options();
        opts.splitter.number_of_cells_cut = 1;
        let info = line_event(&[6.0, 20.0, 20.0, 6.0, 5.0, 6.0, 15.0, 6.0]);
        let (_, split) = grow_and_split(&constants, &info, &opts);

        let seeds: Vec<i32> = split.summaries.iter().map(|s| s.seed_cell).collect();
        assert_eq!(seeds, vec![1, 6]);
        assert_eq!(split.tags[2].state(), TagState::Exclusive(0));
    }

    #[test]
    fn test_single_maximum_is_unchanged() {
        let constants = line(5);
        let (grown, split) = grow_and_split(&constants, &line_event(&[6.0, 8.0, 20.0, 8.0, 6.0]), &split_options());
        assert_eq!(grown.tags, split.tags);
        let surviving: Vec<_> = grown.summaries.iter().copied().filter(|s| s.is_valid()).collect();
        assert_eq!(surviving, split.summaries);
    }

    #[test]
    fn test_energy_cut_blocks_splitting() {
        // with the production energy cut nothing on this line qualifies
        let constants = line(9);
        let opts = TopoClusterOptions::default();
        let (grown, split) = grow_and_split(&constants, &line_event(&TWO_PEAKS), &opts);
        assert_eq!(grown.tags, split.tags);
    }

    #[test]
    fn test_inherited_sharing_survives() {
        let constants = line(3);
        let mut opts = split_options();
        opts.growing.share_border_cells = true;
        let (grown, split) = grow_and_split(&constants, &line_event(&[12.0, 1.5, 6.0]), &opts);
        assert!(grown.tags[1].is_shared());
        assert_eq!(grown.tags, split.tags);
    }

    #[test]
    fn test_capacity_drops_excess_split_clusters() {
        let constants = line(9);
        let mut opts = split_options();
        opts.max_clusters = 1;
        let (_, split) = grow_and_split(&constants, &line_event(&TWO_PEAKS), &opts);
        assert_eq!(split.summaries.len(), 1);
        assert!(split.tags[..5].iter().all(|t| t.state() == TagState::Exclusive(0)));
        assert!(split.tags[5..].iter().all(|t| !t.is_valid()));
    }

    fn two_layers() -> SyntheticCalorimeter {
        SyntheticCalorimeter::new(
            5,
            1,
            0.125,
            vec![
                SyntheticLayer::new(CaloSampling::EMB1, 1500.0),
                SyntheticLayer::new(CaloSampling::EMB2, 1700.0),
            ],
        )
    }

    #[test]
    fn test_secondary_maximum_near_primary_is_dropped() {
        let calo = two_layers();
        let constants = calo.constant_data().unwrap();
        let mut opts = split_options();
        opts.splitter.number_of_cells_cut = 1;

        // EMB1 peak at eta 1, EMB2 peak at eta 2: two steps apart
        let near = line_event(&[6.0, 20.0, 6.0, 6.0, 6.0, 6.0, 6.0, 30.0, 6.0, 6.0]);
        let (grown, split) = grow_and_split(&constants, &near, &opts);
        assert_eq!(grown.tags, split.tags);

        // EMB2 peak at eta 4: far enough for both to survive
        let far = line_event(&[6.0, 20.0, 6.0, 6.0, 6.0, 6.0, 6.0, 6.0, 6.0, 30.0]);
        let (_, split) = grow_and_split(&constants, &far, &opts);
        assert_eq!(split.summaries.len(), 2);
        assert_eq!(split.summaries[0].seed_cell, 1);
        assert_eq!(split.summaries[1].seed_cell, 9);
    }

    #[test]
    fn test_random_events_keep_weight_invariant() {
        let calo = SyntheticCalorimeter::barrel(16, 16).with_noise(vec![30.0, 90.0, 270.0]);
        let constants = calo.constant_data().unwrap();
        let mut opts = TopoClusterOptions::default();
        opts.growing.share_border_cells = true;
        opts.splitter.share_border_cells = true;
        let mut gen = EventGenerator::new(&calo, 21);
        for _ in 0..3 {
            let info = gen.random_event(6, 5_000.0, 60_000.0).unwrap();
            let (grown, split) = grow_and_split(&constants, &info, &opts);
            for (before, after) in grown.tags.iter().zip(&split.tags) {
                let m: Vec<_> = after.memberships().collect();
                assert!(m.len() <= 2);
                if !m.is_empty() {
                    let sum: f32 = m.iter().map(|&(_, w)| w).sum();
                    assert!((sum - 1.0).abs() < 1e-6);
                }
                // splitting never pulls in cells that were outside every cluster
                assert_eq!(before.is_valid(), after.is_valid());
            }
        }
    }
}
