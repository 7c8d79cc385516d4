// calotopo/src/cluster/growing.rs

use std::cmp::Reverse;

use ordered_float::OrderedFloat;
use rayon::prelude::*;

use calocore::cell_info::CellInfo;
use calocore::cluster::ClusterSummary;
use calocore::geometry::ConstantData;
use calocore::tag::ClusterTag;

use crate::cluster::classify::CellClass;
use crate::cluster::options::TopoClusterOptions;
use crate::cluster::pairs::EdgeList;
use crate::cluster::summary::compute_summaries;
use crate::cluster::utility::{order_shared, share_weight, Adjacency, Centroid};

/// Label of a cell that belongs to no cluster.
pub const NO_CLUSTER: u32 = u32::MAX;

/// Cell tags and per-id summaries after growing. Ids absorbed by a lower id stay
/// in `summaries` with `seed_cell == -1`.
#[derive(Clone, Debug, Default)]
pub struct GrowResult {
    pub tags: Vec<ClusterTag>,
    pub summaries: Vec<ClusterSummary>,
}

/// Synchronous min-label sweeps over the core adjacency until nothing changes.
///
/// Every sweep reads only the previous labels. After taking the minimum over its
/// neighbors a cell also looks up the current label of the seed cell owning that
/// minimum, which lets labels jump along chains instead of creeping one cell per
/// sweep. Returns the number of sweeps.
fn propagate_labels(
    core: &Adjacency,
    labels: &[CellClass],
    seed_cell_of: &[u32],
    current: &mut Vec<u32>,
) -> usize {
    let mut next = current.clone();
    let mut sweeps = 0usize;
    loop {
        sweeps += 1;
        let prev: &[u32] = &current[..];
        let changed: usize = next
            .par_iter_mut()
            .enumerate()
            .map(|(c, out)| {
                let mut best = prev[c];
                if labels[c].is_growable() {
                    for &nb in core.of(c as u32) {
                        best = best.min(prev[nb as usize]);
                    }
                    if best != NO_CLUSTER {
                        best = best.min(prev[seed_cell_of[best as usize] as usize]);
                    }
                }
                *out = best;
                usize::from(best != prev[c])
            })
            .sum();
        std::mem::swap(current, &mut next);
        if changed == 0 {
            return sweeps;
        }
    }
}

/// Grow clusters from seeds through growing cells and attach terminal cells.
///
/// 1. Seeds spawn ids in ascending cell order, at most `max_clusters` of them.
/// 2. Seed and growing cells connected through edges merge; the lowest id survives.
/// 3. A terminal cell next to one cluster joins it. Next to several, it goes to the
///    most energetic one, or is shared between the two most energetic ones when
///    border sharing is enabled.
///
/// The result does not depend on the order of `edges.pairs`.
pub fn grow_clusters(
    labels: &[CellClass],
    edges: &EdgeList,
    cell_info: &CellInfo,
    constants: &ConstantData,
    options: &TopoClusterOptions,
) -> GrowResult {
    let n = labels.len();
    debug_assert_eq!(n, cell_info.n_cells());

    let mut seed_cell_of: Vec<u32> = Vec::new();
    let mut label = vec![NO_CLUSTER; n];
    let mut surplus = 0usize;
    for (c, &class) in labels.iter().enumerate() {
        if class != CellClass::Seed {
            continue;
        }
        if seed_cell_of.len() < options.max_clusters {
            label[c] = seed_cell_of.len() as u32;
            seed_cell_of.push(c as u32);
        } else {
            surplus += 1;
        }
    }
    if surplus > 0 {
        log::warn!(
            "cluster capacity {} reached, {} further seeds treated as growing cells",
            options.max_clusters,
            surplus
        );
    }

    let core = Adjacency::undirected(
        n,
        edges
            .pairs
            .iter()
            .copied()
            .filter(|&(a, b)| labels[a as usize].is_growable() && labels[b as usize].is_growable()),
    );
    let sweeps = propagate_labels(&core, labels, &seed_cell_of, &mut label);

    let mut summaries: Vec<ClusterSummary> = seed_cell_of
        .iter()
        .enumerate()
        .map(|(id, &cell)| {
            if label[cell as usize] == id as u32 {
                ClusterSummary::seeded(cell)
            } else {
                ClusterSummary::default()
            }
        })
        .collect();
    log::debug!(
        "growing: {} seeds, {} clusters after {} sweeps",
        seed_cell_of.len(),
        summaries.iter().filter(|s| s.is_valid()).count(),
        sweeps
    );

    // core energies and |E|-weighted centroids, summed in cell order
    let geometry = &constants.geometry;
    let mut core_energy = vec![0.0f64; seed_cell_of.len()];
    let mut centroid = vec![Centroid::default(); seed_cell_of.len()];
    for (c, &l) in label.iter().enumerate() {
        if l == NO_CLUSTER {
            continue;
        }
        let e = cell_info.energy[c] as f64;
        core_energy[l as usize] += e;
        centroid[l as usize].add(geometry.position(c as u32), e.abs());
    }

    let incoming = Adjacency::directed(
        n,
        edges
            .pairs
            .iter()
            .copied()
            .filter(|&(_, t)| labels[t as usize] == CellClass::Terminal)
            .map(|(s, t)| (t, s)),
    );

    let g = &options.growing;
    let tags: Vec<ClusterTag> = (0..n)
        .into_par_iter()
        .map(|c| {
            if labels[c].is_growable() {
                return if label[c] == NO_CLUSTER { ClusterTag::INVALID } else { ClusterTag::exclusive(label[c]) };
            }
            if labels[c] != CellClass::Terminal {
                return ClusterTag::INVALID;
            }
            let mut near: Vec<u32> = incoming
                .of(c as u32)
                .iter()
                .map(|&s| label[s as usize])
                .filter(|&l| l != NO_CLUSTER)
                .collect();
            near.sort_unstable();
            near.dedup();
            match near.len() {
                0 => ClusterTag::INVALID,
                1 => ClusterTag::exclusive(near[0]),
                _ => {
                    near.sort_by_key(|&id| (Reverse(OrderedFloat(core_energy[id as usize])), id));
                    let (first, second) = (near[0], near[1]);
                    if !g.share_border_cells {
                        return ClusterTag::exclusive(first);
                    }
                    let fallback = |id: u32| geometry.position(seed_cell_of[id as usize]);
                    let d1 = geometry.distance_to(c as u32, centroid[first as usize].position_or(fallback(first)));
                    let d2 = geometry.distance_to(c as u32, centroid[second as usize].position_or(fallback(second)));
                    let w1 = share_weight(
                        core_energy[first as usize],
                        d1,
                        core_energy[second as usize],
                        d2,
                        g.em_shower_scale as f64,
                    );
                    let (primary, secondary, w) = order_shared(first, w1, second);
                    ClusterTag::shared(primary, secondary, w)
                }
            }
        })
        .collect();

    compute_summaries(&tags, &mut summaries, cell_info, geometry);
    GrowResult { tags, summaries }
}
