// calotopo/src/cluster/compact.rs

use std::cmp::Reverse;

use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::Serialize;

use calocore::cluster::{Cluster, ClusterSummary};
use calocore::tag::ClusterTag;

use crate::cluster::options::OutputOptions;

/// Final clusters of one event, most energetic (in Et) first, with cell tags
/// renumbered to match.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ClusterOutput {
    pub clusters: Vec<Cluster>,
    pub tags: Vec<ClusterTag>,
}

impl ClusterOutput {
    #[inline]
    pub fn n_clusters(&self) -> usize {
        self.clusters.len()
    }
}

#[inline]
fn passes_cut(summary: &ClusterSummary, options: &OutputOptions) -> bool {
    let et = if options.cuts_in_abs_et { summary.et.abs() } else { summary.et };
    et > options.et_cut
}

/// Drop invalid, empty and below-cut clusters, order the rest by descending Et
/// (ties keep id order) and attach each cluster's `(cell, weight)` members.
pub fn compact_clusters(tags: &[ClusterTag], summaries: &[ClusterSummary], options: &OutputOptions) -> ClusterOutput {
    let mut kept: Vec<u32> = summaries
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_valid() && s.n_cells > 0 && passes_cut(s, options))
        .map(|(id, _)| id as u32)
        .collect();
    kept.sort_by_key(|&id| Reverse(OrderedFloat(summaries[id as usize].et)));

    let mut new_index = vec![None; summaries.len()];
    for (new, &old) in kept.iter().enumerate() {
        new_index[old as usize] = Some(new as u32);
    }

    let new_tags: Vec<ClusterTag> = tags
        .par_iter()
        .map(|t| t.remap(|id| new_index.get(id as usize).copied().flatten()))
        .collect();

    let mut clusters: Vec<Cluster> = kept
        .iter()
        .map(|&old| Cluster { summary: summaries[old as usize], cells: Vec::new() })
        .collect();
    for (cell, tag) in new_tags.iter().enumerate() {
        for (id, weight) in tag.memberships() {
            clusters[id as usize].cells.push((cell as u32, weight));
        }
    }

    ClusterOutput { clusters, tags: new_tags }
}
