// calotopo/src/cluster/pairs.rs

use rayon::prelude::*;

use calocore::neighbors::NeighborTable;

use crate::cluster::classify::CellClass;
use crate::cluster::options::NeighborSelection;

/// Directed growth edges `(source, target)`: the source is a seed or growing cell,
/// the target any non-ignored neighbor. Edges leaving seed cells come first.
#[derive(Clone, Debug, Default)]
pub struct EdgeList {
    pub pairs: Vec<(u32, u32)>,
    pub seed_edge_count: usize,
}

impl EdgeList {
    #[inline]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn seed_edges(&self) -> &[(u32, u32)] {
        &self.pairs[..self.seed_edge_count]
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
        self.seed_edge_count = 0;
    }
}

fn edges_from(
    class: CellClass,
    labels: &[CellClass],
    table: &NeighborTable,
    selection: &NeighborSelection,
) -> Vec<(u32, u32)> {
    (0..labels.len() as u32)
        .into_par_iter()
        .filter(|&c| labels[c as usize] == class)
        .flat_map_iter(|c| {
            selection
                .neighbors(table, c)
                .filter(|&n| labels[n as usize] != CellClass::Ignored)
                .map(move |n| (c, n))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Build the growth edges of an event into `out`.
pub fn build_pairs_into(
    labels: &[CellClass],
    table: &NeighborTable,
    selection: &NeighborSelection,
    out: &mut EdgeList,
) {
    debug_assert_eq!(labels.len(), table.n_cells());
    out.clear();
    out.pairs.extend(edges_from(CellClass::Seed, labels, table, selection));
    out.seed_edge_count = out.pairs.len();
    out.pairs.extend(edges_from(CellClass::Grow, labels, table, selection));
}

/// Enumerate the neighbor relations along which clusters may grow.
pub fn build_pairs(labels: &[CellClass], table: &NeighborTable, selection: &NeighborSelection) -> EdgeList {
    let mut out = EdgeList::default();
    build_pairs_into(labels, table, selection, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use calocore::neighbors::NeighborMask;
    use calocore::sampling::CaloSampling;
    use crate::sim::geometry::{SyntheticCalorimeter, SyntheticLayer};

    #[test]
    fn test_line_edges_seed_first() {
        let table = SyntheticCalorimeter::line(4, CaloSampling::EMB2).neighbor_table();
        let labels = vec![CellClass::Grow, CellClass::Seed, CellClass::Terminal, CellClass::Ignored];
        let edges = build_pairs(&labels, &table, &NeighborSelection::new(NeighborMask::SUPER_3D));
        assert_eq!(edges.seed_edge_count, 2);
        let mut seed: Vec<_> = edges.seed_edges().to_vec();
        seed.sort();
        assert_eq!(seed, vec![(1, 0), (1, 2)]);
        assert_eq!(&edges.pairs[2..], &[(0, 1)]);
        // terminal and ignored cells never originate edges, ignored ones never receive
        assert!(edges.pairs.iter().all(|&(a, b)| a < 2 && b != 3));
    }

    #[test]
    fn test_empty_event_has_no_edges() {
        let table = SyntheticCalorimeter::line(3, CaloSampling::EMB2).neighbor_table();
        let labels = vec![CellClass::Terminal; 3];
        let edges = build_pairs(&labels, &table, &NeighborSelection::new(NeighborMask::SUPER_3D));
        assert!(edges.is_empty());
        assert_eq!(edges.seed_edge_count, 0);
    }

    #[test]
    fn test_presampler_restriction() {
        // two layers of a single cell: presampler below EMB1
        let calo = SyntheticCalorimeter::new(
            1,
            1,
            0.1,
            vec![
                SyntheticLayer::new(CaloSampling::PreSamplerB, 1400.0),
                SyntheticLayer::new(CaloSampling::EMB1, 1500.0),
            ],
        );
        let table = calo.neighbor_table();
        let labels = vec![CellClass::Seed, CellClass::Seed];

        let mut sel = NeighborSelection::new(NeighborMask::ALL_3D);
        assert_eq!(build_pairs(&labels, &table, &sel).len(), 2);
        sel.restrict_ps = true;
        assert!(build_pairs(&labels, &table, &sel).is_empty());
        sel.restrict_ps = false;
        sel.mask = NeighborMask::ALL_2D;
        assert!(build_pairs(&labels, &table, &sel).is_empty());
    }
}
