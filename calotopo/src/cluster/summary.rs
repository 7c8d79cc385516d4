// calotopo/src/cluster/summary.rs

use calocore::cell_info::CellInfo;
use calocore::cluster::ClusterSummary;
use calocore::geometry::CellGeometry;
use calocore::tag::ClusterTag;

use crate::cluster::utility::wrap_phi;

#[derive(Clone, Copy, Default)]
struct Accumulator {
    energy: f64,
    abs_weight: f64,
    eta: f64,
    dphi: f64,
    n_cells: u32,
}

/// Recompute the kinematics of every valid cluster from the cell tags.
///
/// Energy is the weighted sum of cell energies. Eta and phi are weighted by
/// `|E| * w`, with phi taken relative to the seed cell so clusters straddling the
/// phi boundary come out right. `Et = E / cosh(eta)`. Cells are visited in id order
/// and summed in f64, so the result does not depend on thread scheduling.
pub fn compute_summaries(
    tags: &[ClusterTag],
    summaries: &mut [ClusterSummary],
    cell_info: &CellInfo,
    geometry: &CellGeometry,
) {
    let mut acc = vec![Accumulator::default(); summaries.len()];

    for (cell, tag) in tags.iter().enumerate() {
        for (id, weight) in tag.memberships() {
            let id = id as usize;
            let Some(summary) = summaries.get(id) else { continue };
            if !summary.is_valid() {
                continue;
            }
            let seed_phi = geometry.phi[summary.seed_cell as usize] as f64;
            let e = cell_info.energy[cell] as f64;
            let w = weight as f64;
            let a = &mut acc[id];
            a.energy += w * e;
            a.abs_weight += w * e.abs();
            a.eta += w * e.abs() * geometry.eta[cell] as f64;
            a.dphi += w * e.abs() * wrap_phi(geometry.phi[cell] as f64 - seed_phi);
            a.n_cells += 1;
        }
    }

    for (summary, a) in summaries.iter_mut().zip(acc) {
        if !summary.is_valid() {
            continue;
        }
        let seed = summary.seed_cell as usize;
        let (eta, phi) = if a.abs_weight > 0.0 {
            let seed_phi = geometry.phi[seed] as f64;
            (a.eta / a.abs_weight, wrap_phi(seed_phi + a.dphi / a.abs_weight))
        } else {
            (geometry.eta[seed] as f64, geometry.phi[seed] as f64)
        };
        summary.energy = a.energy as f32;
        summary.eta = eta as f32;
        summary.phi = phi as f32;
        summary.et = (a.energy / eta.cosh()) as f32;
        summary.n_cells = a.n_cells;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calocore::sampling::CaloSampling;
    use crate::sim::event::line_event;
    use crate::sim::geometry::{SyntheticCalorimeter, SyntheticLayer};

    #[test]
    fn test_weighted_summary() {
        let calo = SyntheticCalorimeter::line(3, CaloSampling::EMB2);
        let geometry = calo.geometry();
        let info = line_event(&[10.0, 30.0, 20.0]);
        let tags = vec![
            ClusterTag::exclusive(0),
            ClusterTag::exclusive(0),
            ClusterTag::shared(0, 1, 0.25),
        ];
        let mut summaries = vec![ClusterSummary::seeded(1), ClusterSummary::seeded(2)];
        compute_summaries(&tags, &mut summaries, &info, &geometry);

        assert!((summaries[0].energy - 55.0).abs() < 1e-4);
        assert!((summaries[1].energy - 5.0).abs() < 1e-4);
        assert_eq!(summaries[0].n_cells, 3);
        assert_eq!(summaries[1].n_cells, 1);
        assert!((summaries[1].eta - geometry.eta[2]).abs() < 1e-6);
        let expected_eta = (10.0 * geometry.eta[0] + 30.0 * geometry.eta[1] + 15.0 * geometry.eta[2]) / 55.0;
        assert!((summaries[0].eta - expected_eta).abs() < 1e-5);
        let et = 55.0 / (expected_eta as f64).cosh();
        assert!((summaries[0].et as f64 - et).abs() < 1e-3);
    }

    #[test]
    fn test_phi_wraps_around_seed() {
        let calo = SyntheticCalorimeter::new(1, 4, 0.1, vec![SyntheticLayer::new(CaloSampling::EMB2, 1500.0)]);
        let geometry = calo.geometry();
        let info = line_event(&[5.0, 0.0, 0.0, 5.0]);
        // cells 0 and 3 sit on either side of the phi = +-pi boundary
        let tags = vec![ClusterTag::exclusive(0), ClusterTag::INVALID, ClusterTag::INVALID, ClusterTag::exclusive(0)];
        let mut summaries = vec![ClusterSummary::seeded(0)];
        compute_summaries(&tags, &mut summaries, &info, &geometry);
        assert!((summaries[0].phi.abs() - std::f32::consts::PI).abs() < 1e-5);
    }

    #[test]
    fn test_invalid_summaries_are_left_alone() {
        let calo = SyntheticCalorimeter::line(2, CaloSampling::EMB2);
        let geometry = calo.geometry();
        let info = line_event(&[1.0, 1.0]);
        let tags = vec![ClusterTag::exclusive(0), ClusterTag::exclusive(0)];
        let mut summaries = vec![ClusterSummary::default()];
        compute_summaries(&tags, &mut summaries, &info, &geometry);
        assert_eq!(summaries[0], ClusterSummary::default());
    }
}
