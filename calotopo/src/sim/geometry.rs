// calotopo/src/sim/geometry.rs

use std::f64::consts::PI;

use calocore::error::Result;
use calocore::geometry::{CellDescriptor, CellGeometry, CellNoise, ConstantData};
use calocore::neighbors::{NeighborMask, NeighborOption, NeighborTable, NeighborTableBuilder};
use calocore::sampling::{CaloSampling, SubCalo};

use crate::pipeline::processor::ConstantSource;

/// One cylindrical layer of the synthetic calorimeter.
#[derive(Clone, Debug)]
pub struct SyntheticLayer {
    pub sampling: CaloSampling,
    /// Radius of the layer center (mm)
    pub radius: f32,
    pub hec_iw_or_fcal: bool,
}

impl SyntheticLayer {
    pub fn new(sampling: CaloSampling, radius: f32) -> Self {
        SyntheticLayer {
            sampling,
            radius,
            hec_iw_or_fcal: sampling.sub_calo() == SubCalo::LArFCal,
        }
    }
}

/// A toy calorimeter: every layer shares the same eta x phi grid and layers are
/// stacked radially, so cells line up across layers.
///
/// Cell ids run layer-major, then eta, then phi. Positions are flat in eta
/// (`z = r * eta`) which keeps neighboring cells equidistant along every axis.
#[derive(Clone, Debug)]
pub struct SyntheticCalorimeter {
    pub n_eta: usize,
    pub n_phi: usize,
    pub eta_max: f32,
    pub layers: Vec<SyntheticLayer>,
    /// Noise (MeV) of every cell, per gain
    pub noise_per_gain: Vec<f32>,
}

impl SyntheticCalorimeter {
    pub fn new(n_eta: usize, n_phi: usize, eta_max: f32, layers: Vec<SyntheticLayer>) -> Self {
        SyntheticCalorimeter {
            n_eta,
            n_phi,
            eta_max,
            layers,
            noise_per_gain: vec![1.0, 1.0, 1.0],
        }
    }

    /// Presampler plus the three EM barrel layers.
    pub fn barrel(n_eta: usize, n_phi: usize) -> Self {
        Self::new(
            n_eta,
            n_phi,
            1.4,
            vec![
                SyntheticLayer::new(CaloSampling::PreSamplerB, 1450.0),
                SyntheticLayer::new(CaloSampling::EMB1, 1550.0),
                SyntheticLayer::new(CaloSampling::EMB2, 1700.0),
                SyntheticLayer::new(CaloSampling::EMB3, 1900.0),
            ],
        )
        .with_noise(vec![40.0, 120.0, 360.0])
    }

    /// A single row of `n` cells along eta, unit noise.
    pub fn line(n: usize, sampling: CaloSampling) -> Self {
        Self::new(n, 1, 0.025 * n as f32, vec![SyntheticLayer::new(sampling, 1500.0)])
    }

    pub fn with_noise(mut self, noise_per_gain: Vec<f32>) -> Self {
        self.noise_per_gain = noise_per_gain;
        self
    }

    #[inline]
    pub fn n_cells(&self) -> usize {
        self.layers.len() * self.n_eta * self.n_phi
    }

    #[inline]
    pub fn cell_id(&self, layer: usize, ieta: usize, iphi: usize) -> u32 {
        ((layer * self.n_eta + ieta) * self.n_phi + iphi) as u32
    }

    #[inline]
    pub fn coords(&self, cell: u32) -> (usize, usize, usize) {
        let c = cell as usize;
        let iphi = c % self.n_phi;
        let ieta = (c / self.n_phi) % self.n_eta;
        let layer = c / (self.n_phi * self.n_eta);
        (layer, ieta, iphi)
    }

    #[inline]
    pub fn deta(&self) -> f64 {
        2.0 * self.eta_max as f64 / self.n_eta as f64
    }

    #[inline]
    pub fn dphi(&self) -> f64 {
        2.0 * PI / self.n_phi as f64
    }

    pub fn eta_of(&self, ieta: usize) -> f64 {
        -(self.eta_max as f64) + (ieta as f64 + 0.5) * self.deta()
    }

    pub fn phi_of(&self, iphi: usize) -> f64 {
        -PI + (iphi as f64 + 0.5) * self.dphi()
    }

    /// Nearest grid cell of an (eta, phi) direction, `None` outside the eta range.
    pub fn locate(&self, eta: f64, phi: f64) -> Option<(usize, usize)> {
        let fe = (eta + self.eta_max as f64) / self.deta();
        if !(0.0..self.n_eta as f64).contains(&fe) {
            return None;
        }
        let fp = (phi + PI).rem_euclid(2.0 * PI) / self.dphi();
        Some((fe as usize, (fp as usize).min(self.n_phi - 1)))
    }

    pub fn geometry(&self) -> CellGeometry {
        let mut g = CellGeometry::with_capacity(self.n_cells());
        let (deta, dphi) = (self.deta(), self.dphi());
        for layer in &self.layers {
            let r = layer.radius as f64;
            for ieta in 0..self.n_eta {
                let eta = self.eta_of(ieta);
                for iphi in 0..self.n_phi {
                    let phi = self.phi_of(iphi);
                    g.push(CellDescriptor {
                        x: (r * phi.cos()) as f32,
                        y: (r * phi.sin()) as f32,
                        z: (r * eta) as f32,
                        eta: eta as f32,
                        phi: phi as f32,
                        dx: (r * dphi) as f32,
                        dy: (r * dphi) as f32,
                        dz: (r * deta) as f32,
                        deta: deta as f32,
                        dphi: dphi as f32,
                        sampling: layer.sampling,
                        region: 0,
                        hec_iw_or_fcal: layer.hec_iw_or_fcal,
                    });
                }
            }
        }
        g
    }

    fn wrap_phi_index(&self, iphi: usize, step: isize) -> Option<usize> {
        if self.n_phi < 2 {
            return None;
        }
        Some(((iphi as isize + step).rem_euclid(self.n_phi as isize)) as usize)
    }

    fn shift_eta(&self, ieta: usize, step: isize) -> Option<usize> {
        let e = ieta as isize + step;
        (0..self.n_eta as isize).contains(&e).then_some(e as usize)
    }

    fn shift_layer(&self, layer: usize, step: isize) -> Option<usize> {
        let l = layer as isize + step;
        (0..self.layers.len() as isize).contains(&l).then_some(l as usize)
    }

    /// Block of cells around `(ieta, iphi)` in `layer`, one step in every direction.
    fn block(&self, layer: usize, ieta: usize, iphi: usize, out: &mut Vec<u32>) {
        for de in -1..=1isize {
            let Some(e) = self.shift_eta(ieta, de) else { continue };
            for dp in -1..=1isize {
                let p = if dp == 0 { Some(iphi) } else { self.wrap_phi_index(iphi, dp) };
                if let Some(p) = p {
                    out.push(self.cell_id(layer, e, p));
                }
            }
        }
    }

    fn option_neighbors(&self, cell: u32, opt: NeighborOption, out: &mut Vec<u32>) {
        let (layer, ieta, iphi) = self.coords(cell);
        match opt {
            NeighborOption::PrevInPhi | NeighborOption::NextInPhi => {
                let step = if opt == NeighborOption::PrevInPhi { -1 } else { 1 };
                if let Some(p) = self.wrap_phi_index(iphi, step) {
                    out.push(self.cell_id(layer, ieta, p));
                }
            }
            NeighborOption::PrevInEta | NeighborOption::NextInEta => {
                let step = if opt == NeighborOption::PrevInEta { -1 } else { 1 };
                if let Some(e) = self.shift_eta(ieta, step) {
                    out.push(self.cell_id(layer, e, iphi));
                }
            }
            NeighborOption::Corners2D => {
                for de in [-1isize, 1] {
                    for dp in [-1isize, 1] {
                        if let (Some(e), Some(p)) = (self.shift_eta(ieta, de), self.wrap_phi_index(iphi, dp)) {
                            out.push(self.cell_id(layer, e, p));
                        }
                    }
                }
            }
            NeighborOption::PrevInSamp | NeighborOption::NextInSamp => {
                let step = if opt == NeighborOption::PrevInSamp { -1 } else { 1 };
                if let Some(l) = self.shift_layer(layer, step) {
                    out.push(self.cell_id(l, ieta, iphi));
                }
            }
            NeighborOption::Corners3D => {
                for step in [-1isize, 1] {
                    if let Some(l) = self.shift_layer(layer, step) {
                        self.block(l, ieta, iphi, out);
                    }
                }
            }
            // a single sub-detector: no cross-detector relations
            NeighborOption::PrevSubDet
            | NeighborOption::NextSubDet
            | NeighborOption::PrevSuperCalo
            | NeighborOption::NextSuperCalo => {}
        }
    }

    /// Neighbors of `cell` under a (possibly composite) option mask, without duplicates.
    pub fn query(&self, cell: u32, mask: NeighborMask) -> Vec<u32> {
        let mut out = Vec::new();
        for opt in mask.options() {
            self.option_neighbors(cell, opt, &mut out);
        }
        let mut seen = std::collections::HashSet::with_capacity(out.len());
        out.retain(|&c| c != cell && seen.insert(c));
        out
    }

    pub fn neighbor_table(&self) -> NeighborTable {
        let geometry = self.geometry();
        NeighborTableBuilder::from_query(
            self.n_cells(),
            |cell, mask| self.query(cell, mask),
            |cell| (geometry.hec_iw_or_fcal[cell as usize], geometry.is_presampler(cell)),
        )
    }

    pub fn noise(&self) -> Result<CellNoise> {
        let n = self.n_cells();
        CellNoise::new(self.noise_per_gain.iter().map(|&v| vec![v; n]).collect())
    }

    pub fn constant_data(&self) -> Result<ConstantData> {
        ConstantData::new(self.geometry(), self.noise()?, self.neighbor_table())
    }
}

impl ConstantSource for SyntheticCalorimeter {
    fn load(&self) -> Result<ConstantData> {
        log::info!(
            "building synthetic calorimeter: {} layers x {} eta x {} phi",
            self.layers.len(),
            self.n_eta,
            self.n_phi
        );
        self.constant_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_and_coords() {
        let calo = SyntheticCalorimeter::barrel(6, 8);
        assert_eq!(calo.n_cells(), 4 * 6 * 8);
        let id = calo.cell_id(2, 3, 7);
        assert_eq!(calo.coords(id), (2, 3, 7));
        assert_eq!(calo.locate(calo.eta_of(3), calo.phi_of(7)), Some((3, 7)));
        assert_eq!(calo.locate(5.0, 0.0), None);
    }

    #[test]
    fn test_neighbor_table_faces_and_corners() {
        let calo = SyntheticCalorimeter::barrel(5, 6);
        let table = calo.neighbor_table();
        let c = calo.cell_id(2, 2, 0);

        let faces = table.neighbor_vec(c, NeighborMask::FACES_2D);
        assert_eq!(faces.len(), 4);
        // phi wraps around
        assert!(faces.contains(&calo.cell_id(2, 2, 5)));

        let corners = table.option_slice(c, NeighborOption::Corners2D);
        assert_eq!(corners.len(), 4);
        assert!(corners.iter().all(|n| !faces.contains(n)));

        assert_eq!(table.option_slice(c, NeighborOption::PrevInSamp), &[calo.cell_id(1, 2, 0)]);
        // the 3x3 blocks above and below minus the two direct samp neighbors
        assert_eq!(table.option_slice(c, NeighborOption::Corners3D).len(), 16);
        assert_eq!(table.offsets(c).total(), 4 + 4 + 2 + 16);
    }

    #[test]
    fn test_presampler_cells_are_flagged() {
        let calo = SyntheticCalorimeter::barrel(3, 4);
        let table = calo.neighbor_table();
        assert!(table.offsets(calo.cell_id(0, 1, 1)).is_limited_ps());
        assert!(!table.offsets(calo.cell_id(1, 1, 1)).is_limited_ps());
    }

    #[test]
    fn test_line_is_a_chain() {
        let calo = SyntheticCalorimeter::line(4, CaloSampling::EMB2);
        let table = calo.neighbor_table();
        assert_eq!(table.neighbor_vec(0, NeighborMask::SUPER_3D), vec![1]);
        let mut mid = table.neighbor_vec(2, NeighborMask::SUPER_3D);
        mid.sort();
        assert_eq!(mid, vec![1, 3]);
        let cd = calo.constant_data().unwrap();
        let g = &cd.geometry;
        let step = g.distance_to(1, g.position(0));
        assert!((g.distance_to(2, g.position(1)) - step).abs() < 1e-3);
    }
}
