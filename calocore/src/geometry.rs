use serde::{Deserialize, Serialize};

use crate::error::{CaloError, Result};
use crate::neighbors::NeighborTable;
use crate::sampling::{CaloSampling, SubCalo};

/// Description of a single cell, used to fill [`CellGeometry`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CellDescriptor {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub eta: f32,
    pub phi: f32,
    pub dx: f32,
    pub dy: f32,
    pub dz: f32,
    pub deta: f32,
    pub dphi: f32,
    pub sampling: CaloSampling,
    pub region: u8,
    /// HEC inner wheel or FCal cell (candidate for restricted neighbors).
    pub hec_iw_or_fcal: bool,
}

/// Static per-cell geometry, stored as parallel arrays indexed by cell id.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CellGeometry {
    pub x: Vec<f32>,
    pub y: Vec<f32>,
    pub z: Vec<f32>,
    pub eta: Vec<f32>,
    pub phi: Vec<f32>,
    pub dx: Vec<f32>,
    pub dy: Vec<f32>,
    pub dz: Vec<f32>,
    pub deta: Vec<f32>,
    pub dphi: Vec<f32>,
    pub sampling: Vec<CaloSampling>,
    pub region: Vec<u8>,
    pub hec_iw_or_fcal: Vec<bool>,
}

impl CellGeometry {
    pub fn with_capacity(n: usize) -> Self {
        CellGeometry {
            x: Vec::with_capacity(n),
            y: Vec::with_capacity(n),
            z: Vec::with_capacity(n),
            eta: Vec::with_capacity(n),
            phi: Vec::with_capacity(n),
            dx: Vec::with_capacity(n),
            dy: Vec::with_capacity(n),
            dz: Vec::with_capacity(n),
            deta: Vec::with_capacity(n),
            dphi: Vec::with_capacity(n),
            sampling: Vec::with_capacity(n),
            region: Vec::with_capacity(n),
            hec_iw_or_fcal: Vec::with_capacity(n),
        }
    }

    pub fn push(&mut self, d: CellDescriptor) -> u32 {
        self.x.push(d.x);
        self.y.push(d.y);
        self.z.push(d.z);
        self.eta.push(d.eta);
        self.phi.push(d.phi);
        self.dx.push(d.dx);
        self.dy.push(d.dy);
        self.dz.push(d.dz);
        self.deta.push(d.deta);
        self.dphi.push(d.dphi);
        self.sampling.push(d.sampling);
        self.region.push(d.region);
        self.hec_iw_or_fcal.push(d.hec_iw_or_fcal);
        (self.x.len() - 1) as u32
    }

    #[inline]
    pub fn n_cells(&self) -> usize {
        self.sampling.len()
    }

    /// All arrays must have the same length.
    pub fn validate(&self) -> Result<()> {
        let n = self.n_cells();
        let lengths = [
            ("geometry x", self.x.len()),
            ("geometry y", self.y.len()),
            ("geometry z", self.z.len()),
            ("geometry eta", self.eta.len()),
            ("geometry phi", self.phi.len()),
            ("geometry dx", self.dx.len()),
            ("geometry dy", self.dy.len()),
            ("geometry dz", self.dz.len()),
            ("geometry deta", self.deta.len()),
            ("geometry dphi", self.dphi.len()),
            ("geometry region", self.region.len()),
            ("geometry hec_iw_or_fcal", self.hec_iw_or_fcal.len()),
        ];
        for (what, len) in lengths {
            if len != n {
                return Err(CaloError::SizeMismatch { what, expected: n, got: len });
            }
        }
        Ok(())
    }

    #[inline]
    pub fn sub_calo(&self, cell: u32) -> SubCalo {
        self.sampling[cell as usize].sub_calo()
    }

    #[inline]
    pub fn is_tile(&self, cell: u32) -> bool {
        self.sampling[cell as usize].is_tile()
    }

    #[inline]
    pub fn is_presampler(&self, cell: u32) -> bool {
        self.sampling[cell as usize].is_presampler()
    }

    #[inline]
    pub fn position(&self, cell: u32) -> [f64; 3] {
        let c = cell as usize;
        [self.x[c] as f64, self.y[c] as f64, self.z[c] as f64]
    }

    /// Euclidean distance between a cell center and a point.
    #[inline]
    pub fn distance_to(&self, cell: u32, point: [f64; 3]) -> f64 {
        let p = self.position(cell);
        let (dx, dy, dz) = (p[0] - point[0], p[1] - point[1], p[2] - point[2]);
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Double-Gaussian noise shape parameters, carried for the Tile calorimeter.
///
/// Present so the tables keep the full noise description, but the clustering passes
/// always use the single-Gaussian `noise[gain][cell]` value.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DoubleGaussianNoise {
    pub sigma1: Vec<f32>,
    pub sigma2: Vec<f32>,
    pub ratio: Vec<f32>,
}

/// Per-gain cell noise in MeV, `noise[gain][cell]`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CellNoise {
    noise: Vec<Vec<f32>>,
    pub double_gaussian: Option<DoubleGaussianNoise>,
}

impl CellNoise {
    pub fn new(noise: Vec<Vec<f32>>) -> Result<Self> {
        if noise.is_empty() {
            return Err(CaloError::MissingInput("noise table has no gain entries"));
        }
        let n = noise[0].len();
        if let Some(bad) = noise.iter().find(|g| g.len() != n) {
            return Err(CaloError::SizeMismatch { what: "noise per gain", expected: n, got: bad.len() });
        }
        Ok(CellNoise { noise, double_gaussian: None })
    }

    #[inline]
    pub fn n_gains(&self) -> usize {
        self.noise.len()
    }

    #[inline]
    pub fn n_cells(&self) -> usize {
        self.noise.first().map_or(0, |g| g.len())
    }

    /// Noise for a cell at a gain index, `None` if the gain index is not tabulated.
    #[inline]
    pub fn get(&self, gain: usize, cell: u32) -> Option<f32> {
        self.noise.get(gain).map(|g| g[cell as usize])
    }
}

/// Run-constant data shared read-only by every event: geometry, noise and neighbors.
#[derive(Clone, Debug)]
pub struct ConstantData {
    pub geometry: CellGeometry,
    pub noise: CellNoise,
    pub neighbors: NeighborTable,
}

impl ConstantData {
    /// Assemble the constant tables, rejecting any size mismatch between them.
    pub fn new(geometry: CellGeometry, noise: CellNoise, neighbors: NeighborTable) -> Result<Self> {
        geometry.validate()?;
        let n = geometry.n_cells();
        if noise.n_cells() != n {
            return Err(CaloError::SizeMismatch { what: "noise", expected: n, got: noise.n_cells() });
        }
        if neighbors.n_cells() != n {
            return Err(CaloError::SizeMismatch { what: "neighbor table", expected: n, got: neighbors.n_cells() });
        }
        if let Some(dg) = &noise.double_gaussian {
            for (what, len) in [
                ("double gaussian sigma1", dg.sigma1.len()),
                ("double gaussian sigma2", dg.sigma2.len()),
                ("double gaussian ratio", dg.ratio.len()),
            ] {
                if len != n {
                    return Err(CaloError::SizeMismatch { what, expected: n, got: len });
                }
            }
        }
        log::info!(
            "constant data: {} cells, {} gains, {} neighbor entries",
            n,
            noise.n_gains(),
            neighbors.total_neighbors()
        );
        Ok(ConstantData { geometry, noise, neighbors })
    }

    #[inline]
    pub fn n_cells(&self) -> usize {
        self.geometry.n_cells()
    }
}
