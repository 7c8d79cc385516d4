// calotopo/src/sim/event.rs

use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::Normal;

use calocore::cell_info::{CellInfo, GainState, QualityProvenance};
use calocore::error::{CaloError, Result};

use crate::sim::geometry::SyntheticCalorimeter;

/// Dense event for a test line: gain 0, in time, LAr time information present.
pub fn line_event(energies: &[f32]) -> CellInfo {
    let n = energies.len();
    CellInfo {
        energy: energies.to_vec(),
        gain: vec![GainState::new(0); n],
        time: vec![0.0; n],
        quality_provenance: vec![QualityProvenance::new(0, QualityProvenance::LAR_TIME_AVAILABLE); n],
    }
}

/// A single electromagnetic-like shower.
#[derive(Clone, Debug)]
pub struct ShowerSpec {
    pub eta: f64,
    pub phi: f64,
    /// Total deposited energy (MeV)
    pub energy: f64,
    /// Lateral width in cells (Gaussian sigma)
    pub width: f64,
}

/// Generates random events on a [`SyntheticCalorimeter`].
pub struct EventGenerator<'a> {
    calo: &'a SyntheticCalorimeter,
    rng: StdRng,
    /// Fraction of the shower energy per layer, in layer order
    pub layer_fractions: Vec<f64>,
    /// Fraction of cells reported without a valid gain
    pub dead_fraction: f64,
    /// Time spread (ns)
    pub time_sigma: f64,
    /// Gain switch points (MeV): gain `i` is used below `gain_limits[i]`
    pub gain_limits: Vec<f64>,
}

impl<'a> EventGenerator<'a> {
    pub fn new(calo: &'a SyntheticCalorimeter, seed: u64) -> Self {
        let n_layers = calo.layers.len();
        let layer_fractions = match n_layers {
            4 => vec![0.05, 0.25, 0.6, 0.1],
            n => vec![1.0 / n.max(1) as f64; n],
        };
        EventGenerator {
            calo,
            rng: StdRng::seed_from_u64(seed),
            layer_fractions,
            dead_fraction: 0.0,
            time_sigma: 2.0,
            gain_limits: vec![20_000.0, 200_000.0],
        }
    }

    fn gain_for(&self, energy: f64) -> GainState {
        let g = self.gain_limits.iter().take_while(|&&lim| energy.abs() >= lim).count();
        GainState::new(g.min(self.calo.noise_per_gain.len().saturating_sub(1)) as u8)
    }

    pub fn random_shower(&mut self, min_energy: f64, max_energy: f64) -> ShowerSpec {
        let eta_max = self.calo.eta_max as f64 * 0.9;
        ShowerSpec {
            eta: self.rng.gen_range(-eta_max..eta_max),
            phi: self.rng.gen_range(-std::f64::consts::PI..std::f64::consts::PI),
            energy: self.rng.gen_range(min_energy..max_energy),
            width: self.rng.gen_range(0.6..1.4),
        }
    }

    /// Deposit the showers, add Gaussian noise for each cell's gain and
    /// randomize timing and dead channels.
    pub fn generate(&mut self, showers: &[ShowerSpec]) -> Result<CellInfo> {
        let calo = self.calo;
        let n = calo.n_cells();
        let mut energy = vec![0.0f64; n];

        for shower in showers {
            let Some((ce, cp)) = calo.locate(shower.eta, shower.phi) else {
                log::debug!("shower at eta {:.3} outside acceptance, skipped", shower.eta);
                continue;
            };
            let reach = (3.0 * shower.width).ceil() as isize;
            let mut profile = Vec::new();
            let mut norm = 0.0;
            for de in -reach..=reach {
                let e = ce as isize + de;
                if e < 0 || e >= calo.n_eta as isize {
                    continue;
                }
                for dp in -reach..=reach {
                    if calo.n_phi == 1 && dp != 0 {
                        continue;
                    }
                    let p = (cp as isize + dp).rem_euclid(calo.n_phi as isize) as usize;
                    let w = (-((de * de + dp * dp) as f64) / (2.0 * shower.width * shower.width)).exp();
                    profile.push((e as usize, p, w));
                    norm += w;
                }
            }
            for (layer, frac) in self.layer_fractions.iter().enumerate() {
                for &(e, p, w) in &profile {
                    energy[calo.cell_id(layer, e, p) as usize] += shower.energy * frac * w / norm;
                }
            }
        }

        let time_dist = Normal::new(0.0, self.time_sigma)
            .map_err(|e| CaloError::Config(format!("time spread: {}", e)))?;
        let noise_dists = calo
            .noise_per_gain
            .iter()
            .map(|&sigma| Normal::new(0.0, sigma as f64))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| CaloError::Config(format!("noise per gain: {}", e)))?;

        let mut info = CellInfo::empty(n);
        for cell in 0..n {
            if self.rng.gen::<f64>() < self.dead_fraction {
                continue;
            }
            let gain = self.gain_for(energy[cell]);
            let noisy = energy[cell] + noise_dists[gain.0 as usize].sample(&mut self.rng);
            info.energy[cell] = noisy as f32;
            info.gain[cell] = gain;
            info.time[cell] = time_dist.sample(&mut self.rng) as f32;
            info.quality_provenance[cell] = QualityProvenance::new(0, QualityProvenance::LAR_TIME_AVAILABLE);
        }
        Ok(info)
    }

    /// An event with `n_showers` random showers between `min_energy` and `max_energy` MeV.
    pub fn random_event(&mut self, n_showers: usize, min_energy: f64, max_energy: f64) -> Result<CellInfo> {
        let showers: Vec<ShowerSpec> = (0..n_showers)
            .map(|_| self.random_shower(min_energy, max_energy))
            .collect();
        self.generate(&showers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_event() {
        let info = line_event(&[1.0, 2.0]);
        assert!(info.validate(2).is_ok());
        assert!(info.quality_provenance[0].time_available(false));
    }

    #[test]
    fn test_generator_is_reproducible() {
        let calo = SyntheticCalorimeter::barrel(10, 12);
        let a = EventGenerator::new(&calo, 7).random_event(2, 5_000.0, 50_000.0).unwrap();
        let b = EventGenerator::new(&calo, 7).random_event(2, 5_000.0, 50_000.0).unwrap();
        assert_eq!(a.energy, b.energy);
        assert_eq!(a.n_cells(), calo.n_cells());
    }

    #[test]
    fn test_shower_energy_is_deposited() {
        let calo = SyntheticCalorimeter::barrel(10, 12).with_noise(vec![1e-3, 1e-3, 1e-3]);
        let mut gen = EventGenerator::new(&calo, 1);
        let shower = ShowerSpec { eta: 0.0, phi: 0.1, energy: 10_000.0, width: 1.0 };
        let info = gen.generate(&[shower]).unwrap();
        let total: f64 = info.energy.iter().map(|&e| e as f64).sum();
        assert!((total - 10_000.0).abs() < 1.0, "total {}", total);
        let (ce, cp) = calo.locate(0.0, 0.1).unwrap();
        let peak = calo.cell_id(2, ce, cp) as usize;
        assert!(info.energy[peak] > info.energy[calo.cell_id(2, ce, (cp + 2) % 12) as usize]);
    }

    #[test]
    fn test_dead_cells_have_invalid_gain() {
        let calo = SyntheticCalorimeter::barrel(4, 4);
        let mut gen = EventGenerator::new(&calo, 3);
        gen.dead_fraction = 1.0;
        let info = gen.generate(&[]).unwrap();
        assert!(info.gain.iter().all(|g| g.is_invalid()));
    }
}
