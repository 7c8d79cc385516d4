// calotopo/src/cluster/utility.rs

use std::f64::consts::PI;

/// Compressed adjacency lists over `n` nodes: `targets[starts[i]..starts[i + 1]]`
/// are the (sorted, unique) neighbors of node `i`.
#[derive(Clone, Debug, Default)]
pub struct Adjacency {
    starts: Vec<u32>,
    targets: Vec<u32>,
}

impl Adjacency {
    /// Directed lists: `from -> to` for every pair.
    pub fn directed<I>(n: usize, pairs: I) -> Self
    where
        I: IntoIterator<Item = (u32, u32)>,
    {
        let mut by_source: Vec<Vec<u32>> = vec![Vec::new(); n];
        for (a, b) in pairs {
            by_source[a as usize].push(b);
        }
        let mut starts = Vec::with_capacity(n + 1);
        let mut targets = Vec::new();
        starts.push(0u32);
        for mut row in by_source {
            row.sort_unstable();
            row.dedup();
            targets.extend_from_slice(&row);
            starts.push(targets.len() as u32);
        }
        Adjacency { starts, targets }
    }

    /// Symmetric lists: every pair is inserted in both directions, self loops dropped.
    pub fn undirected<I>(n: usize, pairs: I) -> Self
    where
        I: IntoIterator<Item = (u32, u32)>,
    {
        Self::directed(
            n,
            pairs
                .into_iter()
                .filter(|(a, b)| a != b)
                .flat_map(|(a, b)| [(a, b), (b, a)]),
        )
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.starts.len().saturating_sub(1)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn of(&self, node: u32) -> &[u32] {
        let i = node as usize;
        &self.targets[self.starts[i] as usize..self.starts[i + 1] as usize]
    }
}

/// Wrap an angle difference into `(-pi, pi]`.
#[inline]
pub fn wrap_phi(dphi: f64) -> f64 {
    let mut d = dphi % (2.0 * PI);
    if d > PI {
        d -= 2.0 * PI;
    } else if d <= -PI {
        d += 2.0 * PI;
    }
    d
}

/// Weight of the first cluster for a cell shared between two clusters.
///
/// `w1 = E1 / (E1 + r * E2)` with `r = exp(d1 - d2)`, where the distances are
/// measured from the cell to each cluster centroid in units of the shower scale.
/// Negative energies count as zero; a vanishing denominator splits evenly.
pub fn share_weight(energy_1: f64, dist_1: f64, energy_2: f64, dist_2: f64, scale: f64) -> f64 {
    let e1 = energy_1.max(0.0);
    let e2 = energy_2.max(0.0);
    let r = ((dist_1 - dist_2) / scale).exp();
    let denom = e1 + r * e2;
    if denom > 0.0 && denom.is_finite() {
        e1 / denom
    } else {
        0.5
    }
}

/// Order the two clusters of a shared cell as `(primary, secondary, secondary_weight)`.
/// The heavier weight is primary; equal weights go to the lower id.
#[inline]
pub fn order_shared(id_1: u32, w_1: f64, id_2: u32) -> (u32, u32, f32) {
    let w_2 = 1.0 - w_1;
    if w_1 > w_2 || (w_1 == w_2 && id_1 < id_2) {
        (id_1, id_2, w_2 as f32)
    } else {
        (id_2, id_1, w_1 as f32)
    }
}

/// Running |E|-weighted position, accumulated in f64.
#[derive(Clone, Copy, Debug, Default)]
pub struct Centroid {
    sum: [f64; 3],
    weight: f64,
}

impl Centroid {
    #[inline]
    pub fn add(&mut self, pos: [f64; 3], weight: f64) {
        for k in 0..3 {
            self.sum[k] += pos[k] * weight;
        }
        self.weight += weight;
    }

    /// Weighted mean position, or `fallback` if nothing with weight was added.
    #[inline]
    pub fn position_or(&self, fallback: [f64; 3]) -> [f64; 3] {
        if self.weight > 0.0 {
            [self.sum[0] / self.weight, self.sum[1] / self.weight, self.sum[2] / self.weight]
        } else {
            fallback
        }
    }
}
