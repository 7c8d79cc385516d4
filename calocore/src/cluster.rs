use serde::{Deserialize, Serialize};

/// Kinematic summary of one cluster id.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub energy: f32,
    pub et: f32,
    pub eta: f32,
    pub phi: f32,
    /// Cell that spawned the cluster, `-1` once the id is absorbed or dropped.
    pub seed_cell: i32,
    pub n_cells: u32,
}

impl ClusterSummary {
    pub fn seeded(seed_cell: u32) -> Self {
        ClusterSummary { seed_cell: seed_cell as i32, ..ClusterSummary::default() }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.seed_cell >= 0
    }

    #[inline]
    pub fn invalidate(&mut self) {
        self.seed_cell = -1;
    }
}

impl Default for ClusterSummary {
    fn default() -> Self {
        ClusterSummary {
            energy: 0.0,
            et: 0.0,
            eta: 0.0,
            phi: 0.0,
            seed_cell: -1,
            n_cells: 0,
        }
    }
}

/// A final, compacted cluster with its weighted cell membership.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cluster {
    pub summary: ClusterSummary,
    /// `(cell, weight)` in ascending cell order.
    pub cells: Vec<(u32, f32)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_and_invalidate() {
        let mut s = ClusterSummary::seeded(17);
        assert!(s.is_valid());
        assert_eq!(s.seed_cell, 17);
        s.invalidate();
        assert!(!s.is_valid());
        assert!(!ClusterSummary::default().is_valid());
    }
}
