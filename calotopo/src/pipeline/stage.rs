// calotopo/src/pipeline/stage.rs

use std::sync::Arc;

use calocore::error::{CaloError, Result};
use calocore::geometry::ConstantData;

use crate::cluster::classify::{classify_into, CellClass};
use crate::cluster::growing::grow_clusters;
use crate::cluster::options::TopoClusterOptions;
use crate::cluster::pairs::build_pairs_into;
use crate::cluster::splitter::split_clusters;
use crate::pipeline::pool::EventBuffers;

/// One pass of the clustering chain, reading and writing the event's buffers.
pub trait ClusterStage {
    fn name(&self) -> &'static str;

    fn run(&self, constants: &ConstantData, event: &mut EventBuffers) -> Result<()>;
}

fn expect_len(what: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(CaloError::SizeMismatch { what, expected, got })
    }
}

// ---------------------------------------------------------------------------------

pub struct ClassifyStage {
    options: Arc<TopoClusterOptions>,
}

impl ClassifyStage {
    pub fn new(options: Arc<TopoClusterOptions>) -> Self {
        ClassifyStage { options }
    }
}

impl ClusterStage for ClassifyStage {
    fn name(&self) -> &'static str {
        "classify"
    }

    fn run(&self, constants: &ConstantData, event: &mut EventBuffers) -> Result<()> {
        expect_len("cell info", constants.n_cells(), event.cell_info.n_cells())?;
        classify_into(&event.cell_info, constants, &self.options, &mut event.classification);
        log::debug!(
            "classified {} cells: {} seeds, {} growing, {} terminal",
            event.classification.n_cells(),
            event.classification.count(CellClass::Seed),
            event.classification.count(CellClass::Grow),
            event.classification.count(CellClass::Terminal),
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------------

pub struct PairsStage {
    options: Arc<TopoClusterOptions>,
}

impl PairsStage {
    pub fn new(options: Arc<TopoClusterOptions>) -> Self {
        PairsStage { options }
    }
}

impl ClusterStage for PairsStage {
    fn name(&self) -> &'static str {
        "pairs"
    }

    fn run(&self, constants: &ConstantData, event: &mut EventBuffers) -> Result<()> {
        expect_len("cell labels", constants.n_cells(), event.classification.n_cells())?;
        build_pairs_into(
            &event.classification.labels,
            &constants.neighbors,
            &self.options.growing.neighbors,
            &mut event.edges,
        );
        log::debug!("{} growth edges ({} from seeds)", event.edges.len(), event.edges.seed_edge_count);
        Ok(())
    }
}

// ---------------------------------------------------------------------------------

pub struct GrowStage {
    options: Arc<TopoClusterOptions>,
}

impl GrowStage {
    pub fn new(options: Arc<TopoClusterOptions>) -> Self {
        GrowStage { options }
    }
}

impl ClusterStage for GrowStage {
    fn name(&self) -> &'static str {
        "grow"
    }

    fn run(&self, constants: &ConstantData, event: &mut EventBuffers) -> Result<()> {
        expect_len("cell labels", constants.n_cells(), event.classification.n_cells())?;
        let grown = grow_clusters(
            &event.classification.labels,
            &event.edges,
            &event.cell_info,
            constants,
            &self.options,
        );
        event.tags = grown.tags;
        event.summaries = grown.summaries;
        Ok(())
    }
}

// ---------------------------------------------------------------------------------

/// Splits grown clusters around their local maxima. A no-op when splitting is
/// disabled in the options.
pub struct SplitStage {
    options: Arc<TopoClusterOptions>,
}

impl SplitStage {
    pub fn new(options: Arc<TopoClusterOptions>) -> Self {
        SplitStage { options }
    }
}

impl ClusterStage for SplitStage {
    fn name(&self) -> &'static str {
        "split"
    }

    fn run(&self, constants: &ConstantData, event: &mut EventBuffers) -> Result<()> {
        if !self.options.splitter.enabled {
            return Ok(());
        }
        expect_len("cell tags", constants.n_cells(), event.tags.len())?;
        let split = split_clusters(&event.tags, &event.summaries, &event.cell_info, constants, &self.options);
        event.tags = split.tags;
        event.summaries = split.summaries;
        Ok(())
    }
}

/// Classification, pair construction, growing and splitting, in that order.
pub fn default_stages(options: &Arc<TopoClusterOptions>) -> Vec<Box<dyn ClusterStage + Send + Sync>> {
    vec![
        Box::new(ClassifyStage::new(Arc::clone(options))),
        Box::new(PairsStage::new(Arc::clone(options))),
        Box::new(GrowStage::new(Arc::clone(options))),
        Box::new(SplitStage::new(Arc::clone(options))),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use calocore::sampling::CaloSampling;
    use crate::cluster::options::TopoClusterConfig;
    use crate::sim::event::line_event;
    use crate::sim::geometry::SyntheticCalorimeter;

    fn run_all(options: TopoClusterOptions, energies: &[f32]) -> EventBuffers {
        let constants = SyntheticCalorimeter::line(energies.len(), CaloSampling::EMB2).constant_data().unwrap();
        let options = Arc::new(options);
        let mut event = EventBuffers::default();
        event.load(&line_event(energies));
        for stage in default_stages(&options) {
            stage.run(&constants, &mut event).unwrap();
        }
        event
    }

    #[test]
    fn test_stage_order() {
        let options = Arc::new(TopoClusterOptions::default());
        let names: Vec<_> = default_stages(&options).iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["classify", "pairs", "grow", "split"]);
    }

    #[test]
    fn test_chain_on_a_line() {
        let event = run_all(TopoClusterOptions::default(), &[0.0, 5.0, 3.0, 0.0, 0.0, 4.5, 0.0]);
        assert_eq!(event.classification.count(CellClass::Seed), 2);
        let valid = event.summaries.iter().filter(|s| s.is_valid()).count();
        assert_eq!(valid, 2);
        assert_eq!(event.tags[1].primary(), event.tags[2].primary());
        assert_ne!(event.tags[1].primary(), event.tags[5].primary());
        assert!(!event.tags[3].is_valid());
    }

    #[test]
    fn test_disabled_splitter_keeps_grown_clusters() {
        let mut config = TopoClusterConfig::default();
        config.splitter.enabled = false;
        let (options, _) = config.resolve();
        let constants = SyntheticCalorimeter::line(3, CaloSampling::EMB2).constant_data().unwrap();
        let mut event = EventBuffers::default();
        event.load(&line_event(&[5.0, 5.0, 5.0]));
        event.tags = vec![Default::default(); 1];
        // a disabled splitter does not even look at the buffers
        SplitStage::new(Arc::new(options)).run(&constants, &mut event).unwrap();
        assert_eq!(event.tags.len(), 1);
    }

    #[test]
    fn test_wrong_cell_count_is_an_error() {
        let constants = SyntheticCalorimeter::line(4, CaloSampling::EMB2).constant_data().unwrap();
        let mut event = EventBuffers::default();
        event.load(&line_event(&[5.0, 5.0]));
        let stage = ClassifyStage::new(Arc::new(TopoClusterOptions::default()));
        let err = stage.run(&constants, &mut event).unwrap_err();
        assert!(matches!(err, CaloError::SizeMismatch { expected: 4, got: 2, .. }));
    }
}
