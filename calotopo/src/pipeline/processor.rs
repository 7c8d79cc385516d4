// calotopo/src/pipeline/processor.rs

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use itertools::{Itertools, MinMaxResult};
use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use calocore::cell_info::CellInfo;
use calocore::error::{CaloError, Result};
use calocore::geometry::ConstantData;

use crate::cluster::compact::{compact_clusters, ClusterOutput};
use crate::cluster::options::{TopoClusterConfig, TopoClusterOptions};
use crate::pipeline::pool::{EventBufferPool, EventBuffers};
use crate::pipeline::stage::{default_stages, ClusterStage};

/// Provider of the geometry, noise and neighbor tables.
///
/// Called at most once per initialization of a [`HybridClusterProcessor`].
pub trait ConstantSource {
    fn load(&self) -> Result<ConstantData>;
}

impl<F> ConstantSource for F
where
    F: Fn() -> Result<ConstantData>,
{
    fn load(&self) -> Result<ConstantData> {
        self()
    }
}

enum ConstantState {
    Empty,
    Loading,
    Ready(Arc<ConstantData>),
}

/// Runs the clustering stages on events, sharing one copy of the constant tables.
///
/// Constant data is built lazily by the first event (or an explicit call to
/// [`HybridClusterProcessor::constants`]); concurrent callers wait for that single
/// load instead of starting their own. [`HybridClusterProcessor::release_constants`]
/// drops it again, events in flight keep their `Arc`.
pub struct HybridClusterProcessor {
    options: Arc<TopoClusterOptions>,
    stages: Vec<Box<dyn ClusterStage + Send + Sync>>,
    pool: EventBufferPool,
    constants: Mutex<ConstantState>,
    constants_ready: Condvar,
    source: Box<dyn ConstantSource + Send + Sync>,
}

impl HybridClusterProcessor {
    /// Build a processor from a configuration. Issues found while resolving it are
    /// logged and otherwise ignored.
    pub fn from_config<S>(config: &TopoClusterConfig, source: S) -> Self
    where
        S: ConstantSource + Send + Sync + 'static,
    {
        let (options, _issues) = config.resolve();
        Self::new(options, source)
    }

    pub fn new<S>(options: TopoClusterOptions, source: S) -> Self
    where
        S: ConstantSource + Send + Sync + 'static,
    {
        let options = Arc::new(options);
        let stages = default_stages(&options);
        Self::with_stages(options, stages, source)
    }

    /// Build a processor running `stages` in the given order.
    pub fn with_stages<S>(
        options: Arc<TopoClusterOptions>,
        stages: Vec<Box<dyn ClusterStage + Send + Sync>>,
        source: S,
    ) -> Self
    where
        S: ConstantSource + Send + Sync + 'static,
    {
        let pool = EventBufferPool::new(options.num_preallocated_buffers, options.allow_pool_growth);
        HybridClusterProcessor {
            options,
            stages,
            pool,
            constants: Mutex::new(ConstantState::Empty),
            constants_ready: Condvar::new(),
            source: Box::new(source),
        }
    }

    pub fn options(&self) -> &TopoClusterOptions {
        &self.options
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn pool(&self) -> &EventBufferPool {
        &self.pool
    }

    /// Shared constant data, loading it first if needed. A failed load is not
    /// cached; the next call tries again.
    ///
    /// The lock is not held while the source runs. Callers arriving during a load
    /// wait for it to finish.
    pub fn constants(&self) -> Result<Arc<ConstantData>> {
        let mut state = self.constants.lock();
        loop {
            match &*state {
                ConstantState::Ready(constants) => return Ok(Arc::clone(constants)),
                ConstantState::Loading => self.constants_ready.wait(&mut state),
                ConstantState::Empty => break,
            }
        }
        *state = ConstantState::Loading;
        drop(state);

        let start = Instant::now();
        let loaded = self.load_detached();

        let mut state = self.constants.lock();
        let result = match loaded {
            Ok(constants) => {
                let constants = Arc::new(constants);
                log::info!(
                    "constant data ready: {} cells, {} neighbor relations ({:.1?})",
                    constants.n_cells(),
                    constants.neighbors.total_neighbors(),
                    start.elapsed()
                );
                *state = ConstantState::Ready(Arc::clone(&constants));
                Ok(constants)
            }
            Err(e) => {
                *state = ConstantState::Empty;
                Err(e)
            }
        };
        drop(state);
        self.constants_ready.notify_all();
        result
    }

    /// Run the source on a scoped thread with a rayon pool of its own.
    ///
    /// The caller waits on a plain thread join. When it is a rayon worker it does not
    /// pick up queued events while the tables are built, and the source's parallel
    /// work does not compete with workers blocked in [`Self::constants`].
    fn load_detached(&self) -> Result<ConstantData> {
        let source = &*self.source;
        thread::scope(|scope| {
            scope
                .spawn(|| {
                    let pool = ThreadPoolBuilder::new()
                        .thread_name(|i| format!("calo-constants-{}", i))
                        .build()
                        .map_err(|e| CaloError::ConstantLoad(e.to_string()))?;
                    pool.install(|| source.load())
                })
                .join()
                .unwrap_or_else(|_| Err(CaloError::ConstantLoad("loader thread panicked".to_string())))
        })
    }

    pub fn has_constants(&self) -> bool {
        matches!(*self.constants.lock(), ConstantState::Ready(_))
    }

    /// Drop the processor's handle on the constant data. A load in progress is
    /// left alone.
    pub fn release_constants(&self) {
        let mut state = self.constants.lock();
        if let ConstantState::Ready(_) = *state {
            *state = ConstantState::Empty;
            log::info!("constant data released");
        }
    }

    fn run_event(&self, constants: &ConstantData, cell_info: &CellInfo, event: &mut EventBuffers) -> Result<ClusterOutput> {
        cell_info.validate(constants.n_cells())?;
        event.load(cell_info);
        for stage in &self.stages {
            let start = Instant::now();
            stage.run(constants, event)?;
            log::debug!("stage {} took {:.2?}", stage.name(), start.elapsed());
        }

        let start = Instant::now();
        let output = compact_clusters(&event.tags, &event.summaries, &self.options.output);
        log::debug!(
            "compacted {} clusters into {} ({:.2?})",
            event.summaries.len(),
            output.n_clusters(),
            start.elapsed()
        );
        Ok(output)
    }

    /// Cluster one event.
    ///
    /// The event's buffer comes from the pool, which blocks while a bounded pool is
    /// exhausted. Batches should go through [`Self::process_events`].
    ///
    /// # Arguments
    ///
    /// * `cell_info` - energies, gains, times and quality words of every cell
    ///
    /// # Returns
    ///
    /// * `ClusterOutput` - the event's clusters, most energetic first
    pub fn process_event(&self, cell_info: &CellInfo) -> Result<ClusterOutput> {
        let constants = self.constants()?;
        cell_info.validate(constants.n_cells())?;
        let mut event = self.pool.acquire();
        self.run_event(&constants, cell_info, &mut event)
    }

    /// Cluster a batch of events in parallel. A failing event is logged and yields an
    /// empty output; the other events are unaffected.
    ///
    /// Constant data is loaded once up front. Events run in chunks, each chunk with
    /// all of its buffers checked out before any of its events starts.
    pub fn process_events(&self, events: &[CellInfo]) -> Vec<ClusterOutput> {
        let constants = match self.constants() {
            Ok(constants) => constants,
            Err(e) => {
                log::error!("no constant data, {} events skipped: {}", events.len(), e);
                return vec![ClusterOutput::default(); events.len()];
            }
        };

        let width = if self.pool.allows_growth() {
            rayon::current_num_threads()
        } else {
            self.pool.capacity()
        }
        .max(1);

        let mut outputs = Vec::with_capacity(events.len());
        for (k, chunk) in events.chunks(width).enumerate() {
            let mut buffers = self.pool.acquire_many(chunk.len());
            let done: Vec<ClusterOutput> = chunk
                .par_iter()
                .zip(buffers.par_iter_mut())
                .enumerate()
                .map(|(j, (event, buffers))| {
                    self.run_event(&constants, event, buffers).unwrap_or_else(|e| {
                        log::error!("event {} failed: {}", k * width + j, e);
                        ClusterOutput::default()
                    })
                })
                .collect();
            outputs.extend(done);
        }

        match outputs.iter().map(|o| o.n_clusters()).minmax() {
            MinMaxResult::NoElements => {}
            MinMaxResult::OneElement(n) => log::debug!("1 event, {} clusters", n),
            MinMaxResult::MinMax(lo, hi) => {
                log::debug!("{} events, {} to {} clusters per event", outputs.len(), lo, hi)
            }
        }
        outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;
    use calocore::cell_info::GainState;
    use calocore::error::CaloError;
    use calocore::sampling::CaloSampling;
    use crate::sim::event::{line_event, EventGenerator};
    use crate::sim::geometry::SyntheticCalorimeter;

    fn counting_barrel(loads: &Arc<AtomicUsize>, options: TopoClusterOptions) -> HybridClusterProcessor {
        let counter = Arc::clone(loads);
        let calo = SyntheticCalorimeter::barrel(24, 16);
        let source = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            calo.constant_data()
        };
        HybridClusterProcessor::new(options, source)
    }

    fn barrel_events(n: usize) -> Vec<CellInfo> {
        let calo = SyntheticCalorimeter::barrel(24, 16);
        let mut gen = EventGenerator::new(&calo, 5);
        (0..n).map(|_| gen.random_event(2, 5_000.0, 20_000.0).unwrap()).collect()
    }

    /// Runs `work` on its own thread and fails the test if it has not finished in time.
    fn within_deadline<T: Send + 'static>(work: impl FnOnce() -> T + Send + 'static) -> T {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(work());
        });
        rx.recv_timeout(Duration::from_secs(120)).expect("clustering did not finish")
    }

    fn line_processor(n: usize) -> HybridClusterProcessor {
        HybridClusterProcessor::new(TopoClusterOptions::default(), SyntheticCalorimeter::line(n, CaloSampling::EMB2))
    }

    #[test]
    fn test_constants_are_loaded_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let source = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            SyntheticCalorimeter::line(8, CaloSampling::EMB2).constant_data()
        };
        let processor = HybridClusterProcessor::new(TopoClusterOptions::default(), source);
        assert!(!processor.has_constants());

        let events: Vec<CellInfo> = (0..16).map(|_| line_event(&[0.0, 6.0, 3.0, 0.0, 0.0, 0.0, 5.0, 0.0])).collect();
        let outputs = processor.process_events(&events);
        assert!(outputs.iter().all(|o| o.n_clusters() == 2));
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        processor.release_constants();
        assert!(!processor.has_constants());
        processor.constants().unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_load_is_retried() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let source = move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(CaloError::MissingConstants)
            } else {
                SyntheticCalorimeter::line(3, CaloSampling::EMB2).constant_data()
            }
        };
        let processor = HybridClusterProcessor::new(TopoClusterOptions::default(), source);
        assert!(processor.process_event(&line_event(&[5.0, 0.0, 0.0])).is_err());
        let out = processor.process_event(&line_event(&[5.0, 0.0, 0.0])).unwrap();
        assert_eq!(out.n_clusters(), 1);
    }

    #[test]
    fn test_invalid_gain_cell_is_never_clustered() {
        let processor = line_processor(5);
        let mut info = line_event(&[0.0, 6.0, 10.0, 6.0, 0.0]);
        info.gain[2] = GainState::INVALID;
        let out = processor.process_event(&info).unwrap();

        // the dead cell breaks the line into two clusters
        assert_eq!(out.n_clusters(), 2);
        assert!(!out.tags[2].is_valid());
        assert!(out.clusters.iter().all(|c| c.cells.iter().all(|&(cell, _)| cell != 2)));
    }

    #[test]
    fn test_bad_event_does_not_poison_the_batch() {
        let processor = line_processor(4);
        let events = vec![
            line_event(&[5.0, 0.0, 0.0, 0.0]),
            line_event(&[5.0, 0.0]),
            line_event(&[0.0, 0.0, 0.0, 5.0]),
        ];
        let outputs = processor.process_events(&events);
        let counts: Vec<_> = outputs.iter().map(|o| o.n_clusters()).collect();
        assert_eq!(counts, vec![1, 0, 1]);
        assert!(matches!(
            processor.process_event(&events[1]),
            Err(CaloError::CellCountMismatch { expected: 4, got: 2 })
        ));
    }

    #[test]
    fn test_barrel_events_are_reproducible() {
        let calo = SyntheticCalorimeter::barrel(24, 16);
        let mut gen = EventGenerator::new(&calo, 11);
        let events: Vec<CellInfo> = (0..6).map(|_| gen.random_event(3, 5_000.0, 50_000.0).unwrap()).collect();

        let processor = HybridClusterProcessor::new(TopoClusterOptions::default(), calo.clone());
        let first = processor.process_events(&events);
        let second = processor.process_events(&events);
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.n_clusters(), b.n_clusters());
            assert_eq!(a.tags, b.tags);
            for (x, y) in a.clusters.iter().zip(&b.clusters) {
                assert_eq!(x.summary, y.summary);
            }
            for w in a.clusters.windows(2) {
                assert!(w[0].summary.et >= w[1].summary.et);
            }
        }
        assert!(first.iter().any(|o| o.n_clusters() > 0));
    }

    #[test]
    fn test_custom_stage_list() {
        let options = Arc::new(TopoClusterOptions::default());
        let mut stages = default_stages(&options);
        stages.pop();
        let processor = HybridClusterProcessor::with_stages(options, stages, SyntheticCalorimeter::line(3, CaloSampling::EMB2));
        assert_eq!(processor.stage_names(), vec!["classify", "pairs", "grow"]);
        let out = processor.process_event(&line_event(&[0.0, 5.0, 0.0])).unwrap();
        assert_eq!(out.n_clusters(), 1);
    }

    #[test]
    fn test_batch_on_worker_pool_loads_once() {
        let events = Arc::new(barrel_events(32));
        for _ in 0..4 {
            let loads = Arc::new(AtomicUsize::new(0));
            let processor = Arc::new(counting_barrel(&loads, TopoClusterOptions::default()));
            let (p, ev) = (Arc::clone(&processor), Arc::clone(&events));
            let n_outputs = within_deadline(move || {
                let pool = rayon::ThreadPoolBuilder::new().num_threads(8).build().unwrap();
                pool.install(|| p.process_events(&ev)).len()
            });
            assert_eq!(n_outputs, 32);
            assert_eq!(loads.load(Ordering::SeqCst), 1);
            assert!(processor.has_constants());
        }
    }

    #[test]
    fn test_single_events_from_parallel_workers_share_one_load() {
        let events = Arc::new(barrel_events(24));
        let loads = Arc::new(AtomicUsize::new(0));
        let processor = Arc::new(counting_barrel(&loads, TopoClusterOptions::default()));
        let (p, ev) = (Arc::clone(&processor), Arc::clone(&events));
        let n_ok = within_deadline(move || {
            let pool = rayon::ThreadPoolBuilder::new().num_threads(8).build().unwrap();
            pool.install(|| ev.par_iter().filter(|e| p.process_event(e).is_ok()).count())
        });
        assert_eq!(n_ok, 24);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bounded_pool_batch_on_wide_worker_pool() {
        let mut options = TopoClusterOptions::default();
        options.num_preallocated_buffers = 2;
        options.allow_pool_growth = false;
        let loads = Arc::new(AtomicUsize::new(0));
        let processor = Arc::new(counting_barrel(&loads, options));
        let events = Arc::new(barrel_events(20));

        let (p, ev) = (Arc::clone(&processor), Arc::clone(&events));
        let n_outputs = within_deadline(move || {
            let pool = rayon::ThreadPoolBuilder::new().num_threads(8).build().unwrap();
            pool.install(|| p.process_events(&ev)).len()
        });
        assert_eq!(n_outputs, 20);
        assert_eq!(processor.pool().created(), 2);
        assert_eq!(processor.pool().idle(), 2);
    }
}
