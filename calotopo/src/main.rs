// calotopo/src/main.rs

use std::error::Error;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use flexi_logger::Logger;
use rayon::ThreadPoolBuilder;
use serde::Serialize;

use calocore::cell_info::CellInfo;
use calocore::cluster::Cluster;
use calocore::tag::ClusterTag;
use calotopo::cluster::options::TopoClusterConfig;
use calotopo::pipeline::processor::HybridClusterProcessor;
use calotopo::sim::event::EventGenerator;
use calotopo::sim::geometry::SyntheticCalorimeter;

#[derive(Parser, Debug)]
#[command(name = "calotopo")]
#[command(about = "Topological clustering of synthetic calorimeter events")]
struct Args {
    /// Clustering configuration (JSON); built-in defaults when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the effective configuration as JSON and exit
    #[arg(long, default_value = "false")]
    print_config: bool,

    /// Number of events to generate
    #[arg(short, long, default_value = "10")]
    events: usize,

    /// Showers per event
    #[arg(long, default_value = "4")]
    showers: usize,

    /// Minimum shower energy (MeV)
    #[arg(long, default_value = "2000.0")]
    min_energy: f64,

    /// Maximum shower energy (MeV)
    #[arg(long, default_value = "100000.0")]
    max_energy: f64,

    /// Grid cells along eta, per layer
    #[arg(long, default_value = "56")]
    n_eta: usize,

    /// Grid cells along phi, per layer
    #[arg(long, default_value = "64")]
    n_phi: usize,

    /// Fraction of cells read out without a valid gain
    #[arg(long, default_value = "0.0")]
    dead_fraction: f64,

    /// Random seed of the event generator
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Worker threads (0: one per core)
    #[arg(short, long, default_value = "0")]
    threads: usize,

    /// Include the per-cell tags in the report
    #[arg(long, default_value = "false")]
    with_tags: bool,
}

/// One line of the JSON-lines report.
#[derive(Serialize)]
struct EventReport<'a> {
    event: usize,
    n_clusters: usize,
    clusters: &'a [Cluster],
    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<&'a [ClusterTag]>,
}

fn main() -> Result<(), Box<dyn Error>> {
    let _logger = Logger::try_with_env_or_str("info")?.log_to_stderr().start()?;
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            log::info!("reading configuration from {}", path.display());
            TopoClusterConfig::from_path(path)?
        }
        None => TopoClusterConfig::default(),
    };
    if args.print_config {
        println!("{}", config.to_json_pretty()?);
        return Ok(());
    }

    let calo = SyntheticCalorimeter::barrel(args.n_eta, args.n_phi);
    let mut generator = EventGenerator::new(&calo, args.seed);
    generator.dead_fraction = args.dead_fraction;
    let events = (0..args.events)
        .map(|_| generator.random_event(args.showers, args.min_energy, args.max_energy))
        .collect::<Result<Vec<CellInfo>, _>>()?;
    log::info!("generated {} events on {} cells", events.len(), calo.n_cells());

    let processor = HybridClusterProcessor::from_config(&config, calo.clone());
    let pool = ThreadPoolBuilder::new().num_threads(args.threads).build()?;

    let start = Instant::now();
    let outputs = pool.install(|| processor.process_events(&events));
    let elapsed = start.elapsed();
    let total: usize = outputs.iter().map(|o| o.n_clusters()).sum();
    log::info!(
        "clustered {} events in {:.2?} using {} threads, {} clusters in total",
        outputs.len(),
        elapsed,
        pool.current_num_threads(),
        total
    );

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for (event, output) in outputs.iter().enumerate() {
        let report = EventReport {
            event,
            n_clusters: output.n_clusters(),
            clusters: &output.clusters,
            tags: args.with_tags.then_some(output.tags.as_slice()),
        };
        serde_json::to_writer(&mut out, &report)?;
        writeln!(out)?;
    }
    out.flush()?;

    processor.release_constants();
    Ok(())
}
