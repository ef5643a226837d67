//! Mercator CLI - Semantic Map Engine
//!
//! Command-line interface for training and inspecting semantic maps.

use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};
use log::error;
use mercator::{
    export_map, import_map, ClusterAlgorithm, EntityRecord, FeatureMapKind, InstanceId,
    InstanceRegistry, MapConfig, Result, RunStatus, Topology, TrainingParams,
};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "mercator")]
#[command(author = "Mercator Contributors")]
#[command(version)]
#[command(about = "Semantic Map Engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum AlgorithmArg {
    Umatrix,
    Kmeans,
    Hierarchical,
}

impl From<AlgorithmArg> for ClusterAlgorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::Umatrix => ClusterAlgorithm::UMatrix,
            AlgorithmArg::Kmeans => ClusterAlgorithm::KMeans,
            AlgorithmArg::Hierarchical => ClusterAlgorithm::Hierarchical,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Train a map on synthetic sample data and print derived analyses
    Demo {
        /// Grid width in nodes
        #[arg(long, default_value = "16")]
        width: usize,

        /// Grid height in nodes
        #[arg(long, default_value = "16")]
        height: usize,

        /// Embedding dimension for the synthetic entities
        #[arg(short, long, default_value = "64")]
        dimension: usize,

        /// Number of synthetic entities
        #[arg(short, long, default_value = "200")]
        entities: usize,

        /// Training epochs
        #[arg(long, default_value = "20")]
        epochs: usize,

        /// Entities per iteration
        #[arg(short, long, default_value = "8")]
        batch_size: usize,

        /// Use a hexagonal lattice instead of rectangular
        #[arg(long)]
        hexagonal: bool,

        /// Clustering algorithm for the summary
        #[arg(short, long, value_enum, default_value = "umatrix")]
        algorithm: AlgorithmArg,

        /// Random seed for reproducibility
        #[arg(short, long)]
        seed: Option<u64>,
    },

    /// Train a map from a JSON entity file and save it
    Train {
        /// Input file: a JSON array of entity records
        #[arg(short, long)]
        input: PathBuf,

        /// Output map file
        #[arg(short, long)]
        output: PathBuf,

        /// Grid width in nodes
        #[arg(long, default_value = "20")]
        width: usize,

        /// Grid height in nodes
        #[arg(long, default_value = "20")]
        height: usize,

        /// Embedding dimension (inferred from the first record if omitted)
        #[arg(short, long)]
        dimension: Option<usize>,

        /// Training epochs
        #[arg(long, default_value = "20")]
        epochs: usize,

        /// Entities per iteration
        #[arg(short, long, default_value = "8")]
        batch_size: usize,

        /// Random seed for reproducibility
        #[arg(short, long)]
        seed: Option<u64>,
    },

    /// Show statistics and feature-map summaries of a saved map
    Inspect {
        /// Map file to inspect
        #[arg(short, long)]
        map: PathBuf,

        /// Also summarize one component plane by dimension index
        #[arg(short, long)]
        component: Option<usize>,
    },
}

fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    let result = match cli.command {
        Commands::Demo {
            width,
            height,
            dimension,
            entities,
            epochs,
            batch_size,
            hexagonal,
            algorithm,
            seed,
        } => run_demo(
            width, height, dimension, entities, epochs, batch_size, hexagonal, algorithm, seed,
        ),

        Commands::Train {
            input,
            output,
            width,
            height,
            dimension,
            epochs,
            batch_size,
            seed,
        } => train_map(input, output, width, height, dimension, epochs, batch_size, seed),

        Commands::Inspect { map, component } => inspect_map(map, component),
    };

    if let Err(e) = result {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) ETA: {eta}")
        .unwrap()
        .progress_chars("█▓▒░  ")
}

/// Polls training snapshots into a progress bar until the run terminates.
fn watch_training(registry: &InstanceRegistry, id: InstanceId) -> Result<RunStatus> {
    let snapshot = registry.training_status(id)?;
    let pb = ProgressBar::new(snapshot.total_iterations as u64);
    pb.set_style(progress_style());
    pb.set_message("Training map...");

    let status = loop {
        let snapshot = registry.training_status(id)?;
        pb.set_position(snapshot.current_iteration as u64);
        if snapshot.status != RunStatus::Running {
            break snapshot.status;
        }
        std::thread::sleep(Duration::from_millis(50));
    };
    registry.wait(id)?;
    pb.finish_and_clear();
    Ok(status)
}

fn print_summary(registry: &InstanceRegistry, id: InstanceId, algorithm: ClusterAlgorithm) -> Result<()> {
    let snapshot = registry.training_status(id)?;
    println!(
        "✓ Trained: {} iterations, quantization error {:.4}, topographic error {:.4}",
        snapshot.current_iteration, snapshot.quantization_error, snapshot.topographic_error
    );

    let state = registry.grid_state(id, false)?;
    println!(
        "✓ Grid {}x{}: {} nodes, {} entity mappings",
        state.width,
        state.height,
        state.nodes.len(),
        state.mappings.len()
    );

    let report = registry.cluster(id, algorithm, None, None)?;
    println!(
        "✓ Clusters: {} ({} nodes clustered, {} unclustered, mean quality {:.3})",
        report.clusters.len(),
        report.stats.clustered_nodes,
        report.stats.unclustered_nodes,
        report.stats.mean_quality
    );
    for cluster in &report.clusters {
        println!(
            "    #{}: {} nodes at ({:.1}, {:.1}), cohesion {:.3}, separation {:.3}, quality {:.3}",
            cluster.id,
            cluster.member_nodes.len(),
            cluster.center.0,
            cluster.center.1,
            cluster.cohesion,
            cluster.separation,
            cluster.quality
        );
    }

    let umatrix = registry.feature_map(id, FeatureMapKind::UMatrix)?;
    println!(
        "✓ U-matrix: min {:.4}, max {:.4}, mean {:.4}",
        umatrix.stats.min, umatrix.stats.max, umatrix.stats.mean
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_demo(
    width: usize,
    height: usize,
    dimension: usize,
    entities: usize,
    epochs: usize,
    batch_size: usize,
    hexagonal: bool,
    algorithm: AlgorithmArg,
    seed: Option<u64>,
) -> Result<()> {
    let start_time = Instant::now();
    println!("Mercator Semantic Map Engine");
    println!("   Demo: {entities} synthetic entities on a {width}x{height} grid");
    println!();

    let registry = InstanceRegistry::new();
    let config = MapConfig {
        grid_width: width,
        grid_height: height,
        topology: if hexagonal {
            Topology::Hexagonal
        } else {
            Topology::Rectangular
        },
        embedding_dimension: dimension,
        seed,
        ..Default::default()
    };
    let id = registry.create(config)?;

    let report = registry.generate_sample_data(id, entities)?;
    println!("✓ Generated {} sample entities", report.loaded);

    registry.train(id, TrainingParams { epochs, batch_size })?;
    watch_training(&registry, id)?;
    print_summary(&registry, id, algorithm.into())?;

    println!();
    println!("Done in {}", HumanDuration(start_time.elapsed()));
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn train_map(
    input: PathBuf,
    output: PathBuf,
    width: usize,
    height: usize,
    dimension: Option<usize>,
    epochs: usize,
    batch_size: usize,
    seed: Option<u64>,
) -> Result<()> {
    let start_time = Instant::now();
    println!("Mercator Semantic Map Engine");
    println!("   Training map from: {}", input.display());
    println!();

    let file = File::open(&input)?;
    let records: Vec<EntityRecord> = serde_json::from_reader(BufReader::new(file))?;
    println!("✓ Read {} entity records", records.len());

    let dimension = match dimension.or_else(|| records.first().map(|r| r.embedding.len())) {
        Some(d) => d,
        None => {
            return Err(mercator::MercatorError::Data(
                "input file contains no records and no dimension was given".to_string(),
            ))
        }
    };

    let registry = InstanceRegistry::new();
    let config = MapConfig {
        grid_width: width,
        grid_height: height,
        embedding_dimension: dimension,
        seed,
        ..Default::default()
    };
    let id = registry.create(config)?;

    let report = registry.load_entities(id, records)?;
    println!("✓ Loaded {} entities", report.loaded);
    for rejected in &report.rejected {
        println!("    rejected {}: {}", rejected.uri, rejected.reason);
    }

    registry.train(id, TrainingParams { epochs, batch_size })?;
    let status = watch_training(&registry, id)?;
    if status != RunStatus::Completed {
        return Err(mercator::MercatorError::Training(format!(
            "run ended with status {status:?}"
        )));
    }
    print_summary(&registry, id, ClusterAlgorithm::UMatrix)?;

    export_map(&registry, id, &output)?;
    println!("✓ Saved map to {}", output.display());
    println!();
    println!("Done in {}", HumanDuration(start_time.elapsed()));
    Ok(())
}

fn inspect_map(map: PathBuf, component: Option<usize>) -> Result<()> {
    let registry = InstanceRegistry::new();
    let id = import_map(&registry, &map)?;
    let info = registry.get(id)?;

    println!("Mercator map: {}", map.display());
    println!(
        "   Grid: {}x{} ({:?}), embedding dimension {}",
        info.config.grid_width,
        info.config.grid_height,
        info.config.topology,
        info.config.embedding_dimension
    );

    let umatrix = registry.feature_map(id, FeatureMapKind::UMatrix)?;
    println!(
        "   U-matrix: min {:.4}, max {:.4}, mean {:.4}",
        umatrix.stats.min, umatrix.stats.max, umatrix.stats.mean
    );

    let distance = registry.feature_map(id, FeatureMapKind::Distance)?;
    println!(
        "   Distance to center: min {:.4}, max {:.4}, mean {:.4}",
        distance.stats.min, distance.stats.max, distance.stats.mean
    );

    if let Some(dim) = component {
        let plane = registry.feature_map(id, FeatureMapKind::Component(dim))?;
        println!(
            "   Component {}: min {:.4}, max {:.4}, mean {:.4}",
            dim, plane.stats.min, plane.stats.max, plane.stats.mean
        );
    }
    Ok(())
}
