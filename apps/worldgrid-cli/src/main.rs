mod sample;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use worldgrid_hlod::{
    AggregateGraph, AggregateStore, BuildError, BuildSettings, InstancingBaker,
    MemoryAggregateStore, SettingsError, SystemMemoryProbe,
};
use worldgrid_kernel::World;
use worldgrid_persist::AggregatePackageStore;

#[derive(Parser)]
#[command(
    name = "worldgrid-cli",
    about = "Partition worlds into streaming cells and build aggregates"
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and crate info
    Info,
    /// Partition a world and run the aggregate pass
    Build {
        /// World JSON file
        #[arg(short, long)]
        world: PathBuf,
        /// Build settings YAML; defaults apply when omitted
        #[arg(short, long)]
        settings: Option<PathBuf>,
        /// Aggregate store directory; records are kept in memory when omitted
        #[arg(long)]
        store: Option<PathBuf>,
        /// Print every streaming cell after the build
        #[arg(long)]
        dump: bool,
    },
    /// Check build settings without building
    Validate {
        /// Build settings YAML
        #[arg(short, long)]
        settings: PathBuf,
    },
    /// Write a deterministic synthetic world
    Sample {
        /// Number of objects to place
        #[arg(short, long, default_value = "1000")]
        objects: usize,
        /// Output world JSON file
        #[arg(long)]
        out: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            if is_configuration_error(&e) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn is_configuration_error(e: &anyhow::Error) -> bool {
    if let Some(build) = e.downcast_ref::<BuildError>() {
        return build.is_configuration_error();
    }
    e.downcast_ref::<SettingsError>().is_some()
        || e.downcast_ref::<worldgrid_hlod::AggregateError>().is_some()
        || e.downcast_ref::<worldgrid_stream::PartitionError>().is_some()
}

/// The checks a build runs before loading anything.
fn validate(settings: &BuildSettings) -> anyhow::Result<AggregateGraph> {
    settings.partition.validate()?;
    Ok(settings.aggregates.validate(&settings.partition)?)
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<BuildSettings> {
    match path {
        Some(path) => Ok(BuildSettings::load(path)?),
        None => Ok(BuildSettings::default()),
    }
}

fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Info => {
            println!("worldgrid-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("kernel: {}", worldgrid_kernel::crate_info());
            println!("stream: {}", worldgrid_stream::crate_info());
            println!("hlod: {}", worldgrid_hlod::crate_info());
            println!("persist: {}", worldgrid_persist::crate_info());
        }
        Commands::Build {
            world,
            settings,
            store,
            dump,
        } => {
            let settings = load_settings(settings.as_deref())?;
            let world = World::load_json(&world)
                .with_context(|| format!("loading world {}", world.display()))?;
            let mut store: Box<dyn AggregateStore> = match store {
                Some(dir) => Box::new(
                    AggregatePackageStore::open(&dir)
                        .with_context(|| format!("opening aggregate store {}", dir.display()))?,
                ),
                None => Box::new(MemoryAggregateStore::new()),
            };
            let mut baker = InstancingBaker::new();
            let mut probe = SystemMemoryProbe::new();
            let output = worldgrid_hlod::run(
                &world,
                &settings,
                &mut baker,
                store.as_mut(),
                &mut probe,
            )?;
            if dump {
                print!("{}", worldgrid_stream::dump_state(&output.grids));
            }
            println!("{}", output.summary);
        }
        Commands::Validate { settings } => {
            let settings = BuildSettings::load(&settings)?;
            let graph = validate(&settings)?;
            println!(
                "grids: {}",
                settings
                    .partition
                    .grids
                    .iter()
                    .map(|g| format!("{} ({})", g.name, g.cell_size))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            for (tier, layers) in graph.tiers().iter().enumerate() {
                let names: Vec<&str> = layers.iter().map(|l| l.name.as_str()).collect();
                println!("tier {tier}: {}", names.join(", "));
            }
            println!("OK");
        }
        Commands::Sample { objects, out } => {
            let world = sample::sample_world("Sample", objects);
            world
                .save_json(&out)
                .with_context(|| format!("writing {}", out.display()))?;
            println!(
                "wrote {} objects in {} containers to {}",
                world.object_count(),
                world.containers().count(),
                out.display()
            );
        }
    }

    Ok(())
}
