use clap::Parser;
use color_eyre::eyre::{self, WrapErr};
use console::style;
use rowcolsim::{checkpoint::Checkpoint, config::SimConfig, sim::System, trace};
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser, Debug, Clone)]
pub struct RunOptions {
    #[clap(long = "config", help = "cache and memory config (yaml or json)")]
    pub config: Option<PathBuf>,
    #[clap(long = "trace", help = "csv access trace")]
    pub trace: PathBuf,
    #[clap(long = "stats", help = "write statistics as csv")]
    pub stats: Option<PathBuf>,
    #[clap(long = "checkpoint", help = "write a checkpoint after the run")]
    pub checkpoint: Option<PathBuf>,
    #[clap(long = "json", help = "print statistics as json")]
    pub json: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct RestoreOptions {
    #[clap(long = "config", help = "cache and memory config (yaml or json)")]
    pub config: Option<PathBuf>,
    #[clap(long = "checkpoint", help = "checkpoint to restore from")]
    pub checkpoint: PathBuf,
}

#[derive(Parser, Debug, Clone)]
pub enum Command {
    /// Replays a trace against the cache
    Run(RunOptions),
    /// Restores a cache from a checkpoint
    Restore(RestoreOptions),
}

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Options {
    #[clap(subcommand)]
    pub command: Command,
}

fn load_config(path: Option<&Path>) -> eyre::Result<SimConfig> {
    match path {
        Some(path) => SimConfig::load(path),
        None => Ok(SimConfig::default()),
    }
}

fn write_stats_csv(path: &Path, stats: stats::Stats) -> eyre::Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .wrap_err_with(|| format!("failed to create {}", path.display()))?;
    writer.write_record(["section", "key", "value"])?;
    for row in stats.flatten() {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn run(options: RunOptions) -> eyre::Result<()> {
    let config = load_config(options.config.as_deref())?;
    println!("simulating {config}");
    let mut sys = System::new(config)?;
    let records = trace::load(&options.trace)?;

    let start = Instant::now();
    sys.replay(&records)?;
    let stats = sys.all_stats();
    println!(
        "replayed {} requests in {} ticks ({:?})",
        records.len(),
        stats.sim.ticks,
        start.elapsed()
    );

    let cache = &stats.cache;
    println!(
        "{} {} {} {} {}",
        style(format!("hits={}", cache.total(stats::RequestStatus::HIT))).green(),
        style(format!(
            "cross_hits={}",
            cache.total(stats::RequestStatus::CROSS_HIT)
        ))
        .green(),
        style(format!(
            "mshr_hits={}",
            cache.total(stats::RequestStatus::MSHR_HIT)
        ))
        .yellow(),
        style(format!("misses={}", cache.total(stats::RequestStatus::MISS))).red(),
        style(format!(
            "uncacheable={}",
            cache.total(stats::RequestStatus::UNCACHEABLE)
        ))
        .dim(),
    );

    if options.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    if let Some(path) = &options.stats {
        write_stats_csv(path, stats)?;
        println!("wrote statistics to {}", path.display());
    }
    if let Some(path) = &options.checkpoint {
        let checkpoint = sys.cache.checkpoint();
        checkpoint.save(path)?;
        if checkpoint.valid {
            println!("wrote checkpoint to {}", path.display());
        } else {
            println!(
                "{} checkpoint {} lost {} dirty blocks",
                style("warning:").yellow().bold(),
                path.display(),
                checkpoint.dirty_blocks
            );
        }
    }
    Ok(())
}

fn restore(options: RestoreOptions) -> eyre::Result<()> {
    let config = load_config(options.config.as_deref())?;
    let mut sys = System::new(config)?;
    let checkpoint = Checkpoint::load(&options.checkpoint)
        .wrap_err_with(|| format!("failed to load {}", options.checkpoint.display()))?;
    sys.cache
        .restore(&checkpoint)
        .wrap_err_with(|| format!("cannot restore from {}", options.checkpoint.display()))?;
    println!("{} {}", style("restored").green(), sys.cache);
    Ok(())
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init();
    let options = Options::parse();

    match options.command {
        Command::Run(options) => run(options),
        Command::Restore(options) => restore(options),
    }
}
