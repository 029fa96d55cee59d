//! augur CLI - Ensemble forecast collection and aggregation.

use anyhow::{Context, Result, bail};
use augur::models::MAX_ITERATIONS;
use augur::{
    BatchProgress, CancelFlag, Config, EnsembleStatistics, ForecastAggregator, ForecastPipeline,
    ForecastRun, ReplyStore,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "augur")]
#[command(version)]
#[command(about = "Ensemble forecast collection and robust probability aggregation via OpenRouter")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "augur.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Query every source repeatedly and aggregate the forecasts
    Forecast {
        /// Path to a file holding the prompt
        #[arg(short, long)]
        prompt: PathBuf,

        /// Source to query (repeatable); defaults to [forecast].sources
        #[arg(short, long = "source")]
        sources: Vec<String>,

        /// Iterations per source; defaults to [forecast].iterations
        #[arg(short, long)]
        iterations: Option<u32>,

        /// Path to the JSON run record; defaults to a file in [forecast].output_dir
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Ignore cached replies (new successes are still cached)
        #[arg(long)]
        force_refresh: bool,

        /// Disable the reply cache entirely
        #[arg(long)]
        no_cache: bool,
    },

    /// Re-run aggregation over a stored run record
    Aggregate {
        /// Path to a JSON run record
        #[arg(short, long)]
        input: PathBuf,

        /// Write the re-aggregated record here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Inspect or maintain the reply cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show entry counts per source
    Stats,
    /// Delete expired entries
    Sweep,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

/// Load the config file, falling back to defaults when it does not exist.
fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok(Config::default());
    }
    Config::from_file(path).with_context(|| format!("Failed to load config from {:?}", path))
}

fn print_example_config() {
    let example = r#"# augur configuration file

[openrouter]
# API key (can also use OPENROUTER_API_KEY env var)
# api_key = "${OPENROUTER_API_KEY}"
base_url = "https://openrouter.ai/api/v1"
timeout_secs = 120
max_retries = 3

[query]
concurrency = 3
rate_limited_markers = [":free"]
rate_limit_delay_secs = 3.0
query_timeout_secs = 120
max_output_tokens = 4000
retry_output_tokens = 10000
temperature = 0.7
web_search = true
min_reply_chars = 10

[cache]
enabled = true
path = "cache/replies.db"
ttl_hours = 168

[aggregation]
consistency_threshold = 0.8
uncertainty_threshold = 0.5
outlier_method = "iqr"    # iqr | z_score

[aggregation.consistency]
method = "blend"          # inverse_cv | entropy | blend

[aggregation.calibration]
method = "temperature"    # temperature | platt | isotonic

[aggregation.bayesian]
prior_strength = 1.0
outlier_threshold = 2.5
virtual_sample_size = 10.0

[forecast]
sources = [
    "openai/gpt-4o",
    "anthropic/claude-sonnet-4",
    "google/gemini-2.5-pro",
    "deepseek/deepseek-r1:free",
]
iterations = 10
output_dir = "output"
"#;
    println!("{example}");
}

fn print_summary(stats: &EnsembleStatistics) {
    let m = &stats.methods;

    println!("\n=== Forecast Summary ===");
    println!(
        "Queries:      {} ({} ok, {} failed, {:.1}% success)",
        stats.total_queries,
        stats.successful_queries,
        stats.failed_queries,
        stats.success_rate() * 100.0
    );
    println!("Valid probs:  {}", stats.valid_probabilities);
    for (status, count) in &stats.status_counts {
        println!("  {status:<16} {count}");
    }

    println!("\nPer source:");
    for (source, s) in &stats.sources {
        match &s.probabilities {
            Some(p) => println!(
                "  {source:<40} mean {:>5.1}%  sd {:>4.1}  consistency {:.2}  ({}/{})",
                p.mean,
                p.std_dev,
                s.consistency.unwrap_or(0.0),
                s.successful,
                s.queries
            ),
            None => println!("  {source:<40} no usable probabilities ({}/{})", s.successful, s.queries),
        }
    }

    println!("\nMethods:");
    println!("  Simple mean:           {:.1}%", m.simple_mean);
    println!("  Median:                {:.1}%", m.median);
    println!("  Trimmed mean:          {:.1}%", m.trimmed_mean);
    if let Some(v) = m.calibrated_mean {
        println!(
            "  Calibrated:            {:.1}% (T = {:.2})",
            v,
            m.calibration_temperature.unwrap_or(1.0)
        );
    }
    if let Some(v) = m.consistency_weighted {
        println!("  Consistency-weighted:  {:.1}%", v);
    }
    if let Some(v) = m.bayesian_mean {
        match m.bayesian_interval {
            Some(ci) => println!(
                "  Bayesian:              {:.1}% (95% CI {:.1}-{:.1}, {} outliers)",
                v, ci.lower, ci.upper, m.outliers_detected
            ),
            None => println!("  Bayesian:              {:.1}%", v),
        }
    }
    println!(
        "  Ensemble of methods:   {:.1}% (sd {:.2})",
        m.ensemble_of_methods, m.methods_std
    );

    if let Some(c) = &stats.consensus {
        println!(
            "\nConsensus:    {} (IQR {:.1}-{:.1}, range {:.1})",
            c.consensus_score
                .map_or_else(|| "n/a".to_string(), |s| format!("{s:.2}")),
            c.p25,
            c.p75,
            c.range
        );
    }
    if let Some(agreement) = m.rank_agreement {
        println!("Rank agreement: {agreement:.2}");
    }
    if !stats.outlier_ids.is_empty() {
        println!("Outliers:     {}", stats.outlier_ids.join(", "));
    }
    if let Some(comparison) = &stats.comparison {
        let r = &comparison.rankings;
        println!("Most consistent: {}", r.by_consistency.join(" > "));
        println!("Fastest:         {}", r.by_speed.join(" > "));
    }

    println!(
        "\nRecommended:  {:.1}% via {} (confidence {:.0}%)",
        m.recommended_estimate,
        m.recommended_method,
        m.confidence * 100.0
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Example => {
            print_example_config();
        }

        Commands::Validate => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

            // Try to resolve API key
            config
                .resolve_api_key()
                .context("Failed to resolve API key")?;

            info!("Configuration is valid");
            info!(
                "  Sources: {} x {} iterations",
                config.forecast.sources.len(),
                config.forecast.iterations
            );
            info!(
                "  Concurrency: {}, rate-limited markers: {:?}",
                config.query.concurrency, config.query.rate_limited_markers
            );
            info!(
                "  Cache: {} ({:?}, ttl {}h)",
                if config.cache.enabled { "enabled" } else { "disabled" },
                config.cache.path,
                config.cache.ttl_hours
            );
        }

        Commands::Forecast {
            prompt,
            sources,
            iterations,
            output,
            force_refresh,
            no_cache,
        } => {
            let mut config = load_config(&cli.config)?;
            config.query.force_refresh |= force_refresh;
            if no_cache {
                config.cache.enabled = false;
            }

            let prompt_text = std::fs::read_to_string(&prompt)
                .with_context(|| format!("Failed to read prompt from {:?}", prompt))?;
            let sources = if sources.is_empty() {
                config.forecast.sources.clone()
            } else {
                sources
            };
            if sources.is_empty() {
                bail!("No sources: pass --source or set [forecast].sources");
            }
            let iterations = iterations.unwrap_or(config.forecast.iterations);
            if !(1..=MAX_ITERATIONS).contains(&iterations) {
                bail!("--iterations must be between 1 and {MAX_ITERATIONS}");
            }

            let pipeline =
                ForecastPipeline::from_config(&config).context("Failed to set up pipeline")?;

            let cancel = CancelFlag::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, finishing the current source");
                    on_signal.cancel();
                }
            });

            let progress = Arc::new(BatchProgress::new(sources.len() as u64 * iterations as u64));
            let run = pipeline
                .run(&prompt_text, &sources, iterations, progress.clone(), &cancel)
                .await?;
            progress.finish();

            let output = output
                .unwrap_or_else(|| config.forecast.output_dir.join(run.file_name()));
            run.save(&output)
                .with_context(|| format!("Failed to write run record to {:?}", output))?;

            if run.cancelled {
                warn!(replies = run.replies.len(), "Batch was cancelled; record is partial");
            }
            match &run.statistics {
                Some(stats) => print_summary(stats),
                None => println!("\nNo usable probabilities in {} replies", run.replies.len()),
            }
            println!("\nRun record:   {output:?}");
        }

        Commands::Aggregate { input, output } => {
            let config = load_config(&cli.config)?;
            let mut run = ForecastRun::load(&input)
                .with_context(|| format!("Failed to load run record from {:?}", input))?;

            let mut aggregator = ForecastAggregator::new(config.aggregation.clone());
            run.reaggregate(&mut aggregator)?;

            match &run.statistics {
                Some(stats) => print_summary(stats),
                None => println!("No usable probabilities in {} replies", run.replies.len()),
            }
            if let Some(output) = output {
                run.save(&output)
                    .with_context(|| format!("Failed to write run record to {:?}", output))?;
                println!("\nRun record:   {output:?}");
            }
        }

        Commands::Cache { action } => {
            let config = load_config(&cli.config)?;
            let store = ReplyStore::from_config(&config.cache)
                .with_context(|| format!("Failed to open cache at {:?}", config.cache.path))?;

            match action {
                CacheAction::Stats => {
                    let stats = store.statistics()?;
                    println!("=== Reply Cache ===");
                    println!("Path:        {:?}", config.cache.path);
                    println!("Entries:     {}", stats.total_entries);
                    println!("Active:      {}", stats.active_entries);
                    println!("Expired:     {}", stats.expired_entries);
                    println!("Size:        {:.1} KiB", stats.database_bytes as f64 / 1024.0);
                    for (source, count) in &stats.sources {
                        println!("  {source:<40} {count}");
                    }
                }
                CacheAction::Sweep => {
                    let removed = store.sweep_expired()?;
                    println!("Removed {removed} expired entries");
                }
            }
        }
    }

    Ok(())
}
