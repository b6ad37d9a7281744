use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use proxy_sieve::{
    config::ValidatorConfig,
    engine::XrayEngine,
    pipeline::{Orchestrator, Scheduler, StageId},
    proxy::{CandidateParser, GeoLocator},
    report::{Aggregator, ReportWriter},
    reputation::ReputationCache,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// A staged validator for VLESS/VMess/Trojan/Shadowsocks proxy configurations
#[derive(Parser)]
#[command(name = "proxy-sieve")]
#[command(about = "A staged validator for VLESS/VMess/Trojan/Shadowsocks proxy configurations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse descriptors from a file and report the ones that do not parse
    Parse {
        /// Input file containing descriptors
        input: PathBuf,
        /// Output file for the de-duplicated descriptors
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate descriptors and write valid.txt and results.json
    Validate {
        /// Input file containing descriptors
        input: PathBuf,
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Number of concurrent workers
        #[arg(short = 'n', long)]
        workers: Option<usize>,
        /// TCP connect timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Maximum acceptable connect latency in milliseconds
        #[arg(long)]
        max_latency: Option<u64>,
        /// Minimum throughput in Mbps
        #[arg(long)]
        min_speed: Option<f64>,
        /// Stages to skip (reputation, speed, stability, route_quality, tls)
        #[arg(long = "disable-stage", value_name = "STAGE")]
        disable: Vec<String>,
        /// Directory for valid.txt and results.json
        #[arg(short, long, default_value = "results")]
        output_dir: PathBuf,
        /// Path to a MaxMind City database for country annotation
        #[arg(long)]
        mmdb: Option<PathBuf>,
        /// Protocol engine binary
        #[arg(long)]
        engine: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Parse { input, output } => {
            let outcome = CandidateParser::parse_file(&input)?;

            println!(
                "Parsed {} candidates from {:?} ({} unparsable, {} duplicates)",
                outcome.candidates.len(),
                input,
                outcome.failures.len(),
                outcome.duplicates
            );
            for failure in &outcome.failures {
                eprintln!("  line {}: {} ({})", failure.line, failure.error, failure.input);
            }

            if let Some(output_path) = output {
                let content: String = outcome
                    .candidates
                    .iter()
                    .map(|c| c.uri.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                std::fs::write(&output_path, content)?;
                println!("Saved parsed candidates to {:?}", output_path);
            } else {
                for candidate in &outcome.candidates {
                    let remark = candidate.remark.as_deref().unwrap_or("-");
                    println!("{} {} {}", candidate.protocol(), candidate.address(), remark);
                }
            }
        }
        Commands::Validate {
            input,
            config,
            workers,
            timeout,
            max_latency,
            min_speed,
            disable,
            output_dir,
            mmdb,
            engine,
        } => {
            let mut config = match config {
                Some(path) => ValidatorConfig::from_file(&path)
                    .with_context(|| format!("loading configuration {:?}", path))?,
                None => ValidatorConfig::default(),
            };
            if let Some(workers) = workers {
                config = config.with_workers(workers);
            }
            if let Some(secs) = timeout {
                config = config.with_tcp_timeout(Duration::from_secs(secs));
            }
            if let Some(ms) = max_latency {
                config = config.with_max_latency(Duration::from_millis(ms));
            }
            if let Some(mbps) = min_speed {
                config = config.with_min_speed_mbps(mbps);
            }
            for name in &disable {
                config = config.with_stage_enabled(parse_stage(name)?, false);
            }
            if let Some(path) = mmdb {
                config = config.with_mmdb_path(path);
            }
            if let Some(binary) = engine {
                config = config.with_engine_binary(binary);
            }
            config.validate()?;

            let parsed = CandidateParser::parse_file(&input)?;
            println!("Loaded {} candidates from {:?}", parsed.candidates.len(), input);
            if !parsed.failures.is_empty() {
                println!("Skipped {} unparsable descriptors", parsed.failures.len());
            }
            println!(
                "Validating with {} workers, stages: {}",
                config.workers,
                config
                    .stages
                    .enabled()
                    .iter()
                    .map(|s| s.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            println!();

            let cache = Arc::new(ReputationCache::from_config(&config.reputation));
            let engine = Arc::new(XrayEngine::new(config.engine.clone()));
            let orchestrator = Orchestrator::from_config(&config, engine, &cache);
            let scheduler = Scheduler::new(Arc::new(orchestrator), &config);

            let cancel = scheduler.cancellation();
            {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("interrupt received, shutting down");
                        cancel.cancel();
                        cache.shutdown();
                    }
                });
            }

            let sweeper = {
                let cache = Arc::clone(&cache);
                let period = config.reputation.cache_ttl().max(Duration::from_secs(1));
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        let removed = cache.sweep();
                        if removed > 0 {
                            debug!(removed, "expired reputation entries swept");
                        }
                    }
                })
            };

            let run = scheduler.run(parsed.candidates.clone()).await;
            sweeper.abort();
            let report = Aggregator::new(config.weights.clone()).build_report(run, &parsed, cache.stats());
            report.log_stats();

            let mut writer = ReportWriter::new();
            if let Some(path) = &config.mmdb_path {
                match GeoLocator::from_path(path) {
                    Ok(geo) => writer = writer.with_geo(geo),
                    Err(e) => warn!(path = %path.display(), error = %e, "geo database unavailable"),
                }
            }
            let written = writer.write(&report, &output_dir)?;
            info!(run_id = %report.run_id, "run complete");

            println!(
                "Results: {} valid, {} rejected, {} dropped",
                report.stats.accepted, report.stats.rejected, report.stats.dropped
            );
            println!("Saved valid candidates to {:?}", written.valid);
            println!("Saved detailed results to {:?}", written.results);

            if !report.ranked.is_empty() {
                println!("\nTop candidates:");
                for scored in report.ranked.iter().take(10) {
                    println!("  {}", writer.text_line(scored));
                }
            }
        }
    }

    Ok(())
}

fn parse_stage(name: &str) -> Result<StageId> {
    let name = name.trim().to_lowercase().replace('-', "_");
    StageId::ALL
        .into_iter()
        .find(|stage| stage.name() == name)
        .ok_or_else(|| {
            anyhow!(
                "Invalid stage: {}. Use: connectivity, protocol, reputation, speed, stability, route_quality, tls",
                name
            )
        })
}
