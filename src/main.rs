//! Multicrawl main entry point
//!
//! This is the operator command-line interface: site management, crawl runs
//! and job/event inspection.

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use multicrawl::config::{load_config_with_hash, Config};
use multicrawl::crawler::{build_http_client, HttpFetcher, Orchestrator, RunRequest};
use multicrawl::output::{open_sink, print_events, print_jobs, print_run_report, print_sites};
use multicrawl::site::{generate_config, HttpStructureInference, SiteAnalyzer};
use multicrawl::storage::{open_storage, SqliteStorage, Storage};
use multicrawl::url::site_domain;
use multicrawl::{CrawlMode, MulticrawlError};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

/// Multicrawl: an adaptive multi-site crawl orchestrator
///
/// Multicrawl learns the structure of listing sites, crawls many of them
/// concurrently while backing off from rate limits and blocks, and forwards
/// only new or changed records downstream.
#[derive(Parser, Debug)]
#[command(name = "multicrawl")]
#[command(version)]
#[command(about = "An adaptive multi-site crawl orchestrator", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze a new site from its listing URL and store its configuration
    AddSite {
        /// The site's listing page
        url: String,

        /// Extra sample pages (usually record detail pages) shown to inference
        #[arg(long = "sample", value_name = "URL")]
        samples: Vec<String>,
    },

    /// Re-run analysis for a configured site, keeping its operator state
    Reanalyze {
        domain: String,

        #[arg(long = "sample", value_name = "URL")]
        samples: Vec<String>,
    },

    /// List configured sites
    ListSites,

    /// Re-enable a site and reset its health
    Enable { domain: String },

    /// Disable a site; running jobs stop at their next fetch
    Disable { domain: String },

    /// Crawl all crawlable sites, or one
    Crawl {
        /// Override each site's configured mode
        #[arg(long)]
        mode: Option<CrawlMode>,

        /// Crawl only this site
        #[arg(long)]
        domain: Option<String>,

        /// Skip sites crawled more recently than their frequency
        #[arg(long)]
        due: bool,
    },

    /// Show recent crawl jobs
    Jobs {
        #[arg(long)]
        domain: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Show recent rate-limit events of a site
    Events {
        domain: String,

        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = match load_config_with_hash(&cli.config) {
        Ok(loaded) => loaded,
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    let mut storage = open_storage(Path::new(&config.storage.database_path))
        .context("failed to open the store")?;

    match cli.command {
        Command::AddSite { url, samples } => {
            handle_add_site(&config, &mut storage, &url, &samples).await?;
        }
        Command::Reanalyze { domain, samples } => {
            handle_reanalyze(&config, &mut storage, &domain, &samples).await?;
        }
        Command::ListSites => {
            let sites = storage.list_sites()?;
            print_sites(&sites, config.quality.reanalysis_threshold);
        }
        Command::Enable { domain } => {
            let site = storage.set_site_enabled(&domain, true)?;
            println!("✓ {} enabled (status {})", site.domain, site.status);
        }
        Command::Disable { domain } => {
            let site = storage.set_site_enabled(&domain, false)?;
            println!("✓ {} disabled", site.domain);
        }
        Command::Crawl { mode, domain, due } => {
            let request = RunRequest {
                mode,
                domain,
                due_only: due,
            };
            return handle_crawl(config, storage, request).await;
        }
        Command::Jobs { domain, limit } => {
            let jobs = storage.list_jobs(domain.as_deref(), limit)?;
            print_jobs(&jobs);
        }
        Command::Events { domain, limit } => {
            let events = storage.list_events(&domain, limit)?;
            print_events(&domain, &events);
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("multicrawl=info,warn"),
            1 => EnvFilter::new("multicrawl=debug,info"),
            2 => EnvFilter::new("multicrawl=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn build_analyzer(config: &Config) -> anyhow::Result<SiteAnalyzer> {
    let client = build_http_client(&config.user_agent)?;
    let inference = HttpStructureInference::from_config(&config.analyzer, client.clone())
        .context("add-site and reanalyze need analyzer.inference-endpoint")?;
    let analyzer = SiteAnalyzer::new(
        config,
        Arc::new(HttpFetcher::with_client(client)),
        Arc::new(inference),
    )?;
    Ok(analyzer)
}

/// Handles add-site: analyze, generate and store a new site
///
/// Nothing is stored when analysis fails.
async fn handle_add_site(
    config: &Config,
    storage: &mut SqliteStorage,
    url: &str,
    samples: &[String],
) -> anyhow::Result<()> {
    let domain = site_domain(url)?;
    if storage.get_site(&domain)?.is_some() {
        bail!("{} is already configured, use reanalyze to refresh it", domain);
    }

    let analyzer = build_analyzer(config)?;
    let analysis = analyzer.analyze(url, samples).await?;
    let site = generate_config(&analysis, None, config, Utc::now());
    storage.save_site(&site)?;

    println!(
        "✓ Added {} (quality {:.1}, {} field(s), pagination {})",
        site.domain,
        site.quality_score,
        site.selectors.fields.len(),
        site.pagination.pattern.describe()
    );
    Ok(())
}

/// Handles reanalyze: refresh the structure of an existing site
async fn handle_reanalyze(
    config: &Config,
    storage: &mut SqliteStorage,
    domain: &str,
    samples: &[String],
) -> anyhow::Result<()> {
    let current = storage
        .get_site(domain)?
        .ok_or_else(|| MulticrawlError::UnknownSite(domain.to_string()))?;

    let analyzer = build_analyzer(config)?;
    let analysis = analyzer.analyze(&current.base_url, samples).await?;
    let site = generate_config(&analysis, Some(&current), config, Utc::now());
    storage.save_site(&site)?;

    println!(
        "✓ Reanalyzed {}: quality {:.1} -> {:.1}",
        site.domain, current.quality_score, site.quality_score
    );
    Ok(())
}

/// Handles the crawl command
///
/// Ctrl-C cancels the run cooperatively: site tasks stop at their next fetch
/// and their jobs are closed.
async fn handle_crawl(
    config: Config,
    storage: SqliteStorage,
    request: RunRequest,
) -> anyhow::Result<ExitCode> {
    let fetcher = HttpFetcher::new(&config.user_agent)?;
    let sink = open_sink(&config.sink).await?;
    tracing::info!("Emitting records to {}", sink.path().display());

    let orchestrator = Orchestrator::new(
        config,
        Arc::new(Mutex::new(storage)),
        Arc::new(fetcher),
        Arc::new(sink),
    )?;

    let on_interrupt = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping site tasks");
            on_interrupt.cancel();
        }
    });

    let report = match orchestrator.run(request).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("Crawl failed: {}", e);
            return Err(e.into());
        }
    };

    print_run_report(&report);
    Ok(ExitCode::from(report.outcome().exit_code()))
}
