use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

use seoinsikt_engine::config::EngineConfig;
use seoinsikt_engine::domain::{AnalyzerType, ProgressUpdate, WebsiteData};
use seoinsikt_engine::lifecycle;
use seoinsikt_engine::service::analyzers::AnalyzerDeps;
use seoinsikt_engine::service::lighthouse::{LighthouseClient, SidecarBackend};
use seoinsikt_engine::service::orchestrator::{build_layers, DependencyGraph, Orchestrator};
use seoinsikt_engine::service::resilient::{MemoryCache, ResilientClient};
use seoinsikt_engine::service::RunContext;

#[derive(Parser)]
#[command(name = "seoinsikt-engine")]
#[command(about = "Run layered SEO analyzers against a page snapshot")]
#[command(version)]
struct Cli {
    /// JSON engine configuration; SEOINSIKT_* variables override it
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a page and print the run report as JSON
    Analyze(AnalyzeArgs),
    /// Print the execution layers for a set of analyzers
    Schedule {
        /// Analyzer names, comma separated (default: all)
        #[arg(long, value_delimiter = ',')]
        analyzers: Vec<String>,
    },
}

#[derive(Args)]
struct AnalyzeArgs {
    /// WebsiteData JSON produced by the crawler
    #[arg(long, conflicts_with = "html")]
    snapshot: Option<PathBuf>,

    /// Raw HTML file to turn into a snapshot (requires --url)
    #[arg(long, requires = "url")]
    html: Option<PathBuf>,

    #[arg(long)]
    url: Option<String>,

    /// Analyzer names, comma separated (default: every local analyzer)
    #[arg(long, value_delimiter = ',')]
    analyzers: Vec<String>,

    /// Also run Lighthouse through the sidecar runner
    #[arg(long)]
    lighthouse: bool,

    /// Abort the run after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Write progress events to stderr as JSON lines
    #[arg(long)]
    progress: bool,
}

async fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::from_file(path).await?,
        None => EngineConfig::default(),
    };
    config.apply_env();
    config.validate()?;
    Ok(config)
}

async fn load_snapshot(args: &AnalyzeArgs) -> anyhow::Result<WebsiteData> {
    if let Some(path) = &args.snapshot {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading snapshot {}", path.display()))?;
        return serde_json::from_str(&raw).context("parsing snapshot JSON");
    }
    if let (Some(path), Some(url)) = (&args.html, &args.url) {
        let html = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading HTML {}", path.display()))?;
        return Ok(WebsiteData::from_html(url, &html, 0.0));
    }
    bail!("either --snapshot or --html with --url is required")
}

fn parse_kinds(names: &[String], lighthouse: bool) -> anyhow::Result<Vec<AnalyzerType>> {
    let mut kinds: Vec<AnalyzerType> = if names.is_empty() {
        AnalyzerType::ALL
            .into_iter()
            .filter(|k| *k != AnalyzerType::Lighthouse)
            .collect()
    } else {
        names
            .iter()
            .map(|n| n.parse())
            .collect::<Result<Vec<AnalyzerType>, _>>()?
    };
    if lighthouse && !kinds.contains(&AnalyzerType::Lighthouse) {
        kinds.push(AnalyzerType::Lighthouse);
    }
    Ok(kinds)
}

fn build_deps(config: &EngineConfig, kinds: &[AnalyzerType]) -> anyhow::Result<AnalyzerDeps> {
    if !kinds.contains(&AnalyzerType::Lighthouse) {
        return Ok(AnalyzerDeps::default());
    }
    let backend = match &config.lighthouse.runner {
        Some(path) => SidecarBackend::new(path.clone()),
        None => SidecarBackend::discover(),
    };
    let resilient = ResilientClient::from_config("lighthouse", config, Some(Arc::new(MemoryCache::new())))?;
    let client = LighthouseClient::from_config(&config.lighthouse, Arc::new(backend), resilient);
    Ok(AnalyzerDeps {
        lighthouse: Some(client),
    })
}

async fn analyze(config: EngineConfig, args: AnalyzeArgs) -> anyhow::Result<()> {
    let data = load_snapshot(&args).await?;
    let kinds = parse_kinds(&args.analyzers, args.lighthouse)?;
    let deps = build_deps(&config, &kinds)?;

    let mut orchestrator = Orchestrator::default();
    orchestrator.register_all(&kinds, &deps)?;
    if args.progress {
        orchestrator.set_progress_sink(Some(Arc::new(|update: ProgressUpdate| {
            if let Ok(line) = serde_json::to_string(&update) {
                eprintln!("{}", line);
            }
        })));
    }

    let ctx = match args.timeout_secs {
        Some(secs) => RunContext::new().with_timeout(Duration::from_secs(secs)),
        None => RunContext::new(),
    };

    match orchestrator.run_all(&ctx, Arc::new(data)).await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Analysis failed: {}", e.error);
            println!("{}", serde_json::to_string_pretty(&e.partial)?);
            Err(e.into())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    lifecycle::init_logging();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref()).await?;

    match cli.command {
        Commands::Analyze(args) => analyze(config, args).await,
        Commands::Schedule { analyzers } => {
            let kinds = parse_kinds(&analyzers, analyzers.is_empty())?;
            let registered: Vec<(AnalyzerType, i32)> =
                kinds.iter().map(|k| (*k, k.default_priority())).collect();
            let schedule = build_layers(&registered, &DependencyGraph::standard());
            for (index, layer) in schedule.layers.iter().enumerate() {
                let names: Vec<&str> = layer.iter().map(|k| k.as_str()).collect();
                println!("layer {}: {}", index, names.join(", "));
            }
            for warning in &schedule.warnings {
                println!("warning: {}", warning);
            }
            Ok(())
        }
    }
}
