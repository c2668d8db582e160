//! CrossIndex CLI — run the cross-chain message indexer.
//!
//! # Commands
//! ```text
//! crossindex run           [--config <path>]
//! crossindex check-config  [--config <path>]
//! crossindex info
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crossindex_core::{AnomalySink, DecoderRegistry};
use crossindex_evm::{AbiEventDecoder, ChainWatcherBuilder, HttpRpcClient, ProtocolDefinition};
use crossindex_observability::{init_tracing, CrossIndexMetrics, TracingSink};
use crossindex_pipeline::{Archiver, Normalizer, Pipeline};

mod backends;
mod settings;

use settings::Settings;

#[derive(Parser)]
#[command(
    name = "crossindex",
    about = "Multi-chain cross-chain message indexer — CrossIndex CLI",
    long_about = "
CrossIndex: follows bridge contracts on several EVM chains, correlates the two
legs of every cross-chain message, and archives finalized messages.

ENVIRONMENT VARIABLES:
  CROSSCHAIN_CONFIG              Config file path (default: configs/config.yaml)
  CROSSCHAIN__<SECTION>__<KEY>   Override any config key, e.g. CROSSCHAIN__DATABASE__PASSWORD
",
    version
)]
struct Cli {
    /// Path to the YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start watchers, normalizer and archiver; stop on SIGINT/SIGTERM
    Run,

    /// Load and validate the configuration and protocol definitions
    #[command(name = "check-config")]
    CheckConfig,

    /// Show build capabilities and defaults
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            let settings = Settings::load(cli.config.as_deref())?;
            cmd_run(settings).await
        }
        Commands::CheckConfig => {
            let settings = Settings::load(cli.config.as_deref())?;
            cmd_check_config(&settings)
        }
        Commands::Info => cmd_info(),
    }
}

fn load_registry(settings: &Settings) -> Result<DecoderRegistry> {
    let registry = DecoderRegistry::new();
    for path in &settings.protocols {
        let def = ProtocolDefinition::from_file(path)?;
        let decoder = AbiEventDecoder::new(&def)
            .with_context(|| format!("protocol '{}' in {}", def.name, path.display()))?;
        registry
            .register(Arc::new(decoder))
            .with_context(|| format!("registering {}", path.display()))?;
    }
    Ok(registry)
}

async fn cmd_run(settings: Settings) -> Result<()> {
    init_tracing(&settings.logging.log_config()).map_err(|e| anyhow!("logging setup: {e}"))?;

    let registry = load_registry(&settings)?;
    tracing::info!(protocols = ?registry.protocols(), chains = settings.chains.len(), "starting crossindex");

    let stores = backends::open(&settings).await?;
    let metrics = CrossIndexMetrics::global();
    let sink: Arc<dyn AnomalySink> = Arc::new(TracingSink::new(metrics.clone()));

    let normalizer = Normalizer::new(stores.messages.clone(), sink.clone(), settings.normalizer_config())
        .with_metrics(metrics.clone());
    let mut pipeline = Pipeline::new(settings.pipeline_config(), normalizer);
    if let Some(objects) = stores.objects.clone() {
        pipeline = pipeline.with_archiver(Archiver::new(
            stores.messages.clone(),
            objects,
            sink.clone(),
            settings.archiver_config(),
        ));
    }

    for chain in &settings.chains {
        if registry.for_chain(chain.chain_id).is_empty() {
            tracing::warn!(chain_id = chain.chain_id, chain = %chain.name, "no protocol is deployed on this chain");
        }
        let client = HttpRpcClient::new(chain.rpc_url.clone(), chain.request_timeout)
            .with_context(|| format!("rpc client for chain {}", chain.chain_id))?;
        let watcher = ChainWatcherBuilder::from_config(settings.chain_config(chain))
            .indexer_id(settings.indexer.indexer_id.clone())
            .client(Arc::new(client))
            .registry(registry.clone())
            .checkpoint_store(stores.checkpoints.clone())
            .anomaly_sink(sink.clone())
            .metrics(metrics.clone())
            .events(pipeline.events())
            .build()
            .with_context(|| format!("watcher for chain {}", chain.chain_id))?;
        pipeline.add_watcher(watcher);
    }

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        token.cancel();
    });

    let report = pipeline.run(cancel).await;
    if !report.failed_chains.is_empty() {
        let chains: Vec<String> = report
            .failed_chains
            .iter()
            .map(|(id, e)| format!("{id}: {e}"))
            .collect();
        bail!("chain watchers failed: {}", chains.join("; "));
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn cmd_check_config(settings: &Settings) -> Result<()> {
    let registry = load_registry(settings)?;

    println!("Configuration OK");
    println!();
    println!("Chains:");
    for chain in &settings.chains {
        let protocols: Vec<String> = registry
            .for_chain(chain.chain_id)
            .iter()
            .map(|d| d.protocol().to_string())
            .collect();
        println!(
            "  {:>8}  {:<12} depth={:<4} range={:<6} rate={}/s  protocols=[{}]",
            chain.chain_id,
            chain.name,
            chain.confirmation_depth,
            chain.max_block_range,
            chain.rate_limit,
            protocols.join(", ")
        );
    }
    println!();
    println!("Protocols:           {}", registry.protocols().join(", "));
    println!(
        "Message store:       {}",
        if settings.database.is_some() { "postgres" } else { "memory" }
    );
    println!(
        "Archive:             {}",
        match &settings.object_storage {
            Some(s) => format!("s3 {}/{}", s.endpoint, s.bucket),
            None => "disabled".into(),
        }
    );
    let backends = backends::available();
    if settings.database.is_some() && !backends.contains(&"postgres") {
        println!("warning: built without the `postgres` feature; `run` will refuse this config");
    }
    if settings.object_storage.is_some() && !backends.contains(&"s3") {
        println!("warning: built without the `s3` feature; `run` will refuse this config");
    }
    Ok(())
}

fn cmd_info() -> Result<()> {
    let defaults = settings::IndexerSettings::default();
    println!("CrossIndex v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Capabilities:");
    println!("  ✓ EVM log scanning          (eth_blockNumber, eth_getLogs, eth_getBlockByNumber)");
    println!("  ✓ Declarative decoders      (Solidity event signatures via alloy-dyn-abi)");
    println!("  ✓ Out-of-order correlation  (bounded orphan retry queue)");
    println!("  ✓ Content-addressed archive (messages/<protocol>/<sha256>.json)");
    println!();
    println!("Storage backends:            {}", backends::available().join(", "));
    println!("Default confirmation depth:  12 blocks");
    println!("Default max block range:     1000 blocks per eth_getLogs");
    println!("Default poll interval:       {}s", defaults.poll_interval.as_secs());
    println!("Default archive retention:   {}s", defaults.archive_retention.as_secs());
    println!(
        "Orphan retry window:         {} attempts / {}s",
        defaults.orphans.max_attempts,
        defaults.orphans.max_age.as_secs()
    );
    Ok(())
}
