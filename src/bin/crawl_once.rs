use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use zsxq_relay::checkpoint::CheckpointStore;
use zsxq_relay::config;
use zsxq_relay::format::TelegramFormatter;
use zsxq_relay::groups::GroupDirectory;
use zsxq_relay::model::FeedKind;
use zsxq_relay::orchestrator::{EngineSettings, SourceOrchestrator, StopSignal};
use zsxq_relay::telegram::TelegramSink;
use zsxq_relay::zsxq::ZsxqClient;

#[derive(Debug, Parser)]
#[command(author, version, about = "Run a single crawl pass over all groups and exit")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Clear stored checkpoints of this group before crawling
    #[arg(long, value_name = "GROUP_ID")]
    reset: Option<String>,

    /// Restrict --reset to one feed kind (home or digest)
    #[arg(long, requires = "reset", value_parser = parse_kind)]
    kind: Option<FeedKind>,
}

fn parse_kind(raw: &str) -> Result<FeedKind, String> {
    match raw {
        "home" => Ok(FeedKind::Home),
        "digest" => Ok(FeedKind::Digest),
        other => Err(format!("unknown feed kind: {other}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let store = CheckpointStore::from_config(&cfg);
    if let Some(group_id) = args.reset.as_deref() {
        if cfg.group(group_id).is_none() {
            bail!("group {group_id} is not configured");
        }
        if store.reset(group_id, args.kind).await? {
            info!(group_id, kind = ?args.kind, "checkpoints cleared");
        } else {
            warn!(group_id, "no stored checkpoint to clear");
        }
    }

    let feed = ZsxqClient::from_config(&cfg)?;
    let sink = TelegramSink::from_config(&cfg);
    let groups = GroupDirectory::load(&feed, &cfg.groups).await;

    let orchestrator = SourceOrchestrator {
        feed: &feed,
        sink: &sink,
        renderer: &TelegramFormatter,
        store: &store,
        groups: &groups,
        settings: EngineSettings::from_config(&cfg.app),
        error_thread_id: cfg.telegram.error_thread_id,
    };

    let summary = orchestrator.run_once(&cfg.groups, &StopSignal::never()).await;
    for unit in &summary.units {
        info!(
            group_id = %unit.group_id,
            kind = %unit.kind,
            fetched = unit.fetched,
            forwarded = unit.forwarded,
            failed = unit.failed,
            stop = ?unit.stop,
            outcome = ?unit.outcome,
            "unit finished"
        );
    }
    info!(
        forwarded = summary.forwarded(),
        failed = summary.failed(),
        "crawl pass complete"
    );
    Ok(())
}
