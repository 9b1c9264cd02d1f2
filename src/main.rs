use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use zsxq_relay::checkpoint::CheckpointStore;
use zsxq_relay::config;
use zsxq_relay::format::TelegramFormatter;
use zsxq_relay::groups::GroupDirectory;
use zsxq_relay::orchestrator::{EngineSettings, SourceOrchestrator, StopSignal};
use zsxq_relay::telegram::TelegramSink;
use zsxq_relay::zsxq::ZsxqClient;

#[derive(Debug, Parser)]
#[command(author, version, about = "Forward new zsxq topics to Telegram on a schedule")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    let feed = ZsxqClient::from_config(&cfg)?;
    let sink = TelegramSink::from_config(&cfg);
    let store = CheckpointStore::from_config(&cfg);
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
    if groups.len() < cfg.groups.len() {
        orchestrator
            .report_error(&format!(
                "{} of {} groups could not be resolved; ids are shown instead of names",
                cfg.groups.len() - groups.len(),
                cfg.groups.len()
            ))
            .await;
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received; finishing current unit"),
            Err(err) => error!(?err, "failed to listen for Ctrl-C"),
        }
        let _ = stop_tx.send(true);
    });
    let mut stop = StopSignal::new(stop_rx);

    let interval = Duration::from_secs(cfg.app.crawl_interval_minutes * 60);
    info!(
        groups = cfg.groups.len(),
        interval_minutes = cfg.app.crawl_interval_minutes,
        checkpoints = %store.path().display(),
        "starting relay"
    );

    loop {
        let summary = orchestrator.run_once(&cfg.groups, &stop).await;
        if summary.failed() > 0 {
            warn!(failed = summary.failed(), "some items could not be forwarded");
        }
        if stop.is_stopped() {
            break;
        }
        info!(next_in_minutes = cfg.app.crawl_interval_minutes, "sleeping until next pass");
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop.stopped() => break,
        }
    }

    info!("relay stopped");
    Ok(())
}
