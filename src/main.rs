use clap::Parser;
use sip_flow_runner::cli::{run_compare, run_inspect, run_validate, Cli};
use sip_flow_runner::config::{self, RunConfig};
use sip_flow_runner::data_source::DataSource;
use sip_flow_runner::error::SipFlowError;
use sip_flow_runner::reporter::{self, RunReport};
use sip_flow_runner::scenario;
use sip_flow_runner::scheduler::{CallScheduler, SchedulerOptions};
use sip_flow_runner::shutdown::setup_signal_handler;
use sip_flow_runner::stats::{display_final_summary, StatsAggregator};
use sip_flow_runner::transport::{Transport, UdpTransport};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli {
        Cli::Run { config: config_path, output } => run_flow(&config_path, output.as_deref()).await,
        Cli::Validate { scenario } => run_validate(&scenario).map(|_| ()),
        Cli::Inspect { scenario } => run_inspect(&scenario).map(|_| ()),
        Cli::Compare { current, previous } => run_compare(&current, &previous).map(|_| ()),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Paths in the config file are relative to the config file itself.
fn resolve_relative(config_path: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match config_path.parent() {
        Some(dir) => dir.join(path),
        None => path.to_path_buf(),
    }
}

fn load_data_source(config_path: &Path, cfg: &RunConfig) -> Result<DataSource, SipFlowError> {
    match &cfg.data_file {
        Some(file) => {
            let source = DataSource::load_from_file(&resolve_relative(config_path, file), &cfg.data_source_options())?;
            tracing::info!(file = %file, rows = source.len(), cycling = source.is_cycling(), "data source loaded");
            Ok(source)
        }
        None => Ok(DataSource::single_empty()),
    }
}

async fn run_flow(config_path: &Path, output: Option<&Path>) -> Result<(), SipFlowError> {
    let cfg = config::load_from_file(config_path)?;
    let model = scenario::load_from_file(&resolve_relative(config_path, &cfg.scenario_file))?;
    let source = load_data_source(config_path, &cfg)?;
    let started_at = reporter::unix_timestamp();

    let shutdown = CancellationToken::new();
    setup_signal_handler(shutdown.clone())
        .map_err(|e| SipFlowError::ConfigError(format!("Failed to install signal handler: {}", e)))?;

    let source_ip = cfg.source_addr()?;
    let transport = UdpTransport::bind(source_ip, cfg.source_port, cfg.socket_count).await?;
    let receivers = transport.spawn_receivers(shutdown.clone());
    let local = transport
        .socket_addr(0)
        .unwrap_or_else(|| SocketAddr::new(source_ip, cfg.source_port));
    tracing::info!(%local, sockets = transport.socket_count(), target = %cfg.target_address, "transport bound");

    let ctx = Arc::new(cfg.dialog_context(local)?);
    let stats = Arc::new(StatsAggregator::new());
    let options = SchedulerOptions {
        pattern: cfg.pattern.clone(),
        report_interval: cfg.report_interval(),
        drain_timeout: Duration::from_secs(cfg.shutdown_timeout),
        on_rollup: None,
    };
    let scheduler = CallScheduler::new(
        Arc::new(transport.clone()) as Arc<dyn Transport>,
        stats,
        shutdown.clone(),
        ctx,
        options,
    );

    let summary = scheduler
        .run(
            Arc::new(model.clone()),
            &source,
            cfg.calls_per_second,
            cfg.concurrency_ceiling,
            cfg.total_calls,
        )
        .await?;

    // 受信ループを停止する
    shutdown.cancel();
    for handle in receivers {
        if tokio::time::timeout(Duration::from_secs(1), handle).await.is_err() {
            tracing::warn!("receive loop did not stop in time");
        }
    }
    if transport.unrouted_count() > 0 || transport.parse_error_count() > 0 {
        tracing::info!(
            unrouted = transport.unrouted_count(),
            parse_errors = transport.parse_error_count(),
            "inbound datagrams not delivered to a dialog"
        );
    }

    display_final_summary(&summary);

    if let Some(output_path) = output {
        let report = RunReport::new(cfg, model.name(), summary, started_at);
        reporter::write_json_result(&report, output_path)
            .map_err(|e| SipFlowError::ConfigError(format!("Failed to write result file: {:#}", e)))?;
    }

    Ok(())
}
