use std::sync::Arc;

use anyhow::Context;
use tracing::{info, instrument, warn};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

mod cli;

use beacon_controller::{Controller, ControllersConfig, HttpPolicy, PointLibrary};
use beacon_queue::Queue;
use beacon_scheduler::{LogStatus, Scheduler, SchedulerConfig};
use beacon_uplink::{UplinkClient, UplinkConfig};
use beacon_util::config;
use beacon_util::dirs::{config_dir, state_dir};
use beacon_util::store::Store;

use crate::cli::Cli;

fn initialize_tracing() {
    // Use some log defaults. These can be overriden using RUST_LOG
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("debug,hyper=error,hyper_util=error,reqwest=info,rustls=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false)),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    initialize_tracing();

    let cli = cli::parse();
    info!("starting version {}", env!("CARGO_PKG_VERSION"));

    let queue_path = cli
        .queue_path
        .clone()
        .unwrap_or_else(|| state_dir().join("queue.db"));
    let queue = Queue::open(&queue_path)
        .await
        .with_context(|| format!("failed to open queue at {}", queue_path.display()))?;

    if let Some(scope) = cli.clear_queue {
        queue.clear(scope.into()).await?;
        return Ok(());
    }

    let config_store = Store::new(cli.config_dir.clone().unwrap_or_else(config_dir));
    let controllers: ControllersConfig = config::get_or_init(&config_store)
        .await
        .context("failed to load controllers config")?;
    let library: PointLibrary = config::get_or_init(&config_store)
        .await
        .context("failed to load points config")?;

    start(cli, queue, controllers, library).await;
    Ok(())
}

#[instrument(name = "beacon", skip_all)]
async fn start(cli: Cli, queue: Queue, controllers: ControllersConfig, library: PointLibrary) {
    let policy = HttpPolicy {
        retries: cli.http_retries,
        retry_delay: cli.retry_delay,
        timeout: cli.http_timeout,
        request_delay: cli.request_delay,
    };
    let library = Arc::new(library);
    let controllers: Vec<_> = controllers
        .devices
        .into_iter()
        .map(|device| {
            info!(name = %device.name, address = %device.address, "using controller");
            Arc::new(Controller::new(
                device,
                controllers.poll_interval,
                policy.clone(),
                library.clone(),
            ))
        })
        .collect();
    if controllers.is_empty() {
        warn!("no controllers configured, only queued records will be published");
    }

    let mut uplink_config = UplinkConfig::new(cli.scope_id, cli.device_id, cli.group_key);
    if let Some(endpoint) = cli.provisioning_endpoint {
        uplink_config.provisioning_endpoint = endpoint;
    }
    uplink_config.hub_endpoint = cli.hub_endpoint;
    uplink_config.sas_ttl = cli.sas_ttl;
    let uplink = Arc::new(UplinkClient::with_http(uplink_config));

    let scheduler = Scheduler::new(
        controllers,
        queue,
        uplink,
        Arc::new(LogStatus),
        SchedulerConfig {
            publish_interval: cli.publish_interval,
            max_queued_records: cli.max_queued_records,
            trim_batch_size: cli.trim_batch_size,
        },
    );

    scheduler.run(shutdown_signal()).await;
}

/// Resolve on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
