use crate::cluster::KubeCluster;
use crate::config::Config;
use crate::oci_registry::OciRegistryClient;
use crate::state::{ControllerContext, OwnerKinds};
use crate::webserver::Health;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod append_list;
mod cluster;
mod config;
mod controller;
mod credentials;
mod error;
mod image_reference;
mod keychain;
mod loader;
mod oci_registry;
mod repo;
mod secret_string;
mod state;
mod webserver;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

type Context = ControllerContext<KubeCluster, OciRegistryClient>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting kube-digest-refresh {}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(config::load_config_from_env()?);
    let client = cluster::create_client().await?;
    let ctx = ControllerContext {
        cluster: Arc::new(KubeCluster::new(client)),
        registry: Arc::new(OciRegistryClient::new(&config.registry)?),
        config: config.clone(),
        owner_kinds: Arc::new(OwnerKinds::default()),
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(shutdown.clone()));

    match &config.schedule {
        Some(schedule) => run_scheduled(ctx, schedule.clone(), &config, shutdown).await,
        None => run_once(ctx, shutdown).await,
    }
}

async fn cancel_on_ctrl_c(shutdown: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received interrupt, cancelling");
        shutdown.cancel();
    }
}

async fn run_once(ctx: Context, shutdown: CancellationToken) -> anyhow::Result<()> {
    controller::run(ctx, shutdown)
        .await
        .inspect_err(|e| error!("Digest refresh run failed: {}", e.chain()))?;
    Ok(())
}

async fn run_scheduled(
    ctx: Context,
    schedule: String,
    config: &Config,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!("Executing job scheduler at cron schedule {}", schedule);
    let health = Arc::new(Health::default());
    let running = Arc::new(tokio::sync::Mutex::new(()));
    let mut scheduler = JobScheduler::new().await?;

    let job_health = health.clone();
    let job_shutdown = shutdown.clone();
    let job = Job::new_async(schedule, move |_uuid, _l| {
        let ctx = ctx.clone();
        let health = job_health.clone();
        let running = running.clone();
        let cancel = job_shutdown.child_token();
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("Previous digest refresh run is still in progress, skipping");
                return;
            };
            let result = controller::run(ctx, cancel).await;
            if let Err(e) = &result {
                error!("Digest refresh run failed: {}", e.chain());
            }
            health.record_run(result.is_err());
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;

    let app = webserver::create_app(health);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    scheduler.shutdown().await?;
    Ok(())
}
