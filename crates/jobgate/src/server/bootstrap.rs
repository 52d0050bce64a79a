use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::JOBGATE_VERSION;
use crate::common::config::{BackendConfig, GatewayConfig, get_tick_interval};
use crate::common::identity::{IcatClient, IdentityRef};
use crate::common::shell::{ExecutorRef, ProcessExecutor};
use crate::common::ticker::run_periodically;
use crate::server::dispatcher::{Backend, Dispatcher};
use crate::server::http::{DispatcherRef, create_router};
use crate::server::pbs::PbsBackend;
use crate::server::pbs::load::GangliaLoadSource;
use crate::server::unixbatch::UnixBatchBackend;
use crate::store::{Store, StoreRef};

/// Builds the backend selected by the configuration.
async fn create_backend(
    config: &BackendConfig,
    store: StoreRef,
    executor: ExecutorRef,
) -> anyhow::Result<Backend> {
    Ok(match config {
        BackendConfig::Pbs(pbs) => {
            let loads = GangliaLoadSource::connect(&pbs.ganglia_host, pbs.ganglia_port)
                .await
                .context("Cannot reach the load feed")?;
            log::info!(
                "Set up pbs with load feed {}:{}",
                pbs.ganglia_host,
                pbs.ganglia_port
            );
            Backend::Pbs(PbsBackend::new(
                pbs.clone(),
                store,
                executor,
                Arc::new(loads),
            ))
        }
        BackendConfig::UnixBatch(batch) => {
            let backend = UnixBatchBackend::new(batch.clone(), store, executor);
            log::info!(
                "Set up unix_batch with default family {}",
                backend.default_family().unwrap_or_default()
            );
            Backend::UnixBatch(backend)
        }
    })
}

/// Starts the reconcile and reclaim ticks of a PBS backend. Other backends have no periodic work.
pub fn spawn_ticks(
    dispatcher: DispatcherRef,
    period: Duration,
    stop: CancellationToken,
) -> Vec<JoinHandle<()>> {
    if !matches!(dispatcher.backend(), Backend::Pbs(_)) {
        return vec![];
    }

    let reconcile = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(run_periodically(
            "reconcile",
            period,
            stop.clone(),
            move || {
                let dispatcher = dispatcher.clone();
                async move {
                    if let Backend::Pbs(pbs) = dispatcher.backend() {
                        let summary = pbs.reconcile().await?;
                        if !summary.updated.is_empty() {
                            log::debug!("Reconciled jobs {:?}", summary.updated);
                        }
                    }
                    Ok::<(), anyhow::Error>(())
                }
            },
        ))
    };
    let reclaim = tokio::spawn(run_periodically("reclaim", period, stop, move || {
        let dispatcher = dispatcher.clone();
        async move {
            if let Backend::Pbs(pbs) = dispatcher.backend() {
                let summary = pbs.reclaim().await?;
                log::debug!(
                    "Reclaim expired {} and deleted {} accounts, restored hosts {:?}",
                    summary.expired.len(),
                    summary.deleted.len(),
                    summary.restored_hosts
                );
            }
            Ok::<(), anyhow::Error>(())
        }
    }));
    vec![reconcile, reclaim]
}

/// Runs the gateway until Ctrl-C.
pub async fn start_server(config: GatewayConfig) -> anyhow::Result<()> {
    let store: StoreRef = Arc::new(
        Store::open(&config.database)
            .with_context(|| format!("Cannot open database {}", config.database.display()))?,
    );
    let identity: IdentityRef = Arc::new(IcatClient::new(
        &config.icat.url,
        config.icat.trust_store.as_deref(),
    )?);
    let backend = create_backend(&config.backend, store.clone(), ProcessExecutor::new_ref()).await?;
    let backend_name = backend.name();
    let dispatcher = Arc::new(Dispatcher::new(identity, store, backend));

    let stop = CancellationToken::new();
    let ticks = spawn_ticks(dispatcher.clone(), get_tick_interval(), stop.clone());

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Cannot listen on {}", config.listen))?;
    log::info!(
        "jobgate {JOBGATE_VERSION} serving the {backend_name} backend on {}",
        listener.local_addr()?
    );

    let shutdown = {
        let stop = stop.clone();
        async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                log::error!("Cannot listen for Ctrl-C: {error}");
            }
            log::info!("Stopping server");
            stop.cancel();
        }
    };
    let result = axum::serve(listener, create_router(dispatcher))
        .with_graceful_shutdown(shutdown)
        .await;
    stop.cancel();
    for tick in ticks {
        if let Err(error) = tick.await {
            log::error!("Periodic task did not finish cleanly: {error}");
        }
    }
    result.context("HTTP server failed")
}
