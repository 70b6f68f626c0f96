use std::sync::Arc;

use redis::aio::ConnectionManager;
use relayer_core::{signer::LocalKeySigner, transaction_config::TransactionConfigHandle};
use relayer_executors::relay::{
    Cadence, InMemoryTransactionStore, PercentageBump, RedisTransactionStore, RelayWorker,
    TaskRunner,
};
use relayer_server::{
    RelayStore, RpcChainService, StoreBackend, Worker,
    config::{self, LogFormat},
    http::server::{RelayerServer, RelayerServerState},
};
use tokio::sync::watch;
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::get_config()?;

    let subscriber = tracing_subscriber::registry().with(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level if RUST_LOG environment variable is not set
            "relayer=info,relayer_server=debug,relayer_executors=debug,relayer_core=debug,tower_http=debug,axum=debug"
                .into()
        }),
    );

    match config.server.log_format {
        LogFormat::Json => subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => subscriber.with(tracing_subscriber::fmt::layer()).init(),
    }

    let signer = Arc::new(LocalKeySigner::from_private_keys(
        config.relayer.wallet_private_keys.as_slice(),
    )?);
    for wallet in signer.addresses() {
        tracing::info!(wallet = %wallet, "Relayer wallet loaded");
    }

    let store = match config.relayer.store {
        StoreBackend::Redis => {
            let client = redis::Client::open(config.redis.url.as_str())?;
            let redis = ConnectionManager::new(client).await?;
            RelayStore::Redis(RedisTransactionStore::new(
                redis,
                config.relayer.namespace.clone(),
            ))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store, transactions are lost on restart");
            RelayStore::Memory(InMemoryTransactionStore::new())
        }
    };
    tracing::info!(backend = store.backend_name(), "Transaction store initialized");

    let chains = Arc::new(RpcChainService {
        rpc_url_template: config.relayer.rpc_url_template.clone(),
        rpc_timeout: config.relayer.rpc_timeout(),
    });

    let transaction_config = TransactionConfigHandle::new(config.transactions.clone())?;

    let worker: Worker = RelayWorker::new(
        Arc::new(store),
        chains,
        signer,
        transaction_config.clone(),
    )
    .with_fee_policy(PercentageBump {
        percent: config.relayer.fee_bump_percent,
    })
    .with_worker_lease_ttl(config.relayer.worker_lease_ttl());

    tracing::info!(instance_id = %worker.instance_id, "Relay worker initialized");

    let mut server = RelayerServer::new(RelayerServerState {
        worker: worker.clone(),
    });

    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;

    server.start(listener)?;

    // Start relay loops
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let schedulers = spawn_schedulers(
        &worker,
        &transaction_config,
        config.relayer.submission_interval(),
        shutdown_rx,
    );

    tracing::info!("Server and schedulers started, waiting for shutdown signal");
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl+C: {}", e);
    }
    tracing::info!("Shutdown signal received");

    if let Err(e) = server.shutdown().await {
        tracing::error!("Error during HTTP server shutdown: {}", e);
    } else {
        tracing::info!("HTTP server shut down successfully");
    }

    // Schedulers finish their in-flight run before exiting
    let _ = shutdown_tx.send(true);
    for result in futures::future::join_all(schedulers).await {
        if let Err(e) = result {
            tracing::error!("Scheduler task failed: {}", e);
        }
    }
    tracing::info!("All schedulers stopped");

    if let Err(e) = worker.release_worker_lease().await {
        tracing::warn!("Failed to release worker lease: {}", e);
    }

    Ok(())
}

fn spawn_schedulers(
    worker: &Worker,
    transaction_config: &TransactionConfigHandle,
    submission_interval: std::time::Duration,
    shutdown: watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let submission = {
        let worker = worker.clone();
        TaskRunner::new(
            "submission",
            move || Cadence::Every(submission_interval),
            move || {
                let worker = worker.clone();
                async move {
                    if let Err(e) = worker.run_submission().await {
                        tracing::error!(error = %e, "Submission tick failed");
                    }
                }
            },
        )
    };

    let confirmation = {
        let worker = worker.clone();
        let handle = transaction_config.clone();
        TaskRunner::new(
            "confirmation",
            move || Cadence::from_cron(handle.snapshot().mined_tx_listener_cron_schedule.as_deref()),
            move || {
                let worker = worker.clone();
                async move {
                    if let Err(e) = worker.run_confirmation().await {
                        tracing::error!(error = %e, "Confirmation run failed");
                    }
                }
            },
        )
    };

    let retry = {
        let worker = worker.clone();
        let handle = transaction_config.clone();
        TaskRunner::new(
            "retry",
            move || Cadence::from_cron(handle.snapshot().retry_tx_listener_cron_schedule.as_deref()),
            move || {
                let worker = worker.clone();
                async move {
                    if let Err(e) = worker.run_retry().await {
                        tracing::error!(error = %e, "Retry run failed");
                    }
                }
            },
        )
    };

    vec![
        tokio::spawn(submission.run(shutdown.clone())),
        tokio::spawn(confirmation.run(shutdown.clone())),
        tokio::spawn(retry.run(shutdown)),
    ]
}
