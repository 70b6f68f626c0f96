use std::sync::Arc;

use axum::{Json, Router, routing::get};
use relayer_core::signer::LocalKeySigner;
use relayer_executors::relay::RelayWorker;
use tokio::{sync::watch, task::JoinHandle};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_axum::{router::OpenApiRouter, routes};
use utoipa_scalar::{Scalar, Servable};

use crate::{chains::RpcChainService, store::RelayStore};

use super::routes::{admin, configuration, health, transaction, transactions};

pub type Worker = RelayWorker<RelayStore, RpcChainService, LocalKeySigner>;

#[derive(Clone)]
pub struct RelayerServerState {
    pub worker: Worker,
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Transaction Relayer API",
        description = "Queue contract calls, follow them until they are mined, and tune the relay loops at runtime."
    ),
    tags(
        (name = "Transactions", description = "Transaction intake and status"),
        (name = "Configuration", description = "Runtime tunables of the relay loops"),
        (name = "Admin", description = "Operator actions"),
        (name = "System", description = "Process health"),
    )
)]
pub struct ApiDoc;

/// Builds the application router with the OpenAPI document at `/openapi.json`
/// and an API reference at `/reference`
pub fn router(state: RelayerServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_credentials(false);

    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .routes(routes!(transaction::queue_transaction))
        .routes(routes!(transaction::get_transaction))
        .routes(routes!(transaction::cancel_transaction))
        .routes(routes!(transactions::list_transactions))
        .routes(routes!(transactions::list_deployed_contracts))
        .routes(routes!(
            configuration::get_transaction_configuration,
            configuration::update_transaction_configuration
        ))
        .routes(routes!(admin::reset_nonces))
        .routes(routes!(health::health))
        .split_for_parts();

    let api = Arc::new(api);
    let document = api.clone();

    router
        .route(
            "/openapi.json",
            get(move || {
                let document = document.clone();
                async move { Json(document.as_ref().clone()) }
            }),
        )
        .merge(Scalar::with_url("/reference", api.as_ref().clone()))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct RelayerServer {
    handle: Option<JoinHandle<Result<(), std::io::Error>>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    app: Router,
}

impl RelayerServer {
    pub fn new(state: RelayerServerState) -> Self {
        Self {
            handle: None,
            shutdown_tx: None,
            app: router(state),
        }
    }

    pub fn start(&mut self, listener: tokio::net::TcpListener) -> Result<(), std::io::Error> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let app = self.app.clone();
        let local_addr = listener.local_addr()?;

        let handle = tokio::spawn(async move {
            tracing::info!("HTTP server starting on {}", local_addr);

            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let mut rx = shutdown_rx;
                    let _ = rx.wait_for(|stop| *stop).await;
                    tracing::info!("HTTP server shutting down");
                })
                .await
        });

        self.handle = Some(handle);
        self.shutdown_tx = Some(shutdown_tx);

        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), std::io::Error> {
        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(true).is_err() {
                tracing::error!("Failed to send shutdown signal to HTTP server");
            }
        }

        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(result) => {
                    if let Err(e) = result {
                        tracing::error!("HTTP server error during shutdown: {}", e);
                        return Err(e);
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to join HTTP server task: {}", e);
                    return Err(std::io::Error::other(format!("Task join error: {e}")));
                }
            }
        }

        Ok(())
    }
}
