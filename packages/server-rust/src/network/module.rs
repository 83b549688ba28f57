//! Network module with deferred startup lifecycle.
//!
//! `new()` holds configuration, `start()` binds the TCP listener, and
//! `serve()` spawns the accept loop and hands back a [`ListenerHandle`]
//! that the shutdown sequence later stops. Binding before serving lets the
//! process fail fast on a taken port before anything else is started.

use std::net::SocketAddr;

use anyhow::Context as _;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::config::NetworkConfig;
use super::handlers::{
    create_user, get_profile, get_user, health_handler, liveness_handler, metrics_handler,
    readiness_handler, update_profile, AppState,
};
use super::middleware::build_http_layers;
use crate::service::middleware::IngressPipeline;

/// Owns the listener from bind until it is moved into the server task.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            listener: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Assembles the router.
    ///
    /// Routes:
    /// - `GET /health`, `GET /livez`, `GET /ready` -- probes
    /// - `GET <metrics path>` -- Prometheus scrape, when enabled
    /// - `POST /api/v1/users`, `GET /api/v1/users/{id}`
    /// - `GET|PUT /api/v1/users/profile` -- behind the auth stage
    ///
    /// Effective order per request: trace, log, metrics, transport
    /// (panic catch, body limit, timeout), auth, handler.
    pub fn build_router(&self, state: AppState, pipeline: &IngressPipeline) -> Router {
        let mut public = Router::new()
            .route("/health", get(health_handler))
            .route("/livez", get(liveness_handler))
            .route("/ready", get(readiness_handler))
            .route("/api/v1/users", post(create_user))
            .route("/api/v1/users/{id}", get(get_user));
        if let Some(path) = &self.config.metrics_path {
            public = public.route(path, get(metrics_handler));
        }

        let protected = Router::new()
            .route("/api/v1/users/profile", get(get_profile).put(update_profile))
            .route_layer(pipeline.auth_layer());

        self.with_ingress(public.merge(protected), pipeline)
            .with_state(state)
    }

    /// Wraps `routes` in the transport layers, then the ingress stages.
    fn with_ingress(
        &self,
        routes: Router<AppState>,
        pipeline: &IngressPipeline,
    ) -> Router<AppState> {
        routes
            .layer(build_http_layers(&self.config))
            .layer(pipeline.layers())
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the bound address; the port differs from the configured one
    /// when port 0 is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        let local = listener.local_addr()?;

        info!(addr = %local, "TCP listener bound");

        self.listener = Some(listener);
        Ok(local)
    }

    /// Spawns the accept loop. Consumes `self` because the listener moves
    /// into the server task.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first.
    pub fn serve(self, router: Router) -> anyhow::Result<ListenerHandle> {
        let listener = self
            .listener
            .context("start() must be called before serve()")?;
        let local_addr = listener.local_addr()?;
        let stop = CancellationToken::new();
        let signal = stop.clone();

        let task = tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await
        });

        info!(addr = %local_addr, "Serving HTTP connections");
        Ok(ListenerHandle {
            local_addr,
            stop,
            task,
        })
    }
}

/// Running server. Dropping it leaves the server running.
#[derive(Debug)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    stop: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

impl ListenerHandle {
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for in-flight requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the server task failed or panicked.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.stop.cancel();
        self.task.await.context("listener task panicked")??;
        info!("Listener stopped");
        Ok(())
    }
}
