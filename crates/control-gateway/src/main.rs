//! Control gateway: REST control API, agent WebSocket endpoint, and the
//! prometheus scrape target, in front of the orchestration engine.

mod api;
mod ws;

use anyhow::Result;
use async_trait::async_trait;
use axum::routing::{delete, get, post};
use axum::Router;
use clap::Parser;
use orchestration_core::config::OrchestratorConfig;
use orchestration_core::worker_pool::TaskHandler;
use orchestration_core::{Orchestrator, Task};
use serde::{Deserialize, Serialize};
use state_store::{MemoryStore, RedisStore, StateStore, StoreConfig};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "control-gateway", about = "Agent orchestration control plane")]
struct Args {
    /// Path to a config file (toml/yaml/json); env vars override it.
    #[arg(long)]
    config: Option<String>,

    /// Listen port override.
    #[arg(long)]
    port: Option<u16>,

    /// Use the in-memory store instead of Redis.
    #[arg(long)]
    memory_store: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum StoreBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct GatewayConfig {
    listen_port: u16,
    store_backend: StoreBackend,
    store: StoreConfig,
    engine: OrchestratorConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_port: 8080,
            store_backend: StoreBackend::Redis,
            store: StoreConfig::default(),
            engine: OrchestratorConfig::default(),
        }
    }
}

fn load_config(args: &Args) -> Result<GatewayConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = &args.config {
        builder = builder.add_source(config::File::with_name(path));
    }
    builder = builder.add_source(
        config::Environment::with_prefix("ORCHESTRATOR")
            .separator("__")
            .try_parsing(true),
    );
    let mut loaded: GatewayConfig = builder.build()?.try_deserialize()?;

    if let Some(port) = args.port {
        loaded.listen_port = port;
    }
    if args.memory_store {
        loaded.store_backend = StoreBackend::Memory;
    }
    Ok(loaded)
}

/// Worker-pool handler of the gateway process. Task payload semantics belong
/// to the worker tier; the in-process pool just acknowledges the work so
/// plans can be exercised without external workers.
struct PassthroughHandler;

#[async_trait]
impl TaskHandler for PassthroughHandler {
    async fn handle(&self, task: &Task) -> Result<serde_json::Value, String> {
        Ok(serde_json::json!({
            "task_id": task.id,
            "accepted": true,
            "payload": task.payload,
        }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let gateway_config = load_config(&args)?;

    let store: Arc<dyn StateStore> = match gateway_config.store_backend {
        StoreBackend::Redis => {
            info!("connecting to redis store at {}", gateway_config.store.url);
            Arc::new(RedisStore::new(gateway_config.store.clone()).await?)
        }
        StoreBackend::Memory => {
            info!("using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let orchestrator = Orchestrator::new(
        gateway_config.engine.clone(),
        store,
        Arc::new(PassthroughHandler),
    );
    orchestrator.start();

    let state = api::AppState {
        orchestrator: orchestrator.clone(),
    };

    let app = Router::new()
        .route("/health", get(api::health))
        .route("/metrics", get(api::metrics))
        .route("/ws", get(ws::agent_socket))
        .route("/api/v1/agents", post(api::register_agent).get(api::list_agents))
        .route(
            "/api/v1/agents/:id",
            get(api::get_agent)
                .delete(api::unregister_agent)
                .put(api::update_agent),
        )
        .route("/api/v1/agents/discover", post(api::discover_agents))
        .route("/api/v1/tasks", post(api::submit_task).get(api::list_tasks))
        .route(
            "/api/v1/tasks/:id",
            get(api::get_task).delete(api::cancel_task),
        )
        .route("/api/v1/workflows", post(api::submit_workflow))
        .route("/api/v1/plans", post(api::submit_plan))
        .route(
            "/api/v1/plans/:id",
            get(api::get_plan).delete(api::cancel_plan),
        )
        .route("/api/v1/system/metrics", get(api::system_metrics))
        .route("/api/v1/system/report", get(api::performance_report))
        .route("/api/v1/rules", post(api::add_rule).get(api::list_rules))
        .route("/api/v1/rules/:id", delete(api::remove_rule))
        .route("/api/v1/templates", post(api::register_template))
        .route(
            "/api/v1/deployments",
            post(api::create_deployment).get(api::list_deployments),
        )
        .route("/api/v1/deployments/:id", delete(api::remove_deployment))
        .route("/api/v1/deployments/:id/scale", post(api::scale_deployment))
        .route("/api/v1/deployments/:id/update", post(api::update_deployment))
        .route("/api/v1/queue/dead-letters", get(api::dead_letters))
        .route(
            "/api/v1/queue/dead-letters/:id/requeue",
            post(api::requeue_dead_letter),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state);

    let listener =
        tokio::net::TcpListener::bind(("0.0.0.0", gateway_config.listen_port)).await?;
    info!("control gateway listening on :{}", gateway_config.listen_port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(orchestrator))
        .await?;
    Ok(())
}

async fn shutdown_signal(orchestrator: Arc<Orchestrator>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("interrupt received, shutting down");
    orchestrator.shutdown().await;
}
