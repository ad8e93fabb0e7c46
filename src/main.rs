//! Storefront Sync Agent - local HTTP surface over the sync layer
//!
//! Serves the storefront UI with:
//! - Cached collections that stay readable while offline
//! - Writes applied immediately or queued for replay
//! - Connectivity edges, manual sync, and a notification stream (SSE)
//!
//! Without `SUPABASE_URL` the agent serves the built-in mock catalog.

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Instant};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use uuid::Uuid;

use storefront_sync::{
    gateway::{GatewayError, MemoryGateway, PersistenceGateway, RestGateway},
    model::{EntityType, Mutation, MutationOp, UnknownEntityType},
    realtime::{BroadcastRealtime, PhoenixConfig, PhoenixRealtime, RealtimeSource},
    storage::QueueStore,
    sync::{
        spawn_background_tasks, CollectionView, Connectivity, ConnectivityMonitor, DrainSummary,
        MutationOutcome, SyncController, SyncError, SyncStatus,
    },
    AgentConfig,
};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    controller: Arc<SyncController>,
    connectivity: ConnectivityMonitor,
    /// `supabase` or `mock`
    backend: &'static str,
    started_at: Instant,
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    backend: String,
    uptime_seconds: u64,
    is_online: bool,
    pending_changes: usize,
}

#[derive(Debug, Deserialize)]
struct MutationRequest {
    entity_type: EntityType,
    #[serde(flatten)]
    op: MutationOp,
}

#[derive(Debug, Serialize)]
struct ConnectivityResponse {
    state: Connectivity,
    changed: bool,
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    entity_type: EntityType,
    count: usize,
}

type ApiError = (StatusCode, String);

fn parse_entity(entity: &str) -> Result<EntityType, ApiError> {
    entity
        .parse()
        .map_err(|e: UnknownEntityType| (StatusCode::NOT_FOUND, e.to_string()))
}

fn gateway_status(error: &GatewayError) -> StatusCode {
    match error {
        GatewayError::Rejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
        GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn sync_error(error: SyncError) -> ApiError {
    let status = match &error {
        SyncError::Offline => StatusCode::SERVICE_UNAVAILABLE,
        SyncError::Gateway(e) => gateway_status(e),
        SyncError::DrainHalted { source, .. } if source.is_transient() => StatusCode::BAD_GATEWAY,
        SyncError::DrainHalted { .. } => StatusCode::CONFLICT,
        SyncError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, error.to_string())
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.controller.status();
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: state.backend.to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        is_online: status.is_online,
        pending_changes: status.pending_changes,
    })
}

async fn sync_status(State(state): State<Arc<AppState>>) -> Json<SyncStatus> {
    Json(state.controller.status())
}

/// Cached collection; served in every phase, never blocks on the gateway
async fn get_collection(
    State(state): State<Arc<AppState>>,
    Path(entity): Path<String>,
) -> Result<Json<CollectionView>, ApiError> {
    let entity_type = parse_entity(&entity)?;
    Ok(Json(state.controller.cache().get(entity_type)))
}

async fn refresh_collection(
    State(state): State<Arc<AppState>>,
    Path(entity): Path<String>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let entity_type = parse_entity(&entity)?;
    let count = state
        .controller
        .refresh(entity_type)
        .await
        .map_err(|e| (gateway_status(&e), e.to_string()))?;
    Ok(Json(RefreshResponse { entity_type, count }))
}

async fn record_mutation(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MutationRequest>,
) -> Result<(StatusCode, Json<MutationOutcome>), ApiError> {
    let outcome = state
        .controller
        .record_mutation(request.entity_type, request.op)
        .await
        .map_err(sync_error)?;

    let status = match outcome {
        MutationOutcome::Applied { .. } => StatusCode::OK,
        MutationOutcome::Queued { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}

async fn list_pending(State(state): State<Arc<AppState>>) -> Json<Vec<Mutation>> {
    Json(state.controller.pending())
}

async fn discard_pending(
    State(state): State<Arc<AppState>>,
    Path(mutation_id): Path<Uuid>,
) -> Result<Json<Mutation>, ApiError> {
    match state.controller.discard_mutation(mutation_id).map_err(sync_error)? {
        Some(mutation) => Ok(Json(mutation)),
        None => Err((
            StatusCode::NOT_FOUND,
            format!("No pending mutation {}", mutation_id),
        )),
    }
}

async fn manual_sync(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DrainSummary>, ApiError> {
    state
        .controller
        .trigger_manual_sync()
        .await
        .map(Json)
        .map_err(sync_error)
}

/// Connectivity edge reported by the host (browser online/offline events)
async fn report_connectivity(
    State(state): State<Arc<AppState>>,
    Path(connectivity): Path<String>,
) -> Result<Json<ConnectivityResponse>, ApiError> {
    let connectivity: Connectivity = connectivity
        .parse()
        .map_err(|e: String| (StatusCode::BAD_REQUEST, e))?;
    let changed = state.connectivity.report(connectivity);
    Ok(Json(ConnectivityResponse {
        state: connectivity,
        changed,
    }))
}

/// Notification stream for banners and toasts
async fn notifications(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.controller.notifier().subscribe()).filter_map(
        |notification| {
            let notification = notification.ok()?;
            Event::default().json_data(notification).ok().map(Ok)
        },
    );
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ============================================================================
// STARTUP
// ============================================================================

/// Pick the gateway: Supabase when configured, otherwise the mock catalog
fn build_gateway(
    config: &AgentConfig,
) -> anyhow::Result<(Arc<dyn PersistenceGateway>, Option<Arc<BroadcastRealtime>>, &'static str)> {
    match &config.rest {
        Some(rest) => {
            info!("Using Supabase at {}", rest.base_url);
            let gateway: Arc<dyn PersistenceGateway> = Arc::new(RestGateway::new(rest.clone())?);
            Ok((gateway, None, "supabase"))
        }
        None => {
            warn!("SUPABASE_URL not set - serving the mock catalog");
            let hub = Arc::new(BroadcastRealtime::new());
            let gateway: Arc<dyn PersistenceGateway> =
                Arc::new(MemoryGateway::with_mock_catalog().with_realtime(hub.clone()));
            Ok((gateway, Some(hub), "mock"))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "storefront_sync=info,tower_http=info".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();
    let config = AgentConfig::from_env()?;

    info!("Opening mutation queue at: {}", config.storage.path);
    let store = QueueStore::open(config.storage.clone())?;

    let (gateway, hub, backend) = build_gateway(&config)?;
    let controller = Arc::new(SyncController::new(config.sync.clone(), gateway, store)?);

    let realtime: Option<Arc<dyn RealtimeSource>> = match (&config.rest, hub) {
        (_, Some(hub)) => Some(hub as Arc<dyn RealtimeSource>),
        (Some(rest), None) => {
            let phoenix = PhoenixConfig::new(&rest.base_url, &rest.api_key);
            match PhoenixRealtime::connect(phoenix, controller.shutdown_receiver()).await {
                Ok(realtime) => Some(realtime as Arc<dyn RealtimeSource>),
                Err(e) => {
                    warn!("Realtime unavailable, relying on polling: {}", e);
                    None
                }
            }
        }
        (None, None) => None,
    };

    let initial = if config.sync.start_online {
        Connectivity::Online
    } else {
        Connectivity::Offline
    };
    let connectivity = ConnectivityMonitor::new(initial);
    let background_handles =
        spawn_background_tasks(controller.clone(), realtime, connectivity.subscribe());

    let state = Arc::new(AppState {
        controller: controller.clone(),
        connectivity,
        backend,
        started_at: Instant::now(),
    });

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/status", get(sync_status))
        .route("/api/collections/:entity", get(get_collection))
        .route("/api/collections/:entity/refresh", post(refresh_collection))
        .route("/api/mutations", get(list_pending).post(record_mutation))
        .route("/api/mutations/:mutation_id", delete(discard_pending))
        .route("/api/sync", post(manual_sync))
        .route("/api/connectivity/:state", post(report_connectivity))
        .route("/api/notifications", get(notifications))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    info!("Storefront sync agent v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Backend: {}", backend);
    info!("   Listening on: http://{}", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    controller.shutdown();
    background_handles.wait().await;
    info!("Pending mutations at exit: {}", controller.status().pending_changes);

    Ok(())
}
