//! Axum JSON API over the enhancement pipeline.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use uuid::Uuid;
use vep_core::{CategoryEnhancement, VehicleEnhancementSummary};
use vep_pipeline::{summarize, EnhancementPipeline, PipelineConfig};
use vep_store::{
    EnhancementStateStore, MemoryEnhancementStore, MemoryVehicleCatalog, PgEnhancementStore,
    VehicleCatalog,
};

pub const CRATE_NAME: &str = "vep-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<EnhancementPipeline>,
    pub store: Arc<dyn EnhancementStateStore>,
    pub catalog: Arc<dyn VehicleCatalog>,
}

impl AppState {
    pub fn new(
        pipeline: Arc<EnhancementPipeline>,
        store: Arc<dyn EnhancementStateStore>,
        catalog: Arc<dyn VehicleCatalog>,
    ) -> Self {
        Self {
            pipeline,
            store,
            catalog,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/vehicles/{id}/enhance", post(enhance_handler))
        .route("/vehicles/{id}/enhancements", get(enhancements_handler))
        .route("/vehicles/{id}/summary", get(summary_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("VEP_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8100);
    let config = PipelineConfig::from_env();
    let store: Arc<dyn EnhancementStateStore> = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let store = PgEnhancementStore::connect(&database_url).await?;
            store.ensure_schema().await?;
            Arc::new(store)
        }
        Err(_) => Arc::new(MemoryEnhancementStore::new()),
    };
    let catalog = Arc::new(MemoryVehicleCatalog::new());
    let pipeline = Arc::new(EnhancementPipeline::from_config(&config, store.clone())?);
    let state = AppState::new(pipeline, store, catalog);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Triggers a full enhancement run for a known vehicle and returns the
/// resulting rollup. The body is empty; the catalog supplies the identity.
async fn enhance_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    let identity = match state.catalog.resolve(id).await {
        Ok(Some(identity)) => identity,
        Ok(None) => return not_found("unknown vehicle"),
        Err(err) => return server_error(err),
    };
    match state.pipeline.run(id, &identity).await {
        Ok(summary) => json_ok(&summary),
        Err(err) => server_error(err),
    }
}

async fn enhancements_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.store.list_by_vehicle(id).await {
        Ok(rows) => json_ok::<Vec<CategoryEnhancement>>(&rows),
        Err(err) => server_error(err),
    }
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.store.list_by_vehicle(id).await {
        Ok(rows) if rows.is_empty() => not_found("vehicle has no enhancement records"),
        Ok(rows) => json_ok::<VehicleEnhancementSummary>(&summarize(&rows)),
        Err(err) => server_error(err),
    }
}

fn json_ok<T: Serialize>(value: &T) -> Response {
    Json(value).into_response()
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;
    use vep_adapters::{GapFill, RawAttribute, RegistryLookup, RegistryMatch, RegistryRecord};
    use vep_core::{CategorySchema, FieldMap, VehicleIdentity};
    use vep_pipeline::Normalizer;

    struct StubRegistry;

    #[async_trait]
    impl RegistryLookup for StubRegistry {
        async fn lookup(&self, _identity: &VehicleIdentity) -> Option<RegistryRecord> {
            Some(RegistryRecord {
                attributes: vec![RawAttribute {
                    name: "Displacement (L)".into(),
                    value: serde_json::json!("2.5L"),
                }],
                matched_by: RegistryMatch::Vin,
            })
        }
    }

    struct StubGapFill;

    #[async_trait]
    impl GapFill for StubGapFill {
        async fn fill(
            &self,
            _identity: &VehicleIdentity,
            _schema: &CategorySchema,
            _existing: &FieldMap,
        ) -> FieldMap {
            FieldMap::new()
        }
    }

    async fn test_state() -> (AppState, Arc<MemoryVehicleCatalog>) {
        let store = Arc::new(MemoryEnhancementStore::new());
        let catalog = Arc::new(MemoryVehicleCatalog::new());
        let pipeline = Arc::new(EnhancementPipeline::new(
            Arc::new(StubRegistry),
            Arc::new(StubGapFill),
            store.clone(),
            Normalizer::default(),
            Duration::from_secs(25),
            0.30,
        ));
        (
            AppState::new(pipeline, store, catalog.clone()),
            catalog,
        )
    }

    fn identity() -> VehicleIdentity {
        VehicleIdentity {
            year: Some(2020),
            make: Some("Toyota".into()),
            model: Some("Camry".into()),
            trim: None,
            vin: Some("4T1B11HK5LU123456".into()),
        }
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn get_req(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn enhance_unknown_vehicle_is_404() {
        let (state, _catalog) = test_state().await;
        let app = app(state);
        let resp = app
            .oneshot(post(&format!("/vehicles/{}/enhance", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn enhance_runs_the_pipeline_and_returns_a_summary() {
        let (state, catalog) = test_state().await;
        let vehicle_id = Uuid::new_v4();
        catalog.register(vehicle_id, identity()).await;
        let app = app(state);

        let resp = app
            .oneshot(post(&format!("/vehicles/{vehicle_id}/enhance")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        // Only the engine category gets registry data; the rest fail with
        // the stub sources both empty.
        assert_eq!(json["overall_status"], "partial");
        assert_eq!(json["categories_completed"], 1);
        assert_eq!(json["total_categories"], 6);
    }

    #[tokio::test]
    async fn enhancements_listing_reflects_persisted_rows() {
        let (state, catalog) = test_state().await;
        let vehicle_id = Uuid::new_v4();
        catalog.register(vehicle_id, identity()).await;
        let app = app(state);

        let enhance = app
            .clone()
            .oneshot(post(&format!("/vehicles/{vehicle_id}/enhance")))
            .await
            .unwrap();
        assert_eq!(enhance.status(), StatusCode::OK);

        let resp = app
            .oneshot(get_req(&format!("/vehicles/{vehicle_id}/enhancements")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let rows = json.as_array().unwrap();
        assert_eq!(rows.len(), 6);
        assert_eq!(rows[0]["category"], "engine");
        assert_eq!(rows[0]["status"], "completed");
        assert_eq!(rows[3]["category"], "fuel-economy");
        assert_eq!(rows[3]["status"], "failed");
    }

    #[tokio::test]
    async fn summary_without_rows_is_404() {
        let (state, _catalog) = test_state().await;
        let app = app(state);
        let resp = app
            .oneshot(get_req(&format!("/vehicles/{}/summary", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn summary_recomputes_from_rows() {
        let (state, catalog) = test_state().await;
        let vehicle_id = Uuid::new_v4();
        catalog.register(vehicle_id, identity()).await;
        let app = app(state);

        app.clone()
            .oneshot(post(&format!("/vehicles/{vehicle_id}/enhance")))
            .await
            .unwrap();
        let resp = app
            .oneshot(get_req(&format!("/vehicles/{vehicle_id}/summary")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["overall_status"], "partial");
        assert!(json["last_enhanced_at"].is_string());
    }

    #[tokio::test]
    async fn malformed_vehicle_id_is_rejected() {
        let (state, _catalog) = test_state().await;
        let app = app(state);
        let resp = app
            .oneshot(get_req("/vehicles/not-a-uuid/summary"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
