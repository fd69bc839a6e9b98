//! Enhancement state persistence: collaborator contract plus in-memory and
//! Postgres-backed implementations.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use uuid::Uuid;
use vep_core::{
    Category, CategoryEnhancement, Confidence, EnhancementState, FieldMap, VehicleIdentity,
};

pub const CRATE_NAME: &str = "vep-store";

/// One row per (vehicle, category); `upsert` overwrites any prior record for
/// the same key so repeated runs are idempotent.
#[async_trait]
pub trait EnhancementStateStore: Send + Sync {
    async fn upsert(&self, record: CategoryEnhancement) -> Result<()>;

    async fn get(&self, vehicle_id: Uuid, category: Category)
        -> Result<Option<CategoryEnhancement>>;

    /// All records for the vehicle, in the fixed category processing order.
    async fn list_by_vehicle(&self, vehicle_id: Uuid) -> Result<Vec<CategoryEnhancement>>;
}

/// Resolves a vehicle id to its identity so the trigger surface can stay
/// body-less.
#[async_trait]
pub trait VehicleCatalog: Send + Sync {
    async fn resolve(&self, vehicle_id: Uuid) -> Result<Option<VehicleIdentity>>;
}

#[derive(Debug, Default)]
pub struct MemoryEnhancementStore {
    records: Mutex<HashMap<(Uuid, Category), CategoryEnhancement>>,
}

impl MemoryEnhancementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EnhancementStateStore for MemoryEnhancementStore {
    async fn upsert(&self, record: CategoryEnhancement) -> Result<()> {
        let mut records = self.records.lock().await;
        records.insert((record.vehicle_id, record.category), record);
        Ok(())
    }

    async fn get(
        &self,
        vehicle_id: Uuid,
        category: Category,
    ) -> Result<Option<CategoryEnhancement>> {
        let records = self.records.lock().await;
        Ok(records.get(&(vehicle_id, category)).cloned())
    }

    async fn list_by_vehicle(&self, vehicle_id: Uuid) -> Result<Vec<CategoryEnhancement>> {
        let records = self.records.lock().await;
        let mut rows: Vec<_> = records
            .values()
            .filter(|r| r.vehicle_id == vehicle_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.category);
        Ok(rows)
    }
}

#[derive(Debug, Default)]
pub struct MemoryVehicleCatalog {
    vehicles: Mutex<HashMap<Uuid, VehicleIdentity>>,
}

impl MemoryVehicleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, vehicle_id: Uuid, identity: VehicleIdentity) {
        let mut vehicles = self.vehicles.lock().await;
        vehicles.insert(vehicle_id, identity);
    }
}

#[async_trait]
impl VehicleCatalog for MemoryVehicleCatalog {
    async fn resolve(&self, vehicle_id: Uuid) -> Result<Option<VehicleIdentity>> {
        let vehicles = self.vehicles.lock().await;
        Ok(vehicles.get(&vehicle_id).cloned())
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS category_enhancements (
    vehicle_id UUID NOT NULL,
    category TEXT NOT NULL,
    status TEXT NOT NULL,
    data JSONB,
    sources JSONB,
    confidence TEXT,
    error TEXT,
    processing_started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    PRIMARY KEY (vehicle_id, category)
)
"#;

#[derive(Debug, Clone)]
pub struct PgEnhancementStore {
    pool: PgPool,
}

impl PgEnhancementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to enhancement database")?;
        Ok(Self::new(pool))
    }

    /// Creates the backing table if missing. The composite primary key is
    /// what makes the upsert well-defined.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .context("creating category_enhancements table")?;
        Ok(())
    }
}

#[async_trait]
impl EnhancementStateStore for PgEnhancementStore {
    async fn upsert(&self, record: CategoryEnhancement) -> Result<()> {
        let (data, sources, confidence, error) = match &record.state {
            EnhancementState::Completed {
                data,
                sources,
                confidence,
            } => (
                Some(serde_json::to_value(data).context("serializing enhancement data")?),
                Some(serde_json::to_value(sources).context("serializing enhancement sources")?),
                Some(confidence_label(*confidence)),
                None,
            ),
            EnhancementState::Failed { error } => (None, None, None, Some(error.clone())),
            EnhancementState::Pending | EnhancementState::Processing => (None, None, None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO category_enhancements
                (vehicle_id, category, status, data, sources, confidence, error,
                 processing_started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (vehicle_id, category) DO UPDATE SET
                status = EXCLUDED.status,
                data = EXCLUDED.data,
                sources = EXCLUDED.sources,
                confidence = EXCLUDED.confidence,
                error = EXCLUDED.error,
                processing_started_at = EXCLUDED.processing_started_at,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(record.vehicle_id)
        .bind(record.category.as_str())
        .bind(record.state.status_label())
        .bind(data)
        .bind(sources)
        .bind(confidence)
        .bind(error)
        .bind(record.processing_started_at)
        .bind(record.completed_at)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "upserting enhancement {}/{}",
                record.vehicle_id, record.category
            )
        })?;
        Ok(())
    }

    async fn get(
        &self,
        vehicle_id: Uuid,
        category: Category,
    ) -> Result<Option<CategoryEnhancement>> {
        let row = sqlx::query(
            r#"
            SELECT vehicle_id, category, status, data, sources, confidence, error,
                   processing_started_at, completed_at
              FROM category_enhancements
             WHERE vehicle_id = $1 AND category = $2
            "#,
        )
        .bind(vehicle_id)
        .bind(category.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("fetching enhancement record")?;

        row.map(record_from_row).transpose()
    }

    async fn list_by_vehicle(&self, vehicle_id: Uuid) -> Result<Vec<CategoryEnhancement>> {
        let rows = sqlx::query(
            r#"
            SELECT vehicle_id, category, status, data, sources, confidence, error,
                   processing_started_at, completed_at
              FROM category_enhancements
             WHERE vehicle_id = $1
            "#,
        )
        .bind(vehicle_id)
        .fetch_all(&self.pool)
        .await
        .context("listing enhancement records")?;

        let mut records = rows
            .into_iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>>>()?;
        records.sort_by_key(|r| r.category);
        Ok(records)
    }
}

fn confidence_label(confidence: Confidence) -> &'static str {
    match confidence {
        Confidence::High => "high",
        Confidence::Medium => "medium",
        Confidence::Low => "low",
    }
}

fn parse_confidence(label: &str) -> Option<Confidence> {
    match label {
        "high" => Some(Confidence::High),
        "medium" => Some(Confidence::Medium),
        "low" => Some(Confidence::Low),
        _ => None,
    }
}

fn record_from_row(row: sqlx::postgres::PgRow) -> Result<CategoryEnhancement> {
    let vehicle_id: Uuid = row.try_get("vehicle_id")?;
    let category_label: String = row.try_get("category")?;
    let category = Category::parse(&category_label)
        .with_context(|| format!("unknown category {category_label} in store"))?;
    let status: String = row.try_get("status")?;
    let processing_started_at: Option<DateTime<Utc>> = row.try_get("processing_started_at")?;
    let completed_at: Option<DateTime<Utc>> = row.try_get("completed_at")?;

    let state = match status.as_str() {
        "pending" => EnhancementState::Pending,
        "processing" => EnhancementState::Processing,
        "completed" => {
            let data_json: Option<serde_json::Value> = row.try_get("data")?;
            let sources_json: Option<serde_json::Value> = row.try_get("sources")?;
            let confidence_label: Option<String> = row.try_get("confidence")?;
            let data: FieldMap = data_json
                .map(serde_json::from_value)
                .transpose()
                .context("decoding enhancement data")?
                .with_context(|| format!("completed row {vehicle_id}/{category} has no data"))?;
            let sources = sources_json
                .map(serde_json::from_value)
                .transpose()
                .context("decoding enhancement sources")?
                .unwrap_or_default();
            let confidence = confidence_label
                .as_deref()
                .and_then(parse_confidence)
                .with_context(|| {
                    format!("completed row {vehicle_id}/{category} has no confidence")
                })?;
            EnhancementState::Completed {
                data,
                sources,
                confidence,
            }
        }
        "failed" => {
            let error: Option<String> = row.try_get("error")?;
            EnhancementState::Failed {
                error: error.unwrap_or_else(|| "unknown failure".to_string()),
            }
        }
        other => bail!("unknown enhancement status {other} in store"),
    };

    Ok(CategoryEnhancement {
        vehicle_id,
        category,
        state,
        processing_started_at,
        completed_at,
    })
}
