//! Reconciliation pipeline: normalization, cross-source merge, the
//! per-category scheduler, and the vehicle-level aggregation.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use vep_adapters::{
    extract, GapFill, HttpGapFillAdapter, HttpRegistryAdapter, RegistryLookup,
};
use vep_core::{
    CategoryEnhancement, CategorySchema, Confidence, FieldConflict, FieldKind, FieldMap,
    FieldSpec, FieldValue, NormalizeRule, OverallStatus, ReconciliationResult,
    VehicleEnhancementSummary, VehicleIdentity,
};
use vep_store::EnhancementStateStore;

pub const CRATE_NAME: &str = "vep-pipeline";

/// Relative tolerance for numeric comparison, anchored on the authoritative
/// value. A difference of exactly this fraction is still agreement.
pub const NUMERIC_TOLERANCE: f64 = 0.05;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub registry_base_url: String,
    pub gap_fill_base_url: String,
    pub call_timeout: Duration,
    pub run_deadline: Duration,
    pub gap_fill_threshold: f64,
    pub workspace_root: PathBuf,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            registry_base_url: std::env::var("VEP_REGISTRY_URL")
                .unwrap_or_else(|_| "http://localhost:8101".to_string()),
            gap_fill_base_url: std::env::var("VEP_GAP_FILL_URL")
                .unwrap_or_else(|_| "http://localhost:8102".to_string()),
            call_timeout: Duration::from_secs(
                std::env::var("VEP_CALL_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            ),
            run_deadline: Duration::from_secs(
                std::env::var("VEP_RUN_DEADLINE_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(25),
            ),
            gap_fill_threshold: std::env::var("VEP_GAP_FILL_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.30),
            workspace_root: PathBuf::from("."),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            registry_base_url: "http://localhost:8101".to_string(),
            gap_fill_base_url: "http://localhost:8102".to_string(),
            call_timeout: Duration::from_secs(10),
            run_deadline: Duration::from_secs(25),
            gap_fill_threshold: 0.30,
            workspace_root: PathBuf::from("."),
        }
    }
}

// ---------------------------------------------------------------------------
// Normalizer

#[derive(Debug, Clone, Deserialize)]
struct SynonymRule {
    canonical: String,
    matches: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct SynonymRulesFile {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    #[serde(default)]
    drivetrain: Vec<SynonymRule>,
    #[serde(default)]
    fuel_type: Vec<SynonymRule>,
    #[serde(default)]
    transmission: Vec<SynonymRule>,
}

/// Pure value canonicalization for cross-source comparison: unit conversion
/// for numerics, synonym collapsing for categorical strings, case-fold +
/// trim as the default text rule.
#[derive(Debug, Clone)]
pub struct Normalizer {
    drivetrain: HashMap<String, String>,
    fuel_type: HashMap<String, String>,
    transmission: HashMap<String, String>,
}

fn fold_text(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn synonym_map(defaults: &[(&str, &[&str])]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (canonical, matches) in defaults {
        map.insert(fold_text(canonical), canonical.to_string());
        for m in *matches {
            map.insert(fold_text(m), canonical.to_string());
        }
    }
    map
}

const DRIVETRAIN_DEFAULTS: &[(&str, &[&str])] = &[
    ("fwd", &["front wheel drive", "front-wheel drive", "2wd front"]),
    ("rwd", &["rear wheel drive", "rear-wheel drive", "2wd rear"]),
    ("awd", &["all wheel drive", "all-wheel drive"]),
    ("4wd", &["four wheel drive", "four-wheel drive", "4x4"]),
];

const FUEL_TYPE_DEFAULTS: &[(&str, &[&str])] = &[
    (
        "gasoline",
        &["gas", "petrol", "regular unleaded", "premium unleaded"],
    ),
    ("diesel", &["diesel fuel"]),
    ("hybrid", &["gas/electric hybrid", "gasoline hybrid"]),
    ("electric", &["ev", "battery electric"]),
];

const TRANSMISSION_DEFAULTS: &[(&str, &[&str])] = &[
    ("automatic", &["auto", "automatic transmission"]),
    ("manual", &["manual transmission", "stick shift"]),
    (
        "cvt",
        &["continuously variable", "continuously variable transmission"],
    ),
];

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            drivetrain: synonym_map(DRIVETRAIN_DEFAULTS),
            fuel_type: synonym_map(FUEL_TYPE_DEFAULTS),
            transmission: synonym_map(TRANSMISSION_DEFAULTS),
        }
    }
}

impl Normalizer {
    /// Built-in synonym tables, optionally extended from
    /// `rules/synonyms.yaml` under the workspace root.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let mut normalizer = Normalizer::default();
        let rules_path = root.join("rules").join("synonyms.yaml");
        if !rules_path.exists() {
            return Ok(normalizer);
        }
        let text = std::fs::read_to_string(&rules_path)
            .with_context(|| format!("reading {}", rules_path.display()))?;
        let rules: SynonymRulesFile = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", rules_path.display()))?;
        normalizer.merge_rules(&rules.drivetrain, SynonymTable::Drivetrain);
        normalizer.merge_rules(&rules.fuel_type, SynonymTable::FuelType);
        normalizer.merge_rules(&rules.transmission, SynonymTable::Transmission);
        Ok(normalizer)
    }

    fn merge_rules(&mut self, rules: &[SynonymRule], table: SynonymTable) {
        let map = match table {
            SynonymTable::Drivetrain => &mut self.drivetrain,
            SynonymTable::FuelType => &mut self.fuel_type,
            SynonymTable::Transmission => &mut self.transmission,
        };
        for rule in rules {
            map.insert(fold_text(&rule.canonical), rule.canonical.clone());
            for m in &rule.matches {
                map.insert(fold_text(m), rule.canonical.clone());
            }
        }
    }

    pub fn normalize_text(&self, rule: NormalizeRule, input: &str) -> String {
        let folded = fold_text(input);
        let table = match rule {
            NormalizeRule::Drivetrain => Some(&self.drivetrain),
            NormalizeRule::FuelType => Some(&self.fuel_type),
            NormalizeRule::Transmission => Some(&self.transmission),
            _ => None,
        };
        match table.and_then(|t| t.get(&folded)) {
            Some(canonical) => canonical.clone(),
            None => folded,
        }
    }

    pub fn normalize_number(&self, rule: NormalizeRule, value: f64) -> f64 {
        match rule {
            // Displacement in liters never reaches triple digits; a value
            // that large is cubic centimeters.
            NormalizeRule::DisplacementLiters if value >= 100.0 => value / 1000.0,
            _ => value,
        }
    }

    /// Whether two values for the same field agree after normalization.
    /// Numbers use relative tolerance anchored on the authoritative value;
    /// everything else requires exact normalized equality.
    pub fn values_agree(
        &self,
        spec: &FieldSpec,
        authoritative: &FieldValue,
        inferred: &FieldValue,
    ) -> bool {
        match (spec.kind, authoritative, inferred) {
            (FieldKind::Number, FieldValue::Number(a), FieldValue::Number(b)) => {
                let a = self.normalize_number(spec.rule, *a);
                let b = self.normalize_number(spec.rule, *b);
                (a - b).abs() <= NUMERIC_TOLERANCE * a.abs()
            }
            (FieldKind::Text, FieldValue::Text(a), FieldValue::Text(b)) => {
                self.normalize_text(spec.rule, a) == self.normalize_text(spec.rule, b)
            }
            (FieldKind::Flag, FieldValue::Flag(a), FieldValue::Flag(b)) => a == b,
            _ => false,
        }
    }
}

enum SynonymTable {
    Drivetrain,
    FuelType,
    Transmission,
}

// ---------------------------------------------------------------------------
// Reconciler

/// Merges the authoritative and inferred field sets for one category.
/// Authoritative always wins when both are present; conflicts are detected
/// independently of merge direction and only count fields present in both
/// sources.
pub fn reconcile(
    normalizer: &Normalizer,
    schema: &CategorySchema,
    authoritative: &FieldMap,
    inferred: &FieldMap,
) -> ReconciliationResult {
    let mut merged = FieldMap::new();
    let mut conflicts = Vec::new();

    for spec in schema.fields {
        let auth = authoritative.get(spec.name).filter(|v| !v.is_empty());
        let inf = inferred.get(spec.name).filter(|v| !v.is_empty());

        match (auth, inf) {
            (Some(a), Some(b)) => {
                merged.insert(spec.name.to_string(), a.clone());
                if !normalizer.values_agree(spec, a, b) {
                    conflicts.push(FieldConflict {
                        field: spec.name.to_string(),
                        authoritative: a.clone(),
                        inferred: b.clone(),
                    });
                }
            }
            (Some(a), None) => {
                merged.insert(spec.name.to_string(), a.clone());
            }
            (None, Some(b)) => {
                merged.insert(spec.name.to_string(), b.clone());
            }
            (None, None) => {}
        }
    }

    let confidence = Confidence::from_conflict_count(conflicts.len());
    ReconciliationResult {
        merged,
        conflicts,
        confidence,
    }
}

/// Fraction of schema fields that are null/empty in the extracted set.
pub fn gap_fraction(schema: &CategorySchema, extracted: &FieldMap) -> f64 {
    let filled = schema
        .fields
        .iter()
        .filter(|spec| {
            extracted
                .get(spec.name)
                .map(|v| !v.is_empty())
                .unwrap_or(false)
        })
        .count();
    let total = schema.fields.len();
    (total - filled) as f64 / total as f64
}

// ---------------------------------------------------------------------------
// Aggregator

/// Recomputes the vehicle-level summary from the per-category rows. Pure;
/// never cached independently of the rows it summarizes.
pub fn summarize(rows: &[CategoryEnhancement]) -> VehicleEnhancementSummary {
    let completed = rows.iter().filter(|r| r.state.is_completed()).count();
    let failed = rows.iter().filter(|r| r.state.is_failed()).count();
    let overall_status = if !rows.is_empty() && completed == rows.len() {
        OverallStatus::Completed
    } else if !rows.is_empty() && failed == rows.len() {
        OverallStatus::Failed
    } else {
        OverallStatus::Partial
    };
    VehicleEnhancementSummary {
        overall_status,
        categories_completed: completed,
        total_categories: rows.len(),
        last_enhanced_at: rows.iter().filter_map(|r| r.completed_at).max(),
    }
}

// ---------------------------------------------------------------------------
// Scheduler

enum CategoryOutcome {
    Completed {
        data: FieldMap,
        sources: BTreeSet<String>,
        confidence: Confidence,
    },
    Failed {
        error: String,
    },
}

/// Drives the fixed, ordered category set through extract -> reconcile ->
/// persist under a whole-run wall-clock deadline. All collaborators are
/// injected; the pipeline holds no global state.
pub struct EnhancementPipeline {
    registry: Arc<dyn RegistryLookup>,
    gap_fill: Arc<dyn GapFill>,
    store: Arc<dyn EnhancementStateStore>,
    normalizer: Normalizer,
    run_deadline: Duration,
    gap_fill_threshold: f64,
    run_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl EnhancementPipeline {
    pub fn new(
        registry: Arc<dyn RegistryLookup>,
        gap_fill: Arc<dyn GapFill>,
        store: Arc<dyn EnhancementStateStore>,
        normalizer: Normalizer,
        run_deadline: Duration,
        gap_fill_threshold: f64,
    ) -> Self {
        Self {
            registry,
            gap_fill,
            store,
            normalizer,
            run_deadline,
            gap_fill_threshold,
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Builds a pipeline with HTTP-backed adapters from config.
    pub fn from_config(
        config: &PipelineConfig,
        store: Arc<dyn EnhancementStateStore>,
    ) -> Result<Self> {
        let registry = HttpRegistryAdapter::new(&config.registry_base_url, config.call_timeout)?;
        let gap_fill = HttpGapFillAdapter::new(&config.gap_fill_base_url, config.call_timeout)?;
        let normalizer = Normalizer::from_workspace_root(&config.workspace_root)?;
        Ok(Self::new(
            Arc::new(registry),
            Arc::new(gap_fill),
            store,
            normalizer,
            config.run_deadline,
            config.gap_fill_threshold,
        ))
    }

    /// Overlapping runs for the same vehicle are serialized; interleaved
    /// upserts to the same key could otherwise pair one run's data with the
    /// other's confidence.
    async fn vehicle_lock(&self, vehicle_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.run_locks.lock().await;
        locks
            .entry(vehicle_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn run(
        &self,
        vehicle_id: Uuid,
        identity: &VehicleIdentity,
    ) -> Result<VehicleEnhancementSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("enhancement_run", %run_id, %vehicle_id);
        let lock = self.vehicle_lock(vehicle_id).await;
        let _guard = lock.lock().await;
        let started = Instant::now();

        let result = self
            .run_locked(vehicle_id, identity)
            .instrument(span.clone())
            .await;

        drop(_guard);
        {
            // Two strong counts mean the map entry plus our local clone;
            // anything more is another run waiting on this vehicle.
            let mut locks = self.run_locks.lock().await;
            if let Some(entry) = locks.get(&vehicle_id) {
                if Arc::strong_count(entry) <= 2 {
                    locks.remove(&vehicle_id);
                }
            }
        }

        let summary = result?;
        let _enter = span.enter();
        info!(
            overall_status = ?summary.overall_status,
            categories_completed = summary.categories_completed,
            total_categories = summary.total_categories,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "enhancement run finished"
        );
        Ok(summary)
    }

    async fn run_locked(
        &self,
        vehicle_id: Uuid,
        identity: &VehicleIdentity,
    ) -> Result<VehicleEnhancementSummary> {
        // Pre-flight, fatal, zero external calls.
        if !identity.has_required_fields() {
            let now = Utc::now();
            for schema in CategorySchema::all() {
                self.store
                    .upsert(CategoryEnhancement::failed(
                        vehicle_id,
                        schema.category,
                        "missing required identity fields",
                        None,
                        now,
                    ))
                    .await?;
            }
            return self.final_summary(vehicle_id).await;
        }

        for schema in CategorySchema::all() {
            self.store
                .upsert(CategoryEnhancement::pending(vehicle_id, schema.category))
                .await?;
        }

        let deadline = Instant::now() + self.run_deadline;
        for schema in CategorySchema::all() {
            if deadline.saturating_duration_since(Instant::now()).is_zero() {
                // Not-yet-started categories stay pending.
                warn!(category = %schema.category, "run deadline reached; stopping dispatch");
                break;
            }

            let started_at = Utc::now();
            self.store
                .upsert(CategoryEnhancement::processing(
                    vehicle_id,
                    schema.category,
                    started_at,
                ))
                .await?;

            match timeout_at(deadline, self.process_category(identity, schema)).await {
                Ok(outcome) => {
                    let record = match outcome {
                        CategoryOutcome::Completed {
                            data,
                            sources,
                            confidence,
                        } => CategoryEnhancement::completed(
                            vehicle_id,
                            schema.category,
                            data,
                            sources,
                            confidence,
                            started_at,
                            Utc::now(),
                        ),
                        CategoryOutcome::Failed { error } => CategoryEnhancement::failed(
                            vehicle_id,
                            schema.category,
                            error,
                            Some(started_at),
                            Utc::now(),
                        ),
                    };
                    self.store.upsert(record).await?;
                }
                Err(_elapsed) => {
                    // In-flight work is discarded wholesale, including the
                    // processing marker.
                    warn!(
                        category = %schema.category,
                        "run deadline expired mid-category; discarding in-flight result"
                    );
                    self.store
                        .upsert(CategoryEnhancement::pending(vehicle_id, schema.category))
                        .await?;
                    break;
                }
            }
        }

        self.final_summary(vehicle_id).await
    }

    async fn final_summary(&self, vehicle_id: Uuid) -> Result<VehicleEnhancementSummary> {
        let rows = self.store.list_by_vehicle(vehicle_id).await?;
        Ok(summarize(&rows))
    }

    async fn process_category(
        &self,
        identity: &VehicleIdentity,
        schema: &CategorySchema,
    ) -> CategoryOutcome {
        let record = self.registry.lookup(identity).await;
        let authoritative = record
            .as_ref()
            .map(|r| extract(schema, &r.attributes))
            .unwrap_or_default();

        let needs_fill = record.is_none()
            || gap_fraction(schema, &authoritative) > self.gap_fill_threshold;
        let inferred = if needs_fill {
            self.gap_fill.fill(identity, schema, &authoritative).await
        } else {
            FieldMap::new()
        };

        if authoritative.is_empty() && inferred.is_empty() {
            return CategoryOutcome::Failed {
                error: "no data available from registry or gap-fill sources".to_string(),
            };
        }

        let result = reconcile(&self.normalizer, schema, &authoritative, &inferred);
        for conflict in &result.conflicts {
            warn!(
                category = %schema.category,
                field = %conflict.field,
                authoritative = ?conflict.authoritative,
                inferred = ?conflict.inferred,
                "cross-source conflict"
            );
        }

        let mut sources = BTreeSet::new();
        for (field, _) in result.merged.iter() {
            if authoritative
                .get(field)
                .map(|v| !v.is_empty())
                .unwrap_or(false)
            {
                sources.insert("registry".to_string());
            } else {
                sources.insert("gap-fill".to_string());
            }
        }

        CategoryOutcome::Completed {
            data: result.merged,
            sources,
            confidence: result.confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vep_adapters::{RawAttribute, RegistryMatch, RegistryRecord};
    use vep_core::{Category, EnhancementState};
    use vep_store::MemoryEnhancementStore;

    fn schema(category: Category) -> &'static CategorySchema {
        CategorySchema::for_category(category)
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

    // ---- normalizer ----

    #[test]
    fn drivetrain_synonyms_collapse_to_one_canonical_form() {
        let n = Normalizer::default();
        assert_eq!(
            n.normalize_text(NormalizeRule::Drivetrain, "Front Wheel Drive"),
            n.normalize_text(NormalizeRule::Drivetrain, "FWD")
        );
        assert_eq!(
            n.normalize_text(NormalizeRule::Drivetrain, "4x4"),
            n.normalize_text(NormalizeRule::Drivetrain, "Four-Wheel Drive")
        );
    }

    #[test]
    fn fuel_type_synonyms_collapse() {
        let n = Normalizer::default();
        assert_eq!(
            n.normalize_text(NormalizeRule::FuelType, "Gas"),
            n.normalize_text(NormalizeRule::FuelType, "Gasoline")
        );
        assert_ne!(
            n.normalize_text(NormalizeRule::FuelType, "Diesel"),
            n.normalize_text(NormalizeRule::FuelType, "Gasoline")
        );
    }

    #[test]
    fn default_text_rule_is_case_fold_and_trim() {
        let n = Normalizer::default();
        assert_eq!(
            n.normalize_text(NormalizeRule::CaseFold, "  Inline-4 "),
            n.normalize_text(NormalizeRule::CaseFold, "INLINE 4")
        );
    }

    #[test]
    fn displacement_in_cc_converts_to_liters() {
        let n = Normalizer::default();
        assert_eq!(
            n.normalize_number(NormalizeRule::DisplacementLiters, 2500.0),
            2.5
        );
        assert_eq!(n.normalize_number(NormalizeRule::DisplacementLiters, 2.5), 2.5);
        assert_eq!(n.normalize_number(NormalizeRule::Plain, 2500.0), 2500.0);
    }

    #[test]
    fn yaml_rules_extend_the_builtin_tables() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("rules")).unwrap();
        std::fs::write(
            dir.path().join("rules/synonyms.yaml"),
            "version: 1\ndrivetrain:\n  - canonical: awd\n    matches: [\"symmetrical all wheel drive\"]\n",
        )
        .unwrap();

        let n = Normalizer::from_workspace_root(dir.path()).unwrap();
        assert_eq!(
            n.normalize_text(NormalizeRule::Drivetrain, "Symmetrical All-Wheel Drive"),
            "awd"
        );
        // Built-ins survive the overlay.
        assert_eq!(n.normalize_text(NormalizeRule::Drivetrain, "FWD"), "fwd");
    }

    // ---- reconciler ----

    fn num_map(pairs: &[(&str, f64)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), FieldValue::Number(*v)))
            .collect()
    }

    #[test]
    fn authoritative_wins_for_fields_present_in_both_sources() {
        let result = reconcile(
            &Normalizer::default(),
            schema(Category::Engine),
            &num_map(&[("horsepower", 203.0)]),
            &num_map(&[("horsepower", 301.0)]),
        );
        assert_eq!(
            result.merged.get("horsepower"),
            Some(&FieldValue::Number(203.0))
        );
        assert_eq!(result.conflicts.len(), 1);
    }

    #[test]
    fn tolerance_boundary_at_exactly_five_percent() {
        let n = Normalizer::default();
        let s = schema(Category::Engine);
        // 105 differs from 100 by exactly 5% of the authoritative value.
        let at_boundary = reconcile(
            &n,
            s,
            &num_map(&[("horsepower", 100.0)]),
            &num_map(&[("horsepower", 105.0)]),
        );
        assert!(at_boundary.conflicts.is_empty());
        assert_eq!(at_boundary.confidence, Confidence::High);

        let over_boundary = reconcile(
            &n,
            s,
            &num_map(&[("horsepower", 100.0)]),
            &num_map(&[("horsepower", 105.1)]),
        );
        assert_eq!(over_boundary.conflicts.len(), 1);
        assert_eq!(over_boundary.confidence, Confidence::Medium);
    }

    #[test]
    fn field_present_in_one_source_is_merged_without_conflict() {
        let result = reconcile(
            &Normalizer::default(),
            schema(Category::Engine),
            &FieldMap::new(),
            &num_map(&[("horsepower", 203.0)]),
        );
        assert_eq!(
            result.merged.get("horsepower"),
            Some(&FieldValue::Number(203.0))
        );
        assert!(result.conflicts.is_empty());
        assert_eq!(result.confidence, Confidence::High);
    }

    #[test]
    fn three_conflicts_drop_confidence_to_low() {
        let result = reconcile(
            &Normalizer::default(),
            schema(Category::Dimensions),
            &num_map(&[("length_in", 192.0), ("width_in", 72.0), ("height_in", 57.0)]),
            &num_map(&[("length_in", 250.0), ("width_in", 90.0), ("height_in", 80.0)]),
        );
        assert_eq!(result.conflicts.len(), 3);
        assert_eq!(result.confidence, Confidence::Low);
    }

    #[test]
    fn worked_example_engine_fields() {
        // Registry reports displacement "2.5L" (extracted upstream to 2.5)
        // and no horsepower; gap fill supplies 2.5 and 203.
        let s = schema(Category::Engine);
        let authoritative = extract(
            s,
            &[RawAttribute {
                name: "Displacement (L)".into(),
                value: json!("2.5L"),
            }],
        );
        let inferred = num_map(&[("displacement_liters", 2.5), ("horsepower", 203.0)]);
        let result = reconcile(&Normalizer::default(), s, &authoritative, &inferred);

        assert!(result.conflicts.is_empty());
        assert_eq!(
            result.merged.get("displacement_liters"),
            Some(&FieldValue::Number(2.5))
        );
        assert_eq!(
            result.merged.get("horsepower"),
            Some(&FieldValue::Number(203.0))
        );
        assert_eq!(result.confidence, Confidence::High);
    }

    #[test]
    fn worked_example_drivetrain_synonyms_do_not_conflict() {
        let s = schema(Category::Drivetrain);
        let authoritative: FieldMap = [(
            "drivetrain".to_string(),
            FieldValue::Text("FWD".into()),
        )]
        .into_iter()
        .collect();
        let inferred: FieldMap = [(
            "drivetrain".to_string(),
            FieldValue::Text("Front Wheel Drive".into()),
        )]
        .into_iter()
        .collect();
        let result = reconcile(&Normalizer::default(), s, &authoritative, &inferred);
        assert!(result.conflicts.is_empty());
        assert_eq!(
            result.merged.get("drivetrain"),
            Some(&FieldValue::Text("FWD".into()))
        );
    }

    #[test]
    fn gap_fraction_counts_missing_and_blank_fields() {
        let s = schema(Category::Drivetrain); // 3 fields
        assert_eq!(gap_fraction(s, &FieldMap::new()), 1.0);
        let one: FieldMap = [("gears".to_string(), FieldValue::Number(8.0))]
            .into_iter()
            .collect();
        assert!((gap_fraction(s, &one) - 2.0 / 3.0).abs() < 1e-9);
        let blank: FieldMap = [("drivetrain".to_string(), FieldValue::Text("  ".into()))]
            .into_iter()
            .collect();
        assert_eq!(gap_fraction(s, &blank), 1.0);
    }

    // ---- aggregator ----

    fn row(category: Category, state: EnhancementState) -> CategoryEnhancement {
        CategoryEnhancement {
            vehicle_id: Uuid::nil(),
            category,
            state,
            processing_started_at: None,
            completed_at: Some(Utc::now()),
        }
    }

    fn completed_state() -> EnhancementState {
        EnhancementState::Completed {
            data: FieldMap::new(),
            sources: BTreeSet::new(),
            confidence: Confidence::High,
        }
    }

    #[test]
    fn summary_is_partial_when_statuses_are_mixed() {
        let rows = vec![
            row(Category::Engine, completed_state()),
            row(
                Category::Drivetrain,
                EnhancementState::Failed {
                    error: "boom".into(),
                },
            ),
            row(Category::Dimensions, EnhancementState::Pending),
        ];
        let summary = summarize(&rows);
        assert_eq!(summary.overall_status, OverallStatus::Partial);
        assert_eq!(summary.categories_completed, 1);
        assert_eq!(summary.total_categories, 3);
    }

    #[test]
    fn summary_edges_all_completed_and_all_failed() {
        let all_done = vec![
            row(Category::Engine, completed_state()),
            row(Category::Safety, completed_state()),
        ];
        assert_eq!(summarize(&all_done).overall_status, OverallStatus::Completed);

        let all_failed = vec![row(
            Category::Engine,
            EnhancementState::Failed { error: "x".into() },
        )];
        assert_eq!(summarize(&all_failed).overall_status, OverallStatus::Failed);
    }

    // ---- scheduler ----

    #[derive(Default)]
    struct StubRegistry {
        attributes: Vec<RawAttribute>,
        calls: AtomicUsize,
        slow_after: Option<usize>,
    }

    #[async_trait]
    impl RegistryLookup for StubRegistry {
        async fn lookup(&self, _identity: &VehicleIdentity) -> Option<RegistryRecord> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(after) = self.slow_after {
                if call >= after {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
            if self.attributes.is_empty() {
                None
            } else {
                Some(RegistryRecord {
                    attributes: self.attributes.clone(),
                    matched_by: RegistryMatch::Vin,
                })
            }
        }
    }

    #[derive(Default)]
    struct StubGapFill {
        fields: FieldMap,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GapFill for StubGapFill {
        async fn fill(
            &self,
            _identity: &VehicleIdentity,
            schema: &CategorySchema,
            existing: &FieldMap,
        ) -> FieldMap {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.fields
                .iter()
                .filter(|(name, _)| schema.field(name).is_some() && !existing.contains_key(*name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect()
        }
    }

    fn pipeline_with(
        registry: Arc<StubRegistry>,
        gap_fill: Arc<StubGapFill>,
        store: Arc<MemoryEnhancementStore>,
        run_deadline: Duration,
    ) -> EnhancementPipeline {
        EnhancementPipeline::new(
            registry,
            gap_fill,
            store,
            Normalizer::default(),
            run_deadline,
            0.30,
        )
    }

    fn rich_gap_fill_fields() -> FieldMap {
        [
            ("horsepower", FieldValue::Number(203.0)),
            ("drivetrain", FieldValue::Text("Front Wheel Drive".into())),
            ("gears", FieldValue::Number(8.0)),
            ("length_in", FieldValue::Number(192.1)),
            ("city_mpg", FieldValue::Number(28.0)),
            ("abs", FieldValue::Flag(true)),
            ("seating_capacity", FieldValue::Number(5.0)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    #[tokio::test]
    async fn missing_identity_fails_fast_with_zero_adapter_calls() {
        let registry = Arc::new(StubRegistry::default());
        let gap_fill = Arc::new(StubGapFill::default());
        let store = Arc::new(MemoryEnhancementStore::new());
        let pipeline = pipeline_with(
            registry.clone(),
            gap_fill.clone(),
            store.clone(),
            Duration::from_secs(25),
        );

        let bad_identity = VehicleIdentity {
            year: None,
            make: Some("".into()),
            model: Some("Camry".into()),
            ..Default::default()
        };
        let vehicle_id = Uuid::new_v4();
        let summary = pipeline.run(vehicle_id, &bad_identity).await.unwrap();

        assert_eq!(summary.overall_status, OverallStatus::Failed);
        assert_eq!(summary.categories_completed, 0);
        assert_eq!(summary.total_categories, Category::ALL.len());
        assert_eq!(registry.calls.load(Ordering::SeqCst), 0);
        assert_eq!(gap_fill.calls.load(Ordering::SeqCst), 0);

        let rows = store.list_by_vehicle(vehicle_id).await.unwrap();
        assert!(rows.iter().all(|r| matches!(
            &r.state,
            EnhancementState::Failed { error } if error == "missing required identity fields"
        )));
    }

    #[tokio::test]
    async fn registry_plus_gap_fill_completes_every_category() {
        let registry = Arc::new(StubRegistry {
            attributes: vec![
                RawAttribute {
                    name: "Displacement (L)".into(),
                    value: json!("2.5L"),
                },
                RawAttribute {
                    name: "Drive Type".into(),
                    value: json!("FWD"),
                },
            ],
            ..Default::default()
        });
        let gap_fill = Arc::new(StubGapFill {
            fields: rich_gap_fill_fields(),
            ..Default::default()
        });
        let store = Arc::new(MemoryEnhancementStore::new());
        let pipeline = pipeline_with(
            registry,
            gap_fill,
            store.clone(),
            Duration::from_secs(25),
        );

        let vehicle_id = Uuid::new_v4();
        let summary = pipeline.run(vehicle_id, &identity()).await.unwrap();

        assert_eq!(summary.overall_status, OverallStatus::Completed);
        assert_eq!(summary.categories_completed, Category::ALL.len());

        let engine = store
            .get(vehicle_id, Category::Engine)
            .await
            .unwrap()
            .unwrap();
        match engine.state {
            EnhancementState::Completed {
                data,
                sources,
                confidence,
            } => {
                assert_eq!(
                    data.get("displacement_liters"),
                    Some(&FieldValue::Number(2.5))
                );
                // Horsepower came from gap fill only; no conflict recorded.
                assert_eq!(data.get("horsepower"), Some(&FieldValue::Number(203.0)));
                assert!(sources.contains("registry"));
                assert!(sources.contains("gap-fill"));
                assert_eq!(confidence, Confidence::High);
            }
            other => panic!("expected completed engine category, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn category_fails_only_when_both_sources_produce_nothing() {
        let registry = Arc::new(StubRegistry::default());
        let gap_fill = Arc::new(StubGapFill::default());
        let store = Arc::new(MemoryEnhancementStore::new());
        let pipeline = pipeline_with(registry, gap_fill, store.clone(), Duration::from_secs(25));

        let vehicle_id = Uuid::new_v4();
        let summary = pipeline.run(vehicle_id, &identity()).await.unwrap();

        assert_eq!(summary.overall_status, OverallStatus::Failed);
        let rows = store.list_by_vehicle(vehicle_id).await.unwrap();
        assert!(rows.iter().all(|r| r.state.is_failed()));
        // Each category entered processing before failing; the timestamp
        // survives the failure.
        assert!(rows.iter().all(|r| r.processing_started_at.is_some()));
    }

    #[tokio::test]
    async fn vehicle_lock_entries_do_not_accumulate_across_runs() {
        let registry = Arc::new(StubRegistry::default());
        let gap_fill = Arc::new(StubGapFill {
            fields: rich_gap_fill_fields(),
            ..Default::default()
        });
        let store = Arc::new(MemoryEnhancementStore::new());
        let pipeline = pipeline_with(registry, gap_fill, store, Duration::from_secs(25));

        for _ in 0..3 {
            pipeline.run(Uuid::new_v4(), &identity()).await.unwrap();
        }
        assert!(pipeline.run_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn gap_fill_is_skipped_when_registry_data_is_dense() {
        let registry = Arc::new(StubRegistry {
            attributes: vec![
                RawAttribute { name: "Displacement (L)".into(), value: json!(2.5) },
                RawAttribute { name: "Horsepower".into(), value: json!(203) },
                RawAttribute { name: "Torque (lb-ft)".into(), value: json!(184) },
                RawAttribute { name: "Cylinders".into(), value: json!(4) },
                RawAttribute { name: "Fuel Type - Primary".into(), value: json!("Gasoline") },
                RawAttribute { name: "Engine Configuration".into(), value: json!("Inline") },
            ],
            ..Default::default()
        });
        let gap_fill = Arc::new(StubGapFill::default());
        let store = Arc::new(MemoryEnhancementStore::new());
        let pipeline = pipeline_with(
            registry,
            gap_fill.clone(),
            store,
            Duration::from_secs(25),
        );

        pipeline.run(Uuid::new_v4(), &identity()).await.unwrap();

        // Engine extraction is complete, so only the other five categories
        // cross the sparsity threshold.
        assert_eq!(
            gap_fill.calls.load(Ordering::SeqCst),
            Category::ALL.len() - 1
        );
    }

    #[tokio::test]
    async fn second_run_with_unchanged_inputs_is_byte_identical() {
        let registry = Arc::new(StubRegistry {
            attributes: vec![RawAttribute {
                name: "Displacement (L)".into(),
                value: json!("2.5L"),
            }],
            ..Default::default()
        });
        let gap_fill = Arc::new(StubGapFill {
            fields: rich_gap_fill_fields(),
            ..Default::default()
        });
        let store = Arc::new(MemoryEnhancementStore::new());
        let pipeline = pipeline_with(registry, gap_fill, store.clone(), Duration::from_secs(25));

        let vehicle_id = Uuid::new_v4();
        pipeline.run(vehicle_id, &identity()).await.unwrap();
        let first: Vec<_> = store
            .list_by_vehicle(vehicle_id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.state)
            .collect();

        pipeline.run(vehicle_id, &identity()).await.unwrap();
        let second: Vec<_> = store
            .list_by_vehicle(vehicle_id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.state)
            .collect();

        assert_eq!(first, second);
        let first_json = serde_json::to_string(&first).unwrap();
        let second_json = serde_json::to_string(&second).unwrap();
        assert_eq!(first_json, second_json);
    }

    #[tokio::test]
    async fn deadline_expiry_yields_partial_summary_and_pending_remainder() {
        let registry = Arc::new(StubRegistry {
            attributes: vec![RawAttribute {
                name: "Displacement (L)".into(),
                value: json!(2.5),
            }],
            slow_after: Some(3),
            ..Default::default()
        });
        let gap_fill = Arc::new(StubGapFill {
            fields: rich_gap_fill_fields(),
            ..Default::default()
        });
        let store = Arc::new(MemoryEnhancementStore::new());
        let pipeline = pipeline_with(
            registry,
            gap_fill,
            store.clone(),
            Duration::from_millis(500),
        );

        let vehicle_id = Uuid::new_v4();
        let summary = pipeline.run(vehicle_id, &identity()).await.unwrap();

        assert_eq!(summary.overall_status, OverallStatus::Partial);
        assert_eq!(summary.categories_completed, 3);
        assert_eq!(summary.total_categories, Category::ALL.len());

        let rows = store.list_by_vehicle(vehicle_id).await.unwrap();
        let pending = rows
            .iter()
            .filter(|r| r.state == EnhancementState::Pending)
            .count();
        assert_eq!(pending, 3);
    }
}
