//! Core domain model for the vehicle enhancement pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "vep-core";

/// Partially-known vehicle identity. `vin` is authoritative when present;
/// year + make + model form the fallback query key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VehicleIdentity {
    pub year: Option<i32>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub trim: Option<String>,
    pub vin: Option<String>,
}

impl VehicleIdentity {
    /// Year, make, and model must all be present (and non-blank) for a run
    /// to proceed at all.
    pub fn has_required_fields(&self) -> bool {
        self.year.is_some() && non_blank(&self.make) && non_blank(&self.model)
    }
}

fn non_blank(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|s| !s.trim().is_empty())
}

/// One named group of related vehicle attributes, processed as an
/// independent unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Engine,
    Drivetrain,
    Dimensions,
    FuelEconomy,
    Safety,
    Features,
}

impl Category {
    /// Fixed processing order.
    pub const ALL: [Category; 6] = [
        Category::Engine,
        Category::Drivetrain,
        Category::Dimensions,
        Category::FuelEconomy,
        Category::Safety,
        Category::Features,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Engine => "engine",
            Category::Drivetrain => "drivetrain",
            Category::Dimensions => "dimensions",
            Category::FuelEconomy => "fuel-economy",
            Category::Safety => "safety",
            Category::Features => "features",
        }
    }

    pub fn parse(input: &str) -> Option<Category> {
        Category::ALL.iter().copied().find(|c| c.as_str() == input)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Number,
    Text,
    Flag,
}

/// Normalization rule tag applied before cross-source comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizeRule {
    /// Numeric displacement; values that look like cubic centimeters are
    /// converted to liters before comparison.
    DisplacementLiters,
    /// Drivetrain synonym collapsing (FWD / "Front Wheel Drive" / 4x4 ...).
    Drivetrain,
    /// Fuel-type synonym collapsing (gas / gasoline / petrol ...).
    FuelType,
    /// Transmission synonym collapsing (auto / automatic / CVT ...).
    Transmission,
    /// Default text rule: case-fold + trim.
    CaseFold,
    /// Numbers with no unit ambiguity; compared under relative tolerance
    /// only.
    Plain,
}

/// One typed field in a category schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub rule: NormalizeRule,
}

const fn number(name: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        kind: FieldKind::Number,
        rule: NormalizeRule::Plain,
    }
}

const fn text(name: &'static str, rule: NormalizeRule) -> FieldSpec {
    FieldSpec {
        name,
        kind: FieldKind::Text,
        rule,
    }
}

const fn flag(name: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        kind: FieldKind::Flag,
        rule: NormalizeRule::CaseFold,
    }
}

const ENGINE_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "displacement_liters",
        kind: FieldKind::Number,
        rule: NormalizeRule::DisplacementLiters,
    },
    number("horsepower"),
    number("torque_lb_ft"),
    number("cylinders"),
    text("fuel_type", NormalizeRule::FuelType),
    text("configuration", NormalizeRule::CaseFold),
];

const DRIVETRAIN_FIELDS: &[FieldSpec] = &[
    text("drivetrain", NormalizeRule::Drivetrain),
    text("transmission", NormalizeRule::Transmission),
    number("gears"),
];

const DIMENSIONS_FIELDS: &[FieldSpec] = &[
    number("length_in"),
    number("width_in"),
    number("height_in"),
    number("wheelbase_in"),
    number("curb_weight_lbs"),
];

const FUEL_ECONOMY_FIELDS: &[FieldSpec] = &[
    number("city_mpg"),
    number("highway_mpg"),
    number("combined_mpg"),
    number("fuel_tank_gallons"),
];

const SAFETY_FIELDS: &[FieldSpec] = &[
    flag("abs"),
    flag("traction_control"),
    flag("lane_departure_warning"),
    number("airbags"),
];

const FEATURES_FIELDS: &[FieldSpec] = &[
    number("seating_capacity"),
    number("touchscreen_in"),
    flag("keyless_entry"),
    flag("sunroof"),
];

/// Fixed per-category field schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategorySchema {
    pub category: Category,
    pub fields: &'static [FieldSpec],
}

static SCHEMAS: [CategorySchema; 6] = [
    CategorySchema {
        category: Category::Engine,
        fields: ENGINE_FIELDS,
    },
    CategorySchema {
        category: Category::Drivetrain,
        fields: DRIVETRAIN_FIELDS,
    },
    CategorySchema {
        category: Category::Dimensions,
        fields: DIMENSIONS_FIELDS,
    },
    CategorySchema {
        category: Category::FuelEconomy,
        fields: FUEL_ECONOMY_FIELDS,
    },
    CategorySchema {
        category: Category::Safety,
        fields: SAFETY_FIELDS,
    },
    CategorySchema {
        category: Category::Features,
        fields: FEATURES_FIELDS,
    },
];

impl CategorySchema {
    pub fn for_category(category: Category) -> &'static CategorySchema {
        SCHEMAS
            .iter()
            .find(|s| s.category == category)
            .expect("every category has a schema")
    }

    pub fn all() -> &'static [CategorySchema] {
        &SCHEMAS
    }

    pub fn field(&self, name: &str) -> Option<&'static FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A single extracted or merged field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            FieldValue::Flag(b) => Some(*b),
            _ => None,
        }
    }

    /// Blank text counts as empty for merge purposes.
    pub fn is_empty(&self) -> bool {
        matches!(self, FieldValue::Text(s) if s.trim().is_empty())
    }
}

/// Partial field map, keyed by schema field name.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Coarse rule-based indicator of cross-source agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn from_conflict_count(conflicts: usize) -> Confidence {
        match conflicts {
            0 => Confidence::High,
            1 | 2 => Confidence::Medium,
            _ => Confidence::Low,
        }
    }
}

/// Per-category status. The completed payload and the failure message are
/// only reachable through their own variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum EnhancementState {
    Pending,
    Processing,
    Completed {
        data: FieldMap,
        sources: BTreeSet<String>,
        confidence: Confidence,
    },
    Failed {
        error: String,
    },
}

impl EnhancementState {
    pub fn status_label(&self) -> &'static str {
        match self {
            EnhancementState::Pending => "pending",
            EnhancementState::Processing => "processing",
            EnhancementState::Completed { .. } => "completed",
            EnhancementState::Failed { .. } => "failed",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, EnhancementState::Completed { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, EnhancementState::Failed { .. })
    }

    pub fn is_terminal(&self) -> bool {
        self.is_completed() || self.is_failed()
    }
}

/// Persisted per-(vehicle, category) outcome of a pipeline run. Exactly one
/// record exists per key; re-runs overwrite wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryEnhancement {
    pub vehicle_id: Uuid,
    pub category: Category,
    #[serde(flatten)]
    pub state: EnhancementState,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CategoryEnhancement {
    pub fn pending(vehicle_id: Uuid, category: Category) -> Self {
        Self {
            vehicle_id,
            category,
            state: EnhancementState::Pending,
            processing_started_at: None,
            completed_at: None,
        }
    }

    pub fn processing(vehicle_id: Uuid, category: Category, started_at: DateTime<Utc>) -> Self {
        Self {
            vehicle_id,
            category,
            state: EnhancementState::Processing,
            processing_started_at: Some(started_at),
            completed_at: None,
        }
    }

    pub fn completed(
        vehicle_id: Uuid,
        category: Category,
        data: FieldMap,
        sources: BTreeSet<String>,
        confidence: Confidence,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            vehicle_id,
            category,
            state: EnhancementState::Completed {
                data,
                sources,
                confidence,
            },
            processing_started_at: Some(started_at),
            completed_at: Some(completed_at),
        }
    }

    /// `started_at` is `None` only for pre-flight failures that never
    /// entered `processing`.
    pub fn failed(
        vehicle_id: Uuid,
        category: Category,
        error: impl Into<String>,
        started_at: Option<DateTime<Utc>>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            vehicle_id,
            category,
            state: EnhancementState::Failed {
                error: error.into(),
            },
            processing_started_at: started_at,
            completed_at: Some(completed_at),
        }
    }
}

/// Vehicle-level rollup, always recomputed from the per-category rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Completed,
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleEnhancementSummary {
    pub overall_status: OverallStatus,
    pub categories_completed: usize,
    pub total_categories: usize,
    pub last_enhanced_at: Option<DateTime<Utc>>,
}

/// One field where both sources had a value and the normalized values
/// disagree beyond tolerance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: String,
    pub authoritative: FieldValue,
    pub inferred: FieldValue,
}

/// Ephemeral output of reconciling one category; folded into a
/// `CategoryEnhancement` rather than persisted directly.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationResult {
    pub merged: FieldMap,
    pub conflicts: Vec<FieldConflict>,
    pub confidence: Confidence,
}
