//! External data-source contracts: the authoritative registry lookup, the
//! best-effort gap-fill service, and the pure extraction layer that maps
//! their raw responses onto the fixed category schemas.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use vep_core::{CategorySchema, FieldKind, FieldMap, FieldValue, VehicleIdentity};

pub const CRATE_NAME: &str = "vep-adapters";

/// Default per-call budget for either external service. The adapters never
/// self-retry; a call that misses this window is a soft failure.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// One unordered `{name, value}` pair as the registry reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAttribute {
    pub name: String,
    pub value: JsonValue,
}

/// How a registry record was matched to the requested identity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegistryMatch {
    /// 1:1 deterministic VIN decode.
    Vin,
    /// Best candidate from the broader (make, year) query.
    MakeYear { similarity: f64 },
}

/// Raw authoritative result for a vehicle, prior to per-category extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryRecord {
    pub attributes: Vec<RawAttribute>,
    pub matched_by: RegistryMatch,
}

/// Authoritative lookup source. Failures are soft: timeout, non-success
/// response, and empty results all surface as `None`, never as an error.
#[async_trait]
pub trait RegistryLookup: Send + Sync {
    async fn lookup(&self, identity: &VehicleIdentity) -> Option<RegistryRecord>;
}

/// Best-effort fill source for fields the registry left empty. Returns only
/// fields it can state with reasonable confidence; omits rather than
/// guesses. Failures surface as an empty map, never as an error.
#[async_trait]
pub trait GapFill: Send + Sync {
    async fn fill(
        &self,
        identity: &VehicleIdentity,
        schema: &CategorySchema,
        existing: &FieldMap,
    ) -> FieldMap;
}

#[derive(Debug, Error)]
enum AdapterError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

// ---------------------------------------------------------------------------
// Extraction (CategoryExtractor): pure, deterministic, side-effect free.

/// Collapses an attribute name to a comparison key: lowercase, alphanumerics
/// only, single-space separated.
pub fn normalize_attribute_name(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

type AliasTable = &'static [(&'static str, &'static str)];

// Normalized registry attribute name -> schema field. Names the registry
// never sends simply never match; unknown names are ignored outright.
const ENGINE_ALIASES: AliasTable = &[
    ("displacement l", "displacement_liters"),
    ("displacement", "displacement_liters"),
    ("engine displacement l", "displacement_liters"),
    ("engine displacement cc", "displacement_liters"),
    ("horsepower", "horsepower"),
    ("engine brake hp from", "horsepower"),
    ("engine hp", "horsepower"),
    ("torque", "torque_lb_ft"),
    ("torque lb ft", "torque_lb_ft"),
    ("engine number of cylinders", "cylinders"),
    ("cylinders", "cylinders"),
    ("fuel type primary", "fuel_type"),
    ("fuel type", "fuel_type"),
    ("engine configuration", "configuration"),
];

const DRIVETRAIN_ALIASES: AliasTable = &[
    ("drive type", "drivetrain"),
    ("drivetrain", "drivetrain"),
    ("transmission style", "transmission"),
    ("transmission", "transmission"),
    ("transmission speeds", "gears"),
    ("number of gears", "gears"),
];

const DIMENSIONS_ALIASES: AliasTable = &[
    ("overall length in", "length_in"),
    ("length", "length_in"),
    ("overall width in", "width_in"),
    ("width", "width_in"),
    ("overall height in", "height_in"),
    ("height", "height_in"),
    ("wheelbase in", "wheelbase_in"),
    ("wheelbase", "wheelbase_in"),
    ("curb weight lbs", "curb_weight_lbs"),
    ("curb weight", "curb_weight_lbs"),
];

const FUEL_ECONOMY_ALIASES: AliasTable = &[
    ("city mpg", "city_mpg"),
    ("highway mpg", "highway_mpg"),
    ("combined mpg", "combined_mpg"),
    ("fuel tank capacity gal", "fuel_tank_gallons"),
    ("fuel tank capacity", "fuel_tank_gallons"),
];

const SAFETY_ALIASES: AliasTable = &[
    ("anti lock braking system abs", "abs"),
    ("abs", "abs"),
    ("traction control", "traction_control"),
    ("lane departure warning", "lane_departure_warning"),
    ("number of airbags", "airbags"),
    ("airbags", "airbags"),
];

const FEATURES_ALIASES: AliasTable = &[
    ("seating capacity", "seating_capacity"),
    ("number of seats", "seating_capacity"),
    ("touchscreen size in", "touchscreen_in"),
    ("touchscreen", "touchscreen_in"),
    ("keyless entry", "keyless_entry"),
    ("sunroof", "sunroof"),
];

fn alias_table(schema: &CategorySchema) -> AliasTable {
    use vep_core::Category::*;
    match schema.category {
        Engine => ENGINE_ALIASES,
        Drivetrain => DRIVETRAIN_ALIASES,
        Dimensions => DIMENSIONS_ALIASES,
        FuelEconomy => FUEL_ECONOMY_ALIASES,
        Safety => SAFETY_ALIASES,
        Features => FEATURES_ALIASES,
    }
}

/// Maps a raw registry attribute name to the schema field it feeds, if any.
pub fn schema_field_for_attribute(schema: &CategorySchema, raw_name: &str) -> Option<&'static str> {
    let key = normalize_attribute_name(raw_name);
    alias_table(schema)
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, field)| *field)
}

/// Parses the leading number out of free text, tolerating thousands
/// separators and trailing unit suffixes ("2.5L", "4,090 lbs", "203 hp").
pub fn leading_number(text: &str) -> Option<f64> {
    let cleaned = text.replace(',', "");
    let trimmed = cleaned.trim();
    let mut out = String::new();
    let mut seen_dot = false;
    for (i, ch) in trimmed.chars().enumerate() {
        if ch.is_ascii_digit() {
            out.push(ch);
        } else if ch == '-' && i == 0 {
            out.push(ch);
        } else if ch == '.' && !seen_dot && !out.is_empty() {
            out.push(ch);
            seen_dot = true;
        } else {
            break;
        }
    }
    out.parse().ok()
}

/// Lossy-but-total coercion of a raw JSON value into a typed field value.
/// Anything that cannot be coerced becomes `None` rather than an error.
pub fn coerce(kind: FieldKind, raw: &JsonValue) -> Option<FieldValue> {
    match kind {
        FieldKind::Number => match raw {
            JsonValue::Number(n) => n.as_f64().map(FieldValue::Number),
            JsonValue::String(s) => leading_number(s).map(FieldValue::Number),
            JsonValue::Bool(_) | JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => {
                None
            }
        },
        FieldKind::Text => match raw {
            JsonValue::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(FieldValue::Text(trimmed.to_string()))
                }
            }
            JsonValue::Number(n) => Some(FieldValue::Text(n.to_string())),
            _ => None,
        },
        FieldKind::Flag => match raw {
            JsonValue::Bool(b) => Some(FieldValue::Flag(*b)),
            JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "yes" | "true" | "std" | "standard" | "s" | "1" => Some(FieldValue::Flag(true)),
                "no" | "false" | "none" | "n/a" | "0" => Some(FieldValue::Flag(false)),
                _ => None,
            },
            JsonValue::Number(n) => match n.as_i64() {
                Some(0) => Some(FieldValue::Flag(false)),
                Some(_) => Some(FieldValue::Flag(true)),
                None => None,
            },
            _ => None,
        },
    }
}

/// Extracts a typed partial field map from the registry's raw `{name, value}`
/// pairs. Unknown names are ignored; coercion failures leave the field
/// absent. First match wins when two attribute names feed the same field.
pub fn extract(schema: &CategorySchema, attributes: &[RawAttribute]) -> FieldMap {
    let mut out = FieldMap::new();
    for attribute in attributes {
        let Some(field_name) = schema_field_for_attribute(schema, &attribute.name) else {
            continue;
        };
        if out.contains_key(field_name) {
            continue;
        }
        let Some(spec) = schema.field(field_name) else {
            continue;
        };
        if let Some(value) = coerce(spec.kind, &attribute.value) {
            if !value.is_empty() {
                out.insert(field_name.to_string(), value);
            }
        }
    }
    out
}

/// Extracts a typed partial field map from a JSON object keyed directly by
/// schema field names (the gap-fill response shape). Fields outside the
/// schema are dropped.
pub fn extract_object(schema: &CategorySchema, object: &JsonValue) -> FieldMap {
    let mut out = FieldMap::new();
    let Some(map) = object.as_object() else {
        return out;
    };
    for (key, raw) in map {
        let Some(spec) = schema.field(key) else {
            continue;
        };
        if let Some(value) = coerce(spec.kind, raw) {
            if !value.is_empty() {
                out.insert(spec.name.to_string(), value);
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Registry lookup over HTTP.

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryCandidate {
    pub model: String,
    #[serde(default)]
    pub trim: Option<String>,
    #[serde(default)]
    pub attributes: Vec<RawAttribute>,
}

/// Candidates whose model similarity falls below this floor are rejected so
/// a wrong-model record never masquerades as authoritative.
pub const CANDIDATE_SIMILARITY_FLOOR: f64 = 0.85;

/// Picks the best (make, year) candidate by Jaro-Winkler similarity between
/// the requested model (+ trim when present) and each candidate's model
/// string.
pub fn select_candidate<'a>(
    candidates: &'a [RegistryCandidate],
    model: &str,
    trim: Option<&str>,
) -> Option<(&'a RegistryCandidate, f64)> {
    let wanted = match trim {
        Some(trim) if !trim.trim().is_empty() => {
            normalize_attribute_name(&format!("{model} {trim}"))
        }
        _ => normalize_attribute_name(model),
    };

    let mut best: Option<(&RegistryCandidate, f64)> = None;
    for candidate in candidates {
        let candidate_key = match &candidate.trim {
            Some(t) if !t.trim().is_empty() => {
                normalize_attribute_name(&format!("{} {}", candidate.model, t))
            }
            _ => normalize_attribute_name(&candidate.model),
        };
        let model_only = normalize_attribute_name(&candidate.model);
        let score = jaro_winkler(&wanted, &candidate_key).max(jaro_winkler(&wanted, &model_only));
        if score >= CANDIDATE_SIMILARITY_FLOOR
            && best.map(|(_, s)| score > s).unwrap_or(true)
        {
            best = Some((candidate, score));
        }
    }
    best
}

#[derive(Debug)]
pub struct HttpRegistryAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRegistryAdapter {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building registry http client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    async fn get_json(&self, request: reqwest::RequestBuilder) -> Result<JsonValue, AdapterError> {
        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AdapterError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.json().await?)
    }

    async fn lookup_by_vin(&self, vin: &str) -> Result<Vec<RawAttribute>, AdapterError> {
        let request = self
            .client
            .get(format!("{}/vehicles/decode/{vin}", self.base_url));
        let body = self.get_json(request).await?;
        Ok(serde_json::from_value(body).unwrap_or_default())
    }

    async fn lookup_by_make_year(
        &self,
        identity: &VehicleIdentity,
    ) -> Result<Option<RegistryRecord>, AdapterError> {
        let make = identity.make.as_deref().unwrap_or_default();
        let year = identity.year.unwrap_or_default().to_string();
        let request = self
            .client
            .get(format!("{}/vehicles", self.base_url))
            .query(&[("make", make), ("year", year.as_str())]);
        let body = self.get_json(request).await?;
        let candidates: Vec<RegistryCandidate> = serde_json::from_value(body).unwrap_or_default();
        let model = identity.model.as_deref().unwrap_or_default();
        Ok(
            select_candidate(&candidates, model, identity.trim.as_deref()).map(
                |(candidate, similarity)| RegistryRecord {
                    attributes: candidate.attributes.clone(),
                    matched_by: RegistryMatch::MakeYear { similarity },
                },
            ),
        )
    }
}

#[async_trait]
impl RegistryLookup for HttpRegistryAdapter {
    async fn lookup(&self, identity: &VehicleIdentity) -> Option<RegistryRecord> {
        let span = info_span!("registry_lookup", vin = identity.vin.as_deref().unwrap_or(""));
        async {
            let result = match identity.vin.as_deref().filter(|v| !v.trim().is_empty()) {
                Some(vin) => self.lookup_by_vin(vin).await.map(|attributes| {
                    if attributes.is_empty() {
                        None
                    } else {
                        Some(RegistryRecord {
                            attributes,
                            matched_by: RegistryMatch::Vin,
                        })
                    }
                }),
                None => self.lookup_by_make_year(identity).await,
            };
            match result {
                Ok(record) => {
                    if let Some(RegistryMatch::MakeYear { similarity }) =
                        record.as_ref().map(|r| r.matched_by)
                    {
                        info!(similarity, "registry matched by make and year");
                    }
                    record
                }
                Err(err) => {
                    warn!(error = %err, "registry lookup failed; proceeding without authoritative data");
                    None
                }
            }
        }
        .instrument(span)
        .await
    }
}

// ---------------------------------------------------------------------------
// Gap fill over HTTP.

#[derive(Debug, Serialize)]
struct GapFillRequest<'a> {
    identity: &'a VehicleIdentity,
    category: &'a str,
    fields: Vec<GapFillFieldSpec>,
    known: &'a FieldMap,
}

#[derive(Debug, Serialize)]
struct GapFillFieldSpec {
    name: &'static str,
    kind: FieldKind,
}

#[derive(Debug)]
pub struct HttpGapFillAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGapFillAdapter {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building gap-fill http client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    async fn request_fill(
        &self,
        identity: &VehicleIdentity,
        schema: &CategorySchema,
        existing: &FieldMap,
    ) -> Result<JsonValue, AdapterError> {
        let url = format!("{}/fill", self.base_url);
        let request = GapFillRequest {
            identity,
            category: schema.category.as_str(),
            fields: schema
                .fields
                .iter()
                .map(|f| GapFillFieldSpec {
                    name: f.name,
                    kind: f.kind,
                })
                .collect(),
            known: existing,
        };
        let resp = self.client.post(&url).json(&request).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AdapterError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        Ok(resp.json().await?)
    }
}

/// Strips fields the registry already produced: the gap-fill contract is
/// scoped to gaps even before the reconciler enforces precedence.
pub fn without_known_fields(mut filled: FieldMap, existing: &FieldMap) -> FieldMap {
    filled.retain(|name, _| !existing.contains_key(name));
    filled
}

#[async_trait]
impl GapFill for HttpGapFillAdapter {
    async fn fill(
        &self,
        identity: &VehicleIdentity,
        schema: &CategorySchema,
        existing: &FieldMap,
    ) -> FieldMap {
        let span = info_span!("gap_fill", category = schema.category.as_str());
        async {
            match self.request_fill(identity, schema, existing).await {
                Ok(body) => without_known_fields(extract_object(schema, &body), existing),
                Err(err) => {
                    warn!(error = %err, "gap fill failed; proceeding without inferred data");
                    FieldMap::new()
                }
            }
        }
        .instrument(span)
        .await
    }
}
