pub mod contracts;
pub mod field_map;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// One logical dataset in the source system. Entities are processed once per run, ordered by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Entity {
    /// Target folder name: the display name reduced to a filesystem-safe form, suffixed with the id
    /// so that two entities sharing a name never share a folder.
    pub fn folder_name(&self) -> String {
        format!("{}_{}", safe_name(&self.name), self.id)
    }
}

pub fn safe_name(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_alphanumeric() || matches!(ch, ' ' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// Sorts entities into the single order used for cursors, both within a run and across resumes.
pub fn sort_entities(entities: &mut [Entity]) {
    entities.sort_by(|left, right| {
        left.name
            .cmp(&right.name)
            .then_with(|| left.id.cmp(&right.id))
    });
}

pub fn entity_list_fingerprint(entities: &[Entity]) -> String {
    let mut hasher = Sha256::new();
    for entity in entities {
        hasher.update(entity.id.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    digest[..8].iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Record field value. Source documents nest maps and lists to arbitrary depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Sequence(Vec<FieldValue>),
    Mapping(BTreeMap<String, FieldValue>),
    Scalar(Value),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Scalar(Value::String(value.into()))
    }

    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Array(items) => {
                FieldValue::Sequence(items.into_iter().map(FieldValue::from_json).collect())
            }
            Value::Object(map) => FieldValue::Mapping(
                map.into_iter()
                    .map(|(key, value)| (key, FieldValue::from_json(value)))
                    .collect(),
            ),
            scalar => FieldValue::Scalar(scalar),
        }
    }

    pub fn as_mapping(&self) -> Option<&BTreeMap<String, FieldValue>> {
        match self {
            FieldValue::Mapping(map) => Some(map),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.as_mapping().and_then(|map| map.get(key))
    }

    /// Renders a scalar the way it appears in a CSV cell. Containers render empty.
    pub fn scalar_text(&self) -> String {
        match self {
            FieldValue::Scalar(Value::Null) => String::new(),
            FieldValue::Scalar(Value::String(text)) => text.clone(),
            FieldValue::Scalar(other) => other.to_string(),
            FieldValue::Sequence(_) | FieldValue::Mapping(_) => String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Geolocation {
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub horizontal_accuracy: Option<f64>,
    #[serde(default)]
    pub vertical_accuracy: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub updated_by: Option<String>,
    #[serde(flatten)]
    pub geolocation: Geolocation,
    #[serde(default)]
    pub form_values: BTreeMap<String, FieldValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetReference {
    pub asset_id: String,
    pub record_id: String,
    pub field_path: String,
    #[serde(default)]
    pub caption: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub asset_id: String,
    #[serde(default)]
    pub record_id: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub stored_size: Option<u64>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub uploaded_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub deleted_at: Option<String>,
    #[serde(default = "default_true")]
    pub stored: bool,
    #[serde(default = "default_true")]
    pub processed: bool,
    #[serde(default)]
    pub exif: BTreeMap<String, Value>,
}

impl AssetMetadata {
    pub fn new(asset_id: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            record_id: None,
            content_type: Some("image/jpeg".to_string()),
            file_size: None,
            stored_size: None,
            created_at: None,
            uploaded_at: None,
            updated_at: None,
            latitude: None,
            longitude: None,
            deleted_at: None,
            stored: true,
            processed: true,
            exif: BTreeMap::new(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Terminal reasons an asset can never be transferred, checked before any network work.
    pub fn rejection(&self) -> Option<AssetRejection> {
        if self.is_deleted() {
            Some(AssetRejection::Deleted)
        } else if !self.stored {
            Some(AssetRejection::NotStored)
        } else if !self.processed {
            Some(AssetRejection::NotProcessed)
        } else {
            None
        }
    }

    pub fn format(&self) -> AssetFormat {
        AssetFormat::from_content_type(self.content_type.as_deref().unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetRejection {
    Deleted,
    NotStored,
    NotProcessed,
}

impl AssetRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetRejection::Deleted => "asset deleted at source",
            AssetRejection::NotStored => "asset not yet stored at source",
            AssetRejection::NotProcessed => "asset not yet processed at source",
        }
    }
}

impl fmt::Display for AssetRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetFormat {
    Jpeg,
    Png,
}

impl AssetFormat {
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type.to_ascii_lowercase().contains("png") {
            AssetFormat::Png
        } else {
            AssetFormat::Jpeg
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            AssetFormat::Jpeg => "jpg",
            AssetFormat::Png => "png",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            AssetFormat::Jpeg => "image/jpeg",
            AssetFormat::Png => "image/png",
        }
    }
}

/// Deterministic target key for an asset.
pub fn asset_object_name(asset_id: &str, format: AssetFormat) -> String {
    format!("{asset_id}.{}", format.extension())
}

/// Every name an asset may already be stored under, whatever format it was written in.
pub fn asset_object_candidates(asset_id: &str) -> [String; 2] {
    [
        asset_object_name(asset_id, AssetFormat::Jpeg),
        asset_object_name(asset_id, AssetFormat::Png),
    ]
}

/// Asset id encoded in a stored filename. Names without an extension carry no id.
pub fn asset_id_from_object_name(name: &str) -> Option<&str> {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => Some(stem),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub entities_processed: u64,
    /// Entities that still failed after their whole-entity retries.
    #[serde(default)]
    pub entities_failed: u64,
    pub records_total: u64,
    pub assets_uploaded: u64,
    pub assets_skipped: u64,
    pub assets_failed: u64,
    pub assets_deleted: u64,
    pub record_docs_uploaded: u64,
    pub layers_uploaded: u64,
}

impl RunCounters {
    pub fn merge(&mut self, other: &RunCounters) {
        self.entities_processed += other.entities_processed;
        self.entities_failed += other.entities_failed;
        self.records_total += other.records_total;
        self.assets_uploaded += other.assets_uploaded;
        self.assets_skipped += other.assets_skipped;
        self.assets_failed += other.assets_failed;
        self.assets_deleted += other.assets_deleted;
        self.record_docs_uploaded += other.record_docs_uploaded;
        self.layers_uploaded += other.layers_uploaded;
    }

    pub fn stats_line(&self) -> String {
        format!(
            "entities={} entities_failed={} records={} assets_uploaded={} assets_skipped={} assets_failed={} assets_deleted={} record_docs={}",
            self.entities_processed,
            self.entities_failed,
            self.records_total,
            self.assets_uploaded,
            self.assets_skipped,
            self.assets_failed,
            self.assets_deleted,
            self.record_docs_uploaded,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalDecision {
    PreApproved,
    AutoApproved,
    /// Intermediate state while a request is outstanding on the approval channel.
    AwaitingResponse,
    Approved,
    Skipped,
    Ended,
    TimedOut,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalDecision::PreApproved => "pre-approved",
            ApprovalDecision::AutoApproved => "auto-approved",
            ApprovalDecision::AwaitingResponse => "awaiting-response",
            ApprovalDecision::Approved => "approved",
            ApprovalDecision::Skipped => "skipped",
            ApprovalDecision::Ended => "ended",
            ApprovalDecision::TimedOut => "timed-out",
        }
    }

    pub fn permits_deletion(&self) -> bool {
        matches!(
            self,
            ApprovalDecision::PreApproved
                | ApprovalDecision::AutoApproved
                | ApprovalDecision::Approved
        )
    }

    pub fn ends_run(&self) -> bool {
        matches!(self, ApprovalDecision::Ended)
    }
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalDecision {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pre-approved" | "pre_approved" => Ok(ApprovalDecision::PreApproved),
            "auto-approved" | "auto_approved" => Ok(ApprovalDecision::AutoApproved),
            "awaiting-response" | "awaiting_response" => Ok(ApprovalDecision::AwaitingResponse),
            "approved" => Ok(ApprovalDecision::Approved),
            "skipped" => Ok(ApprovalDecision::Skipped),
            "ended" => Ok(ApprovalDecision::Ended),
            "timed-out" | "timed_out" | "timeout" => Ok(ApprovalDecision::TimedOut),
            other => Err(format!("Unknown approval decision: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayReason {
    UserRequested,
    NoResponse,
    SkipPolicy,
    Interrupted,
}

impl ReplayReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplayReason::UserRequested => "user requested",
            ReplayReason::NoResponse => "no response",
            ReplayReason::SkipPolicy => "skip policy",
            ReplayReason::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for ReplayReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplayReason {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "user requested" | "user_requested" => Ok(ReplayReason::UserRequested),
            "no response" | "no_response" => Ok(ReplayReason::NoResponse),
            "skip policy" | "skip_policy" => Ok(ReplayReason::SkipPolicy),
            "interrupted" => Ok(ReplayReason::Interrupted),
            other => Err(format!("Unknown replay reason: {other}")),
        }
    }
}

/// An entity whose orphan deletion was not performed and needs operator re-approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayEntry {
    pub entity_name: String,
    pub reason: ReplayReason,
    pub orphan_count: usize,
    pub recorded_at: DateTime<Utc>,
}

/// Resolves a comma-separated pre-approval list. Numeric items are 1-based positions in the replay
/// list; anything else is taken as an entity name.
pub fn resolve_pre_approved(input: &str, replay: &[ReplayEntry]) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for item in input.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        match item.parse::<usize>() {
            Ok(position) => {
                if let Some(entry) = position
                    .checked_sub(1)
                    .and_then(|index| replay.get(index))
                {
                    names.insert(entry.entity_name.clone());
                }
            }
            Err(_) => {
                names.insert(item.to_string());
            }
        }
    }
    names
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    Paused,
    Interrupted,
    EndedEarly,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Complete => "COMPLETE",
            RunStatus::Paused => "PAUSED (timeout)",
            RunStatus::Interrupted => "INTERRUPTED",
            RunStatus::EndedEarly => "ENDED EARLY",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn replay_entry(name: &str) -> ReplayEntry {
        ReplayEntry {
            entity_name: name.to_string(),
            reason: ReplayReason::NoResponse,
            orphan_count: 3,
            recorded_at: Utc
                .with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
                .single()
                .expect("valid timestamp"),
        }
    }

    #[test]
    fn folder_name_replaces_unsafe_characters_and_appends_id() {
        let entity = Entity {
            id: "f-17".to_string(),
            name: "Roads/Bridges: 2024 (east)".to_string(),
            active: true,
        };
        assert_eq!(entity.folder_name(), "Roads_Bridges_ 2024 _east__f-17");
    }

    #[test]
    fn entities_sort_by_name_then_id() {
        let mut entities = vec![
            Entity {
                id: "2".to_string(),
                name: "beta".to_string(),
                active: true,
            },
            Entity {
                id: "9".to_string(),
                name: "alpha".to_string(),
                active: false,
            },
            Entity {
                id: "1".to_string(),
                name: "beta".to_string(),
                active: true,
            },
        ];
        sort_entities(&mut entities);
        let ids: Vec<&str> = entities.iter().map(|entity| entity.id.as_str()).collect();
        assert_eq!(ids, vec!["9", "1", "2"]);
    }

    #[test]
    fn fingerprint_changes_with_entity_order() {
        let a = Entity {
            id: "a".to_string(),
            name: "A".to_string(),
            active: true,
        };
        let b = Entity {
            id: "b".to_string(),
            name: "B".to_string(),
            active: true,
        };
        let forward = entity_list_fingerprint(&[a.clone(), b.clone()]);
        assert_eq!(forward.len(), 16);
        assert_eq!(forward, entity_list_fingerprint(&[a.clone(), b.clone()]));
        assert_ne!(forward, entity_list_fingerprint(&[b, a]));
    }

    #[test]
    fn metadata_rejection_prefers_deletion() {
        let mut metadata = AssetMetadata::new("p1");
        assert_eq!(metadata.rejection(), None);
        metadata.processed = false;
        assert_eq!(metadata.rejection(), Some(AssetRejection::NotProcessed));
        metadata.stored = false;
        assert_eq!(metadata.rejection(), Some(AssetRejection::NotStored));
        metadata.deleted_at = Some("2026-01-01T00:00:00Z".to_string());
        assert_eq!(metadata.rejection(), Some(AssetRejection::Deleted));
    }

    #[test]
    fn png_content_type_maps_to_png_key() {
        let mut metadata = AssetMetadata::new("p1");
        metadata.content_type = Some("image/PNG".to_string());
        assert_eq!(asset_object_name("p1", metadata.format()), "p1.png");
        metadata.content_type = None;
        assert_eq!(asset_object_name("p1", metadata.format()), "p1.jpg");
    }

    #[test]
    fn object_name_without_extension_has_no_asset_id() {
        assert_eq!(asset_id_from_object_name("abc.jpg"), Some("abc"));
        assert_eq!(asset_id_from_object_name("a.b.png"), Some("a.b"));
        assert_eq!(asset_id_from_object_name("README"), None);
        assert_eq!(asset_id_from_object_name(".hidden"), None);
    }

    #[test]
    fn field_value_deserializes_nested_shapes() {
        let value: FieldValue = serde_json::from_str(
            r#"{"a": [1, {"photo_id": "p1"}], "b": "text", "c": null}"#,
        )
        .expect("parse field value");
        let mapping = value.as_mapping().expect("mapping");
        assert!(matches!(mapping.get("a"), Some(FieldValue::Sequence(items)) if items.len() == 2));
        assert_eq!(mapping.get("b").map(FieldValue::scalar_text), Some("text".to_string()));
        assert_eq!(mapping.get("c").map(FieldValue::scalar_text), Some(String::new()));
    }

    #[test]
    fn pre_approved_resolves_numbers_against_replay_list() {
        let replay = vec![replay_entry("Inspections"), replay_entry("Parcels")];
        let names = resolve_pre_approved(" 2, Hydrants ,9,,0", &replay);
        assert_eq!(
            names,
            BTreeSet::from(["Hydrants".to_string(), "Parcels".to_string()])
        );
    }

    #[test]
    fn approval_decision_parses_aliases() {
        assert_eq!(
            "Timed_Out".parse::<ApprovalDecision>(),
            Ok(ApprovalDecision::TimedOut)
        );
        assert!(ApprovalDecision::PreApproved.permits_deletion());
        assert!(!ApprovalDecision::Skipped.permits_deletion());
        assert!("maybe".parse::<ApprovalDecision>().is_err());
    }

    #[test]
    fn counters_merge_and_render_stats_line() {
        let mut total = RunCounters {
            entities_processed: 1,
            assets_uploaded: 4,
            ..RunCounters::default()
        };
        total.merge(&RunCounters {
            entities_processed: 1,
            entities_failed: 1,
            records_total: 10,
            assets_failed: 2,
            ..RunCounters::default()
        });
        assert_eq!(total.entities_processed, 2);
        assert_eq!(
            total.stats_line(),
            "entities=2 entities_failed=1 records=10 assets_uploaded=4 assets_skipped=0 assets_failed=2 assets_deleted=0 record_docs=0"
        );
    }

    #[test]
    fn counters_saved_before_entity_failures_still_load() {
        let counters: RunCounters = serde_json::from_str(
            r#"{"entities_processed":3,"records_total":12,"assets_uploaded":7,"assets_skipped":1,"assets_failed":0,"assets_deleted":2,"record_docs_uploaded":12,"layers_uploaded":0}"#,
        )
        .expect("parse counters");
        assert_eq!(counters.entities_processed, 3);
        assert_eq!(counters.entities_failed, 0);
    }
}
