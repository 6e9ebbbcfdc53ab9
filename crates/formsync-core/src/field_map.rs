use crate::contracts::{EntitySchema, FieldDefinition};
use crate::{AssetReference, FieldValue, Record};
use std::collections::{BTreeMap, BTreeSet};

/// Field key (or `parent_key` composite) to human-readable column label.
pub type FieldMapping = BTreeMap<String, String>;

pub const SYSTEM_COLUMNS: [&str; 11] = [
    "record_id",
    "status",
    "latitude",
    "longitude",
    "altitude",
    "horizontal_accuracy",
    "vertical_accuracy",
    "created_at",
    "updated_at",
    "created_by",
    "updated_by",
];

const ADDRESS_PARTS: [&str; 8] = [
    "sub_thoroughfare",
    "thoroughfare",
    "suite",
    "locality",
    "admin_area",
    "sub_admin_area",
    "postal_code",
    "country",
];

const ADDRESS_MARKERS: [&str; 3] = ["sub_thoroughfare", "thoroughfare", "locality"];

pub fn build_field_mapping(schema: &EntitySchema) -> FieldMapping {
    let mut mapping = FieldMapping::new();
    map_elements(&schema.elements, "", "", &mut mapping);
    mapping
}

fn map_elements(
    elements: &[FieldDefinition],
    parent_key: &str,
    parent_label: &str,
    mapping: &mut FieldMapping,
) {
    for element in elements {
        // Sections and labels carry no data but may wrap real fields.
        if matches!(element.kind.as_str(), "Section" | "Label") {
            map_elements(&element.elements, parent_key, parent_label, mapping);
            continue;
        }

        let key = element.field_key();
        let mut full_label = element.label.clone();
        if let Some(key) = key {
            full_label = if !parent_label.is_empty() && !element.label.is_empty() {
                format!("{parent_label} - {}", element.label)
            } else if !element.label.is_empty() {
                element.label.clone()
            } else {
                title_case(key)
            };

            match element.kind.as_str() {
                "AddressField" => {
                    for part in ADDRESS_PARTS {
                        mapping.insert(
                            format!("{key}_{part}"),
                            format!("{full_label} - {}", title_case(part)),
                        );
                    }
                }
                "VideoField" => {
                    mapping.insert(key.to_string(), full_label.clone());
                    mapping.insert(format!("{key}_caption"), format!("{full_label} - Caption"));
                    mapping.insert(format!("{key}_video_id"), format!("{full_label} - Video ID"));
                }
                "PhotoField" => {
                    mapping.insert(key.to_string(), full_label.clone());
                    mapping.insert(format!("{key}_caption"), format!("{full_label} - Caption"));
                }
                _ => {
                    mapping.insert(key.to_string(), full_label.clone());
                    if !parent_key.is_empty() {
                        mapping.insert(format!("{parent_key}_{key}"), full_label.clone());
                    }
                }
            }
        }

        if !element.elements.is_empty() {
            let repeatable = element.kind == "Repeatable";
            let nested_key = match (repeatable, key) {
                (true, Some(key)) => key,
                _ => parent_key,
            };
            let nested_label = if repeatable {
                full_label.as_str()
            } else {
                parent_label
            };
            map_elements(&element.elements, nested_key, nested_label, mapping);
        }
    }
}

/// Where a flattened column name came from. When two source keys produce the same column, the
/// value from the higher-ranked origin is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ColumnOrigin {
    RawKey,
    ConstructedPath,
    SchemaLabel,
    System,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlatRecord {
    cells: BTreeMap<String, (String, ColumnOrigin)>,
}

impl FlatRecord {
    pub fn put(&mut self, column: impl Into<String>, value: impl Into<String>, origin: ColumnOrigin) {
        let column = column.into();
        if let Some((_, existing)) = self.cells.get(&column) {
            if *existing > origin {
                return;
            }
        }
        self.cells.insert(column, (value.into(), origin));
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells.get(column).map(|(value, _)| value.as_str())
    }

    pub fn origin(&self, column: &str) -> Option<ColumnOrigin> {
        self.cells.get(column).map(|(_, origin)| *origin)
    }

    pub fn columns(&self) -> impl Iterator<Item = &String> {
        self.cells.keys()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

pub fn flatten_record(record: &Record, mapping: &FieldMapping) -> FlatRecord {
    let mut flat = FlatRecord::default();
    let geo = &record.geolocation;
    let number = |value: Option<f64>| value.map(|value| value.to_string()).unwrap_or_default();
    let text = |value: &Option<String>| value.clone().unwrap_or_default();
    let system = [
        ("record_id", record.id.clone()),
        ("status", text(&record.status)),
        ("latitude", number(geo.latitude)),
        ("longitude", number(geo.longitude)),
        ("altitude", number(geo.altitude)),
        ("horizontal_accuracy", number(geo.horizontal_accuracy)),
        ("vertical_accuracy", number(geo.vertical_accuracy)),
        ("created_at", text(&record.created_at)),
        ("updated_at", text(&record.updated_at)),
        ("created_by", text(&record.created_by)),
        ("updated_by", text(&record.updated_by)),
    ];
    for (column, value) in system {
        flat.put(column, value, ColumnOrigin::System);
    }

    let mut cells = Vec::new();
    flatten_mapping(&record.form_values, "", mapping, &mut cells);
    for (column, value, origin) in cells {
        flat.put(column, value, origin);
    }
    flat
}

type Cell = (String, String, ColumnOrigin);

fn flatten_mapping(
    values: &BTreeMap<String, FieldValue>,
    parent_key: &str,
    mapping: &FieldMapping,
    out: &mut Vec<Cell>,
) {
    for (key, value) in values {
        let path = if parent_key.is_empty() {
            key.clone()
        } else {
            format!("{parent_key}_{key}")
        };
        let (column, origin) = if let Some(label) = mapping.get(&path).or_else(|| mapping.get(key))
        {
            (label.clone(), ColumnOrigin::SchemaLabel)
        } else if parent_key.is_empty() {
            (title_case(&path), ColumnOrigin::RawKey)
        } else {
            (title_case(&path), ColumnOrigin::ConstructedPath)
        };
        let labelled = |suffix: &str, fallback: String| match mapping.get(&format!("{key}_{suffix}")) {
            Some(label) => (label.clone(), ColumnOrigin::SchemaLabel),
            None => (fallback, origin),
        };

        match value {
            FieldValue::Mapping(inner) => {
                if let Some(asset_id) = inner.get("photo_id") {
                    out.push((column.clone(), asset_id.scalar_text(), origin));
                    if let Some(caption) = inner.get("caption") {
                        let (caption_column, caption_origin) =
                            labelled("caption", format!("{column} - Caption"));
                        out.push((caption_column, caption.scalar_text(), caption_origin));
                    }
                } else if let Some(video_id) = inner.get("video_id") {
                    let (video_column, video_origin) =
                        labelled("video_id", format!("{column} - Video ID"));
                    out.push((video_column, video_id.scalar_text(), video_origin));
                    if let Some(caption) = inner.get("caption") {
                        let (caption_column, caption_origin) =
                            labelled("caption", format!("{column} - Caption"));
                        out.push((caption_column, caption.scalar_text(), caption_origin));
                    }
                } else if let Some(choices) = inner.get("choice_values") {
                    out.push((column, join_scalars(choices), origin));
                } else if ADDRESS_MARKERS.iter().any(|marker| inner.contains_key(*marker)) {
                    for (part, part_value) in inner {
                        let (part_column, part_origin) = labelled(
                            part.as_str(),
                            format!("{column} - {}", title_case(part)),
                        );
                        out.push((part_column, part_value.scalar_text(), part_origin));
                    }
                } else {
                    flatten_mapping(inner, &path, mapping, out);
                }
            }
            FieldValue::Sequence(items) => match items.first() {
                Some(first) if first.get("photo_id").is_some() => {
                    let ids: Vec<String> = items
                        .iter()
                        .filter_map(|item| item.get("photo_id"))
                        .map(FieldValue::scalar_text)
                        .filter(|id| !id.is_empty())
                        .collect();
                    out.push((column, ids.join(", "), origin));
                }
                Some(FieldValue::Mapping(_)) => {
                    for (index, item) in items.iter().enumerate() {
                        if let FieldValue::Mapping(inner) = item {
                            let mut nested = Vec::new();
                            flatten_mapping(inner, &path, mapping, &mut nested);
                            out.extend(nested.into_iter().map(|(nested_column, value, origin)| {
                                (format!("{nested_column}_{}", index + 1), value, origin)
                            }));
                        }
                    }
                }
                _ => out.push((column, join_scalars(value), origin)),
            },
            FieldValue::Scalar(_) => out.push((column, value.scalar_text(), origin)),
        }
    }
}

fn join_scalars(value: &FieldValue) -> String {
    match value {
        FieldValue::Sequence(items) => items
            .iter()
            .map(FieldValue::scalar_text)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.scalar_text(),
    }
}

/// Column order for a data export: system columns, ordinary fields sorted, then asset columns.
/// Every label the schema defines is present even when no record fills it.
pub fn ordered_columns(records: &[FlatRecord], mapping: &FieldMapping) -> Vec<String> {
    let mut all: BTreeSet<String> = records
        .iter()
        .flat_map(|record| record.columns().cloned())
        .collect();
    all.extend(mapping.values().cloned());

    let mut columns: Vec<String> = SYSTEM_COLUMNS
        .iter()
        .filter(|column| all.contains(**column))
        .map(|column| column.to_string())
        .collect();
    let (assets, fields): (Vec<String>, Vec<String>) = all
        .into_iter()
        .filter(|column| !SYSTEM_COLUMNS.contains(&column.as_str()))
        .partition(|column| is_asset_column(column));
    columns.extend(fields);
    columns.extend(assets);
    columns
}

fn is_asset_column(column: &str) -> bool {
    let lower = column.to_lowercase();
    lower.contains("photo") || lower.contains("image")
}

/// Every asset embedded anywhere in a record, with the dotted/indexed path where it occurs.
pub fn extract_asset_refs(record: &Record) -> Vec<AssetReference> {
    let mut refs = Vec::new();
    for (key, value) in &record.form_values {
        collect_refs(value, key.clone(), &record.id, &mut refs);
    }
    refs
}

fn collect_refs(value: &FieldValue, path: String, record_id: &str, out: &mut Vec<AssetReference>) {
    match value {
        FieldValue::Mapping(inner) => {
            if let Some(asset_id) = inner.get("photo_id") {
                let asset_id = asset_id.scalar_text();
                if !asset_id.is_empty() {
                    out.push(AssetReference {
                        asset_id,
                        record_id: record_id.to_string(),
                        field_path: path,
                        caption: inner
                            .get("caption")
                            .map(FieldValue::scalar_text)
                            .unwrap_or_default(),
                    });
                }
            } else {
                for (key, nested) in inner {
                    collect_refs(nested, format!("{path}.{key}"), record_id, out);
                }
            }
        }
        FieldValue::Sequence(items) => {
            for (index, item) in items.iter().enumerate() {
                collect_refs(item, format!("{path}[{index}]"), record_id, out);
            }
        }
        FieldValue::Scalar(_) => {}
    }
}

/// Asset references across records, keeping only the first occurrence of each asset id.
pub fn unique_asset_refs(records: &[Record]) -> Vec<AssetReference> {
    let mut seen = BTreeSet::new();
    records
        .iter()
        .flat_map(extract_asset_refs)
        .filter(|asset| seen.insert(asset.asset_id.clone()))
        .collect()
}

pub fn title_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut previous_alpha = false;
    for ch in key.chars() {
        let ch = if ch == '_' { ' ' } else { ch };
        if ch.is_alphabetic() {
            if previous_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            previous_alpha = true;
        } else {
            out.push(ch);
            previous_alpha = false;
        }
    }
    out
}
