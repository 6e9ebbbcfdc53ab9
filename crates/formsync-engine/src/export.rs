use crate::transfer::StoredAsset;
use crate::SyncError;
use chrono::{DateTime, Utc};
use formsync_core::contracts::SourceLayer;
use formsync_core::field_map::{ordered_columns, FlatRecord, FieldMapping};
use formsync_core::{safe_name, AssetMetadata, Record};
use serde::Serialize;
use serde_json::{json, Value};

pub const RECORDS_CONTAINER: &str = "records";
pub const ASSETS_CONTAINER: &str = "assets";
pub const LAYERS_CONTAINER: &str = "layers";
pub const LAYERS_MANIFEST: &str = "LAYERS_MANIFEST.json";
pub const NO_RECORDS_MARKER: &str = "NO_RECORDS.txt";
pub const NO_RECORDS_TEXT: &str = "This entity has no records in the source system.";

pub fn data_file_name(folder: &str) -> String {
    format!("{folder}_data.csv")
}

pub fn record_file_name(record_id: &str) -> String {
    format!("{record_id}.json")
}

fn csv_error(err: impl std::fmt::Display) -> SyncError {
    SyncError::Export(format!("csv: {err}"))
}

/// Data export with one row per record. Missing cells are left empty.
pub fn data_csv(records: &[FlatRecord], mapping: &FieldMapping) -> Result<Vec<u8>, SyncError> {
    let columns = ordered_columns(records, mapping);
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&columns).map_err(csv_error)?;
    for record in records {
        writer
            .write_record(
                columns
                    .iter()
                    .map(|column| record.get(column).unwrap_or_default()),
            )
            .map_err(csv_error)?;
    }
    writer.into_inner().map_err(csv_error)
}

pub fn record_document(record: &Record) -> Result<Vec<u8>, SyncError> {
    serde_json::to_vec_pretty(record).map_err(|err| SyncError::Export(format!("json: {err}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetGroup {
    All,
    Before,
    Completed,
}

impl AssetGroup {
    /// Group a field path falls into besides `All`, judged by its wording.
    pub fn for_field_path(field_path: &str) -> Option<AssetGroup> {
        let lower = field_path.to_lowercase();
        if lower.contains("before") {
            Some(AssetGroup::Before)
        } else if ["completed", "complete", "after"]
            .iter()
            .any(|marker| lower.contains(marker))
        {
            Some(AssetGroup::Completed)
        } else {
            None
        }
    }

    pub fn file_name(&self, folder: &str) -> String {
        match self {
            AssetGroup::All => format!("{folder}_assets.csv"),
            AssetGroup::Before => format!("{folder}_before_assets.csv"),
            AssetGroup::Completed => format!("{folder}_completed_assets.csv"),
        }
    }
}

#[derive(Debug, Serialize)]
struct AssetRow {
    asset_id: String,
    parent_record_id: Option<String>,
    record_id: String,
    version: Option<String>,
    caption: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    geometry: String,
    file_size: Option<u64>,
    uploaded_at: Option<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
    content_type: Option<String>,
    stored_size: Option<u64>,
    exif_date_time: String,
    exif_gps_altitude: String,
    exif_gps_date_stamp: String,
    exif_gps_time_stamp: String,
    exif_gps_dop: String,
    exif_gps_img_direction: String,
    exif_gps_img_direction_ref: String,
    exif_gps_latitude: String,
    exif_gps_latitude_ref: String,
    exif_gps_longitude: String,
    exif_gps_longitude_ref: String,
    exif_make: String,
    exif_model: String,
    exif_orientation: String,
    exif_pixel_x_dimension: String,
    exif_pixel_y_dimension: String,
    exif_software: String,
    exif_x_resolution: String,
    exif_y_resolution: String,
}

fn exif_text(metadata: &AssetMetadata, key: &str) -> String {
    match metadata.exif.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

/// WKT point, empty unless both coordinates are present and non-zero.
pub fn point_geometry(latitude: Option<f64>, longitude: Option<f64>) -> String {
    match (latitude, longitude) {
        (Some(lat), Some(lon)) if lat != 0.0 && lon != 0.0 => format!("POINT ({lon} {lat})"),
        _ => String::new(),
    }
}

impl AssetRow {
    fn new(asset: &StoredAsset) -> Self {
        let meta = &asset.metadata;
        Self {
            asset_id: asset.reference.asset_id.clone(),
            parent_record_id: meta.record_id.clone(),
            record_id: asset.reference.record_id.clone(),
            version: meta.updated_at.clone(),
            caption: asset.reference.caption.clone(),
            latitude: meta.latitude,
            longitude: meta.longitude,
            geometry: point_geometry(meta.latitude, meta.longitude),
            file_size: meta.file_size,
            uploaded_at: meta.uploaded_at.clone(),
            created_at: meta.created_at.clone(),
            updated_at: meta.updated_at.clone(),
            content_type: meta.content_type.clone(),
            stored_size: meta.stored_size,
            exif_date_time: exif_text(meta, "date_time"),
            exif_gps_altitude: exif_text(meta, "gps_altitude"),
            exif_gps_date_stamp: exif_text(meta, "gps_date_stamp"),
            exif_gps_time_stamp: exif_text(meta, "gps_time_stamp"),
            exif_gps_dop: exif_text(meta, "gps_dop"),
            exif_gps_img_direction: exif_text(meta, "gps_img_direction"),
            exif_gps_img_direction_ref: exif_text(meta, "gps_img_direction_ref"),
            exif_gps_latitude: exif_text(meta, "gps_latitude"),
            exif_gps_latitude_ref: exif_text(meta, "gps_latitude_ref"),
            exif_gps_longitude: exif_text(meta, "gps_longitude"),
            exif_gps_longitude_ref: exif_text(meta, "gps_longitude_ref"),
            exif_make: exif_text(meta, "make"),
            exif_model: exif_text(meta, "model"),
            exif_orientation: exif_text(meta, "orientation"),
            exif_pixel_x_dimension: exif_text(meta, "pixel_x_dimension"),
            exif_pixel_y_dimension: exif_text(meta, "pixel_y_dimension"),
            exif_software: exif_text(meta, "software"),
            exif_x_resolution: exif_text(meta, "x_resolution"),
            exif_y_resolution: exif_text(meta, "y_resolution"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetCsv {
    pub group: AssetGroup,
    pub rows: usize,
    pub bytes: Vec<u8>,
}

/// One CSV per non-empty group, `All` first. Empty when nothing was stored.
pub fn asset_csvs(stored: &[StoredAsset]) -> Result<Vec<AssetCsv>, SyncError> {
    let mut groups: Vec<(AssetGroup, Vec<&StoredAsset>)> = vec![
        (AssetGroup::All, Vec::new()),
        (AssetGroup::Before, Vec::new()),
        (AssetGroup::Completed, Vec::new()),
    ];
    for asset in stored {
        groups[0].1.push(asset);
        match AssetGroup::for_field_path(&asset.reference.field_path) {
            Some(AssetGroup::Before) => groups[1].1.push(asset),
            Some(AssetGroup::Completed) => groups[2].1.push(asset),
            _ => {}
        }
    }

    let mut out = Vec::new();
    for (group, assets) in groups {
        if assets.is_empty() {
            continue;
        }
        let mut writer = csv::Writer::from_writer(Vec::new());
        for asset in &assets {
            writer.serialize(AssetRow::new(asset)).map_err(csv_error)?;
        }
        out.push(AssetCsv {
            group,
            rows: assets.len(),
            bytes: writer.into_inner().map_err(csv_error)?,
        });
    }
    Ok(out)
}

pub fn layer_file_name(layer: &SourceLayer) -> String {
    format!("{}_{}.json", safe_name(&layer.name), layer.id)
}

pub fn layer_document(layer: &SourceLayer) -> Result<Vec<u8>, SyncError> {
    serde_json::to_vec_pretty(layer).map_err(|err| SyncError::Export(format!("json: {err}")))
}

pub fn layers_manifest(
    layers: &[SourceLayer],
    generated_at: DateTime<Utc>,
) -> Result<Vec<u8>, SyncError> {
    let manifest = json!({
        "export_date": generated_at.to_rfc3339(),
        "total_layers": layers.len(),
        "layers": layers
            .iter()
            .map(|layer| json!({ "id": layer.id, "name": layer.name }))
            .collect::<Vec<_>>(),
    });
    serde_json::to_vec_pretty(&manifest).map_err(|err| SyncError::Export(format!("json: {err}")))
}
