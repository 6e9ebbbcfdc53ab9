use crate::transfer::FailedAsset;
use chrono::{DateTime, Utc};
use formsync_core::Entity;
use formsync_storage::EntityFailure;

pub const ENTITY_SUMMARY: &str = "ENTITY_SUMMARY.txt";
pub const FAILURE_SUMMARY: &str = "FAILED_TRANSFERS_SUMMARY.txt";

const WIDE: usize = 70;
const NARROW: usize = 60;

fn rule(ch: char, width: usize) -> String {
    std::iter::repeat(ch).take(width).collect()
}

fn heading(lines: &mut Vec<String>, title: &str, width: usize) {
    lines.push(rule('-', width));
    lines.push(title.to_string());
    lines.push(rule('-', width));
    lines.push(String::new());
}

pub fn status_label(active: bool) -> &'static str {
    if active {
        "ACTIVE"
    } else {
        "INACTIVE"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySummary<'a> {
    pub entity: &'a Entity,
    pub folder: String,
    pub records: usize,
    pub assets_in_source: usize,
    pub assets_in_target: usize,
    /// Exported artifact names with an optional note, e.g. a row count.
    pub files: Vec<String>,
    pub failed: &'a [FailedAsset],
}

pub fn render_entity_summary(summary: &EntitySummary<'_>, generated_at: DateTime<Utc>) -> String {
    let mut lines = vec![
        rule('=', NARROW),
        "ENTITY EXPORT SUMMARY".to_string(),
        rule('=', NARROW),
        String::new(),
        format!("Entity Name: {}", summary.entity.name),
        format!("Status: {}", status_label(summary.entity.active)),
        format!("Entity ID: {}", summary.entity.id),
        format!("Folder: {}", summary.folder),
        format!("Export Date: {}", generated_at.to_rfc3339()),
        String::new(),
    ];
    heading(&mut lines, "STATISTICS", NARROW);
    lines.extend([
        format!("Total Records: {}", summary.records),
        format!("Record Documents: {}", summary.records),
        format!("Total Assets in Source: {}", summary.assets_in_source),
        format!("Total Assets in Target: {}", summary.assets_in_target),
        format!("Assets Failed: {}", summary.failed.len()),
        String::new(),
    ]);
    heading(&mut lines, "EXPORTED FILES", NARROW);
    lines.extend(summary.files.iter().map(|file| format!("- {file}")));
    lines.push(String::new());

    if !summary.failed.is_empty() {
        heading(&mut lines, "FAILED ASSETS", NARROW);
        for failed in summary.failed {
            lines.push(format!("Asset ID: {}", failed.reference.asset_id));
            lines.push(format!("Record ID: {}", failed.reference.record_id));
            lines.push(format!("Error: {}", failed.reason));
            lines.push(String::new());
        }
    }
    lines.join("\n")
}

/// Entities that could not be synced first, then worst-first, then by name. `None` when nothing
/// failed.
pub fn render_failure_summary(
    failures: &[EntityFailure],
    generated_at: DateTime<Utc>,
) -> Option<String> {
    if failures.is_empty() {
        return None;
    }
    let mut sorted: Vec<&EntityFailure> = failures.iter().collect();
    sorted.sort_by(|left, right| {
        right
            .error
            .is_some()
            .cmp(&left.error.is_some())
            .then_with(|| right.assets_failed.cmp(&left.assets_failed))
            .then_with(|| left.entity_name.cmp(&right.entity_name))
    });
    let total_failed: u64 = sorted.iter().map(|failure| failure.assets_failed).sum();
    let unsynced = sorted.iter().filter(|failure| failure.error.is_some()).count();

    let mut lines = vec![
        rule('=', WIDE),
        "FAILED ASSET TRANSFERS SUMMARY".to_string(),
        rule('=', WIDE),
        String::new(),
        format!("Generated: {}", generated_at.to_rfc3339()),
        format!("Total Entities with Failed Assets: {}", sorted.len() - unsynced),
        format!("Total Entities Not Synced: {unsynced}"),
        format!("Total Assets Failed: {total_failed}"),
        String::new(),
    ];
    heading(&mut lines, "ENTITIES WITH FAILED ASSET TRANSFERS", WIDE);
    for (index, failure) in sorted.iter().enumerate() {
        lines.push(format!("{}. {}", index + 1, failure.entity_name));
        lines.push(format!("   Status: {}", status_label(failure.active)));
        match &failure.error {
            Some(error) => {
                lines.push(format!("   Not Synced: {error}"));
                lines.push(format!("   Location: {}", failure.container_path));
            }
            None => lines.extend([
                format!("   Total Assets in Source: {}", failure.assets_in_source),
                format!("   Total Assets in Target: {}", failure.assets_in_target),
                format!("   Assets Failed: {}", failure.assets_failed),
                format!("   Location: {}/{ENTITY_SUMMARY}", failure.container_path),
            ]),
        }
        lines.push(String::new());
    }
    heading(&mut lines, "NOTE", WIDE);
    lines.extend([
        "Failed assets are typically due to:".to_string(),
        "- Assets not yet uploaded to the source servers".to_string(),
        "- Assets deleted at the source".to_string(),
        "- Network timeouts during transfer".to_string(),
        String::new(),
        "This summary updates after each entity is processed.".to_string(),
        rule('=', WIDE),
    ]);
    Some(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use formsync_core::AssetReference;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0)
            .single()
            .expect("valid timestamp")
    }

    fn failure(name: &str, failed: u64) -> EntityFailure {
        EntityFailure {
            entity_id: format!("id-{name}"),
            entity_name: name.to_string(),
            active: true,
            container_path: format!("active_entities/{name}_id"),
            assets_in_source: 10,
            assets_in_target: 10 - failed,
            assets_failed: failed,
            error: None,
            updated_at: ts(),
        }
    }

    #[test]
    fn failure_summary_lists_worst_first() {
        let text = render_failure_summary(&[failure("Alpha", 1), failure("Beta", 7)], ts())
            .expect("summary");
        let beta = text.find("1. Beta").expect("beta first");
        let alpha = text.find("2. Alpha").expect("alpha second");
        assert!(beta < alpha);
        assert!(text.contains("Total Assets Failed: 8"));
        assert!(text.contains("Location: active_entities/Beta_id/ENTITY_SUMMARY.txt"));
    }

    #[test]
    fn unsynced_entity_heads_the_summary_with_its_error() {
        let unsynced = EntityFailure {
            assets_in_source: 0,
            assets_in_target: 0,
            error: Some("source error: network error: reset".to_string()),
            ..failure("Zulu", 0)
        };
        let text = render_failure_summary(&[failure("Alpha", 3), unsynced], ts())
            .expect("summary");
        let zulu = text.find("1. Zulu").expect("zulu first");
        let alpha = text.find("2. Alpha").expect("alpha second");
        assert!(zulu < alpha);
        assert!(text.contains("Total Entities with Failed Assets: 1"));
        assert!(text.contains("Total Entities Not Synced: 1"));
        assert!(text.contains("   Not Synced: source error: network error: reset"));
        assert!(text.contains("   Location: active_entities/Zulu_id\n"));
    }

    #[test]
    fn no_failures_means_no_summary() {
        assert_eq!(render_failure_summary(&[], ts()), None);
    }

    #[test]
    fn entity_summary_includes_failed_assets() {
        let entity = Entity {
            id: "f1".to_string(),
            name: "Parcels".to_string(),
            active: false,
        };
        let failed = vec![FailedAsset {
            reference: AssetReference {
                asset_id: "a9".to_string(),
                record_id: "r3".to_string(),
                field_path: "photos[0]".to_string(),
                caption: String::new(),
            },
            reason: "timed out".to_string(),
        }];
        let text = render_entity_summary(
            &EntitySummary {
                entity: &entity,
                folder: entity.folder_name(),
                records: 3,
                assets_in_source: 4,
                assets_in_target: 3,
                files: vec!["Parcels_f1_data.csv".to_string()],
                failed: &failed,
            },
            ts(),
        );

        assert!(text.contains("Status: INACTIVE"));
        assert!(text.contains("- Parcels_f1_data.csv"));
        assert!(text.contains("Asset ID: a9"));
        assert!(text.contains("Error: timed out"));
    }
}
