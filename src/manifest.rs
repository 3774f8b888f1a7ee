//! Stage manifests. Each stage writes one of these as pretty JSON and the
//! next stage reads it back, so any stage can be re-run on its own.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::discover::InteractionOutcome;
use crate::tables::Table;

// ── Discovery ──

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchiveLink {
    pub url: String,
    pub filename: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceResult {
    pub name: String,
    pub index_url: String,
    pub status: SourceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub interactions: Vec<InteractionOutcome>,
    pub archive_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryManifest {
    pub discovered_at: DateTime<Utc>,
    pub archive_count: usize,
    pub archives: Vec<ArchiveLink>,
    #[serde(default)]
    pub sources: Vec<SourceResult>,
}

// ── Retrieval ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStatus {
    Downloaded,
    Present,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRetrieval {
    pub archive: String,
    pub url: String,
    pub status: RetrievalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFile {
    pub archive: String,
    pub member: String,
    pub local_path: PathBuf,
    pub table: Table,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnclassifiedFile {
    pub archive: String,
    pub member: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionManifest {
    pub input_manifest: PathBuf,
    pub processed_at: DateTime<Utc>,
    pub archives_processed: usize,
    pub archives_downloaded: usize,
    pub archives: Vec<ArchiveRetrieval>,
    pub files: Vec<ExtractedFile>,
    #[serde(default)]
    pub unclassified: Vec<UnclassifiedFile>,
}

// ── Normalization ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedFile {
    pub archive: String,
    pub table: Table,
    pub source_path: PathBuf,
    pub normalized_path: PathBuf,
    pub rows_read: usize,
    pub rows_written: usize,
    /// Rows dropped for having the wrong number of fields.
    pub rows_skipped: usize,
    pub rows_with_coercion_failures: usize,
    pub coercion_failures: usize,
    #[serde(default)]
    pub ignored_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileFailure {
    pub archive: String,
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizationManifest {
    pub input_manifest: PathBuf,
    pub processed_at: DateTime<Utc>,
    pub files_processed: usize,
    pub total_rows_read: usize,
    pub total_rows_written: usize,
    pub total_rows_skipped: usize,
    pub total_coercion_failures: usize,
    pub files: Vec<NormalizedFile>,
    #[serde(default)]
    pub failures: Vec<FileFailure>,
}

// ── Load ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Loaded,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableLoad {
    pub table: Table,
    pub files: usize,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveLoad {
    pub archive: String,
    pub status: LoadStatus,
    pub tables: Vec<TableLoad>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ArchiveLoad {
    pub fn rows(&self) -> usize {
        self.tables.iter().map(|t| t.rows).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadManifest {
    pub input_manifest: PathBuf,
    pub loaded_at: DateTime<Utc>,
    pub archives_loaded: usize,
    pub archives_skipped: usize,
    pub archives_failed: usize,
    pub total_rows_loaded: usize,
    pub results: Vec<ArchiveLoad>,
}

impl LoadManifest {
    pub fn from_results(input_manifest: PathBuf, results: Vec<ArchiveLoad>) -> Self {
        let count = |s: LoadStatus| results.iter().filter(|r| r.status == s).count();
        LoadManifest {
            input_manifest,
            loaded_at: Utc::now(),
            archives_loaded: count(LoadStatus::Loaded),
            archives_skipped: count(LoadStatus::Skipped),
            archives_failed: count(LoadStatus::Failed),
            total_rows_loaded: results
                .iter()
                .filter(|r| r.status == LoadStatus::Loaded)
                .map(ArchiveLoad::rows)
                .sum(),
            results,
        }
    }
}

// ── IO ──

pub fn read<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {:?}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("Malformed manifest {:?}", path))
}

pub fn write<T: Serialize>(path: &Path, manifest: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        crate::config::ensure_dir(parent)?;
    }
    let json = serde_json::to_string_pretty(manifest)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write manifest {:?}", path))
}

/// Case-insensitive substring filter used by `--archive`.
pub fn archive_matches(archive: &str, filter: Option<&str>) -> bool {
    match filter {
        Some(f) => archive.to_lowercase().contains(&f.to_lowercase()),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extraction_manifest_field_names_are_stable() {
        let manifest = ExtractionManifest {
            input_manifest: "discovered.json".into(),
            processed_at: Utc::now(),
            archives_processed: 1,
            archives_downloaded: 1,
            archives: vec![ArchiveRetrieval {
                archive: "2024q4_form13f.zip".into(),
                url: "https://example.com/2024q4_form13f.zip".into(),
                status: RetrievalStatus::Downloaded,
                bytes: Some(10),
                error: None,
            }],
            files: vec![ExtractedFile {
                archive: "2024q4_form13f.zip".into(),
                member: "OTHERMANAGER2.tsv".into(),
                local_path: "data/extracted/2024q4_form13f__OTHERMANAGER2.tsv".into(),
                table: Table::OtherManager2,
            }],
            unclassified: vec![],
        };

        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value["archives"][0]["status"], json!("downloaded"));
        assert_eq!(value["files"][0]["table"], json!("other_manager2"));
        assert_eq!(
            value["files"][0]["local_path"],
            json!("data/extracted/2024q4_form13f__OTHERMANAGER2.tsv")
        );
        assert!(value["archives"][0].get("error").is_none());
    }

    #[test]
    fn load_manifest_totals_only_count_loaded_archives() {
        let loaded = ArchiveLoad {
            archive: "a.zip".into(),
            status: LoadStatus::Loaded,
            tables: vec![
                TableLoad { table: Table::Filing, files: 1, rows: 2 },
                TableLoad { table: Table::Holding, files: 1, rows: 5 },
            ],
            error: None,
        };
        let failed = ArchiveLoad {
            archive: "b.zip".into(),
            status: LoadStatus::Failed,
            tables: vec![],
            error: Some("boom".into()),
        };
        let m = LoadManifest::from_results("normalized.json".into(), vec![loaded, failed]);
        assert_eq!(m.archives_loaded, 1);
        assert_eq!(m.archives_failed, 1);
        assert_eq!(m.total_rows_loaded, 7);
    }

    #[test]
    fn write_then_read_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/discovered.json");
        let manifest = DiscoveryManifest {
            discovered_at: Utc::now(),
            archive_count: 1,
            archives: vec![ArchiveLink {
                url: "https://example.com/a.zip".into(),
                filename: "a.zip".into(),
            }],
            sources: vec![],
        };
        write(&path, &manifest).unwrap();
        let back: DiscoveryManifest = read(&path).unwrap();
        assert_eq!(back.archives, manifest.archives);
    }

    #[test]
    fn archive_filter_is_case_insensitive() {
        assert!(archive_matches("01DEC2024-28FEB2025_form13f.zip", Some("2025")));
        assert!(archive_matches("01dec2024_form13f.zip", Some("DEC2024")));
        assert!(!archive_matches("01dec2024_form13f.zip", Some("2023")));
        assert!(archive_matches("anything", None));
    }
}
