use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::{ensure_dir, Settings};
use crate::manifest::{
    archive_matches, ExtractedFile, ExtractionManifest, FileFailure, NormalizationManifest,
    NormalizedFile,
};
use crate::tables::{FieldKind, Table};

/// Null marker in staging files. The loader binds it as SQL NULL.
pub const NULL: &str = "\\N";

static DMY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})-([A-Za-z]{3})-(\d{4}|\d{2})$").unwrap());
static ISO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2})$").unwrap());

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// `31-DEC-2024`, `31-dec-24` or `2024-12-31` to ISO. `None` for anything
/// else, including impossible calendar dates.
pub fn normalize_date(raw: &str) -> Option<String> {
    let (y, m, d) = if let Some(c) = DMY_RE.captures(raw) {
        let month = c[2].to_ascii_lowercase();
        let m = MONTHS.iter().position(|name| *name == month)? as u32 + 1;
        let y: i32 = c[3].parse().ok()?;
        let y = match c[3].len() {
            2 if y < 69 => 2000 + y,
            2 => 1900 + y,
            _ => y,
        };
        (y, m, c[1].parse().ok()?)
    } else if let Some(c) = ISO_RE.captures(raw) {
        (c[1].parse().ok()?, c[2].parse().ok()?, c[3].parse().ok()?)
    } else {
        return None;
    };
    NaiveDate::from_ymd_opt(y, m, d).map(|date| date.format("%Y-%m-%d").to_string())
}

pub fn normalize_integer(raw: &str) -> Option<i64> {
    raw.parse::<i64>().ok()
}

#[derive(Debug, PartialEq)]
enum Field {
    Null,
    Value(String),
    /// Present but not coercible to the column type.
    Invalid,
}

fn normalize_field(raw: &str, kind: FieldKind) -> Field {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Field::Null;
    }
    match kind {
        FieldKind::Text => Field::Value(trimmed.to_string()),
        FieldKind::Integer => normalize_integer(trimmed)
            .map(|n| Field::Value(n.to_string()))
            .unwrap_or(Field::Invalid),
        FieldKind::Date => normalize_date(trimmed)
            .map(Field::Value)
            .unwrap_or(Field::Invalid),
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct FileStats {
    pub rows_read: usize,
    pub rows_written: usize,
    pub rows_skipped: usize,
    pub rows_with_coercion_failures: usize,
    pub coercion_failures: usize,
    pub ignored_columns: Vec<String>,
}

/// Header spellings seen across releases that differ from the column name
/// by more than underscores.
const HEADER_ALIASES: &[(&str, &str)] = &[
    ("othermanagers", "othermanager"),
    ("otherincludedmanagerscount", "otherincludedmanagers"),
    ("reporttype", "typeofreport"),
    ("filingmanagername", "name"),
    ("filingmanagerstreet1", "street1"),
    ("filingmanagerstreet2", "street2"),
    ("filingmanagercity", "city"),
    ("filingmanagerstateorcountry", "stateorcountry"),
    ("filingmanagerzipcode", "zipcode"),
];

fn header_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_start_matches('\u{feff}')
        .trim()
        .to_ascii_lowercase()
}

/// Comparison key: `VOTING_AUTH_SOLE` and `votingauth_sole` are the same column.
fn header_key(name: &str) -> String {
    let key: String = name.chars().filter(|c| *c != '_').collect();
    HEADER_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(key)
}

/// Parse one tab-delimited file with a header row and write its rows as
/// headerless TSV in `table`'s column order.
pub fn normalize_stream<R: Read, W: Write>(table: Table, input: R, output: W) -> Result<FileStats> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .quoting(false)
        .from_reader(input);
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .quote_style(csv::QuoteStyle::Never)
        .from_writer(output);

    let header: Vec<String> = reader.byte_headers()?.iter().map(header_name).collect();
    let keys: Vec<String> = header.iter().map(|h| header_key(h)).collect();
    let columns = table.columns();
    let positions: Vec<Option<usize>> = columns
        .iter()
        .map(|c| {
            let want = header_key(c.name);
            keys.iter().position(|k| *k == want)
        })
        .collect();
    let key = table.primary_key();
    let is_key: Vec<bool> = columns.iter().map(|c| key.contains(&c.name)).collect();

    let mut stats = FileStats {
        ignored_columns: header
            .iter()
            .enumerate()
            .filter(|(i, h)| !h.is_empty() && !positions.contains(&Some(*i)))
            .map(|(_, h)| h.clone())
            .collect(),
        ..FileStats::default()
    };
    if !stats.ignored_columns.is_empty() {
        debug!(table = %table, "ignoring columns {:?}", stats.ignored_columns);
    }

    let mut record = csv::ByteRecord::new();
    let mut out: Vec<String> = Vec::with_capacity(columns.len());
    while reader.read_byte_record(&mut record)? {
        stats.rows_read += 1;
        if record.len() != header.len() {
            debug!(
                table = %table,
                "row {} has {} fields, expected {}",
                stats.rows_read,
                record.len(),
                header.len()
            );
            stats.rows_skipped += 1;
            continue;
        }

        out.clear();
        let mut failures = 0;
        let mut keyless = false;
        for ((column, pos), key_column) in columns.iter().zip(&positions).zip(&is_key) {
            let raw = pos
                .and_then(|i| record.get(i))
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            match normalize_field(&raw, column.kind) {
                Field::Value(v) => out.push(v),
                Field::Null | Field::Invalid if *key_column => {
                    keyless = true;
                    break;
                }
                Field::Null => out.push(NULL.to_string()),
                Field::Invalid => {
                    failures += 1;
                    out.push(NULL.to_string());
                }
            }
        }
        // A row without its full key cannot be tied to a filing.
        if keyless {
            debug!(table = %table, "row {} has no usable {:?}", stats.rows_read, key);
            stats.rows_skipped += 1;
            continue;
        }
        if failures > 0 {
            stats.rows_with_coercion_failures += 1;
            stats.coercion_failures += failures;
        }
        writer.write_record(&out)?;
        stats.rows_written += 1;
    }
    writer.flush()?;
    Ok(stats)
}

pub fn staging_path(staging_dir: &Path, source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    staging_dir.join(format!("{}_normalized.tsv", stem))
}

pub fn normalize_file(file: &ExtractedFile, staging_dir: &Path) -> Result<NormalizedFile> {
    let normalized_path = staging_path(staging_dir, &file.local_path);
    let input = File::open(&file.local_path)
        .with_context(|| format!("Failed to open {:?}", file.local_path))?;
    let output = File::create(&normalized_path)
        .with_context(|| format!("Failed to create {:?}", normalized_path))?;

    let stats = normalize_stream(file.table, BufReader::new(input), BufWriter::new(output))
        .with_context(|| format!("Failed to normalize {:?}", file.local_path))?;

    if stats.coercion_failures > 0 || stats.rows_skipped > 0 {
        warn!(
            archive = %file.archive,
            table = %file.table,
            "{:?}: {} coercion failure(s) in {} row(s), {} malformed row(s) skipped",
            file.local_path,
            stats.coercion_failures,
            stats.rows_with_coercion_failures,
            stats.rows_skipped
        );
    }

    Ok(NormalizedFile {
        archive: file.archive.clone(),
        table: file.table,
        source_path: file.local_path.clone(),
        normalized_path,
        rows_read: stats.rows_read,
        rows_written: stats.rows_written,
        rows_skipped: stats.rows_skipped,
        rows_with_coercion_failures: stats.rows_with_coercion_failures,
        coercion_failures: stats.coercion_failures,
        ignored_columns: stats.ignored_columns,
    })
}

pub fn run(
    settings: &Settings,
    extraction: &ExtractionManifest,
    input_manifest: PathBuf,
    table_filter: Option<Table>,
    archive_filter: Option<&str>,
) -> Result<NormalizationManifest> {
    let staging_dir = settings.staging_dir();
    ensure_dir(&staging_dir)?;

    let selected: Vec<&ExtractedFile> = extraction
        .files
        .iter()
        .filter(|f| table_filter.map_or(true, |t| t == f.table))
        .filter(|f| archive_matches(&f.archive, archive_filter))
        .collect();
    info!("Normalizing {} file(s)", selected.len());

    let pb = ProgressBar::new(selected.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")?
            .progress_chars("#>-"),
    );

    let results: Vec<Result<NormalizedFile, FileFailure>> = selected
        .par_iter()
        .map(|file| {
            let result = normalize_file(file, &staging_dir).map_err(|e| {
                warn!(archive = %file.archive, "{:#}", e);
                FileFailure {
                    archive: file.archive.clone(),
                    path: file.local_path.clone(),
                    error: format!("{:#}", e),
                }
            });
            pb.inc(1);
            result
        })
        .collect();
    pb.finish_and_clear();

    let mut files = Vec::new();
    let mut failures = Vec::new();
    for r in results {
        match r {
            Ok(f) => files.push(f),
            Err(f) => failures.push(f),
        }
    }

    Ok(NormalizationManifest {
        input_manifest,
        processed_at: Utc::now(),
        files_processed: files.len(),
        total_rows_read: files.iter().map(|f| f.rows_read).sum(),
        total_rows_written: files.iter().map(|f| f.rows_written).sum(),
        total_rows_skipped: files.iter().map(|f| f.rows_skipped).sum(),
        total_coercion_failures: files.iter().map(|f| f.coercion_failures).sum(),
        files,
        failures,
    })
}
