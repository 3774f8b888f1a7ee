use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Statement};
use tracing::{debug, info, warn};

use crate::db;
use crate::manifest::{
    archive_matches, ArchiveLoad, LoadManifest, LoadStatus, NormalizationManifest, NormalizedFile,
    TableLoad,
};
use crate::normalize::NULL;
use crate::tables::{FieldKind, Table, LOAD_ORDER};

#[derive(Debug, Default, Clone)]
pub struct LoadOptions {
    pub table: Option<Table>,
    pub archive: Option<String>,
    /// Reload archives that already have an import record.
    pub force: bool,
}

/// Normalized files grouped by archive, in first-seen manifest order.
fn group_by_archive(files: &[NormalizedFile]) -> Vec<(String, Vec<&NormalizedFile>)> {
    let mut groups: Vec<(String, Vec<&NormalizedFile>)> = Vec::new();
    for f in files {
        match groups.iter_mut().find(|(a, _)| *a == f.archive) {
            Some((_, v)) => v.push(f),
            None => groups.push((f.archive.clone(), vec![f])),
        }
    }
    groups
}

fn parse_row(table: Table, record: &csv::StringRecord, line: usize) -> Result<Vec<Value>> {
    let columns = table.columns();
    if record.len() != columns.len() {
        bail!(
            "line {}: {} fields, {} expects {}",
            line,
            record.len(),
            table,
            columns.len()
        );
    }
    let key = table.primary_key();
    columns
        .iter()
        .zip(record.iter())
        .map(|(c, raw)| {
            if raw == NULL {
                if key.contains(&c.name) {
                    bail!("line {}: {} key column {} is null", line, table, c.name);
                }
                return Ok(Value::Null);
            }
            match c.kind {
                FieldKind::Integer => raw
                    .parse::<i64>()
                    .map(Value::Integer)
                    .with_context(|| format!("line {}: {} is not an integer: {:?}", line, c.name, raw)),
                FieldKind::Text | FieldKind::Date => Ok(Value::Text(raw.to_string())),
            }
        })
        .collect()
}

struct TableWriter<'conn> {
    table: Table,
    upsert: Statement<'conn>,
    clear: Option<Statement<'conn>>,
    cleared: HashSet<String>,
}

impl<'conn> TableWriter<'conn> {
    fn new(conn: &'conn Connection, table: Table) -> Result<Self> {
        let clear = if table.is_one_to_many() {
            Some(conn.prepare(&db::delete_for_filing_sql(table))?)
        } else {
            None
        };
        Ok(TableWriter {
            table,
            upsert: conn.prepare(&db::upsert_sql(table))?,
            clear,
            cleared: HashSet::new(),
        })
    }

    /// Load one headerless staging file positionally.
    fn load_file(&mut self, path: &Path) -> Result<usize> {
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .quoting(false)
            .from_reader(BufReader::new(file));

        let mut rows = 0;
        for (i, record) in reader.records().enumerate() {
            let record = record.with_context(|| format!("{:?}: unreadable row", path))?;
            let values = parse_row(self.table, &record, i + 1)
                .with_context(|| format!("{:?}", path))?;

            if let (Some(clear), Value::Text(id)) = (self.clear.as_mut(), &values[0]) {
                // First sighting of a filing in this archive replaces its row set.
                if self.cleared.insert(id.clone()) {
                    let removed = clear.execute(params![id])?;
                    if removed > 0 {
                        debug!(table = %self.table, "replacing {} existing row(s) for {}", removed, id);
                    }
                }
            }

            self.upsert
                .execute(params_from_iter(values.iter()))
                .with_context(|| format!("{:?} line {}: {} insert failed", path, i + 1, self.table))?;
            rows += 1;
        }
        Ok(rows)
    }
}

/// Load one archive's files in table dependency order inside a single
/// transaction. Any error rolls the whole archive back.
pub fn load_archive(
    conn: &Connection,
    archive: &str,
    files: &[&NormalizedFile],
    table_filter: Option<Table>,
) -> Result<Vec<TableLoad>> {
    let tx = conn.unchecked_transaction()?;
    let mut loads = Vec::new();

    for table in LOAD_ORDER {
        if table_filter.is_some_and(|t| t != table) {
            continue;
        }
        let table_files: Vec<_> = files.iter().filter(|f| f.table == table).collect();
        if table_files.is_empty() {
            continue;
        }

        let mut writer = TableWriter::new(&tx, table)?;
        let mut rows = 0;
        for f in &table_files {
            rows += writer.load_file(&f.normalized_path)?;
        }
        debug!(archive, table = %table, "{} row(s) from {} file(s)", rows, table_files.len());
        loads.push(TableLoad {
            table,
            files: table_files.len(),
            rows,
        });
    }

    if loads.iter().any(|l| matches!(l.table, Table::Filing | Table::CoverPage)) {
        let n = db::fill_filing_from_cover_page(&tx)?;
        debug!(archive, "filled filer name and quarter on {} filing(s)", n);
    }

    // A single-table load leaves the archive incomplete.
    if table_filter.is_none() {
        let total: usize = loads.iter().map(|l| l.rows).sum();
        db::mark_imported(&tx, archive, total)?;
    }
    tx.commit()?;
    Ok(loads)
}

pub fn run(
    conn: &Connection,
    normalized: &NormalizationManifest,
    input_manifest: PathBuf,
    opts: &LoadOptions,
) -> Result<LoadManifest> {
    let groups: Vec<_> = group_by_archive(&normalized.files)
        .into_iter()
        .filter(|(a, _)| archive_matches(a, opts.archive.as_deref()))
        .collect();
    info!("Loading {} archive(s)", groups.len());

    let pb = ProgressBar::new(groups.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );

    let mut results = Vec::with_capacity(groups.len());
    for (archive, files) in &groups {
        pb.set_message(archive.clone());
        if !opts.force && db::is_imported(conn, archive)? {
            info!(archive = %archive, "already imported, skipping");
            results.push(ArchiveLoad {
                archive: archive.clone(),
                status: LoadStatus::Skipped,
                tables: vec![],
                error: None,
            });
            pb.inc(1);
            continue;
        }

        let result = match load_archive(conn, archive, files, opts.table) {
            Ok(tables) => {
                let rows: usize = tables.iter().map(|t| t.rows).sum();
                info!(archive = %archive, "loaded {} row(s)", rows);
                ArchiveLoad {
                    archive: archive.clone(),
                    status: LoadStatus::Loaded,
                    tables,
                    error: None,
                }
            }
            Err(e) => {
                warn!(archive = %archive, "load failed, rolled back: {:#}", e);
                ArchiveLoad {
                    archive: archive.clone(),
                    status: LoadStatus::Failed,
                    tables: vec![],
                    error: Some(format!("{:#}", e)),
                }
            }
        };
        results.push(result);
        pb.inc(1);
    }
    pb.finish_and_clear();

    Ok(LoadManifest::from_results(input_manifest, results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ExtractedFile;
    use crate::normalize::normalize_file;
    use chrono::Utc;

    const FIXTURES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

    fn staged(dir: &Path, archive: &str, table: Table, body: &str) -> NormalizedFile {
        let path = dir.join(format!("{}_{}_normalized.tsv", archive, table));
        std::fs::write(&path, body).unwrap();
        NormalizedFile {
            archive: archive.to_string(),
            table,
            source_path: PathBuf::new(),
            normalized_path: path,
            rows_read: 0,
            rows_written: 0,
            rows_skipped: 0,
            rows_with_coercion_failures: 0,
            coercion_failures: 0,
            ignored_columns: vec![],
        }
    }

    fn manifest(files: Vec<NormalizedFile>) -> NormalizationManifest {
        NormalizationManifest {
            input_manifest: "extracted.json".into(),
            processed_at: Utc::now(),
            files_processed: files.len(),
            total_rows_read: 0,
            total_rows_written: 0,
            total_rows_skipped: 0,
            total_coercion_failures: 0,
            files,
            failures: vec![],
        }
    }

    /// Normalize every fixture file as members of one archive.
    fn fixture_archive(staging: &Path, archive: &str) -> Vec<NormalizedFile> {
        let members = [
            ("SUBMISSION.tsv", Table::Filing),
            ("COVERPAGE.tsv", Table::CoverPage),
            ("SIGNATURE.tsv", Table::Signature),
            ("SUMMARYPAGE.tsv", Table::SummaryPage),
            ("OTHERMANAGER.tsv", Table::OtherManager),
            ("OTHERMANAGER2.tsv", Table::OtherManager2),
            ("INFOTABLE.tsv", Table::Holding),
        ];
        members
            .iter()
            // Holdings first: load order must not depend on manifest order.
            .rev()
            .map(|(member, table)| {
                let extracted = ExtractedFile {
                    archive: archive.to_string(),
                    member: member.to_string(),
                    local_path: Path::new(FIXTURES).join(member),
                    table: *table,
                };
                normalize_file(&extracted, staging).unwrap()
            })
            .collect()
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |r| r.get(0)).unwrap()
    }

    fn filing_rows(archive_ids: &[(&str, &str)]) -> String {
        archive_ids
            .iter()
            .map(|(id, period)| format!("{id}\t\\N\t\\N\t13F-HR\t\\N\t{period}\t\\N\t\\N\t\\N\n"))
            .collect()
    }

    #[test]
    fn six_filings_with_amendment_load_once_each() {
        let dir = tempfile::tempdir().unwrap();
        let conn = db::open_in_memory().unwrap();
        let files = fixture_archive(dir.path(), "2024q4_form13f.zip");

        let m = run(&conn, &manifest(files), "normalized.json".into(), &LoadOptions::default()).unwrap();
        assert_eq!(m.archives_loaded, 1, "{:?}", m.results[0].error);

        assert_eq!(count(&conn, "SELECT COUNT(*) FROM filing"), 6);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM summary_page"), 6);
        assert_eq!(
            count(
                &conn,
                "SELECT table_value_total FROM summary_page WHERE accession_number = '0000950123-25-000102'"
            ),
            4_350_000_000
        );
        let kind: String = conn
            .query_row(
                "SELECT submissiontype FROM filing WHERE accession_number = '0000950123-25-000102'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(kind, "13F-HR/A");
        let cik: String = conn
            .query_row(
                "SELECT cik FROM filing WHERE accession_number = '0000950123-25-000101'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(cik, "0001067983");
        let (filer, quarter): (String, String) = conn
            .query_row(
                "SELECT filer_name, reportcalendarorquarter FROM filing
                 WHERE accession_number = '0000950123-25-000101'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(filer, "BERKSHIRE HATHAWAY INC");
        assert_eq!(quarter, "2024-12-31");
        let report: String = conn
            .query_row(
                "SELECT typeofreport FROM cover_page WHERE accession_number = '0000950123-25-000101'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(report, "13F HOLDINGS REPORT");

        assert_eq!(count(&conn, "SELECT COUNT(*) FROM holding"), 8);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM other_manager"), 3);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM other_manager2"), 3);
        assert!(db::is_imported(&conn, "2024q4_form13f.zip").unwrap());

        let tables: Vec<Table> = m.results[0].tables.iter().map(|t| t.table).collect();
        assert_eq!(tables, LOAD_ORDER.to_vec());
    }

    #[test]
    fn rerun_skips_imported_archive_and_force_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let conn = db::open_in_memory().unwrap();
        let normalized = manifest(fixture_archive(dir.path(), "2024q4_form13f.zip"));

        run(&conn, &normalized, "n.json".into(), &LoadOptions::default()).unwrap();
        let again = run(&conn, &normalized, "n.json".into(), &LoadOptions::default()).unwrap();
        assert_eq!(again.archives_skipped, 1);
        assert_eq!(again.total_rows_loaded, 0);

        let forced = run(
            &conn,
            &normalized,
            "n.json".into(),
            &LoadOptions { force: true, ..LoadOptions::default() },
        )
        .unwrap();
        assert_eq!(forced.archives_loaded, 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM filing"), 6);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM holding"), 8);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM import_record"), 1);
    }

    #[test]
    fn failure_on_last_table_rolls_back_whole_archive() {
        let dir = tempfile::tempdir().unwrap();
        let conn = db::open_in_memory().unwrap();
        let files = vec![
            staged(dir.path(), "bad.zip", Table::Filing, &filing_rows(&[("A1", "2024-12-31")])),
            staged(dir.path(), "bad.zip", Table::SummaryPage, "A1\t0\t1\t10\n"),
            // References a filing that does not exist.
            staged(
                dir.path(),
                "bad.zip",
                Table::Holding,
                "ZZ\t1\tACME\tCOM\t000000000\t\\N\t10\t1\tSH\t\\N\tSOLE\t\\N\t1\t0\t0\n",
            ),
        ];

        let m = run(&conn, &manifest(files), "n.json".into(), &LoadOptions::default()).unwrap();
        assert_eq!(m.archives_failed, 1);
        assert!(m.results[0].error.is_some());
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM filing"), 0);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM summary_page"), 0);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM holding"), 0);
        assert!(!db::is_imported(&conn, "bad.zip").unwrap());
    }

    #[test]
    fn null_filing_id_fails_the_archive_instead_of_orphaning_rows() {
        let dir = tempfile::tempdir().unwrap();
        let conn = db::open_in_memory().unwrap();
        let files = |archive: &str| {
            vec![
                staged(
                    dir.path(),
                    archive,
                    Table::Filing,
                    &filing_rows(&[("A1", "2024-12-31"), ("\\N", "2024-12-31")]),
                ),
                staged(dir.path(), archive, Table::SummaryPage, "\\N\t0\t1\t10\n"),
            ]
        };

        let first = run(&conn, &manifest(files("q4.zip")), "n.json".into(), &LoadOptions::default()).unwrap();
        let second = run(&conn, &manifest(files("q4b.zip")), "n.json".into(), &LoadOptions::default()).unwrap();
        assert_eq!(first.archives_failed, 1);
        assert_eq!(second.archives_failed, 1);
        assert!(first.results[0].error.as_deref().unwrap().contains("accession_number is null"));
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM filing"), 0);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM summary_page"), 0);

        // The schema refuses a null filing id even when the loader is bypassed.
        assert!(conn
            .execute("INSERT INTO summary_page (accession_number) VALUES (NULL)", [])
            .is_err());
        assert!(conn
            .execute("INSERT INTO filing (accession_number) VALUES (NULL)", [])
            .is_err());
    }

    #[test]
    fn one_bad_archive_does_not_stop_the_next() {
        let dir = tempfile::tempdir().unwrap();
        let conn = db::open_in_memory().unwrap();
        let mut missing = staged(dir.path(), "a.zip", Table::Filing, "");
        missing.normalized_path = dir.path().join("gone.tsv");
        let files = vec![
            missing,
            staged(dir.path(), "b.zip", Table::Filing, &filing_rows(&[("B1", "2024-12-31")])),
        ];

        let m = run(&conn, &manifest(files), "n.json".into(), &LoadOptions::default()).unwrap();
        assert_eq!(m.archives_failed, 1);
        assert_eq!(m.archives_loaded, 1);
        assert_eq!(m.results[0].archive, "a.zip");
        assert!(db::is_imported(&conn, "b.zip").unwrap());
    }

    #[test]
    fn amendment_in_later_archive_replaces_child_row_set() {
        let dir = tempfile::tempdir().unwrap();
        let conn = db::open_in_memory().unwrap();
        let holding = |sk: i64, value: i64| {
            format!("A1\t{sk}\tACME\tCOM\t000000000\t\\N\t{value}\t1\tSH\t\\N\tSOLE\t\\N\t1\t0\t0\n")
        };

        let original = vec![
            staged(dir.path(), "q1.zip", Table::Filing, &filing_rows(&[("A1", "2024-12-31")])),
            staged(
                dir.path(),
                "q1.zip",
                Table::Holding,
                &[holding(1, 10), holding(2, 20), holding(3, 30)].concat(),
            ),
        ];
        run(&conn, &manifest(original), "n.json".into(), &LoadOptions::default()).unwrap();
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM holding"), 3);

        let amended = vec![
            staged(dir.path(), "q1a.zip", Table::Filing, &filing_rows(&[("A1", "2024-12-31")])),
            staged(dir.path(), "q1a.zip", Table::Holding, &[holding(1, 15), holding(4, 40)].concat()),
        ];
        run(&conn, &manifest(amended), "n.json".into(), &LoadOptions::default()).unwrap();

        assert_eq!(count(&conn, "SELECT COUNT(*) FROM filing"), 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM holding"), 2);
        assert_eq!(count(&conn, "SELECT SUM(value) FROM holding"), 55);
    }

    #[test]
    fn table_filter_loads_one_table_without_import_record() {
        let dir = tempfile::tempdir().unwrap();
        let conn = db::open_in_memory().unwrap();
        let normalized = manifest(fixture_archive(dir.path(), "2024q4_form13f.zip"));

        let m = run(
            &conn,
            &normalized,
            "n.json".into(),
            &LoadOptions { table: Some(Table::Filing), ..LoadOptions::default() },
        )
        .unwrap();
        assert_eq!(m.archives_loaded, 1);
        assert_eq!(m.results[0].tables.len(), 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM filing"), 6);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM holding"), 0);
        assert!(!db::is_imported(&conn, "2024q4_form13f.zip").unwrap());
    }

    #[test]
    fn archive_filter_selects_matching_archives() {
        let dir = tempfile::tempdir().unwrap();
        let conn = db::open_in_memory().unwrap();
        let files = vec![
            staged(dir.path(), "2024q3.zip", Table::Filing, &filing_rows(&[("Q3", "2024-09-30")])),
            staged(dir.path(), "2024q4.zip", Table::Filing, &filing_rows(&[("Q4", "2024-12-31")])),
        ];
        let m = run(
            &conn,
            &manifest(files),
            "n.json".into(),
            &LoadOptions { archive: Some("Q4".into()), ..LoadOptions::default() },
        )
        .unwrap();
        assert_eq!(m.results.len(), 1);
        assert_eq!(m.results[0].archive, "2024q4.zip");
    }

    #[test]
    fn holding_view_exposes_value_unit_and_voting_total() {
        let dir = tempfile::tempdir().unwrap();
        let conn = db::open_in_memory().unwrap();
        run(
            &conn,
            &manifest(fixture_archive(dir.path(), "2024q4_form13f.zip")),
            "n.json".into(),
            &LoadOptions::default(),
        )
        .unwrap();

        let unit = |sk: i64| -> String {
            conn.query_row(
                "SELECT value_unit FROM holding_value WHERE infotable_sk = ?1",
                params![sk],
                |r| r.get(0),
            )
            .unwrap()
        };
        assert_eq!(unit(9001), "dollars");
        assert_eq!(unit(9301), "thousands");

        let total: i64 = conn
            .query_row(
                "SELECT voting_total FROM holding_value WHERE infotable_sk = 9102",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(total, 15_600_000);
        // Unparseable voting count was loaded as NULL.
        let none: Option<i64> = conn
            .query_row("SELECT votingauth_none FROM holding WHERE infotable_sk = 9401", [], |r| r.get(0))
            .unwrap();
        assert_eq!(none, None);
    }

    #[test]
    fn malformed_staging_rows_are_rejected() {
        let record = csv::StringRecord::from(vec!["A1", "0"]);
        assert!(parse_row(Table::SummaryPage, &record, 1).is_err());
        let record = csv::StringRecord::from(vec!["A1", "\\N", "x", "1"]);
        assert!(parse_row(Table::SummaryPage, &record, 1).is_err());
        let record = csv::StringRecord::from(vec!["\\N", "\\N", "2", "1"]);
        assert!(parse_row(Table::SummaryPage, &record, 1).is_err());
        let record = csv::StringRecord::from(vec!["A1", "\\N", "2", "1"]);
        assert_eq!(
            parse_row(Table::SummaryPage, &record, 1).unwrap(),
            vec![Value::Text("A1".into()), Value::Null, Value::Integer(2), Value::Integer(1)]
        );
    }
}
