use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::{params, Connection};

use crate::config::ensure_dir;
use crate::tables::{Table, ValueUnit, LOAD_ORDER};

const SCHEMA: &str = include_str!("../schema.sql");

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_dir(parent)?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open database {:?}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA).context("Failed to apply schema")?;
    Ok(())
}

// ── Statements ──

/// Positional insert over every column, updating non-key columns when the
/// primary key already exists. Never `REPLACE`: that deletes the parent row
/// and cascades to its children.
pub fn upsert_sql(table: Table) -> String {
    let columns = table.columns();
    let names: Vec<&str> = columns.iter().map(|c| c.name).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let key = table.primary_key();
    let updates: Vec<String> = names
        .iter()
        .filter(|n| !key.contains(*n))
        .map(|n| format!("{n} = excluded.{n}"))
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
        table.sql_name(),
        names.join(", "),
        placeholders.join(", "),
        key.join(", "),
        updates.join(", ")
    )
}

pub fn delete_for_filing_sql(table: Table) -> String {
    format!("DELETE FROM {} WHERE accession_number = ?1", table.sql_name())
}

/// SUBMISSION carries neither the filer name nor the calendar quarter; both
/// come from the filing's cover page. Returns the number of filings changed.
pub fn fill_filing_from_cover_page(conn: &Connection) -> Result<usize> {
    let n = conn.execute(
        "UPDATE filing
         SET filer_name = c.name, reportcalendarorquarter = c.reportcalendarorquarter
         FROM cover_page c
         WHERE c.accession_number = filing.accession_number
           AND (filing.filer_name IS NOT c.name
                OR filing.reportcalendarorquarter IS NOT c.reportcalendarorquarter)",
        [],
    )?;
    Ok(n)
}

// ── Import tracking ──

#[derive(Debug, Clone)]
pub struct ImportRecord {
    pub archive_name: String,
    pub imported_at: String,
    pub row_count: i64,
}

pub fn is_imported(conn: &Connection, archive: &str) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM import_record WHERE archive_name = ?1",
        params![archive],
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

pub fn mark_imported(conn: &Connection, archive: &str, row_count: usize) -> Result<()> {
    conn.execute(
        "INSERT INTO import_record (archive_name, imported_at, row_count)
         VALUES (?1, datetime('now'), ?2)
         ON CONFLICT (archive_name) DO UPDATE SET
            imported_at = excluded.imported_at,
            row_count = excluded.row_count",
        params![archive, row_count as i64],
    )?;
    Ok(())
}

pub fn list_imported(conn: &Connection) -> Result<Vec<ImportRecord>> {
    let mut stmt = conn.prepare(
        "SELECT archive_name, imported_at, row_count FROM import_record ORDER BY imported_at, archive_name",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ImportRecord {
                archive_name: row.get(0)?,
                imported_at: row.get(1)?,
                row_count: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Delete tracking rows, all of them or those whose name contains `filter`
/// (case-insensitive). Loaded data is left in place.
pub fn clear_imported(conn: &Connection, filter: Option<&str>) -> Result<usize> {
    let n = match filter {
        Some(f) => conn.execute(
            "DELETE FROM import_record WHERE instr(lower(archive_name), lower(?1)) > 0",
            params![f],
        )?,
        None => conn.execute("DELETE FROM import_record", [])?,
    };
    Ok(n)
}

// ── Stats ──

pub struct Stats {
    pub tables: Vec<(Table, usize)>,
    /// Holdings split by the unit their `value` is reported in. Holdings
    /// whose filing has no period are not counted.
    pub holdings_by_unit: Vec<(ValueUnit, usize)>,
    pub imported: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let mut tables = Vec::with_capacity(LOAD_ORDER.len());
    for table in LOAD_ORDER {
        let n: usize = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", table.sql_name()),
            [],
            |r| r.get(0),
        )?;
        tables.push((table, n));
    }

    let mut stmt = conn.prepare(
        "SELECT f.periodofreport, COUNT(*)
         FROM holding h JOIN filing f ON f.accession_number = h.accession_number
         WHERE f.periodofreport IS NOT NULL
         GROUP BY f.periodofreport",
    )?;
    let periods = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, usize>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut holdings_by_unit = vec![(ValueUnit::Dollars, 0), (ValueUnit::Thousands, 0)];
    for (period, n) in periods {
        let Ok(date) = NaiveDate::parse_from_str(&period, "%Y-%m-%d") else {
            continue;
        };
        let unit = ValueUnit::for_period(date);
        if let Some(slot) = holdings_by_unit.iter_mut().find(|(u, _)| *u == unit) {
            slot.1 += n;
        }
    }

    let imported: usize = conn.query_row("SELECT COUNT(*) FROM import_record", [], |r| r.get(0))?;
    Ok(Stats {
        tables,
        holdings_by_unit,
        imported,
    })
}
