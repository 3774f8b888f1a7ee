use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// The seven entities of a quarterly dataset, keyed by filing identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Filing,
    CoverPage,
    Signature,
    SummaryPage,
    OtherManager,
    OtherManager2,
    Holding,
}

/// Parent first, holdings last.
pub const LOAD_ORDER: [Table; 7] = [
    Table::Filing,
    Table::CoverPage,
    Table::Signature,
    Table::SummaryPage,
    Table::OtherManager,
    Table::OtherManager2,
    Table::Holding,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Date,
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn text(name: &'static str) -> Column {
    Column { name, kind: FieldKind::Text }
}

const fn int(name: &'static str) -> Column {
    Column { name, kind: FieldKind::Integer }
}

const fn date(name: &'static str) -> Column {
    Column { name, kind: FieldKind::Date }
}

const FILING: &[Column] = &[
    text("accession_number"),
    text("cik"),
    text("filer_name"),
    text("submissiontype"),
    date("reportcalendarorquarter"),
    date("periodofreport"),
    date("filing_date"),
    date("filed_as_of_date"),
    date("effective_date"),
];

const COVER_PAGE: &[Column] = &[
    text("accession_number"),
    date("reportcalendarorquarter"),
    text("isamendment"),
    int("amendmentno"),
    text("amendmenttype"),
    text("name"),
    text("street1"),
    text("street2"),
    text("city"),
    text("stateorcountry"),
    text("zipcode"),
    text("phone"),
    text("typeofreport"),
    text("form13f_file_number"),
];

const SIGNATURE: &[Column] = &[
    text("accession_number"),
    text("name"),
    text("title"),
    text("phone"),
    text("city"),
    text("stateorcountry"),
    date("signaturedate"),
];

const SUMMARY_PAGE: &[Column] = &[
    text("accession_number"),
    int("other_included_managers"),
    int("table_entry_total"),
    int("table_value_total"),
];

const OTHER_MANAGER: &[Column] = &[
    text("accession_number"),
    int("othermanager_sk"),
    int("sequencenumber"),
    text("cik"),
    text("form13ffilenumber"),
    text("name"),
];

const OTHER_MANAGER2: &[Column] = &[
    text("accession_number"),
    int("sequencenumber"),
    text("cik"),
    text("form13ffilenumber"),
    text("name"),
];

const HOLDING: &[Column] = &[
    text("accession_number"),
    int("infotable_sk"),
    text("nameofissuer"),
    text("titleofclass"),
    text("cusip"),
    text("figi"),
    int("value"),
    int("sshprnamt"),
    text("sshprnamttype"),
    text("putcall"),
    text("investmentdiscretion"),
    text("othermanager"),
    int("votingauth_sole"),
    int("votingauth_shared"),
    int("votingauth_none"),
];

impl Table {
    pub fn sql_name(self) -> &'static str {
        match self {
            Table::Filing => "filing",
            Table::CoverPage => "cover_page",
            Table::Signature => "signature",
            Table::SummaryPage => "summary_page",
            Table::OtherManager => "other_manager",
            Table::OtherManager2 => "other_manager2",
            Table::Holding => "holding",
        }
    }

    /// Destination column order. Normalized files are written in this order
    /// and the loader binds them positionally.
    pub fn columns(self) -> &'static [Column] {
        match self {
            Table::Filing => FILING,
            Table::CoverPage => COVER_PAGE,
            Table::Signature => SIGNATURE,
            Table::SummaryPage => SUMMARY_PAGE,
            Table::OtherManager => OTHER_MANAGER,
            Table::OtherManager2 => OTHER_MANAGER2,
            Table::Holding => HOLDING,
        }
    }

    pub fn primary_key(self) -> &'static [&'static str] {
        match self {
            Table::Filing | Table::CoverPage | Table::Signature | Table::SummaryPage => {
                &["accession_number"]
            }
            Table::OtherManager => &["accession_number", "othermanager_sk"],
            Table::OtherManager2 => &["accession_number", "sequencenumber"],
            Table::Holding => &["accession_number", "infotable_sk"],
        }
    }

    /// Zero-to-many children of a filing.
    pub fn is_one_to_many(self) -> bool {
        matches!(self, Table::OtherManager | Table::OtherManager2 | Table::Holding)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_name())
    }
}

impl FromStr for Table {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase().replace(['_', '-'], "");
        let table = match key.as_str() {
            "filing" | "submission" => Table::Filing,
            "coverpage" => Table::CoverPage,
            "signature" => Table::Signature,
            "summarypage" => Table::SummaryPage,
            "othermanager" => Table::OtherManager,
            "othermanager2" => Table::OtherManager2,
            "holding" | "infotable" => Table::Holding,
            _ => anyhow::bail!("unknown table '{}'", s),
        };
        Ok(table)
    }
}

// ── Classification ──

/// Ordered (tokens, table) rules. Longer tokens that contain a shorter one
/// as a substring must come first.
const CLASSIFY_RULES: &[(&[&str], Table)] = &[
    (&["othermanager2"], Table::OtherManager2),
    (&["othermanager"], Table::OtherManager),
    (&["submission"], Table::Filing),
    (&["coverpage", "cover"], Table::CoverPage),
    (&["summarypage", "summary"], Table::SummaryPage),
    (&["signature"], Table::Signature),
    (&["infotable", "info"], Table::Holding),
];

/// Map a member file name to its destination table, `None` when unclassified.
pub fn classify(file_name: &str) -> Option<Table> {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name)
        .to_lowercase();
    let stem = base
        .strip_suffix(".tsv")
        .or_else(|| base.strip_suffix(".txt"))
        .unwrap_or(&base);

    CLASSIFY_RULES
        .iter()
        .find(|(tokens, _)| tokens.iter().any(|t| stem.contains(t)))
        .map(|(_, table)| *table)
}

// ── Value units ──

/// Holdings in reports for periods on or after this date carry whole
/// dollars; earlier reports carry thousands.
pub const VALUE_CUTOVER: (i32, u32, u32) = (2022, 12, 31);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueUnit {
    Dollars,
    Thousands,
}

impl ValueUnit {
    pub fn for_period(period_of_report: NaiveDate) -> ValueUnit {
        let (y, m, d) = VALUE_CUTOVER;
        match NaiveDate::from_ymd_opt(y, m, d) {
            Some(cutover) if period_of_report < cutover => ValueUnit::Thousands,
            _ => ValueUnit::Dollars,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValueUnit::Dollars => "dollars",
            ValueUnit::Thousands => "thousands",
        }
    }
}
