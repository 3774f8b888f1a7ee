mod config;
mod db;
mod discover;
mod http;
mod load;
mod manifest;
mod normalize;
mod retrieve;
mod tables;

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use clap::{Parser, Subcommand};

use config::{Settings, Source};
use load::LoadOptions;
use manifest::{
    DiscoveryManifest, ExtractionManifest, LoadManifest, NormalizationManifest, RetrievalStatus,
    SourceStatus,
};
use tables::Table;

#[derive(Parser)]
#[command(name = "form13f", about = "SEC Form 13F data set ingestion pipeline")]
struct Cli {
    /// Configuration file (default: ./form13f.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find archive links on the index page(s)
    Discover {
        /// Index page to use instead of the configured sources
        #[arg(long)]
        url: Option<String>,
        /// Extract visible links without running page interactions
        #[arg(long)]
        no_interact: bool,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Download and extract discovered archives
    Retrieve {
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Only archives whose name contains this (case-insensitive)
        #[arg(short, long)]
        archive: Option<String>,
        /// Download again even when the archive is already on disk
        #[arg(long)]
        redownload: bool,
    },
    /// Parse extracted files into load-ready staging files
    Normalize {
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Only this table (e.g. infotable, coverpage, other_manager2)
        #[arg(short, long)]
        table: Option<Table>,
        #[arg(short, long)]
        archive: Option<String>,
    },
    /// Load staging files into the database, one transaction per archive
    Load {
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long)]
        table: Option<Table>,
        #[arg(short, long)]
        archive: Option<String>,
        /// Reload archives already marked as imported
        #[arg(long)]
        force: bool,
    },
    /// All four stages in sequence
    Run {
        #[arg(short, long)]
        archive: Option<String>,
    },
    /// List imported archives
    Imported,
    /// Forget imported archives so the next load picks them up again
    ClearImported {
        #[arg(short, long)]
        archive: Option<String>,
    },
    /// Row counts per table
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Discover {
            url,
            no_interact,
            output,
        } => {
            let output = output.unwrap_or_else(|| settings.manifest_path("discovered"));
            discover_stage(&settings, url, !no_interact, &output).await?;
            Ok(())
        }
        Commands::Retrieve {
            input,
            output,
            archive,
            redownload,
        } => {
            let input = input.unwrap_or_else(|| settings.manifest_path("discovered"));
            let output = output.unwrap_or_else(|| settings.manifest_path("extracted"));
            retrieve_stage(&settings, &input, &output, archive.as_deref(), redownload).await?;
            Ok(())
        }
        Commands::Normalize {
            input,
            output,
            table,
            archive,
        } => {
            let input = input.unwrap_or_else(|| settings.manifest_path("extracted"));
            let output = output.unwrap_or_else(|| settings.manifest_path("normalized"));
            normalize_stage(&settings, &input, &output, table, archive.as_deref())?;
            Ok(())
        }
        Commands::Load {
            input,
            output,
            table,
            archive,
            force,
        } => {
            let input = input.unwrap_or_else(|| settings.manifest_path("normalized"));
            let output = output.unwrap_or_else(|| settings.manifest_path("loaded"));
            let opts = LoadOptions {
                table,
                archive,
                force,
            };
            load_stage(&settings, &input, &output, &opts)?;
            Ok(())
        }
        Commands::Run { archive } => {
            let discovered = settings.manifest_path("discovered");
            let extracted = settings.manifest_path("extracted");
            let normalized = settings.manifest_path("normalized");
            let loaded = settings.manifest_path("loaded");

            let t_stage = Instant::now();
            let d = discover_stage(&settings, None, true, &discovered).await?;
            if d.archives.is_empty() {
                println!("No archives discovered, nothing to do.");
                return Ok(());
            }
            println!("Discovery took {}", format_duration(t_stage.elapsed()));

            let t_stage = Instant::now();
            retrieve_stage(&settings, &discovered, &extracted, archive.as_deref(), false).await?;
            println!("Retrieval took {}", format_duration(t_stage.elapsed()));

            let t_stage = Instant::now();
            normalize_stage(&settings, &extracted, &normalized, None, archive.as_deref())?;
            println!("Normalization took {}", format_duration(t_stage.elapsed()));

            let opts = LoadOptions {
                archive,
                ..LoadOptions::default()
            };
            load_stage(&settings, &normalized, &loaded, &opts)?;
            Ok(())
        }
        Commands::Imported => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let rows = db::list_imported(&conn)?;
            if rows.is_empty() {
                println!("No archives imported yet.");
                return Ok(());
            }
            println!("{:<48} | {:<19} | {:>10}", "Archive", "Imported at", "Rows");
            println!("{}", "-".repeat(83));
            for r in &rows {
                println!(
                    "{:<48} | {:<19} | {:>10}",
                    truncate(&r.archive_name, 48),
                    r.imported_at,
                    r.row_count
                );
            }
            println!("\n{} archive(s)", rows.len());
            Ok(())
        }
        Commands::ClearImported { archive } => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let n = db::clear_imported(&conn, archive.as_deref())?;
            println!("Cleared {} import record(s).", n);
            Ok(())
        }
        Commands::Stats => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            for (table, n) in &s.tables {
                println!("{:<15} {}", format!("{}:", table), n);
            }
            for (unit, n) in &s.holdings_by_unit {
                println!("  value in {:<9} {}", format!("{}:", unit.as_str()), n);
            }
            println!("{:<15} {}", "imported:", s.imported);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn discover_stage(
    settings: &Settings,
    url: Option<String>,
    interact: bool,
    output: &Path,
) -> Result<DiscoveryManifest> {
    let sources = match url {
        Some(url) => vec![Source {
            name: "cli".to_string(),
            url,
            archive_extension: None,
            interactions: settings.discovery.interactions.clone(),
        }],
        None => settings.sources(),
    };
    let m = discover::run(settings, &sources, interact).await?;
    manifest::write(output, &m)?;

    for s in &m.sources {
        let ok = s.interactions.iter().filter(|i| i.succeeded).count();
        match s.status {
            SourceStatus::Success => println!(
                "{}: {} archive(s), {}/{} interaction(s) succeeded",
                s.name,
                s.archive_count,
                ok,
                s.interactions.len()
            ),
            SourceStatus::Failed => println!(
                "{}: FAILED ({})",
                s.name,
                s.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
    println!("Discovered {} archive(s) -> {:?}", m.archive_count, output);
    Ok(m)
}

async fn retrieve_stage(
    settings: &Settings,
    input: &Path,
    output: &Path,
    archive: Option<&str>,
    redownload: bool,
) -> Result<ExtractionManifest> {
    let discovered: DiscoveryManifest = manifest::read(input)?;
    let m = retrieve::run(settings, &discovered, input.to_path_buf(), archive, redownload).await?;
    manifest::write(output, &m)?;

    let failed = m
        .archives
        .iter()
        .filter(|a| a.status == RetrievalStatus::Failed)
        .count();
    println!(
        "Retrieved {} archive(s) ({} downloaded, {} failed): {} file(s), {} unclassified -> {:?}",
        m.archives_processed,
        m.archives_downloaded,
        failed,
        m.files.len(),
        m.unclassified.len(),
        output
    );
    Ok(m)
}

fn normalize_stage(
    settings: &Settings,
    input: &Path,
    output: &Path,
    table: Option<Table>,
    archive: Option<&str>,
) -> Result<NormalizationManifest> {
    let extraction: ExtractionManifest = manifest::read(input)?;
    let m = normalize::run(settings, &extraction, input.to_path_buf(), table, archive)?;
    manifest::write(output, &m)?;

    println!(
        "Normalized {} file(s): {} rows written, {} skipped, {} coercion failure(s), {} file error(s) -> {:?}",
        m.files_processed,
        m.total_rows_written,
        m.total_rows_skipped,
        m.total_coercion_failures,
        m.failures.len(),
        output
    );
    Ok(m)
}

fn load_stage(
    settings: &Settings,
    input: &Path,
    output: &Path,
    opts: &LoadOptions,
) -> Result<LoadManifest> {
    let normalized: NormalizationManifest = manifest::read(input)?;
    let conn = db::connect(&settings.db_path)?;
    db::init_schema(&conn)?;

    let m = load::run(&conn, &normalized, input.to_path_buf(), opts)?;
    manifest::write(output, &m)?;

    for r in m.results.iter().filter(|r| r.error.is_some()) {
        println!("  {}: {}", r.archive, r.error.as_deref().unwrap_or_default());
    }
    println!(
        "Loaded {} archive(s) ({} rows), {} skipped, {} failed -> {:?}",
        m.archives_loaded, m.total_rows_loaded, m.archives_skipped, m.archives_failed, output
    );
    Ok(m)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
