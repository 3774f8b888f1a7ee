use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::config::{ensure_dir, RetrievalSettings, Settings};
use crate::http::Fetcher;
use crate::manifest::{
    archive_matches, ArchiveRetrieval, DiscoveryManifest, ExtractedFile, ExtractionManifest,
    RetrievalStatus, UnclassifiedFile,
};
use crate::tables;

pub struct Extraction {
    pub files: Vec<ExtractedFile>,
    pub unclassified: Vec<UnclassifiedFile>,
}

/// Allow-listed extension and no exclude pattern, both case-insensitive.
pub fn member_selected(name: &str, rules: &RetrievalSettings) -> bool {
    let lower = name.to_lowercase();
    let allowed = rules
        .extensions
        .iter()
        .any(|ext| lower.ends_with(&ext.to_lowercase()));
    let excluded = rules
        .exclude_patterns
        .iter()
        .any(|p| lower.contains(&p.to_lowercase()));
    allowed && !excluded
}

fn member_basename(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

fn archive_stem(archive: &str) -> &str {
    match archive.rfind('.') {
        Some(i) if i > 0 => &archive[..i],
        _ => archive,
    }
}

/// Extract selected members of `zip_path` flat into `out_dir` as
/// `<archive stem>__<member basename>`, classifying each one.
pub fn extract_archive(
    zip_path: &Path,
    archive: &str,
    out_dir: &Path,
    rules: &RetrievalSettings,
) -> Result<Extraction> {
    let file = File::open(zip_path).with_context(|| format!("Failed to open {:?}", zip_path))?;
    let mut zip = zip::ZipArchive::new(file)
        .with_context(|| format!("{:?} is not a readable zip archive", zip_path))?;
    ensure_dir(out_dir)?;

    let stem = archive_stem(archive);
    let mut files = Vec::new();
    let mut unclassified = Vec::new();
    let mut taken = HashSet::new();

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let member = entry.name().to_string();
        if !member_selected(&member, rules) {
            debug!("{}: skipping member {}", archive, member);
            continue;
        }

        let Some(table) = tables::classify(&member) else {
            warn!("{}: unclassified member {}, excluded", archive, member);
            unclassified.push(UnclassifiedFile {
                archive: archive.to_string(),
                member,
            });
            continue;
        };

        let mut local_path = out_dir.join(format!("{}__{}", stem, member_basename(&member)));
        if !taken.insert(local_path.clone()) {
            let flat = member.replace(['/', '\\'], "_");
            warn!(
                "{}: {} shares its file name with an earlier member, extracting as {}__{}",
                archive, member, stem, flat
            );
            local_path = out_dir.join(format!("{}__{}", stem, flat));
            taken.insert(local_path.clone());
        }
        let mut out = BufWriter::new(
            File::create(&local_path).with_context(|| format!("Failed to create {:?}", local_path))?,
        );
        std::io::copy(&mut entry, &mut out)
            .with_context(|| format!("Failed to extract {} from {}", member, archive))?;
        out.flush()?;
        debug!("{}: {} -> {} ({:?})", archive, member, table, local_path);

        files.push(ExtractedFile {
            archive: archive.to_string(),
            member,
            local_path,
            table,
        });
    }

    info!(
        "{}: extracted {} file(s), {} unclassified",
        archive,
        files.len(),
        unclassified.len()
    );
    Ok(Extraction { files, unclassified })
}

/// Download (unless already present) and extract every archive in the
/// discovery manifest. Per-archive failures are recorded, not raised.
pub async fn run(
    settings: &Settings,
    discovered: &DiscoveryManifest,
    input_manifest: PathBuf,
    archive_filter: Option<&str>,
    redownload: bool,
) -> Result<ExtractionManifest> {
    let archives_dir = settings.archives_dir();
    let extracted_dir = settings.extracted_dir();
    ensure_dir(&archives_dir)?;
    ensure_dir(&extracted_dir)?;

    let selected: Vec<_> = discovered
        .archives
        .iter()
        .filter(|a| archive_matches(&a.filename, archive_filter))
        .collect();
    if let Some(f) = archive_filter {
        info!("Filtered to {} archive(s) matching '{}'", selected.len(), f);
    }

    let fetcher = Fetcher::new(settings)?;
    let pb = ProgressBar::new(selected.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );

    let mut archives = Vec::with_capacity(selected.len());
    let mut files = Vec::new();
    let mut unclassified = Vec::new();

    for link in selected {
        pb.set_message(link.filename.clone());
        let zip_path = archives_dir.join(&link.filename);

        let (status, bytes) = if zip_path.exists() && !redownload {
            info!("{} already present, skipping download", link.filename);
            (RetrievalStatus::Present, None)
        } else {
            match fetcher.download(&link.url, &zip_path).await {
                Ok(n) => {
                    info!("Downloaded {} ({} bytes)", link.filename, n);
                    (RetrievalStatus::Downloaded, Some(n))
                }
                Err(e) => {
                    warn!("Failed to download {}: {}", link.url, e);
                    archives.push(ArchiveRetrieval {
                        archive: link.filename.clone(),
                        url: link.url.clone(),
                        status: RetrievalStatus::Failed,
                        bytes: None,
                        error: Some(e.to_string()),
                    });
                    pb.inc(1);
                    continue;
                }
            }
        };

        match extract_archive(&zip_path, &link.filename, &extracted_dir, &settings.retrieval) {
            Ok(extraction) => {
                files.extend(extraction.files);
                unclassified.extend(extraction.unclassified);
                archives.push(ArchiveRetrieval {
                    archive: link.filename.clone(),
                    url: link.url.clone(),
                    status,
                    bytes,
                    error: None,
                });
            }
            Err(e) => {
                warn!("{}: extraction failed: {:#}", link.filename, e);
                // A corrupt archive must not satisfy skip-if-present next time.
                if let Err(rm) = std::fs::remove_file(&zip_path) {
                    debug!("could not remove {:?}: {}", zip_path, rm);
                }
                archives.push(ArchiveRetrieval {
                    archive: link.filename.clone(),
                    url: link.url.clone(),
                    status: RetrievalStatus::Failed,
                    bytes,
                    error: Some(format!("{:#}", e)),
                });
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    let processed = archives
        .iter()
        .filter(|a| a.status != RetrievalStatus::Failed)
        .count();
    let downloaded = archives
        .iter()
        .filter(|a| a.status == RetrievalStatus::Downloaded)
        .count();

    Ok(ExtractionManifest {
        input_manifest,
        processed_at: Utc::now(),
        archives_processed: processed,
        archives_downloaded: downloaded,
        archives,
        files,
        unclassified,
    })
}
