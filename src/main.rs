use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use walkdir::WalkDir;

use dedupe_engine::services::{open_cache, EmbeddingCache, HttpEmbeddingGateway, SledEmbeddingCache};
use dedupe_engine::{
    CancellationToken, DedupOptions, DedupReport, EngineConfig, FileDescriptor, GroupingEngine,
};

#[derive(Parser, Debug)]
#[command(name = "dedupe", version, about = "Find duplicate and near-duplicate files")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Find and list duplicate groups
    Scan {
        /// Directory to scan
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Engine config file (JSON)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Base URL of the embedding service; without it only hash tiers run
        #[arg(long, value_name = "URL")]
        gateway_url: Option<String>,
        #[arg(long, value_name = "F")]
        image_threshold: Option<f64>,
        #[arg(long, value_name = "F")]
        text_threshold: Option<f64>,
        /// Max items per embedding call
        #[arg(long, value_name = "N")]
        batch_size: Option<usize>,
        /// Deadline for each embedding call and index operation
        #[arg(long, value_name = "SECS")]
        deadline_secs: Option<u64>,
        /// Persistent embedding cache directory
        #[arg(long, value_name = "DIR")]
        cache_dir: Option<PathBuf>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage the embedding cache
    Cache {
        #[command(subcommand)]
        command: CacheCmd,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCmd {
    /// Remove every cached embedding
    Clear {
        #[arg(long, value_name = "DIR")]
        cache_dir: Option<PathBuf>,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Scan {
            path,
            config,
            gateway_url,
            image_threshold,
            text_threshold,
            batch_size,
            deadline_secs,
            cache_dir,
            json,
        } => {
            let mut engine_config = match &config {
                Some(file) => EngineConfig::load(file)
                    .with_context(|| format!("Failed to load config {}", file.display()))?,
                None => EngineConfig::default(),
            };
            engine_config.cache_path = cache_dir
                .or(engine_config.cache_path.take())
                .or_else(default_cache_dir);

            let mut options = DedupOptions::default();
            if let Some(t) = image_threshold {
                options.image_threshold = t;
            }
            if let Some(t) = text_threshold {
                options.text_threshold = t;
            }
            if let Some(n) = batch_size {
                options.max_embed_batch_size = n;
            }
            if let Some(secs) = deadline_secs {
                options.deadline = Duration::from_secs(secs);
            }
            options.validate().context("Invalid scan options")?;

            let report = scan(&path, engine_config, gateway_url.as_deref(), &options).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }

        Commands::Cache { command } => match command {
            CacheCmd::Clear { cache_dir, yes } => {
                let dir = cache_dir
                    .or_else(default_cache_dir)
                    .context("No cache directory available on this platform")?;
                if !dir.exists() {
                    println!("No cache at {}", dir.display());
                    return Ok(());
                }

                let cache = SledEmbeddingCache::open(&dir)
                    .with_context(|| format!("Failed to open cache {}", dir.display()))?;
                let entries = cache.len();

                let confirmed = yes
                    || Confirm::new()
                        .with_prompt(format!(
                            "Remove {} cached embeddings from {}?",
                            entries,
                            dir.display()
                        ))
                        .default(false)
                        .interact()?;
                if !confirmed {
                    println!("Aborted.");
                    return Ok(());
                }

                cache.clear();
                cache.flush().context("Failed to flush cache")?;
                println!("🧹 Removed {} cached embeddings", entries);
            }
        },
    }

    Ok(())
}

async fn scan(
    dir: &Path,
    config: EngineConfig,
    gateway_url: Option<&str>,
    options: &DedupOptions,
) -> Result<DedupReport> {
    println!("▶ Scanning for duplicates in: {}", dir.display());
    let files = collect_files(dir)?;

    let cache = open_cache(&config).context("Failed to open embedding cache")?;
    let mut engine = GroupingEngine::new(config)?.with_cache(cache);

    match gateway_url {
        Some(url) => {
            let gateway = HttpEmbeddingGateway::new(url, options.deadline)
                .context("Failed to build embedding client")?;
            if !gateway.health_check().await {
                log::warn!("Embedding service at {} is not healthy", url);
            }
            engine = engine.with_gateway(Arc::new(gateway));
        }
        None => println!("⚠️  No embedding service configured; only hash tiers will run."),
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    println!("▶ Deduplicating {} files…", files.len());
    let start = Instant::now();
    let report = engine
        .deduplicate_with_cancel(files, options, &cancel)
        .await?;
    println!("⏱ deduplication took {:.2?}", start.elapsed());
    Ok(report)
}

/// Recursively walk `dir`, describing every regular file.
fn collect_files(dir: &Path) -> Result<Vec<FileDescriptor>> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.set_message("Scanning for files…");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match describe(dir, path) {
            Ok(descriptor) => files.push(descriptor),
            Err(e) => log::warn!("Skipping {}: {:#}", path.display(), e),
        }
        spinner.tick();
    }
    spinner.finish_with_message(format!("Found {} files", files.len()));
    Ok(files)
}

fn describe(root: &Path, path: &Path) -> Result<FileDescriptor> {
    let metadata = fs::metadata(path)?;

    let id = path
        .strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| id.clone());
    let mime = mime_from_extension(path);

    let mut descriptor = FileDescriptor::new(id, name, mime)
        .with_content(LazyFile::new(path.to_path_buf()), metadata.len());
    if let Ok(modified) = metadata.modified() {
        descriptor = descriptor.with_modified_at(DateTime::<Utc>::from(modified));
    }
    Ok(descriptor)
}

/// File handle opened on first read.
struct LazyFile {
    path: PathBuf,
    file: Option<File>,
}

impl LazyFile {
    fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }
}

impl Read for LazyFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.file.is_none() {
            self.file = Some(File::open(&self.path)?);
        }
        match self.file.as_mut() {
            Some(file) => file.read(buf),
            None => Ok(0),
        }
    }
}

fn mime_from_extension(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "webp" => "image/webp",
        "txt" | "log" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "xml" => "application/xml",
        "yaml" | "yml" => "application/x-yaml",
        "js" => "application/javascript",
        _ => "application/octet-stream",
    }
}

fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("dedupe-engine").join("embeddings"))
}

fn print_report(report: &DedupReport) {
    if report.groups.is_empty() {
        println!("No duplicates found.");
    } else {
        println!("Found {} duplicate group(s):", report.groups.len());
    }

    for (i, group) in report.groups.iter().enumerate() {
        println!("\n✨ Group {}:", i + 1);
        println!("   🏆 Keeping → {}", group.kept_file.id);
        for dup in &group.duplicates {
            println!(
                "   📦 {} ({}, score {:.4})",
                dup.file.id, dup.reason, dup.similarity_score
            );
        }
    }

    if !report.ungrouped.is_empty() {
        println!("\n⚠️  {} file(s) could not be fully compared:", report.ungrouped.len());
        for file in &report.ungrouped {
            println!("   {} [{}] {}", file.file_id, file.reason_unavailable, file.detail);
        }
    }

    let stats = &report.stats;
    println!(
        "\n✅ {} files, {} exact / {} near-duplicate groups, {} unique",
        stats.files_total,
        stats.exact_groups,
        stats.near_duplicate_groups,
        report.unique.len()
    );
    println!(
        "   {} bytes reclaimable · cache {} hit / {} miss · {} embedding call(s)",
        stats.bytes_reclaimable, stats.cache_hits, stats.cache_misses, stats.gateway_calls
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mime_from_extension() {
        assert_eq!(mime_from_extension(Path::new("a/B.JPG")), "image/jpeg");
        assert_eq!(mime_from_extension(Path::new("notes.md")), "text/markdown");
        assert_eq!(mime_from_extension(Path::new("scan.PDF")), "application/pdf");
        assert_eq!(
            mime_from_extension(Path::new("archive.tar.gz")),
            "application/octet-stream"
        );
        assert_eq!(mime_from_extension(Path::new("README")), "application/octet-stream");
    }

    #[test]
    fn test_collect_files_uses_relative_ids() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("nested")).unwrap();
        fs::write(temp_dir.path().join("a.txt"), "hello").unwrap();
        fs::write(temp_dir.path().join("nested/b.txt"), "hello").unwrap();

        let mut files = collect_files(temp_dir.path()).unwrap();
        files.sort_by(|a, b| a.id.cmp(&b.id));
        let ids: Vec<_> = files.iter().map(|f| f.id.replace('\\', "/")).collect();
        assert_eq!(ids, vec!["a.txt", "nested/b.txt"]);
        assert_eq!(files[0].size_bytes, 5);
        assert!(files[0].modified_at.is_some());
        assert!(files[0].has_content());
    }

    #[test]
    fn test_lazy_file_reports_missing_file_on_read() {
        let temp_dir = TempDir::new().unwrap();
        let mut reader = LazyFile::new(temp_dir.path().join("gone.txt"));
        let mut buf = [0u8; 4];
        assert!(reader.read(&mut buf).is_err());

        fs::write(temp_dir.path().join("here.txt"), "abc").unwrap();
        let mut reader = LazyFile::new(temp_dir.path().join("here.txt"));
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "abc");
    }

    #[tokio::test]
    async fn test_scan_groups_identical_files() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("photos");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("one.txt"), "same bytes").unwrap();
        fs::write(root.join("two.txt"), "same bytes").unwrap();
        fs::write(root.join("three.txt"), "different").unwrap();

        let config = EngineConfig {
            cache_path: Some(temp_dir.path().join("cache")),
            ..EngineConfig::default()
        };
        let report = scan(&root, config, None, &DedupOptions::default())
            .await
            .unwrap();

        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.groups[0].kept_file.id, "one.txt");
        assert_eq!(report.groups[0].duplicates[0].file.id, "two.txt");
    }
}
