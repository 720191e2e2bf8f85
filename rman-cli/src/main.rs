use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use rman_core::encode::{pack_dir, PackConfig};
use rman_core::fetch::{CancelToken, HttpFetcher, LocalFetcher, RangeFetcher};
use rman_core::progress::Progress;
use rman_core::{decode, HashAlgorithm, Manifest, PatchOptions, Patcher, PatcherConfig, Selection};

const DEFAULT_CHUNK: usize = 1 << 20;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Algorithm { Sha256, HmacChain, Blake3 }

impl From<Algorithm> for HashAlgorithm {
    fn from(a: Algorithm) -> Self {
        match a {
            Algorithm::Sha256 => HashAlgorithm::Sha256,
            Algorithm::HmacChain => HashAlgorithm::HmacChain,
            Algorithm::Blake3 => HashAlgorithm::Blake3,
        }
    }
}

#[derive(Parser)]
#[command(name = "rman", version, about = "RMAN manifest patcher")]
struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Download or repair the files of a manifest
    Download {
        manifest: String,
        #[arg(short, long, default_value = "output")]
        output: PathBuf,
        #[arg(short, long, default_value_t = 4)]
        threads: usize,
        /// Regex searched in full paths, case-insensitive; repeatable
        #[arg(long)] filter: Vec<String>,
        #[arg(long)] lang: Vec<String>,
        #[arg(long, default_value_t = false)] no_neutral: bool,
        /// Bundle base URL or a local mirror directory
        #[arg(long)] cdn: Option<String>,
        #[arg(long, default_value_t = 3)] retries: u32,
        #[arg(long, default_value_t = 30)] timeout: u64,
        #[arg(long, default_value_t = false)] dry_run: bool,
        #[arg(long, default_value_t = false)] progress: bool,
    },
    /// Print manifest summary
    Info {
        manifest: String,
        #[arg(long, default_value_t = false)] json: bool,
    },
    /// Check a directory against a manifest without downloading
    Verify { manifest: String, root: PathBuf },
    /// Chunk a directory into bundles plus manifest.rman
    Pack {
        input: PathBuf,
        #[arg(short, long, default_value = "mirror")]
        output: PathBuf,
        #[arg(long, default_value_t = DEFAULT_CHUNK)]
        chunk_size: usize,
        #[arg(long, default_value_t = 16 << 20)]
        max_bundle: usize,
        #[arg(long, value_enum, default_value_t = Algorithm::Blake3)]
        algorithm: Algorithm,
        #[arg(long, default_value_t = 1)]
        id: u64,
        #[arg(long)] include: Vec<String>,
        #[arg(long)] exclude: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel()).context("install Ctrl-C handler")?;
    }

    match cli.cmd {
        Cmd::Download { manifest, output, threads, filter, lang, no_neutral, cdn, retries, timeout, dry_run, progress } => {
            let selection = Selection { patterns: filter, languages: lang, include_neutral: !no_neutral };
            let cfg = PatcherConfig {
                concurrency: threads,
                retries,
                timeout: Duration::from_secs(timeout),
                bundle_base_url: cdn,
                ..PatcherConfig::default()
            };
            download(&manifest, &output, cfg, selection, dry_run, progress, cancel)?;
        }
        Cmd::Info { manifest, json } => info(&manifest, json, &cancel)?,
        Cmd::Verify { manifest, root } => verify(&manifest, &root, cancel)?,
        Cmd::Pack { input, output, chunk_size, max_bundle, algorithm, id, include, exclude } => {
            let cfg = PackConfig {
                chunk_size,
                max_bundle_bytes: max_bundle,
                algorithm: algorithm.into(),
                manifest_id: id,
                include,
                exclude,
            };
            let s = pack_dir(&input, &output, &cfg).with_context(|| format!("pack {}", input.display()))?;
            tracing::info!(
                files = s.files,
                chunks = s.chunks,
                bundles = s.bundles,
                manifest = %s.manifest_path.display(),
                "packed"
            );
        }
    }
    Ok(())
}

fn is_remote(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

fn fetcher_for(location: Option<&str>, timeout: Duration) -> Result<Arc<dyn RangeFetcher>> {
    match location {
        Some(l) if !is_remote(l) => Ok(Arc::new(LocalFetcher)),
        _ => Ok(Arc::new(HttpFetcher::new(timeout)?)),
    }
}

fn load_manifest(src: &str, timeout: Duration, cancel: &CancelToken) -> Result<Manifest> {
    let bytes = if is_remote(src) {
        HttpFetcher::new(timeout)?.fetch_all(src, cancel).with_context(|| format!("fetch {src}"))?
    } else {
        std::fs::read(src).with_context(|| format!("read {src}"))?
    };
    decode(&bytes).with_context(|| format!("decode {src}"))
}

fn download(
    src: &str,
    output: &Path,
    cfg: PatcherConfig,
    selection: Selection,
    dry_run: bool,
    show_progress: bool,
    cancel: CancelToken,
) -> Result<()> {
    let manifest = load_manifest(src, cfg.timeout, &cancel)?;
    let fetcher = fetcher_for(cfg.bundle_base_url.as_deref(), cfg.timeout)?;
    let progress = Progress::new(show_progress);
    let patcher = Patcher::new(cfg, fetcher)
        .with_sink(Arc::new(progress.clone()))
        .with_cancel(cancel);
    let opts = PatchOptions {
        output: output.to_path_buf(),
        selection,
        manifest_url: Some(src.to_string()),
        ..PatchOptions::default()
    };

    progress.set_stage("scan");
    let plan = patcher.plan(&manifest, &opts)?;
    if dry_run {
        for fp in &plan.files {
            println!("{}  {} chunk(s), {} byte(s)", fp.path, fp.chunk_count(), fp.download_bytes());
        }
        tracing::info!(
            files = plan.files.len(),
            chunks = plan.chunk_count(),
            download_bytes = plan.download_bytes(),
            up_to_date = plan.up_to_date.len(),
            "dry run"
        );
        return Ok(());
    }

    // Totals cover the selection and only the bytes the plan will write.
    progress.set_stage("patch");
    progress.set_totals(plan.selected(), plan.write_bytes());
    progress.start();
    let report = patcher.execute(&manifest, &opts, plan);
    progress.stop();
    let report = report?;

    for f in report.failures() {
        let outcome = serde_json::to_string(&f.outcome)?;
        tracing::warn!(path = %f.path, %outcome, "file not patched");
    }
    tracing::info!(
        chunks = report.chunks_written,
        bytes = report.bytes_written,
        files = report.files.len(),
        "download finished"
    );
    if !report.is_success() {
        return Err(anyhow!("{} file(s) not patched; re-run to resume", report.failures().count()));
    }
    Ok(())
}

fn info(src: &str, json: bool, cancel: &CancelToken) -> Result<()> {
    let m = load_manifest(src, Duration::from_secs(30), cancel)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&m)?);
        return Ok(());
    }
    let (major, minor) = m.version();
    println!("Manifest {:016X} (v{}.{})", m.id(), major, minor);
    println!("  bundles: {}", m.bundles().len());
    println!("  chunks: {}", m.bundles().iter().map(|b| b.chunks.len()).sum::<usize>());
    println!("  files: {} ({} bytes)", m.files().len(), m.total_size());
    println!("  directories: {}", m.directories().len());
    let langs: Vec<&str> = m.languages().iter().map(|l| l.name.as_str()).collect();
    println!("  languages: {}", langs.join(", "));
    Ok(())
}

fn verify(src: &str, root: &Path, cancel: CancelToken) -> Result<()> {
    let manifest = load_manifest(src, Duration::from_secs(30), &cancel)?;
    let patcher = Patcher::new(PatcherConfig::default(), Arc::new(LocalFetcher)).with_cancel(cancel);
    let opts = PatchOptions { output: root.to_path_buf(), ..PatchOptions::default() };
    let plan = patcher.plan(&manifest, &opts)?;
    for (path, e) in &plan.failed {
        tracing::warn!(path = %path, error = %e, "cannot verify");
    }
    tracing::info!(
        ok = plan.up_to_date.len(),
        need_work = plan.files.len(),
        failed = plan.failed.len(),
        bad_chunks = plan.chunk_count(),
        "verified"
    );
    if plan.is_clean() { println!("OK"); } else { println!("BAD"); }
    Ok(())
}
