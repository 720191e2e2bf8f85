//! Fetching scheduled chunks and writing them into place.

use crate::config::{CdnTable, PatcherConfig, Selection};
use crate::error::{Result, RmanError};
use crate::fetch::{with_retries, CancelToken, RangeFetcher, RetryPolicy};
use crate::hash::{self, HashAlgorithm};
use crate::manifest::{Bundle, Manifest};
use crate::paths::PathPolicy;
use crate::plan::{self, BundleGroup, FilePlan, FsState, LocalState, Plan, ScanContext};
use crate::progress::{NoProgress, ProgressEvent, ProgressSink};
use chrono::{DateTime, Utc};
use fs2::FileExt as _;
use rayon::prelude::*;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Clone, Debug, Default)]
pub struct PatchOptions {
    pub output: PathBuf,
    pub selection: Selection,
    /// Where the manifest came from; picks the CDN when no base URL is configured.
    pub manifest_url: Option<String>,
    pub path_policy: PathPolicy,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    UpToDate,
    Patched { chunks: usize, bytes: u64 },
    /// Chunk ids that failed to decompress or verify.
    IntegrityFailed { chunks: Vec<u64> },
    /// Bundle ids with at least one range request that gave up, plus any
    /// chunks of the fetched runs that failed to decompress or verify.
    FetchFailed { groups: Vec<u64>, chunks: Vec<u64> },
    Failed { error: String },
    Cancelled,
}

impl FileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FileOutcome::UpToDate | FileOutcome::Patched { .. })
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct FileReport {
    pub path: String,
    pub outcome: FileOutcome,
}

#[derive(Serialize, Clone, Debug)]
pub struct PatchReport {
    pub manifest_id: u64,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub files: Vec<FileReport>,
    pub chunks_written: usize,
    pub bytes_written: u64,
}

impl PatchReport {
    pub fn is_success(&self) -> bool {
        self.files.iter().all(|f| f.outcome.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &FileReport> {
        self.files.iter().filter(|f| !f.outcome.is_success())
    }
}

/// One inclusive byte range covering consecutive chunks `first..first + len`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Run {
    pub start: u64,
    pub end_inclusive: u64,
    pub first: usize,
    pub len: usize,
}

/// Merge `(bundle_offset, compressed_size)` spans, already sorted by offset,
/// into runs wherever one span ends exactly where the next begins.
pub fn coalesce(spans: &[(u64, u32)]) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    let mut end = 0u64;
    for (i, &(off, size)) in spans.iter().enumerate() {
        match runs.last_mut() {
            Some(run) if end == off => {
                run.len += 1;
                end = off + size as u64;
                run.end_inclusive = end.saturating_sub(1).max(run.start);
            }
            _ => {
                end = off + size as u64;
                runs.push(Run {
                    start: off,
                    end_inclusive: end.saturating_sub(1).max(off),
                    first: i,
                    len: 1,
                });
            }
        }
    }
    runs
}

#[derive(Default)]
struct GroupResult {
    chunks: usize,
    bytes: u64,
    bad_chunks: Vec<u64>,
    failed_bundles: Vec<u64>,
    io_error: Option<String>,
    cancelled: bool,
}

/// Shared destination of one file plus the number of its groups not yet done.
#[derive(Default)]
struct Handle {
    file: Option<Arc<File>>,
    remaining: usize,
    error: Option<String>,
}

impl Handle {
    fn acquire(slot: &Mutex<Handle>, fp: &FilePlan) -> std::result::Result<Arc<File>, String> {
        let mut h = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(error) = &h.error {
            return Err(error.clone());
        }
        if let Some(file) = &h.file {
            return Ok(Arc::clone(file));
        }
        match prepare(fp) {
            Ok(f) => {
                let f = Arc::new(f);
                h.file = Some(Arc::clone(&f));
                Ok(f)
            }
            Err(e) => {
                tracing::warn!(path = %fp.path, error = %e, "cannot prepare destination");
                let error = e.to_string();
                h.error = Some(error.clone());
                Err(error)
            }
        }
    }

    /// Dropping the last reference closes the file and releases its lock.
    fn release(slot: &Mutex<Handle>) {
        let mut h = slot.lock().unwrap_or_else(PoisonError::into_inner);
        h.remaining = h.remaining.saturating_sub(1);
        if h.remaining == 0 {
            h.file = None;
        }
    }
}

/// Brings a directory in line with a manifest.
pub struct Patcher {
    config: PatcherConfig,
    fetcher: Arc<dyn RangeFetcher>,
    state: Arc<dyn LocalState>,
    sink: Arc<dyn ProgressSink>,
    cancel: CancelToken,
}

impl Patcher {
    pub fn new(config: PatcherConfig, fetcher: Arc<dyn RangeFetcher>) -> Self {
        Self {
            config,
            fetcher,
            state: Arc::new(FsState),
            sink: Arc::new(NoProgress),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_state(mut self, state: Arc<dyn LocalState>) -> Self {
        self.state = state;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn pool(&self) -> Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.concurrency.max(1))
            .build()
            .map_err(|e| RmanError::Io(io::Error::new(io::ErrorKind::Other, e)))
    }

    fn bundle_base(&self, opts: &PatchOptions) -> String {
        match &self.config.bundle_base_url {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => CdnTable::default().base_for(opts.manifest_url.as_deref()).to_string(),
        }
    }

    /// Scan only; nothing is fetched or written.
    pub fn plan(&self, manifest: &Manifest, opts: &PatchOptions) -> Result<Plan> {
        let pool = self.pool()?;
        let ctx = ScanContext {
            manifest,
            output: &opts.output,
            policy: opts.path_policy,
            state: self.state.as_ref(),
            cancel: &self.cancel,
            sink: self.sink.as_ref(),
        };
        plan::plan(&ctx, &opts.selection, &pool)
    }

    pub fn run(&self, manifest: &Manifest, opts: &PatchOptions) -> Result<PatchReport> {
        let plan = self.plan(manifest, opts)?;
        self.execute(manifest, opts, plan)
    }

    /// Carry out a plan made by [`Patcher::plan`] with the same manifest and options.
    pub fn execute(&self, manifest: &Manifest, opts: &PatchOptions, plan: Plan) -> Result<PatchReport> {
        let started = Utc::now();
        let base = self.bundle_base(opts);
        tracing::info!(
            files = plan.files.len(),
            chunks = plan.chunk_count(),
            download_bytes = plan.download_bytes(),
            base = %base,
            "patching"
        );

        let mut files: Vec<FileReport> = Vec::new();
        let mut finish = |path: String, outcome: FileOutcome| {
            self.sink.event(&ProgressEvent::FileFinished { path: path.clone(), outcome: outcome.clone() });
            files.push(FileReport { path, outcome });
        };
        for path in plan.up_to_date {
            finish(path, FileOutcome::UpToDate);
        }
        for (path, e) in plan.failed {
            finish(path, FileOutcome::Failed { error: e.to_string() });
        }
        for path in plan.cancelled {
            finish(path, FileOutcome::Cancelled);
        }

        // A destination is opened by the first of its groups to start and closed
        // after the last one ends, so open files stay bounded by groups in flight.
        let handles: Vec<Mutex<Handle>> = plan
            .files
            .iter()
            .map(|fp| Mutex::new(Handle { remaining: fp.groups.len(), ..Handle::default() }))
            .collect();
        let tasks: Vec<(usize, &BundleGroup)> = plan
            .files
            .iter()
            .enumerate()
            .flat_map(|(i, fp)| fp.groups.iter().map(move |g| (i, g)))
            .collect();
        let pool = self.pool()?;
        let results: Vec<(usize, GroupResult)> = pool.install(|| {
            tasks
                .par_iter()
                .map(|&(i, group)| (i, self.patch_group(&plan.files[i], &handles[i], group, &base)))
                .collect()
        });

        let mut per_file: Vec<GroupResult> =
            plan.files.iter().map(|_| GroupResult::default()).collect();
        for (i, r) in results {
            let acc = &mut per_file[i];
            acc.chunks += r.chunks;
            acc.bytes += r.bytes;
            acc.bad_chunks.extend(r.bad_chunks);
            acc.failed_bundles.extend(r.failed_bundles);
            acc.cancelled |= r.cancelled;
            if acc.io_error.is_none() {
                acc.io_error = r.io_error;
            }
        }

        let mut chunks_written = 0;
        let mut bytes_written = 0;
        for (fp, r) in plan.files.iter().zip(per_file) {
            // No chunks to fetch, but the file still gets created or resized.
            let r = if fp.groups.is_empty() { self.touch(fp) } else { r };
            chunks_written += r.chunks;
            bytes_written += r.bytes;
            let outcome = if r.cancelled {
                FileOutcome::Cancelled
            } else if let Some(error) = r.io_error {
                FileOutcome::Failed { error }
            } else if !r.failed_bundles.is_empty() {
                FileOutcome::FetchFailed { groups: r.failed_bundles, chunks: r.bad_chunks }
            } else if !r.bad_chunks.is_empty() {
                FileOutcome::IntegrityFailed { chunks: r.bad_chunks }
            } else {
                FileOutcome::Patched { chunks: r.chunks, bytes: r.bytes }
            };
            finish(fp.path.clone(), outcome);
        }
        drop(finish);
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let report = PatchReport {
            manifest_id: manifest.id(),
            started,
            finished: Utc::now(),
            files,
            chunks_written,
            bytes_written,
        };
        tracing::info!(
            chunks = report.chunks_written,
            bytes = report.bytes_written,
            failed = report.failures().count(),
            "done"
        );
        Ok(report)
    }

    fn touch(&self, fp: &FilePlan) -> GroupResult {
        match self.cancel.check().and_then(|_| prepare(fp)) {
            Ok(_) => GroupResult::default(),
            Err(RmanError::Cancelled) => GroupResult { cancelled: true, ..GroupResult::default() },
            Err(e) => {
                tracing::warn!(path = %fp.path, error = %e, "cannot prepare destination");
                GroupResult { io_error: Some(e.to_string()), ..GroupResult::default() }
            }
        }
    }

    fn patch_group(&self, fp: &FilePlan, slot: &Mutex<Handle>, group: &BundleGroup, base: &str) -> GroupResult {
        let out = if self.cancel.is_cancelled() {
            GroupResult { cancelled: true, ..GroupResult::default() }
        } else {
            match Handle::acquire(slot, fp) {
                Ok(file) => self.fetch_group(fp, &file, group, base),
                Err(error) => GroupResult { io_error: Some(error), ..GroupResult::default() },
            }
        };
        Handle::release(slot);
        out
    }

    fn fetch_group(&self, fp: &FilePlan, file: &File, group: &BundleGroup, base: &str) -> GroupResult {
        let mut out = GroupResult::default();
        if self.cancel.is_cancelled() {
            out.cancelled = true;
            return out;
        }
        let url = format!("{base}/{}", Bundle::file_name(group.bundle_id));
        let mut chunks = group.chunks.clone();
        chunks.sort_by_key(|c| c.chunk.bundle_offset);
        let spans: Vec<(u64, u32)> =
            chunks.iter().map(|c| (c.chunk.bundle_offset, c.chunk.compressed_size)).collect();
        let policy = RetryPolicy { retries: self.config.retries, backoff: self.config.retry_backoff };

        for run in coalesce(&spans) {
            let members = &chunks[run.first..run.first + run.len];
            let want = members.iter().map(|c| c.chunk.compressed_size as u64).sum::<u64>();
            let fetched = if want == 0 {
                Ok(Vec::new())
            } else {
                with_retries(policy, &self.cancel, &url, || {
                    self.fetcher.fetch_range(&url, run.start, run.end_inclusive, &self.cancel)
                })
                .and_then(|data| {
                    if (data.len() as u64) < want {
                        Err(RmanError::Network {
                            url: url.clone(),
                            message: format!("short response: {} of {want} bytes", data.len()),
                            retryable: false,
                        })
                    } else {
                        Ok(data)
                    }
                })
            };
            let data = match fetched {
                Ok(d) => d,
                Err(RmanError::Cancelled) => {
                    out.cancelled = true;
                    return out;
                }
                Err(e) => {
                    tracing::warn!(url = %url, start = run.start, error = %e, "range request failed");
                    self.sink.event(&ProgressEvent::GroupFailed {
                        path: fp.path.clone(),
                        bundle_id: group.bundle_id,
                        chunks: members.len(),
                        error: e.to_string(),
                    });
                    if !out.failed_bundles.contains(&group.bundle_id) {
                        out.failed_bundles.push(group.bundle_id);
                    }
                    continue;
                }
            };

            for sc in members {
                let c = &sc.chunk;
                let at = (c.bundle_offset - run.start) as usize;
                let slice = &data[at..at + c.compressed_size as usize];
                match unpack(slice, c.uncompressed_size, c.id, c.bundle_id, fp.algorithm) {
                    Ok(bytes) => {
                        if let Err(e) = write_at(file, &bytes, sc.file_offset) {
                            out.io_error = Some(e.to_string());
                            return out;
                        }
                        out.chunks += 1;
                        out.bytes += bytes.len() as u64;
                        self.sink.event(&ProgressEvent::ChunkWritten {
                            path: fp.path.clone(),
                            chunk_id: c.id,
                            bytes: bytes.len() as u64,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(path = %fp.path, error = %e, "chunk rejected");
                        self.sink.event(&ProgressEvent::ChunkFailed {
                            path: fp.path.clone(),
                            chunk_id: c.id,
                            bundle_id: c.bundle_id,
                            error: e.to_string(),
                        });
                        out.bad_chunks.push(c.id);
                    }
                }
            }
        }
        out
    }
}

/// Create the file and parent directories, size it, and lock it for this run.
fn prepare(fp: &FilePlan) -> Result<File> {
    if let Some(parent) = fp.dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let f = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&fp.dest)?;
    f.try_lock_exclusive()?;
    if f.metadata()?.len() != fp.size {
        f.set_len(fp.size)?;
    }
    Ok(f)
}

/// Decompress one chunk and check it hashes to its id.
fn unpack(
    compressed: &[u8],
    uncompressed_size: u32,
    chunk_id: u64,
    bundle_id: u64,
    algorithm: HashAlgorithm,
) -> Result<Vec<u8>> {
    let corrupt = || RmanError::ChunkIntegrity { chunk_id, bundle_id };
    let bytes =
        zstd::bulk::decompress(compressed, uncompressed_size as usize).map_err(|_| corrupt())?;
    if bytes.len() != uncompressed_size as usize || !hash::verify(&bytes, chunk_id, algorithm)? {
        return Err(corrupt());
    }
    Ok(bytes)
}

#[cfg(unix)]
fn write_at(f: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    f.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_at(f: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match f.seek_write(buf, offset)? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}
