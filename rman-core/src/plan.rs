//! Reconciliation of a manifest against what is already on disk.

use crate::config::Selection;
use crate::error::{Result, RmanError};
use crate::fetch::CancelToken;
use crate::hash::{self, HashAlgorithm};
use crate::manifest::{Chunk, FileEntry, Manifest};
use crate::paths::{validate_path, PathPolicy};
use crate::progress::{ProgressEvent, ProgressSink};
use memmap2::Mmap;
use rayon::prelude::*;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Read access to existing destination files.
pub trait LocalState: Send + Sync {
    /// Size of the file at `path`, `None` when it does not exist.
    fn size(&self, path: &Path) -> io::Result<Option<u64>>;
    fn view(&self, path: &Path) -> io::Result<FileView>;
}

pub enum FileView {
    Mapped(Mmap),
    Owned(Vec<u8>),
    Empty,
}

impl FileView {
    /// `len` bytes at `offset`, or `None` if the file ends first.
    pub fn range(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let data: &[u8] = match self {
            FileView::Mapped(m) => &m[..],
            FileView::Owned(v) => v.as_slice(),
            FileView::Empty => &[],
        };
        let start = usize::try_from(offset).ok()?;
        data.get(start..start.checked_add(len)?)
    }
}

/// Local filesystem, read through memory maps.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsState;

impl LocalState for FsState {
    fn size(&self, path: &Path) -> io::Result<Option<u64>> {
        match std::fs::metadata(path) {
            Ok(m) => Ok(Some(m.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn view(&self, path: &Path) -> io::Result<FileView> {
        let f = File::open(path)?;
        if f.metadata()?.len() == 0 {
            return Ok(FileView::Empty);
        }
        let mmap = unsafe { Mmap::map(&f)? };
        Ok(FileView::Mapped(mmap))
    }
}

#[derive(Clone, Debug)]
pub struct ScheduledChunk {
    pub chunk: Chunk,
    pub file_offset: u64,
}

/// Scheduled chunks of one file that live in the same bundle.
#[derive(Clone, Debug)]
pub struct BundleGroup {
    pub bundle_id: u64,
    pub chunks: Vec<ScheduledChunk>,
}

#[derive(Clone, Debug)]
pub struct FilePlan {
    pub path: String,
    pub dest: PathBuf,
    pub size: u64,
    pub algorithm: HashAlgorithm,
    /// Ordered by first appearance in the file.
    pub groups: Vec<BundleGroup>,
}

impl FilePlan {
    pub fn chunk_count(&self) -> usize {
        self.groups.iter().map(|g| g.chunks.len()).sum()
    }

    pub fn download_bytes(&self) -> u64 {
        self.chunks().map(|c| c.chunk.compressed_size as u64).sum()
    }

    pub fn write_bytes(&self) -> u64 {
        self.chunks().map(|c| c.chunk.uncompressed_size as u64).sum()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &ScheduledChunk> {
        self.groups.iter().flat_map(|g| g.chunks.iter())
    }
}

/// Outcome of scanning the selected files.
#[derive(Debug, Default)]
pub struct Plan {
    /// Files needing work, in name order.
    pub files: Vec<FilePlan>,
    pub up_to_date: Vec<String>,
    pub failed: Vec<(String, RmanError)>,
    pub cancelled: Vec<String>,
}

impl Plan {
    /// Nothing to fetch and nothing failed.
    pub fn is_clean(&self) -> bool {
        self.files.is_empty() && self.failed.is_empty() && self.cancelled.is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.files.iter().map(FilePlan::chunk_count).sum()
    }

    pub fn download_bytes(&self) -> u64 {
        self.files.iter().map(FilePlan::download_bytes).sum()
    }

    /// Decompressed bytes a run of this plan writes.
    pub fn write_bytes(&self) -> u64 {
        self.files.iter().map(FilePlan::write_bytes).sum()
    }

    /// Every selected file, each of which gets exactly one outcome.
    pub fn selected(&self) -> usize {
        self.files.len() + self.up_to_date.len() + self.failed.len() + self.cancelled.len()
    }
}

pub(crate) struct ScanContext<'a> {
    pub manifest: &'a Manifest,
    pub output: &'a Path,
    pub policy: PathPolicy,
    pub state: &'a dyn LocalState,
    pub cancel: &'a CancelToken,
    pub sink: &'a dyn ProgressSink,
}

enum Scan {
    UpToDate,
    Work(FilePlan),
}

/// Scan every selected file on `pool`, one task per file.
pub(crate) fn plan(
    ctx: &ScanContext<'_>,
    selection: &Selection,
    pool: &rayon::ThreadPool,
) -> Result<Plan> {
    let filter = selection.compile(ctx.manifest)?;
    let candidates: Vec<&FileEntry> =
        ctx.manifest.files().iter().filter(|f| filter.matches(f)).collect();
    tracing::info!(selected = candidates.len(), total = ctx.manifest.files().len(), "scanning");

    let scans: Vec<(String, Result<Scan>)> = pool.install(|| {
        candidates
            .par_iter()
            .map(|file| {
                let res = ctx.cancel.check().and_then(|_| scan_file(ctx, file));
                (file.name.clone(), res)
            })
            .collect()
    });

    let mut plan = Plan::default();
    for (path, res) in scans {
        match res {
            Ok(Scan::UpToDate) => plan.up_to_date.push(path),
            Ok(Scan::Work(fp)) => plan.files.push(fp),
            Err(RmanError::Cancelled) => plan.cancelled.push(path),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "scan failed");
                plan.failed.push((path, e));
            }
        }
    }
    plan.files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(plan)
}

fn scan_file(ctx: &ScanContext<'_>, file: &FileEntry) -> Result<Scan> {
    if !file.hash_algorithm.is_supported() {
        return Err(RmanError::UnsupportedAlgorithm(file.hash_algorithm.tag()));
    }
    let dest = validate_path(ctx.output, &file.name, ctx.policy)?;
    let placed: Vec<(&Chunk, u64)> = ctx.manifest.file_chunks(file).collect();

    let size_ok = ctx.state.size(&dest)? == Some(file.size);
    let scheduled: Vec<ScheduledChunk> = if !size_ok {
        placed.iter().map(|&(c, off)| ScheduledChunk { chunk: c.clone(), file_offset: off }).collect()
    } else {
        let view = match ctx.state.view(&dest) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(path = %file.name, error = %e, "unreadable, refetching all chunks");
                FileView::Empty
            }
        };
        let mut out = Vec::new();
        for &(c, off) in &placed {
            let ok = match view.range(off, c.uncompressed_size as usize) {
                Some(bytes) => hash::verify(bytes, c.id, file.hash_algorithm)?,
                None => false,
            };
            if !ok {
                out.push(ScheduledChunk { chunk: c.clone(), file_offset: off });
            }
        }
        out
    };

    ctx.sink.event(&ProgressEvent::FileScanned {
        path: file.name.clone(),
        scheduled: scheduled.len(),
    });
    if size_ok && scheduled.is_empty() {
        return Ok(Scan::UpToDate);
    }
    Ok(Scan::Work(FilePlan {
        path: file.name.clone(),
        dest,
        size: file.size,
        algorithm: file.hash_algorithm,
        groups: group_by_bundle(scheduled),
    }))
}

fn group_by_bundle(chunks: Vec<ScheduledChunk>) -> Vec<BundleGroup> {
    let mut groups: Vec<BundleGroup> = Vec::new();
    for sc in chunks {
        match groups.iter_mut().find(|g| g.bundle_id == sc.chunk.bundle_id) {
            Some(g) => g.chunks.push(sc),
            None => groups.push(BundleGroup { bundle_id: sc.chunk.bundle_id, chunks: vec![sc] }),
        }
    }
    groups
}
