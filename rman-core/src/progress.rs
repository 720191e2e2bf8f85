use crate::transfer::FileOutcome;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Scan finished for a file; `scheduled` chunks need fetching.
    FileScanned { path: String, scheduled: usize },
    ChunkWritten { path: String, chunk_id: u64, bytes: u64 },
    ChunkFailed { path: String, chunk_id: u64, bundle_id: u64, error: String },
    /// A range request of a bundle group gave up after its retries.
    GroupFailed { path: String, bundle_id: u64, chunks: usize, error: String },
    FileFinished { path: String, outcome: FileOutcome },
}

/// Receives events from scan and fetch workers, possibly from many threads at once.
pub trait ProgressSink: Send + Sync {
    fn event(&self, event: &ProgressEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn event(&self, _event: &ProgressEvent) {}
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn event(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Shared counters plus an optional ticker that logs them every few seconds.
#[derive(Clone)]
pub struct Progress {
    enabled: bool,
    pub stage: Arc<Mutex<String>>,
    pub files_done: Arc<AtomicUsize>,
    pub files_total: Arc<AtomicUsize>,
    pub chunks_done: Arc<AtomicUsize>,
    pub chunks_failed: Arc<AtomicUsize>,
    pub bytes_done: Arc<AtomicU64>,
    pub bytes_total: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

impl Progress {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            stage: Arc::new(Mutex::new(String::new())),
            files_done: Arc::new(AtomicUsize::new(0)),
            files_total: Arc::new(AtomicUsize::new(0)),
            chunks_done: Arc::new(AtomicUsize::new(0)),
            chunks_failed: Arc::new(AtomicUsize::new(0)),
            bytes_done: Arc::new(AtomicU64::new(0)),
            bytes_total: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_stage(&self, s: &str) {
        if let Ok(mut stage) = self.stage.lock() {
            *stage = s.to_string();
        }
    }

    pub fn set_totals(&self, files: usize, bytes: u64) {
        self.files_total.store(files, Ordering::Relaxed);
        self.bytes_total.store(bytes, Ordering::Relaxed);
    }

    pub fn start(&self) {
        if !self.enabled {
            return;
        }
        self.running.store(true, Ordering::Relaxed);
        let this = self.clone();
        thread::spawn(move || {
            let t0 = Instant::now();
            while this.running.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_secs(5));
                if !this.running.load(Ordering::Relaxed) {
                    break;
                }
                let stage = this.stage.lock().map(|s| s.clone()).unwrap_or_default();
                let bd = this.bytes_done.load(Ordering::Relaxed);
                let bt = this.bytes_total.load(Ordering::Relaxed);
                let pct = if bt > 0 { (bd as f64 / bt as f64) * 100.0 } else { 0.0 };
                tracing::info!(
                    elapsed_s = t0.elapsed().as_secs(),
                    files = format_args!(
                        "{}/{}",
                        this.files_done.load(Ordering::Relaxed),
                        this.files_total.load(Ordering::Relaxed)
                    ),
                    chunks = this.chunks_done.load(Ordering::Relaxed),
                    failed = this.chunks_failed.load(Ordering::Relaxed),
                    "{stage} {}%",
                    pct as i32
                );
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl ProgressSink for Progress {
    fn event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::FileScanned { .. } => {}
            ProgressEvent::ChunkWritten { bytes, .. } => {
                self.chunks_done.fetch_add(1, Ordering::Relaxed);
                self.bytes_done.fetch_add(*bytes, Ordering::Relaxed);
            }
            ProgressEvent::ChunkFailed { .. } => {
                self.chunks_failed.fetch_add(1, Ordering::Relaxed);
            }
            ProgressEvent::GroupFailed { chunks, .. } => {
                self.chunks_failed.fetch_add(*chunks, Ordering::Relaxed);
            }
            ProgressEvent::FileFinished { .. } => {
                self.files_done.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_follow_events() {
        let p = Progress::new(false);
        let path = "a.bin".to_string();
        p.event(&ProgressEvent::ChunkWritten { path: path.clone(), chunk_id: 1, bytes: 100 });
        p.event(&ProgressEvent::ChunkWritten { path: path.clone(), chunk_id: 2, bytes: 50 });
        p.event(&ProgressEvent::GroupFailed {
            path: path.clone(),
            bundle_id: 9,
            chunks: 3,
            error: "timeout".into(),
        });
        p.event(&ProgressEvent::FileFinished { path, outcome: FileOutcome::UpToDate });
        assert_eq!(p.chunks_done.load(Ordering::Relaxed), 2);
        assert_eq!(p.bytes_done.load(Ordering::Relaxed), 150);
        assert_eq!(p.chunks_failed.load(Ordering::Relaxed), 3);
        assert_eq!(p.files_done.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn closures_are_sinks() {
        let seen = AtomicUsize::new(0);
        let sink = |_: &ProgressEvent| {
            seen.fetch_add(1, Ordering::Relaxed);
        };
        sink.event(&ProgressEvent::FileScanned { path: "x".into(), scheduled: 0 });
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }
}
