//! Runs in its own process so the descriptor count only sees this test.
#![cfg(target_os = "linux")]

use rman_core::encode::{pack_dir, PackConfig};
use rman_core::fetch::{CancelToken, LocalFetcher, RangeFetcher};
use rman_core::{decode, FileOutcome, PatchOptions, Patcher, PatcherConfig};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn open_fds() -> usize {
    fs::read_dir("/proc/self/fd").map(|d| d.count()).unwrap_or(0)
}

/// Serves from a local mirror and records the most descriptors seen open.
#[derive(Default)]
struct CountingFetcher {
    peak: AtomicUsize,
}

impl RangeFetcher for CountingFetcher {
    fn fetch_range(&self, url: &str, start: u64, end: u64, cancel: &CancelToken) -> rman_core::Result<Vec<u8>> {
        self.peak.fetch_max(open_fds(), Ordering::Relaxed);
        LocalFetcher.fetch_range(url, start, end, cancel)
    }

    fn fetch_all(&self, url: &str, cancel: &CancelToken) -> rman_core::Result<Vec<u8>> {
        LocalFetcher.fetch_all(url, cancel)
    }
}

#[test]
fn many_files_keep_few_destinations_open() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("src");
    for i in 0..300 {
        let dir = src.join(format!("d{}", i % 7));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("f{i:03}.bin")), format!("file number {i}").repeat(8)).unwrap();
    }
    let cfg = PackConfig { chunk_size: 4096, max_bundle_bytes: 64 * 1024, ..PackConfig::default() };
    let summary = pack_dir(&src, &td.path().join("mirror"), &cfg).unwrap();
    let m = decode(&fs::read(&summary.manifest_path).unwrap()).unwrap();
    assert_eq!(m.files().len(), 300);

    let fetcher = Arc::new(CountingFetcher::default());
    let config = PatcherConfig {
        concurrency: 4,
        retries: 0,
        retry_backoff: Duration::from_millis(1),
        bundle_base_url: Some(summary.bundle_dir.to_str().unwrap().to_string()),
        ..PatcherConfig::default()
    };
    let baseline = open_fds();
    let opts = PatchOptions { output: td.path().join("out"), ..PatchOptions::default() };
    let report = Patcher::new(config, fetcher.clone()).run(&m, &opts).unwrap();

    assert_eq!(report.files.len(), 300);
    assert!(report.files.iter().all(|f| matches!(f.outcome, FileOutcome::Patched { .. })));
    let peak = fetcher.peak.load(Ordering::Relaxed);
    assert!(peak < baseline + 64, "peak {peak} open descriptors, baseline {baseline}");
    for i in [0usize, 151, 299] {
        let rel = format!("d{}/f{i:03}.bin", i % 7);
        assert_eq!(fs::read(td.path().join("out").join(&rel)).unwrap(), fs::read(src.join(&rel)).unwrap());
    }
}
