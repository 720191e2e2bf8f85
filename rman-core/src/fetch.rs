//! Byte-range retrieval of bundles and whole-resource retrieval of manifests.

use crate::error::{Result, RmanError};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::RANGE;
use reqwest::StatusCode;

const BUFFER_SIZE: usize = 64 * 1024;

/// Shared cancellation flag, checked by workers between units of work.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(RmanError::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub trait RangeFetcher: Send + Sync {
    /// Bytes `[start, end_inclusive]` of `url`. Shorter responses are errors.
    fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end_inclusive: u64,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>>;

    fn fetch_all(&self, url: &str, cancel: &CancelToken) -> Result<Vec<u8>>;
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. Backoff sleeps wake early on cancellation.
pub fn with_retries<T>(
    policy: RetryPolicy,
    cancel: &CancelToken,
    url: &str,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        cancel.check()?;
        match op() {
            Err(e) if e.is_retryable() && attempt < policy.retries => {
                attempt += 1;
                tracing::debug!(url, attempt, error = %e, "retrying range request");
                let deadline = Instant::now() + policy.backoff;
                while Instant::now() < deadline {
                    cancel.check()?;
                    thread::sleep(Duration::from_millis(20).min(policy.backoff));
                }
            }
            other => return other,
        }
    }
}

fn network(url: &str, message: impl Into<String>, retryable: bool) -> RmanError {
    RmanError::Network { url: url.to_string(), message: message.into(), retryable }
}

fn from_reqwest(url: &str, e: reqwest::Error) -> RmanError {
    let retryable = e.is_timeout()
        || e.is_connect()
        || e.is_body()
        || e.status().is_some_and(|s| s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS);
    network(url, e.to_string(), retryable)
}

/// Read `r` to the end, checking `cancel` between buffers and stopping after `limit` bytes.
fn read_cancellable(
    url: &str,
    r: &mut impl Read,
    limit: Option<usize>,
    cancel: &CancelToken,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(limit.unwrap_or(BUFFER_SIZE).min(64 << 20));
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        cancel.check()?;
        let want = match limit {
            Some(l) if out.len() >= l => break,
            Some(l) => (l - out.len()).min(BUFFER_SIZE),
            None => BUFFER_SIZE,
        };
        let n = r.read(&mut buf[..want]).map_err(|e| network(url, e.to_string(), true))?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    Ok(out)
}

/// Discard the first `n` bytes of `r`, checking `cancel` between buffers.
/// A body that ends early leaves the caller with a short read.
fn skip_cancellable(url: &str, r: &mut impl Read, mut n: u64, cancel: &CancelToken) -> Result<()> {
    let mut buf = vec![0u8; BUFFER_SIZE];
    while n > 0 {
        cancel.check()?;
        let want = n.min(BUFFER_SIZE as u64) as usize;
        let got = r.read(&mut buf[..want]).map_err(|e| network(url, e.to_string(), true))?;
        if got == 0 {
            break;
        }
        n -= got as u64;
    }
    Ok(())
}

/// Ranged GETs over a blocking reqwest client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("rman/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| network("client", e.to_string(), false))?;
        Ok(Self { client })
    }

    fn get(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
        cancel: &CancelToken,
    ) -> Result<(StatusCode, reqwest::blocking::Response)> {
        cancel.check()?;
        let mut req = self.client.get(url);
        if let Some((start, end)) = range {
            req = req.header(RANGE, format!("bytes={start}-{end}"));
        }
        let resp = req.send().map_err(|e| from_reqwest(url, e))?;
        let status = resp.status();
        if !status.is_success() {
            let retryable =
                status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
            return Err(network(url, format!("HTTP {status}"), retryable));
        }
        Ok((status, resp))
    }
}

impl RangeFetcher for HttpFetcher {
    fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end_inclusive: u64,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>> {
        let want = (end_inclusive - start + 1) as usize;
        let (status, mut resp) = self.get(url, Some((start, end_inclusive)), cancel)?;
        tracing::debug!(url, start, end_inclusive, %status, "range response");
        let data = if status == StatusCode::PARTIAL_CONTENT {
            read_cancellable(url, &mut resp, Some(want), cancel)?
        } else {
            // Server ignored the range: skip to it in the full body.
            skip_cancellable(url, &mut resp, start, cancel)?;
            read_cancellable(url, &mut resp, Some(want), cancel)?
        };
        if data.len() < want {
            return Err(network(
                url,
                format!("short response: {} of {want} bytes", data.len()),
                true,
            ));
        }
        Ok(data)
    }

    fn fetch_all(&self, url: &str, cancel: &CancelToken) -> Result<Vec<u8>> {
        let (_, mut resp) = self.get(url, None, cancel)?;
        read_cancellable(url, &mut resp, None, cancel)
    }
}

/// Serves `file://` URLs and plain paths, e.g. a directory of packed bundles.
#[derive(Debug, Clone, Default)]
pub struct LocalFetcher;

impl LocalFetcher {
    fn path(url: &str) -> PathBuf {
        PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
    }
}

impl RangeFetcher for LocalFetcher {
    fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end_inclusive: u64,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>> {
        cancel.check()?;
        let want = (end_inclusive - start + 1) as usize;
        let mut f = File::open(Self::path(url)).map_err(|e| network(url, e.to_string(), false))?;
        f.seek(SeekFrom::Start(start))?;
        let data = read_cancellable(url, &mut f, Some(want), cancel)?;
        if data.len() < want {
            return Err(network(
                url,
                format!("short response: {} of {want} bytes", data.len()),
                false,
            ));
        }
        Ok(data)
    }

    fn fetch_all(&self, url: &str, cancel: &CancelToken) -> Result<Vec<u8>> {
        cancel.check()?;
        let mut f = File::open(Self::path(url)).map_err(|e| network(url, e.to_string(), false))?;
        read_cancellable(url, &mut f, None, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicU32;

    fn policy(retries: u32) -> RetryPolicy {
        RetryPolicy { retries, backoff: Duration::from_millis(1) }
    }

    #[test]
    fn transient_errors_are_retried_up_to_the_budget() {
        let calls = AtomicU32::new(0);
        let res: Result<()> = with_retries(policy(3), &CancelToken::new(), "u", || {
            calls.fetch_add(1, Ordering::Relaxed);
            Err(network("u", "503", true))
        });
        assert!(matches!(res, Err(RmanError::Network { retryable: true, .. })));
        assert_eq!(calls.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let res: Result<()> = with_retries(policy(3), &CancelToken::new(), "u", || {
            calls.fetch_add(1, Ordering::Relaxed);
            Err(network("u", "HTTP 404", false))
        });
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn success_after_a_failure() {
        let calls = AtomicU32::new(0);
        let res = with_retries(policy(2), &CancelToken::new(), "u", || {
            if calls.fetch_add(1, Ordering::Relaxed) == 0 {
                Err(network("u", "timeout", true))
            } else {
                Ok(7)
            }
        });
        assert_eq!(res.unwrap(), 7);
    }

    #[test]
    fn cancelled_token_stops_before_the_first_attempt() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let res: Result<()> = with_retries(policy(3), &cancel, "u", || panic!("must not run"));
        assert!(matches!(res, Err(RmanError::Cancelled)));
    }

    #[test]
    fn local_fetcher_serves_inclusive_ranges() {
        let td = tempfile::tempdir().unwrap();
        let p = td.path().join("0000000000000001.bundle");
        std::fs::write(&p, b"0123456789").unwrap();
        let url = format!("file://{}", p.display());
        let f = LocalFetcher;
        let cancel = CancelToken::new();
        assert_eq!(f.fetch_range(&url, 2, 5, &cancel).unwrap(), b"2345");
        assert_eq!(f.fetch_all(p.to_str().unwrap(), &cancel).unwrap(), b"0123456789");
        assert!(matches!(
            f.fetch_range(&url, 8, 15, &cancel),
            Err(RmanError::Network { retryable: false, .. })
        ));
    }

    #[test]
    fn skip_stops_on_cancel() {
        let cancel = CancelToken::new();
        let mut body: &[u8] = &[0u8; 1024];
        skip_cancellable("u", &mut body, 1000, &cancel).unwrap();
        assert_eq!(body.len(), 24);
        cancel.cancel();
        let mut body: &[u8] = &[0u8; 1024];
        assert!(matches!(skip_cancellable("u", &mut body, 10, &cancel), Err(RmanError::Cancelled)));
        assert_eq!(body.len(), 1024);
    }

    /// Answers one connection per canned response and hands back the raw requests.
    fn serve(responses: Vec<String>) -> (String, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/0000000000000001.bundle", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let mut requests = Vec::new();
            for response in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = stream.read(&mut buf).unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                requests.push(String::from_utf8_lossy(&request).to_ascii_lowercase());
                stream.write_all(response.as_bytes()).unwrap();
            }
            requests
        });
        (url, handle)
    }

    fn response(status: &str, body: &str) -> String {
        format!("HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}", body.len())
    }

    #[test]
    fn http_fetcher_sends_inclusive_range_and_reads_partial_content() {
        let (url, server) = serve(vec![response("206 Partial Content", "2345")]);
        let f = HttpFetcher::new(Duration::from_secs(5)).unwrap();
        assert_eq!(f.fetch_range(&url, 2, 5, &CancelToken::new()).unwrap(), b"2345");
        let requests = server.join().unwrap();
        assert!(requests[0].contains("range: bytes=2-5"), "{}", requests[0]);
    }

    #[test]
    fn http_fetcher_skips_into_a_full_body() {
        let (url, server) = serve(vec![
            response("200 OK", "0123456789"),
            response("200 OK", "0123456789"),
        ]);
        let f = HttpFetcher::new(Duration::from_secs(5)).unwrap();
        let cancel = CancelToken::new();
        assert_eq!(f.fetch_range(&url, 6, 8, &cancel).unwrap(), b"678");
        assert_eq!(f.fetch_all(&url, &cancel).unwrap(), b"0123456789");
        server.join().unwrap();
    }

    #[test]
    fn http_fetcher_short_body_is_retryable() {
        let (url, server) = serve(vec![response("206 Partial Content", "23")]);
        let f = HttpFetcher::new(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            f.fetch_range(&url, 2, 5, &CancelToken::new()),
            Err(RmanError::Network { retryable: true, .. })
        ));
        server.join().unwrap();
    }

    #[test]
    fn http_status_decides_retryability() {
        let (url, server) = serve(vec![
            response("503 Service Unavailable", ""),
            response("429 Too Many Requests", ""),
            response("404 Not Found", ""),
        ]);
        let f = HttpFetcher::new(Duration::from_secs(5)).unwrap();
        let cancel = CancelToken::new();
        for retryable in [true, true, false] {
            match f.fetch_range(&url, 0, 3, &cancel) {
                Err(RmanError::Network { retryable: r, .. }) => assert_eq!(r, retryable),
                other => panic!("unexpected {other:?}"),
            }
        }
        server.join().unwrap();
    }
}
