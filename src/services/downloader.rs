use std::path::Path;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::DownloadConfig;
use crate::errors::{LauncherError, Result};
use crate::services::progress::ProgressReporter;
use crate::utils::file::{
    available_disk_space, format_bytes, rename_replace_async, sibling_with_suffix,
};

const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub stall_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DownloadConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_retry_delay(),
            max_delay: config.max_retry_delay(),
            stall_timeout: config.stall_timeout(),
        }
    }

    /// Sleep before `attempt` (1-based): nothing before the first, then
    /// `base * 2^(attempt - 2)` capped at `max_delay`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let multiplier = 2_u32.saturating_pow(attempt - 2);
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ResumeDecision {
    /// Append to the partial file. Carries the full size when the server reported one.
    Resume { total: Option<u64> },
    /// Server ignored the range and is sending the whole body.
    Restart,
    /// The body cannot be used at all; the partial is stale.
    Reject(String),
}

#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl Downloader {
    pub fn new(policy: RetryPolicy) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(45 * 60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, policy }
    }

    pub fn with_client(client: reqwest::Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Downloads `url` to `dest`, resuming from `dest.part` when the server allows it.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        file_name: &str,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(LauncherError::Cancelled);
            }
            if attempt > 1 {
                let delay = self.policy.delay_before(attempt);
                tracing::info!(
                    file = file_name,
                    "retrying in {:?} [attempt {}/{}]",
                    delay,
                    attempt,
                    max_attempts
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LauncherError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.attempt(url, dest, file_name, progress, cancel).await {
                Ok(()) => {
                    tracing::info!(file = file_name, dest = %dest.display(), "download complete");
                    return Ok(());
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) if !err.is_retryable() => {
                    tracing::warn!(file = file_name, error = %err, "download failed, not retrying");
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        file = file_name,
                        "download failed [attempt {}/{}]: {}",
                        attempt,
                        max_attempts,
                        err
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(LauncherError::DownloadExhausted {
            attempts: max_attempts,
            source: Box::new(last_error.unwrap_or_else(|| {
                LauncherError::Config(format!("no download attempt made for {file_name}"))
            })),
        })
    }

    async fn attempt(
        &self,
        url: &str,
        dest: &Path,
        file_name: &str,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let part_path = sibling_with_suffix(dest, "part");
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut resume_from = match tokio::fs::metadata(&part_path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => 0,
        };

        let mut request = self.client.get(url);
        if resume_from > 0 {
            tracing::info!(file = file_name, offset = resume_from, "resuming download");
            request = request.header(RANGE, format!("bytes={resume_from}-"));
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LauncherError::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status();
        if resume_from > 0 && status == StatusCode::RANGE_NOT_SATISFIABLE {
            remove_partial(&part_path).await;
            return Err(LauncherError::ResumeRejected(format!(
                "range from {resume_from} not satisfiable"
            )));
        }
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(LauncherError::http(
                status.as_u16(),
                format!("unexpected status downloading {file_name}"),
            ));
        }

        let mut reported_total = None;
        if resume_from > 0 {
            match validate_resume(&response, resume_from) {
                ResumeDecision::Resume { total } => reported_total = total,
                ResumeDecision::Restart => {
                    tracing::warn!(file = file_name, "server ignored range request, restarting");
                    remove_partial(&part_path).await;
                    resume_from = 0;
                }
                ResumeDecision::Reject(reason) => {
                    remove_partial(&part_path).await;
                    return Err(LauncherError::ResumeRejected(reason));
                }
            }
        }

        let total = match reported_total {
            Some(total) => Some(total),
            None => response.content_length().map(|len| len + resume_from),
        };

        if let Some(total) = total {
            let needed = total.saturating_sub(resume_from);
            match available_disk_space(dest) {
                Some(available) if available < needed => tracing::warn!(
                    file = file_name,
                    "low disk space: need {}, have {}",
                    format_bytes(needed),
                    format_bytes(available)
                ),
                Some(_) => {}
                None => tracing::debug!(dest = %dest.display(), "could not probe free disk space"),
            }
        }

        let mut file = if resume_from > 0 {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&part_path)
                .await?
        } else {
            tokio::fs::File::create(&part_path).await?
        };

        let mut stream = response.bytes_stream();
        let mut downloaded = resume_from;
        let started = Instant::now();
        let mut last_emit = Instant::now();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = file.flush().await;
                    return Err(LauncherError::Cancelled);
                }
                next = tokio::time::timeout(self.policy.stall_timeout, stream.next()) => next,
            };
            let chunk = match next {
                Err(_) => {
                    let _ = file.flush().await;
                    return Err(LauncherError::Stalled(self.policy.stall_timeout.as_secs()));
                }
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            if last_emit.elapsed() >= PROGRESS_EMIT_INTERVAL {
                last_emit = Instant::now();
                progress.report_transfer(
                    file_name,
                    downloaded,
                    total,
                    transfer_speed(downloaded - resume_from, started.elapsed()),
                );
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(expected) = total {
            if downloaded != expected {
                if downloaded > expected {
                    remove_partial(&part_path).await;
                }
                return Err(LauncherError::IncompleteDownload {
                    expected,
                    received: downloaded,
                });
            }
        }

        rename_replace_async(&part_path, dest).await?;
        progress.report_transfer(
            file_name,
            downloaded,
            Some(downloaded),
            transfer_speed(downloaded - resume_from, started.elapsed()),
        );
        Ok(())
    }
}

fn validate_resume(response: &reqwest::Response, resume_from: u64) -> ResumeDecision {
    if response.status() == StatusCode::OK {
        return ResumeDecision::Restart;
    }

    let accepts_bytes = response
        .headers()
        .get(ACCEPT_RANGES)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().eq_ignore_ascii_case("bytes"))
        .unwrap_or(false);
    if !accepts_bytes {
        return ResumeDecision::Reject("server does not advertise byte ranges".to_string());
    }

    let range = response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_content_range);
    let Some((start, _end, total)) = range else {
        return ResumeDecision::Reject("missing or malformed Content-Range".to_string());
    };
    if start != resume_from {
        return ResumeDecision::Reject(format!(
            "Content-Range starts at {start}, local partial has {resume_from} bytes"
        ));
    }
    if let Some(total) = total {
        if total < resume_from {
            return ResumeDecision::Reject(format!(
                "server total {total} is smaller than local partial {resume_from}"
            ));
        }
    }
    ResumeDecision::Resume { total }
}

/// `bytes START-END/TOTAL` (TOTAL may be `*`).
fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let spec = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = spec.split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let end = end.trim().parse::<u64>().ok()?;
    let total = match total.trim() {
        "*" => None,
        value => Some(value.parse::<u64>().ok()?),
    };
    Some((start, end, total))
}

fn transfer_speed(bytes: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0;
    }
    (bytes as f64 / secs) as u64
}

async fn remove_partial(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove partial download");
        }
    }
}
