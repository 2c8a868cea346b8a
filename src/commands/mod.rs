pub mod domain;
pub mod install;
pub mod manifest;
pub mod verify;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use launcher_sync::services::{ProgressEvent, ProgressReporter};

/// Logs progress events as they arrive. The task ends once every reporter clone is dropped.
pub fn progress_logger() -> (ProgressReporter, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
    let handle = tokio::spawn(async move {
        let mut last_logged = -1.0_f64;
        while let Some(event) = rx.recv().await {
            // transfer events arrive per chunk
            if event.downloaded.is_some() && event.percent - last_logged < 5.0 && event.percent < 100.0 {
                continue;
            }
            last_logged = event.percent;
            tracing::info!(stage = ?event.stage, percent = format!("{:.1}", event.percent), "{}", event.message);
        }
    });
    (ProgressReporter::new(tx), handle)
}

/// Cancelled on Ctrl-C.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            child.cancel();
        }
    });
    token
}

pub fn split_csv(value: Option<&str>) -> Vec<String> {
    value
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_drops_blank_entries() {
        assert_eq!(split_csv(Some("*.log, ,cache/**")), vec!["*.log", "cache/**"]);
        assert!(split_csv(None).is_empty());
    }
}
