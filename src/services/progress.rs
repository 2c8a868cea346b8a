use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Verify,
    Download,
    Patch,
    Install,
    Runtime,
    DomainPatch,
    Complete,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub stage: ProgressStage,
    pub percent: f64,
    pub message: String,
    pub file_name: Option<String>,
    pub downloaded: Option<u64>,
    pub total: Option<u64>,
    pub speed_bps: Option<u64>,
}

/// Cloneable progress sink. `send` never blocks, so it is safe to call from
/// blocking worker threads as well as async tasks.
#[derive(Clone, Debug)]
pub struct ProgressReporter {
    tx: Option<UnboundedSender<ProgressEvent>>,
    start: f64,
    end: f64,
}

impl ProgressReporter {
    pub fn new(tx: UnboundedSender<ProgressEvent>) -> Self {
        Self {
            tx: Some(tx),
            start: 0.0,
            end: 100.0,
        }
    }

    pub fn noop() -> Self {
        Self {
            tx: None,
            start: 0.0,
            end: 100.0,
        }
    }

    /// A reporter whose 0-100 maps onto `start..end` of this one.
    pub fn scaled(&self, start: f64, end: f64) -> Self {
        Self {
            tx: self.tx.clone(),
            start: self.map(start),
            end: self.map(end),
        }
    }

    fn map(&self, percent: f64) -> f64 {
        let percent = percent.clamp(0.0, 100.0);
        self.start + (self.end - self.start) * percent / 100.0
    }

    pub fn report(&self, stage: ProgressStage, percent: f64, message: impl Into<String>) {
        self.emit(ProgressEvent {
            stage,
            percent,
            message: message.into(),
            file_name: None,
            downloaded: None,
            total: None,
            speed_bps: None,
        });
    }

    pub fn report_transfer(
        &self,
        file_name: &str,
        downloaded: u64,
        total: Option<u64>,
        speed_bps: u64,
    ) {
        let percent = match total {
            Some(total) if total > 0 => downloaded as f64 * 100.0 / total as f64,
            _ => 0.0,
        };
        self.emit(ProgressEvent {
            stage: ProgressStage::Download,
            percent,
            message: format!("Downloading {file_name}"),
            file_name: Some(file_name.to_string()),
            downloaded: Some(downloaded),
            total,
            speed_bps: Some(speed_bps),
        });
    }

    fn emit(&self, mut event: ProgressEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        event.percent = self.map(event.percent);
        let _ = tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaled_reporter_maps_into_band() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let reporter = ProgressReporter::new(tx).scaled(20.0, 60.0);

        reporter.report(ProgressStage::Patch, 50.0, "half");
        reporter.scaled(0.0, 50.0).report(ProgressStage::Patch, 100.0, "nested");

        let first = rx.try_recv().expect("first event");
        let second = rx.try_recv().expect("second event");
        assert!((first.percent - 40.0).abs() < f64::EPSILON);
        assert!((second.percent - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn noop_reporter_drops_events() {
        ProgressReporter::noop().report(ProgressStage::Verify, 10.0, "ignored");
    }
}
