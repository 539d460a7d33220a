//! Archive downloader with progress reporting.

use crate::error::MlError;
use futures::StreamExt;
use repro_core::persistence::tmp_path;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Progress is reported every this many percent of a known size...
const REPORT_PERCENT: u64 = 10;
/// ...or every this many bytes when the server sends no length.
const REPORT_BYTES: u64 = 50 * 1_000_000;

/// Tracks downloaded bytes and decides when to report.
#[derive(Debug, Clone)]
pub struct Progress {
    total: Option<u64>,
    done: u64,
    next_report: u64,
}

impl Progress {
    pub fn new(total: Option<u64>) -> Self {
        let mut progress = Self {
            total,
            done: 0,
            next_report: 0,
        };
        progress.next_report = progress.step();
        progress
    }

    fn step(&self) -> u64 {
        match self.total {
            Some(total) if total > 0 => (total * REPORT_PERCENT / 100).max(1),
            _ => REPORT_BYTES,
        }
    }

    /// Record `bytes` more; returns the byte count to report when a threshold was crossed.
    pub fn advance(&mut self, bytes: u64) -> Option<u64> {
        self.done += bytes;
        if self.done < self.next_report {
            return None;
        }
        let step = self.step();
        while self.next_report <= self.done {
            self.next_report += step;
        }
        Some(self.done)
    }

    pub fn done(&self) -> u64 {
        self.done
    }

    pub fn percent(&self) -> Option<f64> {
        self.total
            .filter(|&t| t > 0)
            .map(|t| self.done as f64 * 100.0 / t as f64)
    }
}

/// Stream `url` into `target`. The file only appears under its final name once complete.
pub async fn download_archive(url: &str, target: &Path) -> Result<u64, MlError> {
    let response = reqwest::get(url).await?.error_for_status()?;
    let total = response.content_length();
    info!(
        url,
        path = %target.display(),
        size_mb = total.map(|t| t as f64 / 1e6),
        "Downloading archive"
    );

    let tmp = tmp_path(target);
    let mut file = tokio::fs::File::create(&tmp).await?;
    let mut progress = Progress::new(total);
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        if let Some(done) = progress.advance(chunk.len() as u64) {
            info!(
                downloaded_mb = done as f64 / 1e6,
                percent = progress.percent().map(|p| p.round()),
                "Download progress"
            );
        }
    }

    file.flush().await?;
    drop(file);
    tokio::fs::rename(&tmp, target).await?;

    info!(bytes = progress.done(), "Download complete");
    Ok(progress.done())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_known_total() {
        let mut progress = Progress::new(Some(1000));
        assert_eq!(progress.advance(50), None);
        assert_eq!(progress.advance(50), Some(100));
        assert_eq!(progress.advance(90), None);
        // one big chunk crossing several thresholds reports once
        assert_eq!(progress.advance(300), Some(490));
        assert_eq!(progress.advance(5), None);
        assert_eq!(progress.advance(5), Some(500));
        assert_eq!(progress.percent(), Some(50.0));
    }

    #[test]
    fn test_progress_unknown_total() {
        let mut progress = Progress::new(None);
        assert_eq!(progress.advance(REPORT_BYTES - 1), None);
        assert_eq!(progress.advance(1), Some(REPORT_BYTES));
        assert!(progress.percent().is_none());
    }
}
