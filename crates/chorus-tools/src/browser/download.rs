//! Download Record tracking (spec §4.C). The engine writes a download's
//! bytes to `<dir>/<guid>` while it is in flight; once progress reports it
//! complete we rename it to a human-readable name derived from the site's
//! suggested filename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const RENAME_RETRIES: u32 = 10;
const RENAME_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadState {
    InProgress,
    Completed,
    Failed,
}

#[derive(Clone, Debug)]
pub struct DownloadRecord {
    pub guid: String,
    pub url: String,
    pub suggested_filename: String,
    pub final_path: Option<PathBuf>,
    pub state: DownloadState,
    reported: bool,
}

pub struct DownloadTracker {
    dir: PathBuf,
    records: HashMap<String, DownloadRecord>,
}

impl DownloadTracker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            records: HashMap::new(),
        }
    }

    pub fn begin(&mut self, guid: String, url: String, suggested_filename: String) {
        self.records.insert(
            guid.clone(),
            DownloadRecord {
                guid,
                url,
                suggested_filename,
                final_path: None,
                state: DownloadState::InProgress,
                reported: false,
            },
        );
    }

    /// Renames the engine-assigned file to `<suggested-base>_<8-hex>.<ext>`,
    /// retrying briefly to tolerate a "still writing" race with the engine.
    pub async fn complete(&mut self, guid: &str) -> Option<DownloadRecord> {
        let record = self.records.get_mut(guid)?;
        let source = self.dir.join(guid);
        let final_path = rename_target(&self.dir, &record.suggested_filename);

        let mut last_err = None;
        for attempt in 0..RENAME_RETRIES {
            match tokio::fs::rename(&source, &final_path).await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    last_err = Some(e);
                    if attempt + 1 < RENAME_RETRIES {
                        tokio::time::sleep(RENAME_RETRY_DELAY).await;
                    }
                }
            }
        }

        if let Some(e) = last_err {
            warn!("download {guid} rename failed after {RENAME_RETRIES} attempts: {e}");
            record.state = DownloadState::Failed;
            return Some(record.clone());
        }

        record.final_path = Some(final_path);
        record.state = DownloadState::Completed;
        Some(record.clone())
    }

    pub fn cancel(&mut self, guid: &str) {
        if let Some(record) = self.records.get_mut(guid) {
            record.state = DownloadState::Failed;
        }
    }

    /// Builds "Downloads completed:" lines for every completed-but-unreported
    /// record, then marks them reported so each download is surfaced once.
    pub fn drain_completed_report(&mut self) -> Option<String> {
        let mut lines = Vec::new();
        for record in self.records.values_mut() {
            if record.state == DownloadState::Completed && !record.reported {
                if let Some(path) = &record.final_path {
                    lines.push(format!("  {}", path.display()));
                }
                record.reported = true;
            }
        }
        if lines.is_empty() {
            None
        } else {
            Some(format!("Downloads completed:\n{}", lines.join("\n")))
        }
    }
}

fn rename_target(dir: &Path, suggested_filename: &str) -> PathBuf {
    let suggested = Path::new(suggested_filename);
    let stem = suggested
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    let ext = suggested.extension().map(|e| e.to_string_lossy().to_string());
    let suffix = format!("{:08x}", rand_suffix());
    let filename = match ext {
        Some(ext) => format!("{stem}_{suffix}.{ext}"),
        None => format!("{stem}_{suffix}"),
    };
    dir.join(filename)
}

fn rand_suffix() -> u32 {
    uuid::Uuid::new_v4().as_u128() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_target_keeps_extension_and_adds_hex_suffix() {
        let target = rename_target(Path::new("/tmp/x"), "report.pdf");
        let name = target.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("report_"));
        assert!(name.ends_with(".pdf"));
    }

    #[test]
    fn drain_completed_report_reports_each_download_once() {
        let mut tracker = DownloadTracker::new("/tmp/chorus-test-downloads");
        tracker.begin("g1".into(), "https://x/y.pdf".into(), "y.pdf".into());
        tracker.records.get_mut("g1").unwrap().state = DownloadState::Completed;
        tracker.records.get_mut("g1").unwrap().final_path = Some(PathBuf::from("/tmp/y_abc.pdf"));

        let first = tracker.drain_completed_report();
        assert!(first.is_some());
        assert!(first.unwrap().contains("Downloads completed"));

        let second = tracker.drain_completed_report();
        assert!(second.is_none());
    }
}
