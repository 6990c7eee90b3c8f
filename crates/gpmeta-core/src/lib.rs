pub mod dedup;
pub mod embed;
pub mod error;
pub mod geocode;
pub mod jpeg;
pub mod media;
pub mod processor;
pub mod sidecar;

use std::cell::Cell;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub use dedup::{DuplicateGroup, DuplicatePolicy, KeepAll, KeepLargest, KeepNewest};
pub use error::{GeocodeError, ProcessError};
pub use geocode::{
    run_geocode_pass, GeoCache, GeocodeOptions, GeocodeReport, NominatimClient, ReverseGeocoder,
};
pub use sidecar::SidecarMetadata;

/// Automated duplicate-resolution policy for headless runs. Interactive
/// callers bypass this by supplying their own `DuplicatePolicy` to
/// `process_with_policy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicateMode {
    #[default]
    KeepAll,
    KeepNewest,
    KeepLargest,
}

impl DuplicateMode {
    pub fn policy(self) -> &'static dyn DuplicatePolicy {
        match self {
            DuplicateMode::KeepAll => &KeepAll,
            DuplicateMode::KeepNewest => &KeepNewest,
            DuplicateMode::KeepLargest => &KeepLargest,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Pipeline configuration. There is no process-wide state; callers build one
/// of these and pass it in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOptions {
    pub source: PathBuf,
    /// Mirror processed files under this directory; `None` rewrites the
    /// source tree in place.
    #[serde(default)]
    pub output: Option<PathBuf>,
    /// Prefix output names with the capture date (`YYYY-MM-DD_`).
    #[serde(default)]
    pub rename: bool,
    /// Snapshot originals to `<file>.bak` before in-place modification.
    #[serde(default)]
    pub backups: bool,
    /// Propagate the capture time to the filesystem clock (best effort).
    #[serde(default = "default_true")]
    pub update_file_times: bool,
    #[serde(default)]
    pub duplicate_policy: DuplicateMode,
}

/// Per-file result of the processing pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    /// Sidecar metadata merged into the embedded block.
    Merged,
    /// No usable sidecar; plain copy.
    Copied,
    VideoCopied,
    ThumbnailCopied,
    Errored(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub source: PathBuf,
    /// Where the file ended up; `None` when processing failed.
    pub dest: Option<PathBuf>,
    pub outcome: Outcome,
}

/// Aggregated run summary, exportable as JSON.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessReport {
    pub total_files: u64,
    pub merged: u64,
    pub copied: u64,
    pub video_copied: u64,
    pub thumbnail_copied: u64,
    pub errored: u64,
    pub duplicate_groups: u64,
    pub duplicate_copies_discarded: u64,
    pub dirs_scanned: u64,
    pub unsupported_skipped: u64,
    pub records: Vec<FileRecord>,
}

impl ProcessReport {
    fn record(&mut self, rec: FileRecord) {
        match rec.outcome {
            Outcome::Merged => self.merged += 1,
            Outcome::Copied => self.copied += 1,
            Outcome::VideoCopied => self.video_copied += 1,
            Outcome::ThumbnailCopied => self.thumbnail_copied += 1,
            Outcome::Errored(_) => self.errored += 1,
        }
        self.records.push(rec);
    }
}

/// Progress callback: (stage, current, total, message).
pub type ProgressCallback = dyn Fn(&str, u64, u64, &str);

/// Throttled progress reporter: emits at most every 200ms, or on completion.
pub struct ThrottledProgress<'a> {
    inner: &'a ProgressCallback,
    last_emit: Cell<Instant>,
}

impl<'a> ThrottledProgress<'a> {
    pub fn new(inner: &'a ProgressCallback) -> Self {
        Self {
            inner,
            last_emit: Cell::new(Instant::now() - Duration::from_secs(1)),
        }
    }

    pub fn report(&self, stage: &str, current: u64, total: u64, message: &str) {
        if current < total {
            if self.last_emit.get().elapsed().as_millis() < 200 {
                return;
            }
            self.last_emit.set(Instant::now());
        }
        (self.inner)(stage, current, total, message);
    }
}

/// Run the merge pipeline with the configured duplicate policy.
pub fn process(
    options: &ProcessOptions,
    progress_callback: &ProgressCallback,
) -> anyhow::Result<ProcessReport> {
    process_with_policy(options, options.duplicate_policy.policy(), progress_callback)
}

/// Run the merge pipeline: scan, reconcile duplicates, then process every
/// file. Per-file failures never abort the batch.
pub fn process_with_policy(
    options: &ProcessOptions,
    policy: &dyn DuplicatePolicy,
    progress_callback: &ProgressCallback,
) -> anyhow::Result<ProcessReport> {
    anyhow::ensure!(
        options.source.is_dir(),
        "source directory {} does not exist",
        options.source.display()
    );
    let tp = ThrottledProgress::new(progress_callback);

    let scan = media::scan_tree(&options.source);
    let total = scan.media.len() as u64;
    tp.report("scan", total, total, "source tree scanned");

    let reconciled = dedup::reconcile(scan.media, policy);
    tp.report(
        "dedup",
        reconciled.groups_found,
        reconciled.groups_found,
        "duplicates reconciled",
    );

    let records = processor::process_all(&reconciled.kept, options, &tp);

    let mut report = ProcessReport {
        total_files: total,
        duplicate_groups: reconciled.groups_found,
        duplicate_copies_discarded: reconciled.copies_discarded,
        dirs_scanned: scan.dirs_scanned,
        unsupported_skipped: scan.unsupported_skipped,
        ..Default::default()
    };
    for rec in records {
        report.record(rec);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn tiny_jpeg() -> Vec<u8> {
        let mut v = vec![0xFF, 0xD8];
        v.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
        v.extend_from_slice(b"JFIF\0");
        v.extend_from_slice(&[0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00]);
        v.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x02]);
        v.extend_from_slice(&[0xFF, 0xD9]);
        v
    }

    #[test]
    fn test_process_end_to_end() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        fs::create_dir_all(src.path().join("2023/a")).unwrap();
        fs::create_dir_all(src.path().join("2023/b")).unwrap();

        // Merged image.
        fs::write(src.path().join("2023/a/IMG_001.jpg"), tiny_jpeg()).unwrap();
        fs::write(
            src.path().join("2023/a/IMG_001.jpg.json"),
            br#"{"photoTakenTime": {"timestamp": "1702648110"}, "description": "Eiffel Tower"}"#,
        )
        .unwrap();
        // Copy fallback.
        fs::write(src.path().join("2023/a/IMG_002.jpg"), tiny_jpeg()).unwrap();
        // Video with thumbnail.
        fs::write(src.path().join("2023/b/VID_001.mp4"), b"video").unwrap();
        fs::write(src.path().join("2023/b/VID_001.jpg"), tiny_jpeg()).unwrap();
        // Identical cross-folder duplicates collapse to one copy.
        fs::write(src.path().join("2023/a/DUP.jpg"), b"same").unwrap();
        fs::write(src.path().join("2023/b/DUP.jpg"), b"same").unwrap();
        // Unsupported media format is counted, not processed.
        fs::write(src.path().join("2023/a/skipme.png"), b"png").unwrap();

        let options = ProcessOptions {
            source: src.path().to_path_buf(),
            output: Some(out.path().to_path_buf()),
            rename: false,
            backups: false,
            update_file_times: true,
            duplicate_policy: DuplicateMode::KeepAll,
        };
        let report = process(&options, &|_, _, _, _| {}).unwrap();

        assert_eq!(report.total_files, 6);
        assert_eq!(report.merged, 1);
        assert_eq!(report.copied, 2); // IMG_002 + the surviving DUP copy
        assert_eq!(report.video_copied, 1);
        assert_eq!(report.thumbnail_copied, 1);
        assert_eq!(report.errored, 0);
        assert_eq!(report.duplicate_groups, 1);
        assert_eq!(report.duplicate_copies_discarded, 1);
        assert_eq!(report.unsupported_skipped, 1);

        // Output mirrors the source layout.
        assert!(out.path().join("2023/a/IMG_001.jpg").is_file());
        assert!(out.path().join("2023/b/VID_001.mp4").is_file());
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let options = ProcessOptions {
            source: PathBuf::from("/definitely/not/here"),
            output: None,
            rename: false,
            backups: false,
            update_file_times: false,
            duplicate_policy: DuplicateMode::KeepAll,
        };
        assert!(process(&options, &|_, _, _, _| {}).is_err());
    }
}
