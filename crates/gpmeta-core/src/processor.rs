use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::error::ProcessError;
use crate::media::{ExtClass, MediaFile};
use crate::sidecar::{decode_sidecar, resolve_sidecar, SidecarMetadata};
use crate::{embed, jpeg};
use crate::{FileRecord, Outcome, ProcessOptions, ThrottledProgress};

static DATE_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}_").unwrap());

/// Cap for the cleaned stem in renamed files, keeping paths portable.
const MAX_STEM_CHARS: usize = 30;

/// Spaces become underscores, anything outside alphanumerics/`-`/`_` is
/// dropped, and the result is cut to a fixed length.
pub fn sanitize_stem(stem: &str) -> String {
    let normalized: String = stem.nfc().collect();
    normalized
        .chars()
        .filter_map(|ch| {
            if ch == ' ' {
                Some('_')
            } else if ch.is_alphanumeric() || ch == '_' || ch == '-' {
                Some(ch)
            } else {
                None
            }
        })
        .take(MAX_STEM_CHARS)
        .collect()
}

/// Destination filename for a media file. Renaming prefixes the capture
/// date; a stem that already carries a date prefix is left untouched so
/// re-running the pipeline never double-prefixes.
pub fn target_name(m: &MediaFile, taken: Option<NaiveDateTime>, rename: bool) -> String {
    if !rename || DATE_PREFIX_RE.is_match(&m.stem) {
        return m.file_name.clone();
    }
    let Some(taken) = taken else {
        return m.file_name.clone();
    };
    let ext = m
        .path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    format!(
        "{}_{}.{}",
        taken.format("%Y-%m-%d"),
        sanitize_stem(&m.stem),
        ext
    )
}

/// Tracks paths assigned during this run so same-named outputs get a `(n)`
/// counter. Paths already on disk from a previous run are overwritten
/// instead, keeping re-runs idempotent.
fn unique_dest(dir: &Path, file_name: &str, used: &mut HashSet<PathBuf>) -> PathBuf {
    let base = dir.join(file_name);
    if used.insert(base.clone()) {
        return base;
    }
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let ext = Path::new(file_name)
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("");
    let mut counter = 1u32;
    loop {
        let name = if ext.is_empty() {
            format!("{stem}({counter})")
        } else {
            format!("{stem}({counter}).{ext}")
        };
        let candidate = dir.join(name);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        counter += 1;
    }
}

pub(crate) fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    path.with_file_name(name)
}

/// Rewrite a file in place, optionally snapshotting the original first.
/// `dest` may differ from `src` when renaming; the original is removed once
/// the new file is safely written.
pub(crate) fn write_in_place(
    src: &Path,
    dest: &Path,
    bytes: &[u8],
    backups: bool,
) -> Result<(), ProcessError> {
    let bak = backup_path(src);
    if backups {
        fs::copy(src, &bak)?;
    }
    match fs::write(dest, bytes) {
        Ok(()) => {
            if dest != src {
                fs::remove_file(src)?;
            }
            if backups {
                let _ = fs::remove_file(&bak);
            }
            Ok(())
        }
        Err(e) => {
            if backups {
                if dest == src {
                    let _ = fs::rename(&bak, src);
                } else {
                    let _ = fs::remove_file(&bak);
                }
            }
            Err(e.into())
        }
    }
}

fn propagate_times(
    dest: &Path,
    src_mtime: Option<filetime::FileTime>,
    taken: Option<NaiveDateTime>,
    enabled: bool,
) {
    // Copy fidelity first: keep the source clock when nothing better exists.
    if let Some(mtime) = src_mtime {
        let _ = filetime::set_file_mtime(dest, mtime);
    }
    if !enabled {
        return;
    }
    if let Some(t) = taken {
        let ft = filetime::FileTime::from_unix_time(t.and_utc().timestamp(), 0);
        // Best effort; not every platform lets us set both times.
        let _ = filetime::set_file_times(dest, ft, ft);
    }
}

fn mtime_of(path: &Path) -> Option<filetime::FileTime> {
    fs::metadata(path)
        .ok()
        .map(|m| filetime::FileTime::from_last_modification_time(&m))
}

struct Ctx<'a> {
    options: &'a ProcessOptions,
    used: HashSet<PathBuf>,
}

impl Ctx<'_> {
    /// Resolve where a file's output goes. Copy mode mirrors the source
    /// folder layout under the output root; in-place mode stays in the
    /// source folder.
    fn destination(&mut self, m: &MediaFile, name: &str) -> Result<(PathBuf, bool), ProcessError> {
        let parent = m.path.parent().unwrap_or_else(|| Path::new(""));
        match &self.options.output {
            Some(output) => {
                let rel = pathdiff::diff_paths(parent, &self.options.source).unwrap_or_default();
                let out_dir = output.join(rel);
                fs::create_dir_all(&out_dir)?;
                Ok((unique_dest(&out_dir, name, &mut self.used), false))
            }
            None => {
                let dest = if name == m.file_name {
                    m.path.clone()
                } else {
                    unique_dest(parent, name, &mut self.used)
                };
                Ok((dest, true))
            }
        }
    }

    /// Copy (or in-place rename) without touching embedded metadata.
    fn transfer(
        &mut self,
        m: &MediaFile,
        name: &str,
        taken: Option<NaiveDateTime>,
    ) -> Result<PathBuf, ProcessError> {
        let src_mtime = mtime_of(&m.path);
        let (dest, in_place) = self.destination(m, name)?;
        if in_place {
            if dest != m.path {
                fs::rename(&m.path, &dest)?;
            }
        } else {
            fs::copy(&m.path, &dest)?;
            propagate_times(&dest, src_mtime, None, false);
        }
        propagate_times(&dest, None, taken, self.options.update_file_times);
        Ok(dest)
    }

    fn merge_image(
        &mut self,
        m: &MediaFile,
        meta: &SidecarMetadata,
    ) -> Result<FileRecord, ProcessError> {
        let fields = embed::build_fields(meta);
        if fields.is_empty() {
            log::debug!("sidecar for {} carries no usable fields", m.path.display());
            let dest = self.transfer(m, &m.file_name, None)?;
            return Ok(record(m, dest, Outcome::Copied));
        }

        let src_bytes = fs::read(&m.path)?;
        let blob = embed::render(&fields)?;
        let merged = jpeg::replace_exif(&src_bytes, &blob)?;

        let name = target_name(m, meta.taken, self.options.rename);
        let (dest, in_place) = self.destination(m, &name)?;
        if in_place {
            write_in_place(&m.path, &dest, &merged, self.options.backups)?;
        } else {
            fs::write(&dest, &merged)?;
        }
        propagate_times(&dest, None, meta.taken, self.options.update_file_times);
        Ok(record(m, dest, Outcome::Merged))
    }

    fn run_image(&mut self, m: &MediaFile) -> FileRecord {
        let result = match resolve_sidecar(&m.path) {
            None => self
                .transfer(m, &m.file_name, None)
                .map(|dest| record(m, dest, Outcome::Copied)),
            Some(sc) => match decode_sidecar(&sc) {
                Ok(meta) => self.merge_image(m, &meta),
                Err(e) => {
                    log::warn!("{e}; copying without merge");
                    self.transfer(m, &m.file_name, None)
                        .map(|dest| record(m, dest, Outcome::Copied))
                }
            },
        };
        result.unwrap_or_else(|e| errored(m, e))
    }

    /// Videos get no embedded-metadata rewrite: copy, propagate the sidecar
    /// timestamp to the file clock, and carry the thumbnail alongside under
    /// the same renamed base.
    fn run_video(&mut self, video: &MediaFile, thumbnail: Option<&MediaFile>) -> Vec<FileRecord> {
        let meta = resolve_sidecar(&video.path).and_then(|sc| match decode_sidecar(&sc) {
            Ok(meta) => Some(meta),
            Err(e) => {
                log::warn!("{e}; copying video without timestamp");
                None
            }
        });
        let taken = meta.as_ref().and_then(|m| m.taken);
        let video_name = target_name(video, taken, self.options.rename);

        let mut records = Vec::new();
        records.push(
            self.transfer(video, &video_name, taken)
                .map(|dest| record(video, dest, Outcome::VideoCopied))
                .unwrap_or_else(|e| errored(video, e)),
        );

        if let Some(thumb) = thumbnail {
            let thumb_name = sibling_name(&video_name, thumb);
            records.push(
                self.transfer(thumb, &thumb_name, taken)
                    .map(|dest| record(thumb, dest, Outcome::ThumbnailCopied))
                    .unwrap_or_else(|e| errored(thumb, e)),
            );
        }
        records
    }
}

/// The thumbnail follows the video's (possibly renamed) base, keeping its
/// own extension.
fn sibling_name(video_name: &str, thumb: &MediaFile) -> String {
    let base = Path::new(video_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(video_name);
    let ext = thumb
        .path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("jpg")
        .to_lowercase();
    format!("{base}.{ext}")
}

fn record(m: &MediaFile, dest: PathBuf, outcome: Outcome) -> FileRecord {
    FileRecord {
        source: m.path.clone(),
        dest: Some(dest),
        outcome,
    }
}

fn errored(m: &MediaFile, e: ProcessError) -> FileRecord {
    log::warn!("{}: {e}", m.path.display());
    FileRecord {
        source: m.path.clone(),
        dest: None,
        outcome: Outcome::Errored(e.to_string()),
    }
}

/// Run the per-file pipeline over the reconciled index, strictly in order.
/// Every failure is converted into an outcome record; nothing aborts the
/// batch.
pub fn process_all(
    files: &[MediaFile],
    options: &ProcessOptions,
    progress: &ThrottledProgress,
) -> Vec<FileRecord> {
    // Group by (folder, stem) so a video and its thumbnail travel together.
    let mut groups: BTreeMap<(PathBuf, String), Vec<&MediaFile>> = BTreeMap::new();
    for f in files {
        let parent = f.path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
        groups.entry((parent, f.stem.clone())).or_default().push(f);
    }

    let total = files.len() as u64;
    let mut done = 0u64;
    let mut ctx = Ctx {
        options,
        used: HashSet::new(),
    };
    let mut records = Vec::with_capacity(files.len());

    for members in groups.values() {
        let video = members.iter().copied().find(|m| m.class == ExtClass::Video);
        let images: Vec<&MediaFile> = members
            .iter()
            .copied()
            .filter(|m| m.class == ExtClass::Image)
            .collect();

        let mut produced = match video {
            Some(v) => {
                let mut recs = ctx.run_video(v, images.first().copied());
                // Any further same-stem images are ordinary photos.
                for extra in images.iter().skip(1) {
                    recs.push(ctx.run_image(extra));
                }
                recs
            }
            None => images.iter().map(|m| ctx.run_image(m)).collect(),
        };

        done += produced.len() as u64;
        if let Some(last) = produced.last() {
            progress.report("process", done, total, &last.source.display().to_string());
        }
        records.append(&mut produced);
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::scan_tree;
    use crate::DuplicateMode;
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

    const SIDECAR: &str = r#"{
        "description": "Eiffel Tower",
        "photoTakenTime": {"timestamp": "1702648110"},
        "geoData": {"latitude": 48.8566, "longitude": 2.3522}
    }"#;

    fn options(source: &Path, output: Option<PathBuf>, rename: bool) -> ProcessOptions {
        ProcessOptions {
            source: source.to_path_buf(),
            output,
            rename,
            backups: false,
            update_file_times: true,
            duplicate_policy: DuplicateMode::KeepAll,
        }
    }

    fn run(opts: &ProcessOptions) -> Vec<FileRecord> {
        let noop = |_: &str, _: u64, _: u64, _: &str| {};
        let progress = ThrottledProgress::new(&noop);
        let scan = scan_tree(&opts.source);
        process_all(&scan.media, opts, &progress)
    }

    #[test]
    fn test_merge_and_rename() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        fs::write(src.path().join("IMG_001.jpg"), tiny_jpeg()).unwrap();
        fs::write(src.path().join("IMG_001.jpg.json"), SIDECAR).unwrap();

        let opts = options(src.path(), Some(out.path().to_path_buf()), true);
        let records = run(&opts);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Outcome::Merged);

        let dest = records[0].dest.clone().unwrap();
        assert_eq!(
            dest.file_name().unwrap().to_str().unwrap(),
            "2023-12-15_IMG_001.jpg"
        );

        let bytes = fs::read(&dest).unwrap();
        let exif = jpeg::read_exif(&bytes).unwrap();
        let dt = exif
            .get_field(exif::Tag::DateTimeOriginal, exif::In::PRIMARY)
            .unwrap();
        let exif::Value::Ascii(text) = &dt.value else {
            panic!("expected ASCII datetime");
        };
        assert_eq!(text[0], b"2023:12:15 13:48:30");
        let (lat, lon) = embed::gps_decimal(&exif).unwrap();
        assert!((lat - 48.8566).abs() <= 1.0 / 3600.0);
        assert!((lon - 2.3522).abs() <= 1.0 / 3600.0);

        // File clock follows the capture time.
        let meta = fs::metadata(&dest).unwrap();
        let mtime = filetime::FileTime::from_last_modification_time(&meta);
        assert_eq!(mtime.unix_seconds(), 1702648110);
    }

    #[test]
    fn test_no_sidecar_falls_back_to_copy() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        fs::write(src.path().join("IMG_002.jpg"), tiny_jpeg()).unwrap();

        let opts = options(src.path(), Some(out.path().to_path_buf()), true);
        let records = run(&opts);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Outcome::Copied);
        let dest = records[0].dest.clone().unwrap();
        assert_eq!(dest.file_name().unwrap().to_str().unwrap(), "IMG_002.jpg");
        assert!(dest.is_file());
    }

    #[test]
    fn test_malformed_sidecar_falls_back_to_copy() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        fs::write(src.path().join("IMG_003.jpg"), tiny_jpeg()).unwrap();
        fs::write(src.path().join("IMG_003.jpg.json"), b"{broken").unwrap();

        let opts = options(src.path(), Some(out.path().to_path_buf()), false);
        let records = run(&opts);
        assert_eq!(records[0].outcome, Outcome::Copied);
    }

    #[test]
    fn test_video_with_thumbnail() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        fs::write(src.path().join("VID_001.mp4"), b"not really a video").unwrap();
        fs::write(src.path().join("VID_001.jpg"), tiny_jpeg()).unwrap();
        fs::write(
            src.path().join("VID_001.mp4.supplemental-metadata.json"),
            SIDECAR,
        )
        .unwrap();

        let opts = options(src.path(), Some(out.path().to_path_buf()), true);
        let mut outcomes: Vec<(String, Outcome)> = run(&opts)
            .into_iter()
            .map(|r| {
                (
                    r.dest
                        .unwrap()
                        .file_name()
                        .unwrap()
                        .to_string_lossy()
                        .into_owned(),
                    r.outcome,
                )
            })
            .collect();
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            outcomes,
            vec![
                ("2023-12-15_VID_001.jpg".to_string(), Outcome::ThumbnailCopied),
                ("2023-12-15_VID_001.mp4".to_string(), Outcome::VideoCopied),
            ]
        );

        let video_dest = out.path().join("2023-12-15_VID_001.mp4");
        let meta = fs::metadata(video_dest).unwrap();
        let mtime = filetime::FileTime::from_last_modification_time(&meta);
        assert_eq!(mtime.unix_seconds(), 1702648110);
    }

    #[test]
    fn test_rename_is_idempotent() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        fs::write(src.path().join("2023-12-15_IMG_001.jpg"), tiny_jpeg()).unwrap();
        fs::write(src.path().join("2023-12-15_IMG_001.jpg.json"), SIDECAR).unwrap();

        let opts = options(src.path(), Some(out.path().to_path_buf()), true);
        let records = run(&opts);
        assert_eq!(records[0].outcome, Outcome::Merged);
        let dest = records[0].dest.clone().unwrap();
        assert_eq!(
            dest.file_name().unwrap().to_str().unwrap(),
            "2023-12-15_IMG_001.jpg"
        );
    }

    #[test]
    fn test_in_place_merge_is_stable() {
        let src = tempdir().unwrap();
        let path = src.path().join("IMG_001.jpg");
        fs::write(&path, tiny_jpeg()).unwrap();
        fs::write(src.path().join("IMG_001.jpg.json"), SIDECAR).unwrap();

        let opts = options(src.path(), None, false);
        let records = run(&opts);
        assert_eq!(records[0].outcome, Outcome::Merged);
        assert_eq!(records[0].dest.clone().unwrap(), path);
        let first = fs::read(&path).unwrap();

        let records = run(&opts);
        assert_eq!(records[0].outcome, Outcome::Merged);
        let second = fs::read(&path).unwrap();
        assert_eq!(first, second);
        assert!(!backup_path(&path).exists());
    }

    #[test]
    fn test_unreadable_source_is_per_file_error() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        fs::write(src.path().join("IMG_001.jpg.json"), SIDECAR).unwrap();
        // Sidecar present but the media file is a dangling record.
        let media = MediaFile::new(src.path().join("IMG_001.jpg"), ExtClass::Image);

        let opts = options(src.path(), Some(out.path().to_path_buf()), false);
        let noop = |_: &str, _: u64, _: u64, _: &str| {};
        let progress = ThrottledProgress::new(&noop);
        let records = process_all(&[media], &opts, &progress);
        assert!(matches!(records[0].outcome, Outcome::Errored(_)));
    }

    #[test]
    fn test_sanitize_stem() {
        assert_eq!(sanitize_stem("My Photo (1)"), "My_Photo_1");
        assert_eq!(
            sanitize_stem("a_very_long_name_that_exceeds_the_thirty_char_cap"),
            "a_very_long_name_that_exceeds_"
        );
        assert_eq!(sanitize_stem("café du port"), "café_du_port");
    }

    #[test]
    fn test_unique_dest_counters() {
        let dir = PathBuf::from("/out");
        let mut used = HashSet::new();
        assert_eq!(unique_dest(&dir, "a.jpg", &mut used), dir.join("a.jpg"));
        assert_eq!(unique_dest(&dir, "a.jpg", &mut used), dir.join("a(1).jpg"));
        assert_eq!(unique_dest(&dir, "a.jpg", &mut used), dir.join("a(2).jpg"));
    }
}
