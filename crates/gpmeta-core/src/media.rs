use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use walkdir::WalkDir;

static DUP_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(.*)\((\d+)\)$").unwrap());

/// Extension class of a discovered media file. Thumbnails are images that
/// turn out to share a stem with a video; they are reclassified during
/// grouping, not at scan time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtClass {
    Image,
    Video,
}

#[derive(Debug, Clone)]
pub struct MediaFile {
    pub path: PathBuf,
    /// Just the filename
    pub file_name: String,
    /// Filename without extension
    pub stem: String,
    pub class: ExtClass,
}

impl MediaFile {
    pub fn new(path: PathBuf, class: ExtClass) -> Self {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        Self {
            path,
            file_name,
            stem,
            class,
        }
    }

    /// Duplicate-identity base: the stem with a trailing `(n)` duplicate
    /// marker removed, so `IMG_001.jpg` and `IMG_001(1).jpg` collide.
    pub fn identity_base(&self) -> String {
        strip_dup_marker(&self.stem).to_string()
    }

    /// The `(n)` duplicate marker, if the stem carries one.
    pub fn dup_marker(&self) -> Option<u32> {
        DUP_MARKER_RE
            .captures(&self.stem)
            .and_then(|c| c.get(2))
            .and_then(|m| m.as_str().parse().ok())
    }
}

pub fn strip_dup_marker(stem: &str) -> &str {
    match DUP_MARKER_RE.captures(stem) {
        Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or(stem),
        None => stem,
    }
}

/// Classify a filename by extension. Only the two supported containers are
/// media; everything else is None.
pub fn classify(file_name: &str) -> Option<ExtClass> {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())?;
    match ext.as_str() {
        "jpg" | "jpeg" => Some(ExtClass::Image),
        "mp4" => Some(ExtClass::Video),
        _ => None,
    }
}

/// Result of scanning the source tree.
pub struct ScanResult {
    pub media: Vec<MediaFile>,
    pub dirs_scanned: u64,
    /// Files that look like media (image/* or video/* mime) but are not one
    /// of the two supported containers.
    pub unsupported_skipped: u64,
}

/// Walk the source tree and collect supported media files. Sidecar JSON
/// files are located on demand by the resolver, not indexed here.
pub fn scan_tree(root: &Path) -> ScanResult {
    let mut media = Vec::new();
    let mut dirs_scanned = 0u64;
    let mut unsupported_skipped = 0u64;

    for entry in WalkDir::new(root).sort_by_file_name() {
        let Ok(entry) = entry else {
            continue;
        };
        if entry.file_type().is_dir() {
            dirs_scanned += 1;
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy();
        if file_name.ends_with(".json") {
            continue;
        }

        match classify(&file_name) {
            Some(class) => media.push(MediaFile::new(entry.path().to_path_buf(), class)),
            None => {
                let looks_like_media = mime_guess::from_path(entry.path())
                    .first()
                    .map_or(false, |m| {
                        m.type_() == mime_guess::mime::IMAGE || m.type_() == mime_guess::mime::VIDEO
                    });
                if looks_like_media {
                    unsupported_skipped += 1;
                    log::debug!("skipping unsupported media format: {}", entry.path().display());
                }
            }
        }
    }

    ScanResult {
        media,
        dirs_scanned,
        unsupported_skipped,
    }
}
