use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde_json::Value;

use crate::error::ProcessError;
use crate::media::strip_dup_marker;

/// Google caps exported sidecar filenames at this many characters; longer
/// media names are cut before the `.json` suffix is appended.
const MAX_JSON_NAME: usize = 51;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
    pub alt: Option<f64>,
}

/// Normalized sidecar content. Every field is optional; absence is never an
/// error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SidecarMetadata {
    pub taken: Option<NaiveDateTime>,
    pub gps: Option<GeoPoint>,
    pub description: Option<String>,
    pub title: Option<String>,
    pub people: Vec<String>,
}

/// Locate the sidecar for a media file, trying the known suffix conventions
/// in order, then Google's truncated-name variants, then the bracket-swapped
/// variants used for `(n)` numbered duplicates. `None` means no sidecar;
/// the caller falls back to a plain copy.
pub fn resolve_sidecar(media_path: &Path) -> Option<PathBuf> {
    let dir = media_path.parent()?;
    let file_name = media_path.file_name()?.to_str()?;

    for name in sidecar_candidates(file_name) {
        let candidate = dir.join(&name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Candidate sidecar filenames for a media filename, most specific first.
pub fn sidecar_candidates(file_name: &str) -> Vec<String> {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    let mut names = vec![
        format!("{file_name}.json"),
        format!("{file_name}.supplemental-metadata.json"),
        format!("{stem}.sup.json"),
        format!("{stem}.mp4.supplemental-metadata.json"),
    ];

    // Truncated variants: the part before ".json" is cut so the whole
    // sidecar name fits the export limit.
    let truncated: Vec<String> = names.iter().filter_map(|n| truncate_json_name(n)).collect();
    names.extend(truncated);

    // Numbered duplicates: `IMG(1).jpg` gets `IMG.jpg(1).json`, the marker
    // hopping over the extension and suffix.
    let base = strip_dup_marker(stem);
    if base != stem {
        let marker = &stem[base.len()..];
        names.push(format!("{base}.{ext}{marker}.json"));
        names.push(format!("{base}.{ext}.supplemental-metadata{marker}.json"));
    }

    names.dedup();
    names
}

fn truncate_json_name(name: &str) -> Option<String> {
    if name.len() <= MAX_JSON_NAME {
        return None;
    }
    let base = name.strip_suffix(".json")?;
    let mut end = MAX_JSON_NAME - ".json".len();
    while end > 0 && !base.is_char_boundary(end) {
        end -= 1;
    }
    Some(format!("{}.json", &base[..end]))
}

/// Parse a sidecar file into a normalized record. Fails only when the file
/// cannot be read or is not JSON; missing keys decode as absent fields.
pub fn decode_sidecar(path: &Path) -> Result<SidecarMetadata, ProcessError> {
    let bytes = fs::read(path).map_err(|e| ProcessError::MalformedSidecar {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let data: Value =
        serde_json::from_slice(&bytes).map_err(|e| ProcessError::MalformedSidecar {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let taken = epoch_field(&data, "photoTakenTime")
        .or_else(|| epoch_field(&data, "creationTime"))
        .and_then(|epoch| chrono::DateTime::from_timestamp(epoch, 0))
        .map(|dt| dt.naive_utc())
        .or_else(|| formatted_field(&data, "photoTakenTime"));

    let gps = geo_field(&data, "geoData").or_else(|| geo_field(&data, "geoDataExif"));

    let people = data
        .get("people")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|p| p.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(SidecarMetadata {
        taken,
        gps,
        description: text_field(&data, "description"),
        title: text_field(&data, "title"),
        people,
    })
}

/// Epoch seconds from `<key>.timestamp`, tolerating both string and integer
/// encodings (Google uses strings; older exports used numbers).
fn epoch_field(data: &Value, key: &str) -> Option<i64> {
    let ts = data.get(key)?.get("timestamp")?;
    match ts {
        Value::String(s) => s.parse().ok(),
        _ => ts.as_i64(),
    }
}

/// Fallback: the human-readable `<key>.formatted` string, e.g.
/// "Dec 15, 2023, 1:48:30 PM UTC". Newer exports separate the time with a
/// narrow no-break space.
fn formatted_field(data: &Value, key: &str) -> Option<NaiveDateTime> {
    let raw = data.get(key)?.get("formatted")?.as_str()?;
    let cleaned: String = raw
        .chars()
        .map(|c| if c == '\u{202f}' || c == '\u{a0}' { ' ' } else { c })
        .collect();
    for fmt in ["%b %d, %Y, %I:%M:%S %p UTC", "%b %d, %Y, %I:%M:%S %p"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(cleaned.trim(), fmt) {
            return Some(dt);
        }
    }
    None
}

fn text_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// GPS pair from a nested geo object. All-zero and out-of-range pairs are
/// treated as "no GPS data", not as an error.
fn geo_field(data: &Value, key: &str) -> Option<GeoPoint> {
    let geo = data.get(key)?;
    let lat = geo.get("latitude").and_then(Value::as_f64)?;
    let lon = geo.get("longitude").and_then(Value::as_f64)?;
    if !lat.is_finite() || !lon.is_finite() {
        return None;
    }
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }
    if lat == 0.0 && lon == 0.0 {
        return None;
    }
    let alt = geo
        .get("altitude")
        .and_then(Value::as_f64)
        .filter(|a| a.is_finite() && *a != 0.0);
    Some(GeoPoint { lat, lon, alt })
}
