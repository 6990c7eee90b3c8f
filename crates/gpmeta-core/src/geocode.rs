use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::GeocodeError;
use crate::media::{classify, ExtClass};
use crate::processor::write_in_place;
use crate::{embed, jpeg, ThrottledProgress};

pub const NOMINATIM_ENDPOINT: &str = "https://nominatim.openstreetmap.org/reverse";

/// Minimum delay between outbound reverse-geocoding calls. Cache hits and
/// pre-existing detections are not throttled.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Coordinate-to-place cache, keyed at 3 decimal places (~110 m). A `None`
/// value is the unresolved marker: a lookup that failed once is not retried
/// within the run.
pub struct GeoCache {
    entries: HashMap<String, Option<String>>,
    dirty: bool,
}

impl GeoCache {
    pub fn key(lat: f64, lon: f64) -> String {
        format!("{lat:.3},{lon:.3}")
    }

    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
            dirty: false,
        }
    }

    /// Load a persisted cache. A missing or corrupt store is an empty cache,
    /// never a startup failure.
    pub fn load(path: &Path) -> Self {
        let Ok(file) = File::open(path) else {
            return Self::empty();
        };
        match serde_json::from_reader(BufReader::new(file)) {
            Ok(entries) => Self {
                entries,
                dirty: false,
            },
            Err(e) => {
                log::warn!(
                    "geocode cache {} is corrupt ({e}); starting with an empty cache",
                    path.display()
                );
                Self::empty()
            }
        }
    }

    /// Persist atomically: write a temp file next to the store, then rename.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if !self.dirty && path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp = path.with_extension("tmp");
        let file = File::create(&temp)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.entries)?;
        fs::rename(&temp, path)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Option<String>> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: String, value: Option<String>) {
        self.entries.insert(key, value);
        self.dirty = true;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Place {
    pub city: String,
    pub country: String,
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.city, self.country)
    }
}

/// Seam for the external lookup so the pass is testable offline.
pub trait ReverseGeocoder {
    fn reverse(&self, lat: f64, lon: f64) -> Result<Place, GeocodeError>;
}

#[derive(Deserialize)]
struct NominatimResponse {
    address: Option<NominatimAddress>,
}

#[derive(Deserialize, Default)]
struct NominatimAddress {
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    country: Option<String>,
}

/// Reverse geocoding against the OpenStreetMap Nominatim service.
pub struct NominatimClient {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl NominatimClient {
    pub fn new() -> Result<Self, GeocodeError> {
        Self::with_endpoint(NOMINATIM_ENDPOINT.to_string())
    }

    pub fn with_endpoint(endpoint: String) -> Result<Self, GeocodeError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("gpmeta-rs/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client, endpoint })
    }
}

impl ReverseGeocoder for NominatimClient {
    fn reverse(&self, lat: f64, lon: f64) -> Result<Place, GeocodeError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("format", "json".to_string()),
                ("addressdetails", "1".to_string()),
                ("zoom", "10".to_string()),
            ])
            .send()?;
        if !response.status().is_success() {
            return Err(GeocodeError::Network(format!("HTTP {}", response.status())));
        }
        let body: NominatimResponse = response
            .json()
            .map_err(|e| GeocodeError::Parse(e.to_string()))?;
        let address = body
            .address
            .ok_or_else(|| GeocodeError::Parse("response has no address block".into()))?;
        let city = address
            .city
            .or(address.town)
            .or(address.village)
            .unwrap_or_default();
        let country = address.country.unwrap_or_default();
        if city.is_empty() || country.is_empty() {
            return Err(GeocodeError::Parse(
                "address has no locality or country".into(),
            ));
        }
        Ok(Place { city, country })
    }
}

/// Fixed-interval throttle for outbound calls only.
pub struct RateLimiter {
    min_interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    /// Block until the interval since the previous outbound call has passed.
    pub fn wait(&mut self) {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                std::thread::sleep(self.min_interval - elapsed);
            }
        }
        self.last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct GeocodeOptions {
    /// Tree of already-processed files to enrich.
    pub root: PathBuf,
    pub cache_path: PathBuf,
    /// Write resolved place names back into the files' GPSAreaInformation.
    pub write_back: bool,
    pub backups: bool,
    pub min_interval: Duration,
}

impl GeocodeOptions {
    pub fn new(root: PathBuf, cache_path: PathBuf) -> Self {
        Self {
            root,
            cache_path,
            write_back: false,
            backups: true,
            min_interval: DEFAULT_MIN_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GeocodeReport {
    pub files_scanned: u64,
    pub files_with_gps: u64,
    pub cache_hits: u64,
    pub pre_existing: u64,
    pub network_resolved: u64,
    pub unresolved: u64,
    pub files_written: u64,
    pub errors: u64,
}

/// Enrichment pass over already-processed images: read embedded GPS, decide
/// between pre-existing text, cache, and a rate-limited network lookup, and
/// optionally write the place name back. Per-lookup failures are cached as
/// unresolved and never abort the pass.
pub fn run_geocode_pass(
    options: &GeocodeOptions,
    geocoder: &dyn ReverseGeocoder,
    progress: &ThrottledProgress,
) -> anyhow::Result<GeocodeReport> {
    let images: Vec<PathBuf> = WalkDir::new(&options.root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| classify(&e.file_name().to_string_lossy()) == Some(ExtClass::Image))
        .map(|e| e.path().to_path_buf())
        .collect();

    let mut cache = GeoCache::load(&options.cache_path);
    let mut limiter = RateLimiter::new(options.min_interval);
    let mut report = GeocodeReport::default();
    let total = images.len() as u64;

    for (i, path) in images.iter().enumerate() {
        progress.report("geocode", i as u64, total, &path.display().to_string());
        report.files_scanned += 1;

        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                log::warn!("{}: {e}", path.display());
                report.errors += 1;
                continue;
            }
        };
        let Some(exif) = jpeg::read_exif(&bytes) else {
            continue;
        };
        let Some((lat, lon)) = embed::gps_decimal(&exif) else {
            continue;
        };
        report.files_with_gps += 1;
        let key = GeoCache::key(lat, lon);

        // Files that already carry a place name resolve without a lookup;
        // their text seeds the cache for neighbors in the same bucket.
        if let Some(existing) = embed::area_information(&exif) {
            report.pre_existing += 1;
            if cache.get(&key).is_none() {
                cache.insert(key, Some(existing));
            }
            continue;
        }

        let place_text = match cache.get(&key) {
            Some(cached) => {
                report.cache_hits += 1;
                cached.clone()
            }
            None => {
                limiter.wait();
                match geocoder.reverse(lat, lon) {
                    Ok(place) => {
                        let text = place.to_string();
                        log::info!("{:.3},{:.3} -> {text}", lat, lon);
                        report.network_resolved += 1;
                        cache.insert(key, Some(text.clone()));
                        Some(text)
                    }
                    Err(e) => {
                        log::warn!("reverse geocoding {:.3},{:.3} failed: {e}", lat, lon);
                        report.unresolved += 1;
                        cache.insert(key, None);
                        None
                    }
                }
            }
        };

        if options.write_back {
            if let Some(text) = place_text {
                match write_place_name(path, &bytes, &exif, &text, options.backups) {
                    Ok(()) => report.files_written += 1,
                    Err(e) => {
                        log::warn!("{}: {e}", path.display());
                        report.errors += 1;
                    }
                }
            }
        }
    }

    cache.save(&options.cache_path)?;
    progress.report("geocode", total, total, "geocoding pass complete");
    Ok(report)
}

/// Rebuild the file's EXIF block with GPSAreaInformation added, keeping the
/// existing fields.
fn write_place_name(
    path: &Path,
    bytes: &[u8],
    exif: &exif::Exif,
    text: &str,
    backups: bool,
) -> Result<(), crate::error::ProcessError> {
    let mut fields = embed::carry_over_fields(exif);
    fields.push(embed::area_information_field(text));
    let blob = embed::render(&fields)?;
    let updated = jpeg::replace_exif(bytes, &blob)?;
    write_in_place(path, path, &updated, backups)
}
