use std::io::Cursor;

use crate::error::ProcessError;

const SOI: [u8; 2] = [0xFF, 0xD8];
const APP1: u8 = 0xE1;
const SOS: u8 = 0xDA;
const EOI: u8 = 0xD9;
const EXIF_HEADER: &[u8] = b"Exif\0\0";

// Segment length is a u16 that includes its own two bytes.
const MAX_SEGMENT_PAYLOAD: usize = 0xFFFF - 2;

/// Parse the EXIF block out of in-memory JPEG bytes.
pub fn read_exif(bytes: &[u8]) -> Option<exif::Exif> {
    exif::Reader::new()
        .read_from_container(&mut Cursor::new(bytes))
        .ok()
}

/// Rebuild a JPEG with `exif_blob` as its only EXIF APP1 segment: any
/// existing `Exif\0\0` APP1 is dropped and the new segment goes directly
/// after SOI. Splicing the same blob twice is byte-stable.
pub fn replace_exif(jpeg: &[u8], exif_blob: &[u8]) -> Result<Vec<u8>, ProcessError> {
    if jpeg.len() < 2 || jpeg[..2] != SOI {
        return Err(ProcessError::Encoding("not a JPEG stream".into()));
    }
    let payload_len = EXIF_HEADER.len() + exif_blob.len();
    if payload_len > MAX_SEGMENT_PAYLOAD {
        return Err(ProcessError::Encoding(format!(
            "EXIF block of {} bytes exceeds the APP1 segment limit",
            exif_blob.len()
        )));
    }

    let mut out = Vec::with_capacity(jpeg.len() + payload_len + 4);
    out.extend_from_slice(&SOI);
    out.extend_from_slice(&[0xFF, APP1]);
    out.extend_from_slice(&((payload_len + 2) as u16).to_be_bytes());
    out.extend_from_slice(EXIF_HEADER);
    out.extend_from_slice(exif_blob);

    let mut pos = 2;
    loop {
        // Skip fill bytes before a marker.
        while pos + 1 < jpeg.len() && jpeg[pos] == 0xFF && jpeg[pos + 1] == 0xFF {
            pos += 1;
        }
        if pos + 1 >= jpeg.len() {
            return Err(ProcessError::Encoding("truncated JPEG stream".into()));
        }
        if jpeg[pos] != 0xFF {
            return Err(ProcessError::Encoding("bad JPEG marker alignment".into()));
        }
        let marker = jpeg[pos + 1];

        match marker {
            // Entropy-coded data follows SOS; copy the remainder verbatim.
            SOS => {
                out.extend_from_slice(&jpeg[pos..]);
                return Ok(out);
            }
            EOI => {
                out.extend_from_slice(&jpeg[pos..pos + 2]);
                return Ok(out);
            }
            // Standalone markers carry no length field.
            0x01 | 0xD0..=0xD7 => {
                out.extend_from_slice(&jpeg[pos..pos + 2]);
                pos += 2;
            }
            _ => {
                if pos + 4 > jpeg.len() {
                    return Err(ProcessError::Encoding("truncated JPEG segment".into()));
                }
                let len = u16::from_be_bytes([jpeg[pos + 2], jpeg[pos + 3]]) as usize;
                let end = pos + 2 + len;
                if len < 2 || end > jpeg.len() {
                    return Err(ProcessError::Encoding("bad JPEG segment length".into()));
                }
                let is_old_exif =
                    marker == APP1 && jpeg[pos + 4..end].starts_with(EXIF_HEADER);
                if !is_old_exif {
                    out.extend_from_slice(&jpeg[pos..end]);
                }
                pos = end;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed;
    use crate::sidecar::{GeoPoint, SidecarMetadata};
    use exif::{In, Tag};

    /// Smallest JPEG the segment parser and kamadak-exif both accept:
    /// SOI, JFIF APP0, an empty SOS, EOI.
    fn tiny_jpeg() -> Vec<u8> {
        let mut v = vec![0xFF, 0xD8];
        v.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
        v.extend_from_slice(b"JFIF\0");
        v.extend_from_slice(&[0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00]);
        v.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x02]);
        v.extend_from_slice(&[0xFF, 0xD9]);
        v
    }

    fn sample_meta() -> SidecarMetadata {
        SidecarMetadata {
            taken: chrono::DateTime::from_timestamp(1702648110, 0).map(|d| d.naive_utc()),
            gps: Some(GeoPoint {
                lat: 48.8566,
                lon: 2.3522,
                alt: None,
            }),
            description: Some("Eiffel Tower".into()),
            title: None,
            people: vec![],
        }
    }

    #[test]
    fn test_splice_and_read_back() {
        let blob = embed::render(&embed::build_fields(&sample_meta())).unwrap();
        let spliced = replace_exif(&tiny_jpeg(), &blob).unwrap();

        let exif = read_exif(&spliced).expect("spliced EXIF should parse");
        let taken = exif.get_field(Tag::DateTimeOriginal, In::PRIMARY).unwrap();
        let exif::Value::Ascii(text) = &taken.value else {
            panic!("DateTimeOriginal should be ASCII");
        };
        assert_eq!(text[0], b"2023:12:15 13:48:30");

        let (lat, lon) = embed::gps_decimal(&exif).unwrap();
        assert!((lat - 48.8566).abs() <= 1.0 / 3600.0);
        assert!((lon - 2.3522).abs() <= 1.0 / 3600.0);

        // The non-EXIF segments survive.
        assert_eq!(&spliced[spliced.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn test_splice_is_idempotent() {
        let blob = embed::render(&embed::build_fields(&sample_meta())).unwrap();
        let once = replace_exif(&tiny_jpeg(), &blob).unwrap();
        let twice = replace_exif(&once, &blob).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_splice_rejects_non_jpeg() {
        assert!(replace_exif(b"PNG...", b"").is_err());
        assert!(replace_exif(&[0xFF, 0xD8, 0xFF], b"").is_err());
    }

    #[test]
    fn test_splice_rejects_oversized_blob() {
        let blob = vec![0u8; 0x10000];
        assert!(replace_exif(&tiny_jpeg(), &blob).is_err());
    }
}
