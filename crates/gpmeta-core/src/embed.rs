use chrono::NaiveDateTime;
use exif::experimental::Writer;
use exif::{Context, Field, In, Rational, Tag, Value};

use crate::error::ProcessError;
use crate::sidecar::SidecarMetadata;

// Windows XP* tags carry UTF-16LE bytes in the 0th IFD. kamadak-exif has no
// named constants for them.
const XP_TITLE: Tag = Tag(Context::Tiff, 0x9c9b);
const XP_KEYWORDS: Tag = Tag(Context::Tiff, 0x9c9e);

// Pointer and offset tags are structural; they must not be carried over
// when an existing block is rebuilt.
const STRUCTURAL_TAGS: &[u16] = &[0x8769, 0x8825, 0xa005, 0x0111, 0x0117, 0x0201, 0x0202];

/// Canonical EXIF date-time text form.
pub fn exif_datetime(dt: NaiveDateTime) -> String {
    dt.format("%Y:%m:%d %H:%M:%S").to_string()
}

/// Decimal degrees (non-negative) to the rational degrees/minutes/seconds
/// triple, seconds carried at 1/100 precision.
pub fn to_dms(value: f64) -> [Rational; 3] {
    let deg = value as u32;
    let min_float = (value - deg as f64) * 60.0;
    let min = min_float as u32;
    let centi_sec = ((min_float - min as f64) * 60.0 * 100.0) as u32;
    [
        Rational { num: deg, denom: 1 },
        Rational { num: min, denom: 1 },
        Rational {
            num: centi_sec,
            denom: 100,
        },
    ]
}

/// Inverse of `to_dms` with the hemisphere reference applied.
pub fn dms_to_decimal(dms: &[Rational], reference: &str) -> Option<f64> {
    if dms.len() < 3 {
        return None;
    }
    let part = |r: &Rational| {
        if r.denom == 0 {
            0.0
        } else {
            r.num as f64 / r.denom as f64
        }
    };
    let decimal = part(&dms[0]) + part(&dms[1]) / 60.0 + part(&dms[2]) / 3600.0;
    Some(match reference {
        "S" | "W" => -decimal,
        _ => decimal,
    })
}

fn ascii_field(tag: Tag, text: &str) -> Field {
    Field {
        tag,
        ifd_num: In::PRIMARY,
        value: Value::Ascii(vec![text.as_bytes().to_vec()]),
    }
}

fn utf16le_field(tag: Tag, text: &str) -> Field {
    let bytes: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
    Field {
        tag,
        ifd_num: In::PRIMARY,
        value: Value::Byte(bytes),
    }
}

/// Assemble the embedded-metadata block for a decoded sidecar. Pure
/// transformation; fields that cannot be represented are simply omitted.
pub fn build_fields(meta: &SidecarMetadata) -> Vec<Field> {
    let mut fields = Vec::new();

    if let Some(dt) = meta.taken {
        let text = exif_datetime(dt);
        for tag in [Tag::DateTimeOriginal, Tag::DateTimeDigitized, Tag::DateTime] {
            fields.push(ascii_field(tag, &text));
        }
    }

    if let Some(gps) = meta.gps {
        fields.push(ascii_field(
            Tag::GPSLatitudeRef,
            if gps.lat >= 0.0 { "N" } else { "S" },
        ));
        fields.push(Field {
            tag: Tag::GPSLatitude,
            ifd_num: In::PRIMARY,
            value: Value::Rational(to_dms(gps.lat.abs()).to_vec()),
        });
        fields.push(ascii_field(
            Tag::GPSLongitudeRef,
            if gps.lon >= 0.0 { "E" } else { "W" },
        ));
        fields.push(Field {
            tag: Tag::GPSLongitude,
            ifd_num: In::PRIMARY,
            value: Value::Rational(to_dms(gps.lon.abs()).to_vec()),
        });
        if let Some(alt) = gps.alt {
            fields.push(Field {
                tag: Tag::GPSAltitudeRef,
                ifd_num: In::PRIMARY,
                value: Value::Byte(vec![if alt >= 0.0 { 0 } else { 1 }]),
            });
            fields.push(Field {
                tag: Tag::GPSAltitude,
                ifd_num: In::PRIMARY,
                value: Value::Rational(vec![Rational {
                    num: (alt.abs() * 100.0) as u32,
                    denom: 100,
                }]),
            });
        }
    }

    if let Some(desc) = &meta.description {
        fields.push(ascii_field(Tag::ImageDescription, desc));
    }
    if let Some(title) = &meta.title {
        fields.push(utf16le_field(XP_TITLE, title));
    }
    if !meta.people.is_empty() {
        fields.push(utf16le_field(XP_KEYWORDS, &meta.people.join(", ")));
    }

    fields
}

/// Render a field set into a raw EXIF (TIFF) blob.
pub fn render(fields: &[Field]) -> Result<Vec<u8>, ProcessError> {
    let mut writer = Writer::new();
    for field in fields {
        writer.push_field(field);
    }
    let mut cursor = std::io::Cursor::new(Vec::new());
    writer
        .write(&mut cursor, false)
        .map_err(|e| ProcessError::Encoding(e.to_string()))?;
    Ok(cursor.into_inner())
}

fn ascii_text(field: &Field) -> Option<String> {
    match &field.value {
        Value::Ascii(v) => v
            .first()
            .map(|b| String::from_utf8_lossy(b).trim().to_string()),
        _ => None,
    }
}

fn rationals(exif: &exif::Exif, tag: Tag) -> Option<Vec<Rational>> {
    match &exif.get_field(tag, In::PRIMARY)?.value {
        Value::Rational(v) => Some(v.clone()),
        _ => None,
    }
}

/// Read the decimal GPS pair back out of an embedded block.
pub fn gps_decimal(exif: &exif::Exif) -> Option<(f64, f64)> {
    let lat_ref = ascii_text(exif.get_field(Tag::GPSLatitudeRef, In::PRIMARY)?)?;
    let lon_ref = ascii_text(exif.get_field(Tag::GPSLongitudeRef, In::PRIMARY)?)?;
    let lat = dms_to_decimal(&rationals(exif, Tag::GPSLatitude)?, &lat_ref)?;
    let lon = dms_to_decimal(&rationals(exif, Tag::GPSLongitude)?, &lon_ref)?;
    Some((lat, lon))
}

/// Existing place-name text, if the block already carries one.
pub fn area_information(exif: &exif::Exif) -> Option<String> {
    let field = exif.get_field(Tag::GPSAreaInformation, In::PRIMARY)?;
    let bytes = match &field.value {
        Value::Undefined(b, _) => b.as_slice(),
        Value::Ascii(v) => v.first()?.as_slice(),
        _ => return None,
    };
    let text = String::from_utf8_lossy(bytes).trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Place-name field for the geocode write-back.
pub fn area_information_field(text: &str) -> Field {
    Field {
        tag: Tag::GPSAreaInformation,
        ifd_num: In::PRIMARY,
        value: Value::Undefined(text.as_bytes().to_vec(), 0),
    }
}

/// Owned copies of the primary-IFD fields of an existing block, minus the
/// structural tags the writer regenerates. Used when a block is rebuilt to
/// add fields without losing the rest.
pub fn carry_over_fields(exif: &exif::Exif) -> Vec<Field> {
    exif.fields()
        .filter(|f| f.ifd_num == In::PRIMARY)
        .filter(|f| !STRUCTURAL_TAGS.contains(&f.tag.number()))
        .filter_map(|f| {
            clone_value(&f.value).map(|value| Field {
                tag: f.tag,
                ifd_num: f.ifd_num,
                value,
            })
        })
        .collect()
}

fn clone_value(v: &Value) -> Option<Value> {
    Some(match v {
        Value::Byte(v) => Value::Byte(v.clone()),
        Value::Ascii(v) => Value::Ascii(v.clone()),
        Value::Short(v) => Value::Short(v.clone()),
        Value::Long(v) => Value::Long(v.clone()),
        Value::Rational(v) => Value::Rational(v.clone()),
        Value::SByte(v) => Value::SByte(v.clone()),
        Value::Undefined(v, o) => Value::Undefined(v.clone(), *o),
        Value::SShort(v) => Value::SShort(v.clone()),
        Value::SLong(v) => Value::SLong(v.clone()),
        Value::SRational(v) => Value::SRational(v.clone()),
        Value::Float(v) => Value::Float(v.clone()),
        Value::Double(v) => Value::Double(v.clone()),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sidecar::GeoPoint;

    #[test]
    fn test_exif_datetime_from_epoch() {
        let dt = chrono::DateTime::from_timestamp(1702648110, 0).unwrap().naive_utc();
        assert_eq!(exif_datetime(dt), "2023:12:15 13:48:30");
    }

    #[test]
    fn test_dms_round_trip() {
        for &(lat, lon) in &[
            (48.8566f64, 2.3522f64),
            (-33.8688, 151.2093),
            (0.0, 2.35),
            (89.9999, -179.9999),
        ] {
            let lat_back =
                dms_to_decimal(&to_dms(lat.abs()), if lat >= 0.0 { "N" } else { "S" }).unwrap();
            let lon_back =
                dms_to_decimal(&to_dms(lon.abs()), if lon >= 0.0 { "E" } else { "W" }).unwrap();
            // Tolerance: one arc-second.
            assert!((lat_back - lat).abs() <= 1.0 / 3600.0, "lat {lat} -> {lat_back}");
            assert!((lon_back - lon).abs() <= 1.0 / 3600.0, "lon {lon} -> {lon_back}");
        }
    }

    #[test]
    fn test_build_fields_references() {
        let meta = SidecarMetadata {
            gps: Some(GeoPoint {
                lat: -33.8688,
                lon: 151.2093,
                alt: None,
            }),
            ..Default::default()
        };
        let fields = build_fields(&meta);
        let text_of = |tag: Tag| {
            fields
                .iter()
                .find(|f| f.tag == tag)
                .and_then(ascii_text)
                .unwrap()
        };
        assert_eq!(text_of(Tag::GPSLatitudeRef), "S");
        assert_eq!(text_of(Tag::GPSLongitudeRef), "E");
    }

    #[test]
    fn test_build_fields_zero_latitude_is_present() {
        let meta = SidecarMetadata {
            gps: Some(GeoPoint {
                lat: 0.0,
                lon: 2.35,
                alt: None,
            }),
            ..Default::default()
        };
        let fields = build_fields(&meta);
        assert!(fields.iter().any(|f| f.tag == Tag::GPSLatitude));
        let lat_ref = fields
            .iter()
            .find(|f| f.tag == Tag::GPSLatitudeRef)
            .and_then(ascii_text)
            .unwrap();
        assert_eq!(lat_ref, "N");
    }

    #[test]
    fn test_build_fields_people_join_order() {
        let meta = SidecarMetadata {
            people: vec!["Alice".into(), "Bob".into(), "Chloé".into()],
            ..Default::default()
        };
        let fields = build_fields(&meta);
        let kw = fields.iter().find(|f| f.tag == XP_KEYWORDS).unwrap();
        let Value::Byte(bytes) = &kw.value else {
            panic!("XPKeywords should be byte-valued");
        };
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(String::from_utf16(&units).unwrap(), "Alice, Bob, Chloé");
    }

    #[test]
    fn test_empty_metadata_builds_no_fields() {
        assert!(build_fields(&SidecarMetadata::default()).is_empty());
    }
}
