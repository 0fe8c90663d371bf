//! Stores a target's position as EXIF in the saved JPEG: the target id in
//! `ImageDescription`, the coordinates in `UserComment`, and the capture DPI
//! as the image resolution.

use std::io::Cursor;

use bytes::{Bytes, BytesMut};
use exif::{experimental::Writer, Field, In, Rational, Tag, Value};
use img_parts::jpeg::{markers, Jpeg, JpegSegment};
use nom::{
    bytes::complete::tag,
    combinator::all_consuming,
    number::complete::double,
    sequence::{preceded, tuple},
    IResult,
};

use crate::error::{RigError, RigResult};

const EXIF_PREFIX: &[u8] = b"Exif\0\0";
/// Character code header required in front of a `UserComment` value.
const ASCII_CODE: &[u8] = b"ASCII\0\0\0";
const INCHES: u16 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct PositionTag {
    pub target_id: String,
    pub x: f64,
    pub y: f64,
}

fn parse_coordinates(input: &str) -> IResult<&str, (f64, f64), ()> {
    all_consuming(tuple((
        preceded(tag("X-LAT="), double),
        preceded(tag(";Y-LONG="), double),
    )))(input)
}

fn is_exif(segment: &JpegSegment) -> bool {
    segment.marker() == markers::APP1 && segment.contents().starts_with(EXIF_PREFIX)
}

fn parse_jpeg(jpeg: &[u8]) -> RigResult<Jpeg> {
    Jpeg::from_bytes(Bytes::copy_from_slice(jpeg))
        .map_err(|e| RigError::MetadataEmbed(format!("not a JPEG stream: {}", e)))
}

fn exif_block(target_id: &str, x: f64, y: f64, precision: usize, dpi: u32) -> RigResult<Vec<u8>> {
    let mut comment = ASCII_CODE.to_vec();
    comment.extend_from_slice(format!("X-LAT={:.*};Y-LONG={:.*}", precision, x, precision, y).as_bytes());
    let resolution = Value::Rational(vec![Rational { num: dpi.max(1), denom: 1 }]);
    let fields = [
        Field { tag: Tag::ImageDescription, ifd_num: In::PRIMARY, value: Value::Ascii(vec![target_id.as_bytes().to_vec()]) },
        Field { tag: Tag::XResolution, ifd_num: In::PRIMARY, value: resolution.clone() },
        Field { tag: Tag::YResolution, ifd_num: In::PRIMARY, value: resolution },
        Field { tag: Tag::ResolutionUnit, ifd_num: In::PRIMARY, value: Value::Short(vec![INCHES]) },
        Field { tag: Tag::UserComment, ifd_num: In::PRIMARY, value: Value::Undefined(comment, 0) },
    ];
    let mut writer = Writer::new();
    for field in &fields {
        writer.push_field(field);
    }
    let mut tiff = Cursor::new(Vec::new());
    writer
        .write(&mut tiff, false)
        .map_err(|e| RigError::MetadataEmbed(format!("cannot encode EXIF: {}", e)))?;
    Ok(tiff.into_inner())
}

/// Returns a copy of `jpeg` carrying the position, replacing any earlier EXIF block.
/// The block goes right after the JFIF header when there is one.
pub fn embed_position(jpeg: &[u8], target_id: &str, x: f64, y: f64, precision: usize, dpi: u32) -> RigResult<Vec<u8>> {
    let mut image = parse_jpeg(jpeg)?;
    let tiff = exif_block(target_id, x, y, precision, dpi)?;
    if tiff.len() + EXIF_PREFIX.len() + 2 > u16::MAX as usize {
        return Err(RigError::MetadataEmbed("EXIF block too large".into()));
    }
    let mut contents = BytesMut::with_capacity(EXIF_PREFIX.len() + tiff.len());
    contents.extend_from_slice(EXIF_PREFIX);
    contents.extend_from_slice(&tiff);

    let segments = image.segments_mut();
    segments.retain(|segment| !is_exif(segment));
    let after_jfif = segments.iter().take_while(|segment| segment.marker() == markers::APP0).count();
    segments.insert(after_jfif, JpegSegment::new_with_contents(markers::APP1, contents.freeze()));
    Ok(image.encoder().bytes().to_vec())
}

/// Reads back what [`embed_position`] stored; `None` for images without a position.
pub fn read_position(jpeg: &[u8]) -> RigResult<Option<PositionTag>> {
    let exif = match exif::Reader::new().read_from_container(&mut Cursor::new(jpeg)) {
        Ok(exif) => exif,
        Err(exif::Error::NotFound(_)) => return Ok(None),
        Err(e) => return Err(RigError::MetadataEmbed(format!("unreadable EXIF: {}", e))),
    };
    let Some(Value::Undefined(comment, _)) = exif.get_field(Tag::UserComment, In::PRIMARY).map(|f| &f.value) else {
        return Ok(None);
    };
    let Some(text) = comment.strip_prefix(ASCII_CODE).and_then(|text| std::str::from_utf8(text).ok()) else {
        return Ok(None);
    };
    let Ok((_, (x, y))) = parse_coordinates(text.trim_end_matches('\0')) else {
        return Ok(None);
    };
    let target_id = match exif.get_field(Tag::ImageDescription, In::PRIMARY).map(|f| &f.value) {
        Some(Value::Ascii(parts)) => parts
            .first()
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .unwrap_or_default(),
        _ => String::new(),
    };
    Ok(Some(PositionTag { target_id, x, y }))
}
