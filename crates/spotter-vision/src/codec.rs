//! Template persistence codec.
//!
//! The on-disk record is a sequence of six newline-terminated decimal text
//! fields — `center_x`, `center_y`, `radius`, `match_threshold`,
//! `created_at_ms`, `bitmap_size` — followed by exactly `bitmap_size` bytes
//! of PNG holding the reference image. No other delimiters exist. Corrupt
//! input is rejected whole; a partially-parsed template is never returned.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Cursor, Read, Write};
use std::path::Path;
use std::str::FromStr;

use image::ImageFormat;
use tracing::debug;

use crate::template::{Template, TemplateError};

/// Serialize a template into the sequential text-fields-plus-PNG record.
pub fn write_template<W: Write>(mut writer: W, template: &Template) -> Result<(), TemplateError> {
    let mut png = Vec::new();
    template
        .image()
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;

    let (cx, cy) = template.center();
    writeln!(writer, "{cx}")?;
    writeln!(writer, "{cy}")?;
    writeln!(writer, "{}", template.radius())?;
    writeln!(writer, "{}", template.match_threshold())?;
    writeln!(writer, "{}", template.created_at_ms())?;
    writeln!(writer, "{}", png.len())?;
    writer.write_all(&png)?;
    Ok(())
}

/// Parse a template record. Reads exactly six text lines, then `bitmap_size`
/// raw bytes; anything short, non-numeric, or undecodable is an error.
pub fn read_template<R: BufRead>(mut reader: R) -> Result<Template, TemplateError> {
    let center_x: i32 = read_field(&mut reader, "center_x")?;
    let center_y: i32 = read_field(&mut reader, "center_y")?;
    let radius: u32 = read_field(&mut reader, "radius")?;
    let match_threshold: f64 = read_field(&mut reader, "match_threshold")?;
    let created_at_ms: u64 = read_field(&mut reader, "created_at_ms")?;
    let bitmap_size: usize = read_field(&mut reader, "bitmap_size")?;

    if bitmap_size == 0 {
        return Err(TemplateError::Malformed(
            "zero-length image payload".into(),
        ));
    }

    let mut png = vec![0u8; bitmap_size];
    reader
        .read_exact(&mut png)
        .map_err(|_| TemplateError::Malformed("truncated image payload".into()))?;

    // Decoding also materializes a sample-able RGBA copy of the payload.
    let image = image::load_from_memory(&png)?.to_rgba8();
    Template::new(
        center_x,
        center_y,
        radius,
        image,
        match_threshold,
        created_at_ms,
    )
}

/// Load a template from a file.
pub fn load_template(path: &Path) -> Result<Template, TemplateError> {
    let file = File::open(path)?;
    let template = read_template(BufReader::new(file))?;
    debug!(
        "loaded template from {}: {}x{} anchor ({}, {})",
        path.display(),
        template.image().width(),
        template.image().height(),
        template.center().0,
        template.center().1,
    );
    Ok(template)
}

/// Save a template to a file.
pub fn save_template(path: &Path, template: &Template) -> Result<(), TemplateError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    write_template(&mut writer, template)?;
    writer.flush()?;
    Ok(())
}

fn read_field<R: BufRead, T: FromStr>(reader: &mut R, name: &str) -> Result<T, TemplateError> {
    let mut line = String::new();
    let read = reader.read_line(&mut line)?;
    if read == 0 {
        return Err(TemplateError::Malformed(format!("missing {name} field")));
    }
    line.trim_end()
        .parse()
        .map_err(|_| TemplateError::Malformed(format!("invalid {name} field: {:?}", line.trim_end())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn sample_template() -> Template {
        let image = RgbaImage::from_fn(12, 10, |x, y| {
            Rgba([(x * 20) as u8, (y * 25) as u8, ((x + y) * 10) as u8, 255])
        });
        Template::new(100, 80, 10, image, 0.85, 1_700_000_000_000).unwrap()
    }

    #[test]
    fn test_record_roundtrip() {
        let template = sample_template();
        let mut buf = Vec::new();
        write_template(&mut buf, &template).unwrap();

        let parsed = read_template(&buf[..]).unwrap();
        assert_eq!(parsed.center(), (100, 80));
        assert_eq!(parsed.radius(), 10);
        assert_eq!(parsed.match_threshold(), 0.85);
        assert_eq!(parsed.created_at_ms(), 1_700_000_000_000);
        assert_eq!(parsed.image().dimensions(), (12, 10));
        // PNG is lossless, pixels survive the trip
        assert_eq!(parsed.image().as_raw(), template.image().as_raw());
    }

    #[test]
    fn test_record_layout_is_six_text_lines_then_png() {
        let mut buf = Vec::new();
        write_template(&mut buf, &sample_template()).unwrap();

        let header_end = buf
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == b'\n')
            .map(|(i, _)| i)
            .nth(5)
            .unwrap();
        let header = std::str::from_utf8(&buf[..header_end]).unwrap();
        let fields: Vec<&str> = header.split('\n').collect();
        assert_eq!(&fields[..5], &["100", "80", "10", "0.85", "1700000000000"]);
        let bitmap_size: usize = fields[5].parse().unwrap();
        assert_eq!(bitmap_size, buf.len() - header_end - 1);
    }

    #[test]
    fn test_rejects_non_numeric_field() {
        let mut buf = Vec::new();
        write_template(&mut buf, &sample_template()).unwrap();
        // Corrupt the first field
        buf[0] = b'x';
        assert!(matches!(
            read_template(&buf[..]),
            Err(TemplateError::Malformed(_))
        ));
    }

    #[test]
    fn test_rejects_truncated_payload() {
        let mut buf = Vec::new();
        write_template(&mut buf, &sample_template()).unwrap();
        buf.truncate(buf.len() - 16);
        assert!(matches!(
            read_template(&buf[..]),
            Err(TemplateError::Malformed(_))
        ));
    }

    #[test]
    fn test_rejects_zero_length_payload() {
        let record = b"10\n20\n5\n0.9\n0\n0\n";
        assert!(matches!(
            read_template(&record[..]),
            Err(TemplateError::Malformed(_))
        ));
    }

    #[test]
    fn test_rejects_missing_fields() {
        let record = b"10\n20\n";
        assert!(matches!(
            read_template(&record[..]),
            Err(TemplateError::Malformed(_))
        ));
    }
}
