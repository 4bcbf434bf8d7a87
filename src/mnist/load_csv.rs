use std::path::Path;

use csv::StringRecord;
use rayon::prelude::*;

use super::{ImageDataset, LabeledImage};
use crate::error::{LoadError, ParseErrorKind};
use crate::{IMAGE_AREA, NUM_CLASSES};

// Label followed by one field per pixel
const FIELDS_PER_ROW: usize = 1 + IMAGE_AREA;

// Rows decoded per parallel pass
const CHUNK_ROWS: usize = 4096;

// Load labeled images from a csv file.
// The expected format is:
// - No headers
// - One image per row
// - Each row starts with the class label 0-9
// - The rest of the row consists of exactly 28x28 pixel values, row-major
// - The pixel values are represented as integers, 0-255
// Anything else is rejected with the offending line number; no row is skipped.
pub fn load_csv(path: impl AsRef<Path>) -> Result<ImageDataset, LoadError> {
    load_in_chunks(path.as_ref(), CHUNK_ROWS)
}

// Records are parsed a chunk at a time, so only one chunk of raw text is held
// alongside the decoded images.
fn load_in_chunks(path: &Path, chunk_rows: usize) -> Result<ImageDataset, LoadError> {
    // Field counts are checked per row below, so let the reader accept ragged rows
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|err| csv_error(path, err))?;

    let mut images = Vec::new();
    let mut chunk = Vec::with_capacity(chunk_rows);
    for result in reader.records() {
        chunk.push(result.map_err(|err| csv_error(path, err))?);
        if chunk.len() == chunk_rows {
            images.extend(parse_chunk(path, &chunk)?);
            chunk.clear();
        }
    }
    images.extend(parse_chunk(path, &chunk)?);

    tracing::debug!("Parsed {} rows from {}", images.len(), path.display());
    Ok(ImageDataset::new(images))
}

// Parsing is independent per row; collecting keeps file order
fn parse_chunk(path: &Path, records: &[StringRecord]) -> Result<Vec<LabeledImage>, LoadError> {
    records
        .par_iter()
        .map(|record| {
            parse_record(record).map_err(|kind| LoadError::Parse {
                path: path.to_path_buf(),
                line: record.position().map_or(0, |position| position.line()),
                kind,
            })
        })
        .collect()
}

fn parse_record(record: &StringRecord) -> Result<LabeledImage, ParseErrorKind> {
    if record.len() != FIELDS_PER_ROW {
        return Err(ParseErrorKind::FieldCount {
            expected: FIELDS_PER_ROW,
            found: record.len(),
        });
    }

    let label = parse_unsigned(&record[0], 0)?;
    if label >= NUM_CLASSES as u64 {
        return Err(ParseErrorKind::LabelOutOfRange {
            label,
            classes: NUM_CLASSES,
        });
    }

    let mut pixels = [0_u8; IMAGE_AREA];
    // `index` counts fields, so the first pixel is field 1
    for (index, (pixel, token)) in (1..).zip(pixels.iter_mut().zip(record.iter().skip(1))) {
        let value = parse_unsigned(token, index)?;
        // Out-of-range pixels are rejected, never truncated
        *pixel = u8::try_from(value).map_err(|_| ParseErrorKind::PixelOutOfRange { index, value })?;
    }

    Ok(LabeledImage::new(pixels, label as usize))
}

fn parse_unsigned(token: &str, index: usize) -> Result<u64, ParseErrorKind> {
    token
        .parse::<u64>()
        .map_err(|_| ParseErrorKind::NotAnInteger {
            index,
            token: token.to_string(),
        })
}

fn csv_error(path: &Path, err: csv::Error) -> LoadError {
    let line = err.position().map_or(0, |position| position.line());
    match err.into_kind() {
        csv::ErrorKind::Io(source) => LoadError::Io {
            path: path.to_path_buf(),
            source,
        },
        kind => LoadError::Parse {
            path: path.to_path_buf(),
            line,
            kind: ParseErrorKind::Malformed(format!("{kind:?}")),
        },
    }
}
