//! Binary codec for SeaFlow EVT/OPP particle files.
//!
//! # File Layout
//! ```text
//! [u32 row_count (LE)] [row 0] [row 1] ... [row row_count-1]
//!
//! Row (24 bytes, all u16 LE):
//!   prefix: [u16; 2]     (reserved, normally 10 0)
//!   values: [u16; 10]    (time, pulse_width, D1, D2, fsc_small,
//!                         fsc_perp, fsc_big, pe, chl_small, chl_big)
//! ```
//!
//! Files may be gzip compressed. Compression is recognised from the gzip
//! magic bytes, so a renamed or recompressed file decodes the same way.

use super::{ParticleEvent, ParticleFile, CHANNEL_COUNT};
use crate::error::{AppResult, FormatError};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

/// Size of the row count header in bytes.
pub const HEADER_SIZE: usize = 4;

/// Number of u16 words per row, reserved prefix included.
pub const ROW_WORDS: usize = CHANNEL_COUNT + 2;

/// Size of one row in bytes.
pub const ROW_WIDTH: usize = ROW_WORDS * 2;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Whether a byte buffer starts with a gzip member header.
pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= GZIP_MAGIC.len() && bytes[..2] == GZIP_MAGIC
}

/// Decode a particle file from raw or gzip compressed bytes.
///
/// # Errors
/// Returns a `FormatError` when the header is short or zero, the row data is
/// truncated, the row data is not a whole number of rows, extra rows follow
/// the declared count, or the gzip stream is corrupt.
pub fn decode(bytes: &[u8]) -> Result<ParticleFile, FormatError> {
    if is_gzip(bytes) {
        let mut plain = Vec::with_capacity(bytes.len() * 4);
        MultiGzDecoder::new(bytes)
            .read_to_end(&mut plain)
            .map_err(FormatError::Gzip)?;
        decode_plain(&plain)
    } else {
        decode_plain(bytes)
    }
}

fn decode_plain(bytes: &[u8]) -> Result<ParticleFile, FormatError> {
    let declared = parse_header(bytes)?;
    let body = &bytes[HEADER_SIZE..];

    if body.len() % ROW_WIDTH != 0 {
        return Err(FormatError::RowFraming {
            actual: body.len(),
            row_width: ROW_WIDTH,
        });
    }
    let expected = (declared as usize).saturating_mul(ROW_WIDTH);
    if body.len() < expected {
        return Err(FormatError::Truncated {
            declared,
            expected,
            actual: body.len(),
        });
    }
    if body.len() > expected {
        return Err(FormatError::RowCountMismatch {
            declared,
            present: body.len() / ROW_WIDTH,
        });
    }

    let events = body.chunks_exact(ROW_WIDTH).map(decode_row).collect();
    Ok(ParticleFile {
        header_count: declared,
        events,
    })
}

fn parse_header(bytes: &[u8]) -> Result<u32, FormatError> {
    let header: [u8; HEADER_SIZE] = bytes
        .get(..HEADER_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or(FormatError::ShortHeader(bytes.len()))?;
    match u32::from_le_bytes(header) {
        0 => Err(FormatError::Empty),
        n => Ok(n),
    }
}

fn decode_row(row: &[u8]) -> ParticleEvent {
    let mut words = [0u16; ROW_WORDS];
    for (word, pair) in words.iter_mut().zip(row.chunks_exact(2)) {
        *word = u16::from_le_bytes([pair[0], pair[1]]);
    }
    let mut values = [0u16; CHANNEL_COUNT];
    values.copy_from_slice(&words[2..]);
    ParticleEvent::with_prefix([words[0], words[1]], values)
}

/// Encode rows, in the order given, as an uncompressed particle file.
///
/// Fails only when the row count does not fit the u32 header.
pub fn encode(rows: &[ParticleEvent]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(HEADER_SIZE + rows.len() * ROW_WIDTH);
    write_rows(&mut out, rows)?;
    Ok(out)
}

/// Encode rows as a gzip compressed particle file.
pub fn encode_gz(rows: &[ParticleEvent]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    write_rows(&mut encoder, rows)?;
    encoder.finish()
}

fn write_rows<W: Write>(out: &mut W, rows: &[ParticleEvent]) -> std::io::Result<()> {
    let count = u32::try_from(rows.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} rows exceed the u32 header", rows.len()),
        )
    })?;
    out.write_all(&count.to_le_bytes())?;

    let mut buf = [0u8; ROW_WIDTH];
    for row in rows {
        let prefix = row.prefix();
        let words = prefix.iter().chain(row.values().iter());
        for (pair, word) in buf.chunks_exact_mut(2).zip(words) {
            pair.copy_from_slice(&word.to_le_bytes());
        }
        out.write_all(&buf)?;
    }
    Ok(())
}

/// Read and decode a particle file from disk.
pub fn decode_file(path: &Path) -> AppResult<ParticleFile> {
    let bytes = std::fs::read(path)?;
    Ok(decode(&bytes)?)
}

/// Write rows to `path`, gzip compressed when the path ends in `.gz`.
pub fn write_file(path: &Path, rows: &[ParticleEvent]) -> std::io::Result<()> {
    let file = BufWriter::new(File::create(path)?);
    let gz = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(".gz"));
    if gz {
        let mut encoder = GzEncoder::new(file, Compression::default());
        write_rows(&mut encoder, rows)?;
        encoder.finish()?.flush()
    } else {
        let mut file = file;
        write_rows(&mut file, rows)?;
        file.flush()
    }
}

/// Read only the row count header of a file, decompressing as needed.
pub fn read_row_count(path: &Path) -> AppResult<u32> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let n = read_up_to(&mut file, &mut magic)?;
    let mut reader: Box<dyn Read> = {
        let head = std::io::Cursor::new(magic[..n].to_vec()).chain(file);
        if is_gzip(&magic[..n]) {
            Box::new(MultiGzDecoder::new(head))
        } else {
            Box::new(head)
        }
    };
    let mut header = [0u8; HEADER_SIZE];
    let n = read_up_to(&mut reader, &mut header).map_err(FormatError::Gzip)?;
    if n < HEADER_SIZE {
        return Err(FormatError::ShortHeader(n).into());
    }
    Ok(u32::from_le_bytes(header))
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evt::Channel;

    fn sample_rows(n: u16) -> Vec<ParticleEvent> {
        (0..n)
            .map(|i| ParticleEvent::new([i, i + 1, 100 * i, 200 * i, 3, 4, 5, 6, 7, u16::MAX - i]))
            .collect()
    }

    #[test]
    fn test_layout_is_little_endian() {
        let rows = vec![ParticleEvent::new([1, 2, 3, 4, 5, 6, 7, 8, 9, 0x0102])];
        let bytes = encode(&rows).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + ROW_WIDTH);
        assert_eq!(&bytes[..4], &[1, 0, 0, 0]);
        // reserved prefix 10 0
        assert_eq!(&bytes[4..8], &[10, 0, 0, 0]);
        // time = 1
        assert_eq!(&bytes[8..10], &[1, 0]);
        // chl_big = 0x0102
        assert_eq!(&bytes[26..28], &[0x02, 0x01]);
    }

    #[test]
    fn test_roundtrip_plain_and_gzip() {
        let rows = sample_rows(50);
        let subset: Vec<_> = rows.iter().copied().step_by(3).collect();

        let plain = decode(&encode(&subset).unwrap()).unwrap();
        assert_eq!(plain.header_count() as usize, subset.len());
        assert_eq!(plain.events(), subset.as_slice());

        let gz = encode_gz(&subset).unwrap();
        assert!(is_gzip(&gz));
        let unzipped = decode(&gz).unwrap();
        assert_eq!(unzipped, plain);
    }

    #[test]
    fn test_reserved_prefix_preserved() {
        let mut bytes = encode(&sample_rows(1)).unwrap();
        bytes[4] = 7;
        bytes[6] = 9;
        let file = decode(&bytes).unwrap();
        assert_eq!(file.events()[0].prefix(), [7, 9]);
        assert_eq!(encode(file.events()).unwrap(), bytes);
    }

    #[test]
    fn test_empty_file_rejected() {
        assert!(matches!(decode(&[0, 0, 0, 0]), Err(FormatError::Empty)));
    }

    #[test]
    fn test_short_header_rejected() {
        assert!(matches!(decode(&[3, 0]), Err(FormatError::ShortHeader(2))));
        assert!(matches!(decode(&[]), Err(FormatError::ShortHeader(0))));
    }

    #[test]
    fn test_header_without_rows_rejected() {
        let err = decode(&[5, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, FormatError::Truncated { declared: 5, actual: 0, .. }));
    }

    #[test]
    fn test_partial_row_rejected() {
        let mut bytes = encode(&sample_rows(2)).unwrap();
        bytes.pop();
        assert!(matches!(decode(&bytes), Err(FormatError::RowFraming { .. })));
    }

    #[test]
    fn test_extra_rows_rejected() {
        let mut bytes = encode(&sample_rows(3)).unwrap();
        bytes[0] = 2;
        assert!(matches!(
            decode(&bytes),
            Err(FormatError::RowCountMismatch { declared: 2, present: 3 })
        ));
    }

    #[test]
    fn test_corrupt_gzip_rejected() {
        let mut gz = encode_gz(&sample_rows(10)).unwrap();
        let mid = gz.len() / 2;
        gz.truncate(mid);
        assert!(decode(&gz).is_err());
    }

    #[test]
    fn test_detection_ignores_extension() {
        let dir = tempfile::tempdir().unwrap();
        let rows = sample_rows(4);
        // gzip content behind a plain name, plain content behind a .gz name
        let misnamed_gz = dir.path().join("2014-07-04T00-00-02+00-00");
        std::fs::write(&misnamed_gz, encode_gz(&rows).unwrap()).unwrap();
        let misnamed_plain = dir.path().join("2014-07-04T00-03-02+00-00.gz");
        std::fs::write(&misnamed_plain, encode(&rows).unwrap()).unwrap();

        let a = decode_file(&misnamed_gz).unwrap();
        let b = decode_file(&misnamed_plain).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.events()[3].get(Channel::D2), 600);
    }

    #[test]
    fn test_write_file_and_header_count() {
        let dir = tempfile::tempdir().unwrap();
        let rows = sample_rows(12);
        let gz_path = dir.path().join("x.opp.gz");
        let plain_path = dir.path().join("x.opp");
        write_file(&gz_path, &rows).unwrap();
        write_file(&plain_path, &rows).unwrap();

        assert!(is_gzip(&std::fs::read(&gz_path).unwrap()));
        assert_eq!(read_row_count(&gz_path).unwrap(), 12);
        assert_eq!(read_row_count(&plain_path).unwrap(), 12);
        assert_eq!(decode_file(&gz_path).unwrap().events(), rows.as_slice());
    }
}
