use std::io::{Read, Write};

use crate::types::*;

/// Size of the preamble at the start of every Neuralynx file.
pub const HEADER_SIZE: usize = 16 * 1024;

/// The fixed-size preamble of a recorder file.
///
/// Kept byte for byte for provenance; the importer does not interpret it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    bytes: Vec<u8>,
}

impl Header {
    /// Wraps raw header bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Header { bytes }
    }

    /// Builds a header holding `remarks`, NUL padded to [`HEADER_SIZE`].
    pub fn with_remarks(remarks: &str) -> Result<Self> {
        let len = remarks.len();
        if len > HEADER_SIZE {
            return Err(LynxError::HeaderOverflow {
                len,
                capacity: HEADER_SIZE,
            });
        }
        let mut bytes = remarks.as_bytes().to_vec();
        bytes.resize(HEADER_SIZE, 0);
        Ok(Header { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The header as text, with NUL padding dropped.
    ///
    /// Cheetah writes its acquisition settings here as ASCII lines.
    pub fn text(&self) -> String {
        let end = self
            .bytes
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |i| i + 1);
        String::from_utf8_lossy(&self.bytes[..end]).into_owned()
    }
}

/// Reads the fixed-size header from the start of a stream.
///
/// Consumes exactly [`HEADER_SIZE`] bytes. A shorter stream is reported as
/// [`LynxError::TruncatedFile`].
pub fn read_header<R: Read>(reader: &mut R) -> Result<Header> {
    let mut bytes = Vec::with_capacity(HEADER_SIZE);
    reader
        .by_ref()
        .take(HEADER_SIZE as u64)
        .read_to_end(&mut bytes)?;

    if bytes.len() < HEADER_SIZE {
        return Err(LynxError::TruncatedFile {
            expected: HEADER_SIZE,
            found: bytes.len(),
        });
    }

    let header = Header { bytes };
    log::debug!("File header: {}", header.text().lines().next().unwrap_or(""));

    Ok(header)
}

/// Writes a header back out unchanged.
pub fn write_header<W: Write>(writer: &mut W, header: &Header) -> Result<()> {
    writer.write_all(&header.bytes)?;
    Ok(())
}
