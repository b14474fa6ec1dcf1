//! JH7110 mask ROM header
//!
//! The mask ROM only executes a first stage that is preceded by a 0x400 byte header carrying the
//! payload length, the offset of the payload and a CRC32 checksum over the payload. All multi-byte
//! fields are little endian and every byte not listed here is zero.
//!
//! | Offset  | Field                                  |
//! |---------|----------------------------------------|
//! | `0x000` | Offset of the SPL header (`0x240`)     |
//! | `0x004` | Offset of the backup copy in flash     |
//! | `0x284` | Version, always `0x01010101`           |
//! | `0x288` | Payload length                         |
//! | `0x28c` | Offset from header start to payload    |
//! | `0x290` | CRC32 of the payload                   |

use std::convert::TryFrom;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use crc::{Crc, CRC_32_ISO_HDLC};
use log::{debug, trace};
use thiserror::Error;

use crate::descriptor::AreaKind;
use crate::image::ComposedImage;

/// Size of the header record
pub const HEADER_SIZE: usize = 0x400;

/// The largest payload the mask ROM copies into SRAM
pub const DEFAULT_MAX_PAYLOAD: usize = 0x40000;

/// Default offset of the backup copy of the first stage in flash
pub const DEFAULT_BACKUP_OFFSET: u32 = 0x20_0000;

/// Suffix appended to a file name when a header has been added to it
pub const NORMAL_OUTPUT_SUFFIX: &str = ".normal.out";

const SPL_HEADER_OFFSET: u32 = 0x240;
const VERSION: u32 = 0x0101_0101;

const VERSION_FIELD: u64 = 0x284;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Payload is {len} bytes, but the header allows at most {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("The board descriptor has no header area")]
    MissingHeaderArea,
    #[error("Header area is {} bytes, but the header needs {}", _0, HEADER_SIZE)]
    AreaTooSmall(usize),
    #[error("Header area of {:#x} bytes is too large for the payload offset field", _0)]
    AreaTooLarge(usize),
    #[error("The header version is invalid: {:#010x}", _0)]
    InvalidVersion(u32),
    #[error("Header declares a {declared} byte payload, but {actual} bytes follow it")]
    LengthMismatch { declared: u32, actual: usize },
    #[error("Payload checksum {actual:#010x} does not match the header checksum {expected:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("I/O error: {}", _0)]
    IoError(#[from] io::Error),
}

/// Parameters of the header that are not derived from the payload
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeaderConfig {
    /// Offset of the backup copy of the first stage in flash
    pub backup_offset: u32,
    /// The largest payload accepted
    pub max_payload: usize,
}

impl Default for HeaderConfig {
    fn default() -> HeaderConfig {
        HeaderConfig {
            backup_offset: DEFAULT_BACKUP_OFFSET,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
    /// Offset of the backup copy in flash
    pub backup_offset: u32,
    /// Length of the payload in bytes
    pub payload_len: u32,
    /// Offset from the start of the header to the payload
    pub payload_offset: u32,
    /// CRC32 checksum of the payload
    pub crc32: u32,
}

impl Header {
    /// Computes the header for `payload`, which starts `payload_offset` bytes after the header
    pub fn for_payload(
        payload: &[u8],
        payload_offset: u32,
        config: &HeaderConfig,
    ) -> Result<Header, HeaderError> {
        let max = config.max_payload.min(u32::MAX as usize);

        if payload.len() > max {
            return Err(HeaderError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }

        Ok(Header {
            backup_offset: config.backup_offset,
            payload_len: payload.len() as u32,
            payload_offset,
            crc32: CRC32.checksum(payload),
        })
    }

    /// Prepends a header to `payload`, returning the combined image
    pub fn wrap(payload: &[u8], config: &HeaderConfig) -> Result<Vec<u8>, HeaderError> {
        let header = Header::for_payload(payload, HEADER_SIZE as u32, config)?;
        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());

        header.write_to(&mut out)?;
        out.extend_from_slice(payload);

        Ok(out)
    }

    /// Reads and parses a header with `reader`
    pub fn from_reader<R: ReadBytesExt + Seek>(mut reader: R) -> Result<Header, HeaderError> {
        // Skip the SPL header offset
        reader.seek(SeekFrom::Current(4))?;

        let backup_offset = reader.read_u32::<LittleEndian>()?;

        reader.seek(SeekFrom::Current(VERSION_FIELD as i64 - 8))?;

        let version = reader.read_u32::<LittleEndian>()?;

        if version != VERSION {
            return Err(HeaderError::InvalidVersion(version));
        }

        let payload_len = reader.read_u32::<LittleEndian>()?;
        let payload_offset = reader.read_u32::<LittleEndian>()?;
        let crc32 = reader.read_u32::<LittleEndian>()?;

        Ok(Header {
            backup_offset,
            payload_len,
            payload_offset,
            crc32,
        })
    }

    /// Reads only the header part of `reader`, without the payload
    pub fn read_from<R: Read>(mut reader: R) -> Result<Header, HeaderError> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;

        Header::from_reader(Cursor::new(&buf[..]))
    }

    /// Writes the full `HEADER_SIZE` byte record to `writer`
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), HeaderError> {
        writer.write_all(&self.to_bytes())?;

        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        let version = VERSION_FIELD as usize;

        LittleEndian::write_u32(&mut buf[0..4], SPL_HEADER_OFFSET);
        LittleEndian::write_u32(&mut buf[4..8], self.backup_offset);
        LittleEndian::write_u32(&mut buf[version..version + 4], VERSION);
        LittleEndian::write_u32(&mut buf[version + 4..version + 8], self.payload_len);
        LittleEndian::write_u32(&mut buf[version + 8..version + 12], self.payload_offset);
        LittleEndian::write_u32(&mut buf[version + 12..version + 16], self.crc32);

        buf
    }

    /// Checks that `payload` is the payload this header describes
    pub fn verify(&self, payload: &[u8]) -> Result<(), HeaderError> {
        if self.payload_len as usize != payload.len() {
            return Err(HeaderError::LengthMismatch {
                declared: self.payload_len,
                actual: payload.len(),
            });
        }

        let actual = CRC32.checksum(payload);

        if actual != self.crc32 {
            return Err(HeaderError::ChecksumMismatch {
                expected: self.crc32,
                actual,
            });
        }

        Ok(())
    }
}

/// Writes the header into the header area of `image`
///
/// Everything after the header area is the payload. The whole header area is rewritten, so
/// running this again on the same image produces the same bytes.
pub fn inject(image: &mut ComposedImage, config: &HeaderConfig) -> Result<Header, HeaderError> {
    let range = image
        .placement(AreaKind::Header)
        .map(|placement| placement.range.clone())
        .ok_or(HeaderError::MissingHeaderArea)?;

    if range.len() < HEADER_SIZE {
        return Err(HeaderError::AreaTooSmall(range.len()));
    }

    let payload_offset =
        u32::try_from(range.len()).map_err(|_| HeaderError::AreaTooLarge(range.len()))?;

    let bytes = image.as_bytes_mut();
    let header = Header::for_payload(&bytes[range.end..], payload_offset, config)?;

    trace!("Writing header {:x?} at {:#x}", header, range.start);

    let area = &mut bytes[range];
    area[..HEADER_SIZE].copy_from_slice(&header.to_bytes());

    for byte in &mut area[HEADER_SIZE..] {
        *byte = 0;
    }

    debug!(
        "Header covers {:#x} payload bytes with crc32 {:#010x}",
        header.payload_len, header.crc32
    );

    Ok(header)
}

/// Returns the path the header tool writes its output to for `input`
pub fn output_path<P: AsRef<Path>>(input: P) -> PathBuf {
    let mut name = input.as_ref().as_os_str().to_os_string();
    name.push(NORMAL_OUTPUT_SUFFIX);

    PathBuf::from(name)
}

/// Reads a headered image and splits it into the parsed header and its payload
pub fn split(image: &[u8]) -> Result<(Header, &[u8]), HeaderError> {
    let header = Header::from_reader(Cursor::new(image))?;
    let start = (header.payload_offset as usize).min(image.len());
    let payload = &image[start..];

    header.verify(payload)?;

    Ok((header, payload))
}
