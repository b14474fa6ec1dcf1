//! Wire formats of the two transfer protocols

use std::convert::TryFrom;
use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_16_XMODEM, CRC_32_ISO_HDLC};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// A trait marker to mark a type as a transfer protocol.
pub trait Protocol {}

/// Packet based protocol spoken by a running first stage.
pub struct Xmodem;

impl Protocol for Xmodem {}

/// Bulk protocol spoken by the recovery agent in the mask ROM.
pub struct Recovery;

impl Protocol for Recovery {}

/// An interface for serializing commands to a writer in a binary protocol that the target
/// supports.
pub trait Command<P: Protocol> {
    fn to_writer<W: Write>(&self, writer: W) -> io::Result<()>;
}

/// An interface for deserializing responses from a reader.
pub trait Response<P: Protocol>
where
    Self: Sized,
{
    /// The type to return on successful read from a reader.
    type T;

    fn from_reader<R>(reader: R) -> io::Result<Self::T>
    where
        R: Read + ReadBytesExt;
}

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Byte used to pad the last packet
pub const PADDING: u8 = 0x1a;

/// XMODEM control characters
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum Control {
    /// Start of a 128 byte packet
    Soh = 0x01,
    /// Start of a 1024 byte packet
    Stx = 0x02,
    Eot = 0x04,
    Ack = 0x06,
    Nak = 0x15,
    Can = 0x18,
    /// Receiver requests CRC-16 checksums
    Crc = 0x43,
}

/// The integrity check appended to every packet, chosen by the receiver during the handshake
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Checksum {
    /// Arithmetic sum of the data bytes, one byte
    Sum,
    /// CRC-16/XMODEM, two bytes big endian
    Crc16,
}

impl Checksum {
    /// Maps a handshake byte from the receiver to the checksum it asks for
    pub fn from_handshake(byte: u8) -> Option<Checksum> {
        match Control::try_from(byte) {
            Ok(Control::Crc) => Some(Checksum::Crc16),
            Ok(Control::Nak) => Some(Checksum::Sum),
            _ => None,
        }
    }
}

/// Calculates the CRC-16/XMODEM checksum of `bytes`
pub fn crc16(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

/// Calculates the CRC-32 checksum of `bytes`
pub fn crc32(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}

/// One data packet
pub struct Packet<'a> {
    /// Block number, starts at 1 and wraps around after 255
    pub block: u8,
    /// Payload, at most `size` bytes
    pub data: &'a [u8],
    /// Packet size, 128 or 1024
    pub size: usize,
    pub checksum: Checksum,
}

impl Packet<'_> {
    /// Returns the block number of the packet at `index`
    pub fn block_for_index(index: usize) -> u8 {
        ((index + 1) % 256) as u8
    }

    /// Number of bytes the packet occupies on the wire
    pub fn wire_len(&self) -> usize {
        let trailer = match self.checksum {
            Checksum::Sum => 1,
            Checksum::Crc16 => 2,
        };

        3 + self.size + trailer
    }
}

impl Command<Xmodem> for Packet<'_> {
    fn to_writer<W: Write>(&self, mut writer: W) -> io::Result<()> {
        let start = if self.size == 1024 {
            Control::Stx
        } else {
            Control::Soh
        };

        let mut buf = Vec::with_capacity(self.wire_len());

        buf.push(start.into());
        buf.push(self.block);
        buf.push(!self.block);
        buf.extend_from_slice(self.data);
        buf.resize(3 + self.size, PADDING);

        match self.checksum {
            Checksum::Sum => {
                let sum = buf[3..].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
                buf.push(sum);
            }
            Checksum::Crc16 => {
                let crc = crc16(&buf[3..]);
                buf.extend_from_slice(&crc.to_be_bytes());
            }
        }

        writer.write_all(&buf)
    }
}

/// Marks the end of the transmission
pub struct EndOfTransmission;

impl Command<Xmodem> for EndOfTransmission {
    fn to_writer<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&[Control::Eot.into()])
    }
}

/// Aborts the transmission
pub struct Abort;

impl Command<Xmodem> for Abort {
    fn to_writer<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&[Control::Can.into(), Control::Can.into()])
    }
}

/// A reply from the receiver to a packet
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Reply {
    Ack,
    Nak,
    Can,
    /// Anything else, a corrupted acknowledgement
    Other(u8),
}

impl Response<Xmodem> for Reply {
    type T = Self;

    fn from_reader<R: Read + ReadBytesExt>(mut reader: R) -> io::Result<Self> {
        let byte = reader.read_u8()?;

        Ok(match Control::try_from(byte) {
            Ok(Control::Ack) => Reply::Ack,
            Ok(Control::Nak) => Reply::Nak,
            Ok(Control::Can) => Reply::Can,
            _ => Reply::Other(byte),
        })
    }
}

/// Byte pattern the recovery agent synchronizes its baud rate on
pub const SYNC_BYTE: u8 = 0x55;

/// Command id of a bulk image transfer
pub const BULK_COMMAND: u8 = 0x5a;

/// Burst of sync bytes that makes the recovery agent answer with its status
pub struct SyncBurst {
    pub len: usize,
}

impl SyncBurst {
    /// Calculates the number of bytes needed to keep the UART busy for 5ms at `baud_rate`
    pub fn for_baud_rate(baud_rate: u32) -> SyncBurst {
        // bauds * 5ms / (8 data bits + 1 start bit + 1 stop bit) / 1000 ms
        let len = baud_rate.saturating_mul(5) / 10 / 1000;

        SyncBurst {
            len: (len as usize).max(1),
        }
    }
}

impl Command<Recovery> for SyncBurst {
    fn to_writer<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&vec![SYNC_BYTE; self.len])
    }
}

/// Announces an image of `len` bytes with the checksum `crc32`
pub struct BulkHeader {
    pub len: u32,
    pub crc32: u32,
}

impl BulkHeader {
    pub fn for_image(image: &[u8]) -> io::Result<BulkHeader> {
        let len = u32::try_from(image.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "image does not fit the bulk length field",
            )
        })?;

        Ok(BulkHeader {
            len,
            crc32: crc32(image),
        })
    }
}

impl Command<Recovery> for BulkHeader {
    fn to_writer<W: Write>(&self, mut writer: W) -> io::Result<()> {
        let mut buf = Vec::with_capacity(10);

        buf.write_u8(BULK_COMMAND)?;
        buf.write_u8(0)?;
        buf.write_u32::<LittleEndian>(self.len)?;
        buf.write_u32::<LittleEndian>(self.crc32)?;

        writer.write_all(&buf)
    }
}

/// Status reported by the recovery agent
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    Ok,
    Failed(u16),
    Unexpected([u8; 2]),
}

impl Response<Recovery> for Status {
    type T = Self;

    fn from_reader<R: Read + ReadBytesExt>(mut reader: R) -> io::Result<Self> {
        let mut buf = [0u8; 2];

        reader.read_exact(&mut buf)?;

        if &buf == b"OK" {
            return Ok(Status::Ok);
        } else if &buf == b"FL" {
            // Read the error code
            let code = reader.read_u16::<LittleEndian>()?;

            return Ok(Status::Failed(code));
        }

        Ok(Status::Unexpected(buf))
    }
}
