//! Normal transfer to a running first stage
//!
//! The receiver opens the handshake by repeatedly sending `C` (CRC-16 checksums) or `NAK`
//! (arithmetic sums). Every packet must be acknowledged before the next one is sent; a `NAK` or a
//! corrupted reply makes the sender retransmit the same packet.

use std::io;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use super::wire::{
    Abort, Checksum, Command, Control, EndOfTransmission, Packet, Reply, Response,
};
use super::{
    is_timeout, read_byte, Cancellation, FailureCause, Link, Rejection, SessionState,
    TransferSession,
};

/// Size of the data part of a packet
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketSize {
    /// 128 byte packets, started with `SOH`
    Standard,
    /// 1024 byte packets, started with `STX`
    OneK,
}

impl PacketSize {
    pub fn len(self) -> usize {
        match self {
            PacketSize::Standard => 128,
            PacketSize::OneK => 1024,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct XmodemConfig {
    pub packet_size: PacketSize,
    /// How long to wait for the receiver to open the handshake
    pub handshake_timeout: Duration,
    /// Read timeout while polling for the handshake
    pub poll_interval: Duration,
    /// How long to wait for the reply to a packet
    pub ack_timeout: Duration,
    /// Number of times a packet is sent again before giving up
    pub max_retries: usize,
}

impl Default for XmodemConfig {
    fn default() -> XmodemConfig {
        XmodemConfig {
            packet_size: PacketSize::Standard,
            handshake_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            ack_timeout: Duration::from_secs(3),
            max_retries: 10,
        }
    }
}

/// Sends `image` to the receiver on the session's link
pub(crate) fn send<L: Link>(
    session: &mut TransferSession<L>,
    config: &XmodemConfig,
    image: &[u8],
    cancel: &Cancellation,
) -> Result<(), FailureCause> {
    let checksum = handshake(session, config, cancel)?;
    let size = config.packet_size.len();

    // Drop the handshake characters that queued up while we were waiting
    session.link().clear_input()?;
    session.link().set_timeout(config.ack_timeout)?;

    for (index, chunk) in image.chunks(size).enumerate() {
        if cancel.is_cancelled() {
            debug!("Cancelled before packet {}", index);
            Abort.to_writer(session.link())?;
            session.link().flush()?;

            return Err(FailureCause::Cancelled);
        }

        session.transition(SessionState::Transmitting {
            packet_index: index,
        });

        let packet = Packet {
            block: Packet::block_for_index(index),
            data: chunk,
            size,
            checksum,
        };

        send_packet(session, config, &packet, index)?;
        session.advance(chunk.len());
    }

    finish(session, config, image.len().div_ceil(size))
}

/// Waits for the receiver to request a transmission and returns the checksum it asked for
fn handshake<L: Link>(
    session: &mut TransferSession<L>,
    config: &XmodemConfig,
    cancel: &Cancellation,
) -> Result<Checksum, FailureCause> {
    session.transition(SessionState::Handshake);

    let deadline = Instant::now() + config.handshake_timeout;
    let mut received = 0usize;

    loop {
        if cancel.is_cancelled() {
            return Err(FailureCause::Cancelled);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());

        if remaining == Duration::from_secs(0) {
            // Noise on the line means something is attached, it just never asked for data
            return Err(if received == 0 {
                FailureCause::NoDevice
            } else {
                FailureCause::HandshakeTimeout
            });
        }

        session
            .link()
            .set_timeout(remaining.min(config.poll_interval))?;

        if let Some(byte) = read_byte(session.link())? {
            if let Some(checksum) = Checksum::from_handshake(byte) {
                debug!("Receiver requested {:?} checksums", checksum);

                return Ok(checksum);
            }

            received += 1;
            trace!("Ignoring {:#04x} while waiting for handshake", byte);
        }
    }
}

/// Sends `packet` until it's acknowledged or the retries are exhausted
fn send_packet<L: Link>(
    session: &mut TransferSession<L>,
    config: &XmodemConfig,
    packet: &Packet<'_>,
    index: usize,
) -> Result<(), FailureCause> {
    let mut retries = 0;

    loop {
        trace!("Sending packet {} (block {})", index, packet.block);

        packet.to_writer(session.link())?;
        session.link().flush()?;

        match read_reply(session.link())? {
            None => return Err(FailureCause::ResponseTimeout),
            Some(Reply::Ack) => return Ok(()),
            Some(Reply::Can) => {
                return Err(FailureCause::WriteRejected(Rejection::ReceiverCancelled));
            }
            Some(reply) => {
                if retries >= config.max_retries {
                    return Err(FailureCause::ChecksumExceeded { packet: index });
                }

                retries += 1;
                session.record_retransmission();

                warn!(
                    "Packet {} was answered with {:?}, retransmitting ({}/{})",
                    index, reply, retries, config.max_retries
                );
            }
        }
    }
}

/// Ends the transmission once every packet has been acknowledged
fn finish<L: Link>(
    session: &mut TransferSession<L>,
    config: &XmodemConfig,
    packets: usize,
) -> Result<(), FailureCause> {
    let mut retries = 0;

    loop {
        EndOfTransmission.to_writer(session.link())?;
        session.link().flush()?;

        match read_reply(session.link())? {
            None => return Err(FailureCause::ResponseTimeout),
            Some(Reply::Ack) => return Ok(()),
            Some(Reply::Can) => {
                return Err(FailureCause::WriteRejected(Rejection::ReceiverCancelled));
            }
            Some(reply) => {
                // Some receivers NAK the first EOT to make sure it's not line noise
                if retries >= config.max_retries {
                    return Err(FailureCause::ChecksumExceeded { packet: packets });
                }

                retries += 1;
                trace!("EOT answered with {:?}, sending it again", reply);
            }
        }
    }
}

/// Reads the receiver's answer, returning `Reply::Can` only for two consecutive `CAN`s
///
/// A lone `CAN` is line noise, so the reply that follows it is taken as the answer. A lone `CAN`
/// followed by silence counts as a corrupted reply.
fn read_reply<L: Link>(link: &mut L) -> io::Result<Option<Reply>> {
    match read_byte_reply(link)? {
        Some(Reply::Can) => match read_byte_reply(link)? {
            Some(reply) => Ok(Some(reply)),
            None => Ok(Some(Reply::Other(Control::Can.into()))),
        },
        reply => Ok(reply),
    }
}

fn read_byte_reply<L: Link>(link: &mut L) -> io::Result<Option<Reply>> {
    match Reply::from_reader(&mut *link) {
        Ok(reply) => Ok(Some(reply)),
        Err(err) if is_timeout(&err) => Ok(None),
        Err(err) => Err(err),
    }
}
