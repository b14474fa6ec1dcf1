//! Recovery transfer to the agent in the mask ROM
//!
//! The agent answers a burst of sync bytes with `OK` once it's ready to accept an image. The image
//! is then sent in one go after a bulk header, without acknowledgements, and the agent reports
//! `OK` or `FL` followed by a status code when it's done.

use std::io;
use std::time::Duration;

use log::{debug, trace};
use num_enum::{FromPrimitive, IntoPrimitive};
use thiserror::Error;

use super::wire::{BulkHeader, Command, Response, Status, SyncBurst};
use super::{
    read_available, Cancellation, FailureCause, Link, Rejection, SessionState, TransferSession,
};

/// Indicates an error reported by the recovery agent
#[repr(u16)]
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, FromPrimitive)]
pub enum RecoveryStatus {
    #[error("The bulk header length does not match the data received")]
    LengthError = 0x0001,
    #[error("The image checksum does not match the bulk header")]
    ChecksumError = 0x0002,
    #[error("Could not erase the flash")]
    FlashEraseError = 0x0003,
    #[error("Flash write error")]
    FlashWriteError = 0x0004,
    #[error("The command was unexpected in this order")]
    SequenceError = 0x0005,
    #[error("The image does not fit the target memory")]
    ImageTooLarge = 0x0006,

    #[error("Unknown recovery agent status")]
    #[num_enum(default)]
    Unknown = 0xffff,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RecoveryConfig {
    /// Baud rate of the link, used to size the sync burst
    pub baud_rate: u32,
    /// How long to wait for the agent to report that it's ready
    pub ready_timeout: Duration,
    /// How long to wait for the final status after the image has been sent
    pub completion_timeout: Duration,
    /// Number of bytes written between cancellation checks
    pub chunk_size: usize,
}

impl Default for RecoveryConfig {
    fn default() -> RecoveryConfig {
        RecoveryConfig {
            baud_rate: 115_200,
            ready_timeout: Duration::from_secs(2),
            completion_timeout: Duration::from_secs(30),
            chunk_size: 4096,
        }
    }
}

/// Sends `image` to the recovery agent on the session's link
pub(crate) fn send<L: Link>(
    session: &mut TransferSession<L>,
    config: &RecoveryConfig,
    image: &[u8],
    cancel: &Cancellation,
) -> Result<(), FailureCause> {
    let header = BulkHeader::for_image(image)?;

    wait_ready(session, config, cancel)?;

    session.transition(SessionState::BulkSend { offset: 0 });
    header.to_writer(session.link())?;

    for chunk in image.chunks(config.chunk_size.max(1)) {
        if cancel.is_cancelled() {
            return Err(FailureCause::Cancelled);
        }

        session.link().write_all(chunk)?;
        session.advance(chunk.len());

        let offset = session.cursor();
        session.transition(SessionState::BulkSend { offset });
    }

    session.link().flush()?;
    session.link().set_timeout(config.completion_timeout)?;

    match read_status(session.link())? {
        None => Err(FailureCause::ResponseTimeout),
        Some(Status::Ok) => Ok(()),
        Some(Status::Failed(code)) => Err(FailureCause::WriteRejected(Rejection::Status(code))),
        Some(Status::Unexpected(buf)) => Err(FailureCause::WriteRejected(
            Rejection::UnexpectedStatus(buf),
        )),
    }
}

fn wait_ready<L: Link>(
    session: &mut TransferSession<L>,
    config: &RecoveryConfig,
    cancel: &Cancellation,
) -> Result<(), FailureCause> {
    if cancel.is_cancelled() {
        return Err(FailureCause::Cancelled);
    }

    session.transition(SessionState::WaitReady);

    let sync = SyncBurst::for_baud_rate(config.baud_rate);
    trace!("Sending {} x 0x55 bytes", sync.len);

    session.link().set_timeout(config.ready_timeout)?;
    sync.to_writer(session.link())?;
    session.link().flush()?;

    match read_status(session.link())? {
        None => Err(FailureCause::NoDevice),
        Some(Status::Ok) => {
            debug!("Recovery agent is ready");
            Ok(())
        }
        Some(Status::Failed(code)) => Err(FailureCause::WriteRejected(Rejection::Status(code))),
        Some(Status::Unexpected(buf)) => {
            debug!("Unexpected answer to sync: {:02x?}", buf);
            Err(FailureCause::HandshakeTimeout)
        }
    }
}

/// Reads a status, returning `None` if the agent sent nothing at all
fn read_status<L: Link>(link: &mut L) -> io::Result<Option<Status>> {
    let mut buf = [0u8; 4];
    let mut len = read_available(link, &mut buf[..2])?;

    if len == 0 {
        return Ok(None);
    } else if len < 2 {
        return Ok(Some(Status::Unexpected([buf[0], buf[1]])));
    }

    if &buf[..2] == b"FL" {
        len += read_available(link, &mut buf[2..])?;

        if len < 4 {
            return Ok(Some(Status::Unexpected([buf[0], buf[1]])));
        }
    }

    Status::from_reader(&buf[..len]).map(Some)
}
