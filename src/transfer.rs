//! Delivery of finished images to a board
//!
//! A [`TransferSession`] owns the device for the duration of one delivery attempt and drives one
//! of the two protocols selected through [`TransferStrategy`]. Sessions never retry as a whole;
//! only the packet acknowledgement loop of the normal protocol retransmits.

pub mod recovery;
pub mod wire;
pub mod xmodem;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashSet;
use std::fmt;
use std::io::{self, Read, Write};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use log::{debug, info, trace, warn};
use thiserror::Error;

pub use recovery::{RecoveryConfig, RecoveryStatus};
pub use xmodem::{PacketSize, XmodemConfig};

/// A byte oriented link to a device, such as a serial port.
pub trait Link: Read + Write {
    /// Name that identifies the underlying device
    fn name(&self) -> String;

    /// Sets the timeout of subsequent reads
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Discards bytes that were received but not read yet
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The protocol used to deliver an image, chosen by the operator
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransferStrategy {
    /// Packet transfer to a running first stage
    Normal(XmodemConfig),
    /// Bulk transfer to the recovery agent in the mask ROM
    Recovery(RecoveryConfig),
}

impl fmt::Display for TransferStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStrategy::Normal(_) => f.write_str("normal"),
            TransferStrategy::Recovery(_) => f.write_str("recovery"),
        }
    }
}

/// Why the device refused the image
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Rejection {
    /// The receiver cancelled the packet transfer
    ReceiverCancelled,
    /// The recovery agent reported a status code
    Status(u16),
    /// The recovery agent answered with something that is neither `OK` nor `FL`
    UnexpectedStatus([u8; 2]),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::ReceiverCancelled => f.write_str("receiver cancelled the transfer"),
            Rejection::Status(code) => {
                write!(f, "{} ({:#06x})", RecoveryStatus::from(*code), code)
            }
            Rejection::UnexpectedStatus(buf) => write!(f, "unexpected status {:02x?}", buf),
        }
    }
}

/// The cause of a failed session
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum FailureCause {
    #[error("No device responded")]
    NoDevice,
    #[error("The device did not complete the handshake in time")]
    HandshakeTimeout,
    #[error("Packet {packet} was not acknowledged after the maximum number of retransmissions")]
    ChecksumExceeded { packet: usize },
    #[error("The device rejected the image: {}", _0)]
    WriteRejected(Rejection),
    #[error("The device stopped responding")]
    ResponseTimeout,
    #[error("The transfer was cancelled")]
    Cancelled,
    #[error("I/O error on the link: {}", _0)]
    Io(String),
}

impl From<io::Error> for FailureCause {
    fn from(err: io::Error) -> FailureCause {
        FailureCause::Io(err.to_string())
    }
}

/// State of a transfer session
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    Handshake,
    Transmitting { packet_index: usize },
    WaitReady,
    BulkSend { offset: usize },
    Completed,
    Failed(FailureCause),
}

/// Result of a finished session
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransferOutcome {
    Succeeded {
        /// Number of image bytes delivered
        bytes: usize,
        /// Number of packets that had to be sent again
        retransmissions: usize,
    },
    Failed(FailureCause),
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferOutcome::Succeeded { .. })
    }

    /// Converts the outcome into a `Result`, turning failures into `TransferError::Failed`
    pub fn into_result(self) -> Result<usize, TransferError> {
        match self {
            TransferOutcome::Succeeded { bytes, .. } => Ok(bytes),
            TransferOutcome::Failed(cause) => Err(TransferError::Failed(cause)),
        }
    }
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Device {} is busy with another transfer", _0)]
    DeviceBusy(String),
    #[error("Serial device {} not found", _0)]
    NoDevice(String),
    #[error("Error when opening serial port {}: {}", _0, _1)]
    OpenError(String, serialport::Error),
    #[error("Transfer failed: {}", _0)]
    Failed(FailureCause),
}

/// Cooperative cancellation flag shared between the operator and a running session
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Cancellation {
        Cancellation::default()
    }

    /// Requests the session to stop at the next packet or chunk boundary
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn claimed_devices() -> &'static Mutex<HashSet<String>> {
    static CLAIMED: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

    CLAIMED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive claim on a device, released when dropped
#[derive(Debug)]
pub struct DeviceClaim {
    name: String,
}

impl DeviceClaim {
    /// Claims the device `name`, failing immediately if another session holds it
    pub fn acquire<S: Into<String>>(name: S) -> Result<DeviceClaim, TransferError> {
        let name = name.into();
        let mut claimed = claimed_devices()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if !claimed.insert(name.clone()) {
            return Err(TransferError::DeviceBusy(name));
        }

        trace!("Claimed device {}", name);

        Ok(DeviceClaim { name })
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        let mut claimed = claimed_devices()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        claimed.remove(&self.name);

        trace!("Released device {}", self.name);
    }
}

/// One delivery attempt over an exclusively owned link
pub struct TransferSession<L: Link> {
    link: L,
    strategy: TransferStrategy,
    state: SessionState,
    /// Number of image bytes delivered so far
    cursor: usize,
    retransmissions: usize,
    /// The first state of every phase of the last run
    history: Vec<SessionState>,
    _claim: DeviceClaim,
}

impl<L: Link> fmt::Debug for TransferSession<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSession")
            .field("device", &self.link.name())
            .field("strategy", &self.strategy)
            .field("state", &self.state)
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl<L: Link> TransferSession<L> {
    /// Starts a session on `link`, claiming its device
    pub fn new(link: L, strategy: TransferStrategy) -> Result<TransferSession<L>, TransferError> {
        let claim = DeviceClaim::acquire(link.name())?;

        Ok(TransferSession {
            link,
            strategy,
            state: SessionState::Idle,
            cursor: 0,
            retransmissions: 0,
            history: vec![SessionState::Idle],
            _claim: claim,
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// The phases the last run went through, in order
    ///
    /// Each phase appears once with the state it was entered with, so a normal transfer that
    /// succeeds reads `Idle, Handshake, Transmitting { packet_index: 0 }, Completed`.
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    /// Delivers `image`, ending in `Completed` or `Failed`
    ///
    /// The device stays claimed until the session is dropped. Running the session again starts
    /// over from `Idle`.
    pub fn run(&mut self, image: &[u8], cancel: &Cancellation) -> TransferOutcome {
        self.state = SessionState::Idle;
        self.history = vec![SessionState::Idle];
        self.cursor = 0;
        self.retransmissions = 0;

        info!(
            "Starting {} transfer of {} bytes to {}",
            self.strategy,
            image.len(),
            self.link.name()
        );

        let strategy = self.strategy.clone();
        let result = match &strategy {
            TransferStrategy::Normal(config) => xmodem::send(self, config, image, cancel),
            TransferStrategy::Recovery(config) => recovery::send(self, config, image, cancel),
        };

        match result {
            Ok(()) => {
                self.transition(SessionState::Completed);
                info!("Transferred {} bytes", self.cursor);

                TransferOutcome::Succeeded {
                    bytes: self.cursor,
                    retransmissions: self.retransmissions,
                }
            }
            Err(cause) => {
                warn!("Transfer failed after {} bytes: {}", self.cursor, cause);
                self.transition(SessionState::Failed(cause.clone()));

                TransferOutcome::Failed(cause)
            }
        }
    }

    pub(crate) fn transition(&mut self, state: SessionState) {
        trace!("{:?} -> {:?}", self.state, state);

        if mem::discriminant(&self.state) != mem::discriminant(&state) {
            self.history.push(state.clone());
        }

        self.state = state;
    }

    pub(crate) fn link(&mut self) -> &mut L {
        &mut self.link
    }

    pub(crate) fn advance(&mut self, bytes: usize) {
        self.cursor += bytes;
    }

    pub(crate) fn record_retransmission(&mut self) {
        self.retransmissions += 1;
    }
}

/// Delivers `image` over `link` with `strategy` in a single session
pub fn transfer<L: Link>(
    link: L,
    strategy: TransferStrategy,
    image: &[u8],
    cancel: &Cancellation,
) -> Result<TransferOutcome, TransferError> {
    let mut session = TransferSession::new(link, strategy)?;

    debug!("{:?}", session);

    Ok(session.run(image, cancel))
}

/// Reads a single byte, returning `None` if the read timed out
pub(crate) fn read_byte<R: Read>(reader: &mut R) -> io::Result<Option<u8>> {
    let mut buf = [0u8; 1];

    match reader.read(&mut buf) {
        Ok(0) => Ok(None),
        Ok(_) => Ok(Some(buf[0])),
        Err(err) if is_timeout(&err) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Fills `buf` as far as possible, returning the number of bytes read before a timeout
pub(crate) fn read_available<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        match read_byte(reader)? {
            Some(byte) => {
                buf[filled] = byte;
                filled += 1;
            }
            None => break,
        }
    }

    Ok(filled)
}

/// Returns true if `err` means that no data arrived in time
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::UnexpectedEof
    )
}
