use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

use structopt::StructOpt;

use boardflash::transfer::{PacketSize, RecoveryConfig, XmodemConfig};

#[derive(StructOpt, Debug)]
pub enum Command {
    /// Compose the flash image of a board and inject the mask ROM header
    Make {
        /// The largest first stage payload the header accepts
        #[structopt(long = "max-payload", parse(try_from_str = parse_number))]
        max_payload: Option<usize>,
    },
    /// Prepend the mask ROM header to a binary, writing <file>.normal.out
    Header {
        /// The binary to wrap
        file: PathBuf,
    },
    /// Send an image to a running first stage
    Run {
        /// The image to send
        image: PathBuf,
    },
    /// Send bt0 with the main binary appended at a fixed offset
    RunPayload {
        /// The bt0 binary
        bt0: PathBuf,
        /// The main binary
        main: PathBuf,
        /// Offset at which the main binary is placed
        #[structopt(long = "offset", default_value = "0x8000", parse(try_from_str = parse_number))]
        offset: usize,
    },
    /// Send an image to the recovery agent in the mask ROM
    Recover {
        /// The image to send
        image: PathBuf,
    },
}

#[derive(StructOpt, Debug)]
pub struct Opts {
    #[structopt(subcommand)]
    pub command: Command,

    /// The serial device to connect to
    #[structopt(
        env = "SERIAL_PORT",
        short = "p",
        long = "port",
        default_value = "/dev/ttyUSB0"
    )]
    pub serial_port: String,
    /// The serial baud rate
    #[structopt(
        env = "BAUD_RATE",
        short = "b",
        long = "baud-rate",
        default_value = "115200"
    )]
    pub baud_rate: u32,
    /// The board descriptor describing the flash layout
    #[structopt(
        env = "BOARD_DESCRIPTOR",
        short = "d",
        long = "descriptor",
        default_value = "board.toml"
    )]
    pub descriptor: PathBuf,
    /// Directory holding the built artifacts, and where images are written to
    #[structopt(env = "DIST_DIR", long = "dist", default_value = "target/dist")]
    pub dist: PathBuf,
    /// How long to wait for the receiver to start the transfer, in milliseconds
    #[structopt(long = "handshake-timeout-ms", default_value = "10000")]
    pub handshake_timeout_ms: u64,
    /// How long to wait for each acknowledgement, in milliseconds
    #[structopt(long = "ack-timeout-ms", default_value = "3000")]
    pub ack_timeout_ms: u64,
    /// Number of times a packet is sent again before the transfer fails
    #[structopt(long = "max-retries", default_value = "10")]
    pub max_retries: usize,
    /// Packet size of the normal transfer, 128 or 1024
    #[structopt(long = "packet-size", default_value = "128", parse(try_from_str = parse_packet_size))]
    pub packet_size: PacketSize,
}

impl Opts {
    pub fn xmodem_config(&self) -> XmodemConfig {
        XmodemConfig {
            packet_size: self.packet_size,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            max_retries: self.max_retries,
            ..XmodemConfig::default()
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            baud_rate: self.baud_rate,
            ready_timeout: Duration::from_millis(self.handshake_timeout_ms),
            ..RecoveryConfig::default()
        }
    }
}

/// Parses a decimal or `0x` prefixed hexadecimal number
fn parse_number(s: &str) -> Result<usize, ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn parse_packet_size(s: &str) -> Result<PacketSize, String> {
    match s {
        "128" => Ok(PacketSize::Standard),
        "1024" | "1k" => Ok(PacketSize::OneK),
        _ => Err(format!("unsupported packet size {:?}, expected 128 or 1024", s)),
    }
}
