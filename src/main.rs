use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context};
use log::info;
use structopt::StructOpt;

use boardflash::header::{self, HeaderConfig};
use boardflash::image::{self, Artifacts, ComposedImage};
use boardflash::{
    ArtifactNames, BoardDescriptor, Cancellation, Error, Header, SerialPort, TransferStrategy,
};

mod cli;

use cli::{Command, Opts};

/// Wraps a stage error so the reported chain names the stage that failed
fn staged<T, E: Into<Error>>(result: Result<T, E>) -> Result<T, anyhow::Error> {
    result.map_err(|err| {
        let err = err.into();
        let stage = err.stage();

        anyhow::Error::new(err).context(format!("The {} stage failed", stage))
    })
}

fn make(opts: &Opts, max_payload: Option<usize>) -> Result<(), anyhow::Error> {
    let descriptor = staged(BoardDescriptor::load(&opts.descriptor))?;
    let names = ArtifactNames::for_board(descriptor.board().name.as_str());

    info!(
        "Composing image for {} from {}",
        descriptor.board().name,
        opts.dist.display()
    );

    let artifacts = staged(Artifacts::from_dir(&opts.dist, &descriptor))?;
    let mut image = staged(ComposedImage::compose(&descriptor, &artifacts))?;

    let all_path = opts.dist.join(names.all());
    staged(image.write_to(&all_path))?;

    info!(
        "Wrote {} ({} bytes, sha256 {})",
        all_path.display(),
        image.len(),
        image.sha256()
    );

    let config = HeaderConfig {
        max_payload: max_payload.unwrap_or(header::DEFAULT_MAX_PAYLOAD),
        ..HeaderConfig::default()
    };
    let header = staged(header::inject(&mut image, &config))?;

    let out_path = header::output_path(&all_path);
    staged(image.write_to(&out_path))?;

    info!(
        "Wrote {} with a {} byte payload (crc32 {:#010x}, sha256 {})",
        out_path.display(),
        header.payload_len,
        header.crc32,
        image.sha256()
    );

    Ok(())
}

fn wrap_header<P: AsRef<Path>>(path: P) -> Result<(), anyhow::Error> {
    let path = path.as_ref();
    let payload = fs::read(path).with_context(|| format!("Could not read {}", path.display()))?;
    let out = staged(Header::wrap(&payload, &HeaderConfig::default()))?;
    let out_path = header::output_path(path);

    fs::write(&out_path, &out)
        .with_context(|| format!("Could not write {}", out_path.display()))?;

    info!("Wrote {} ({} bytes)", out_path.display(), out.len());

    Ok(())
}

fn send(
    opts: &Opts,
    strategy: TransferStrategy,
    image: &[u8],
    cancel: &Cancellation,
) -> Result<(), anyhow::Error> {
    println!("Using serial device {:?}", opts.serial_port);

    let port = staged(SerialPort::open(&opts.serial_port, opts.baud_rate))?;
    let outcome = staged(boardflash::transfer(port, strategy, image, cancel))?;
    let bytes = staged(outcome.into_result())?;

    println!("Transferred {} bytes", bytes);

    Ok(())
}

fn read_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, anyhow::Error> {
    let path = path.as_ref();

    fs::read(path).with_context(|| format!("Could not read {}", path.display()))
}

fn main() -> Result<(), anyhow::Error> {
    // Create a logger with a timestamp that logs everything at Info level or above
    pretty_env_logger::init_timed();

    // Parse the command-line arguments
    let opts = Opts::from_args();

    // Stop a running transfer at the next packet or chunk boundary on Ctrl-C
    let cancel = Cancellation::new();
    let handle = cancel.clone();

    ctrlc::set_handler(move || handle.cancel())
        .map_err(|err| anyhow!("Could not install the Ctrl-C handler: {}", err))?;

    match &opts.command {
        Command::Make { max_payload } => make(&opts, *max_payload)?,
        Command::Header { file } => wrap_header(file)?,
        Command::Run { image } => {
            let image = read_file(image)?;

            send(
                &opts,
                TransferStrategy::Normal(opts.xmodem_config()),
                &image,
                &cancel,
            )?;
        }
        Command::RunPayload { bt0, main, offset } => {
            let bt0 = read_file(bt0)?;
            let main = read_file(main)?;
            let image = staged(image::with_payload(&bt0, *offset, &main))?;

            send(
                &opts,
                TransferStrategy::Normal(opts.xmodem_config()),
                &image,
                &cancel,
            )?;
        }
        Command::Recover { image } => {
            let image = read_file(image)?;

            send(
                &opts,
                TransferStrategy::Recovery(opts.recovery_config()),
                &image,
                &cancel,
            )?;
        }
    }

    Ok(())
}
