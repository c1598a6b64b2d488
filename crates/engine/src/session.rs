//! Session entry points and the receive-side supervisor.
//!
//! [`run_sender`] and [`run_receiver`] perform the handshake on raw
//! streams, wrap them in the multiplexed channel pair, and drive their role
//! to completion. The receive side runs its two workers under a scoped
//! supervisor: the first failure cancels the sibling (by closing the job
//! queue or abandoning the connection) and is the error the caller sees;
//! later failures are logged and suppressed.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use flist::Filelist;
use metadata::Filesystem;
use protocol::channel::{Demux, PrefetchReader, SharedWriter};
use protocol::handshake::{
    exchange_versions_as_client, exchange_versions_as_server, read_seed, write_seed,
    ProtocolVersion,
};
use tracing::{debug, error, info};

use crate::config::SessionConfig;
use crate::error::{EngineError, IoErrorBits};
use crate::generator::{Generator, GeneratorJob};
use crate::messages::SessionMessages;
use crate::receiver::Receiver;
use crate::sender::Sender;
use crate::stats::{SharedStatistics, Statistics};

/// Runs the sending role over a duplex transport.
///
/// The sender acts as the protocol server: it validates the peer's version
/// line and chooses the session checksum seed. Returns the success flag and
/// the accumulated statistics; the flag is false whenever any I/O error bit
/// was recorded on either side.
pub fn run_sender<R, W>(
    config: &SessionConfig,
    fs: &(dyn Filesystem + Sync),
    sources: &[PathBuf],
    reader: R,
    writer: W,
) -> Result<(bool, Statistics), EngineError>
where
    R: Read,
    W: Write,
{
    let codec = config.text_codec()?;
    let mut reader = PrefetchReader::new(reader);
    let mut writer = writer;

    let version = exchange_versions_as_server(&mut reader, &mut writer, ProtocolVersion::NEWEST)?;
    let seed = derive_seed();
    write_seed(&mut writer, seed)?;
    read_empty_filter_rules(config, &mut reader)?;
    info!(%version, seed, "sender session established");

    let errors = IoErrorBits::new();
    let tx = SharedWriter::new(writer);
    let rx = Demux::from_reader(reader, tx.clone(), SessionMessages::new(codec, errors.clone()));

    let sender = Sender::new(config, fs, codec, rx, tx, seed, errors.clone());
    let mut stats = sender.run(sources)?;
    stats.io_errors = errors.get();
    Ok((stats.is_success(), stats))
}

/// Runs the receiving role (generator plus receiver) over a duplex
/// transport, installing into `dest_root`.
pub fn run_receiver<R, W>(
    config: &SessionConfig,
    fs: &(dyn Filesystem + Sync),
    dest_root: &Path,
    reader: R,
    writer: W,
) -> Result<(bool, Statistics), EngineError>
where
    R: Read,
    W: Write + Send,
{
    let codec = config.text_codec()?;
    let mut reader = PrefetchReader::new(reader);
    let mut writer = writer;

    let version = exchange_versions_as_client(&mut reader, &mut writer, ProtocolVersion::NEWEST)?;
    let seed = read_seed(&mut reader)?;
    write_empty_filter_rules(config, &mut writer)?;
    info!(%version, seed, "receiver session established");

    let errors = IoErrorBits::new();
    let stats = SharedStatistics::new();
    let filelist = Arc::new(Mutex::new(Filelist::new(config.recursive)));
    let (job_tx, job_rx) = crossbeam_channel::bounded::<GeneratorJob>(128);

    let tx = SharedWriter::new(writer);
    let messages = SessionMessages::new(codec, errors.clone());
    let rx = Demux::from_reader(reader, tx.clone(), messages.clone());

    let generator = Generator::new(
        config,
        fs,
        codec,
        tx.clone(),
        Arc::clone(&filelist),
        dest_root.to_path_buf(),
        seed,
        errors.clone(),
        job_rx,
    );
    let receiver = Receiver::new(
        config,
        fs,
        codec,
        rx,
        tx,
        messages,
        filelist,
        dest_root.to_path_buf(),
        job_tx,
        stats.clone(),
        errors.clone(),
    );

    let (receiver_result, generator_result) = std::thread::scope(|scope| {
        let generator_handle = scope.spawn(move || generator.run());
        let receiver_result = receiver.run();
        // The receiver owns the job queue; by the time `run` returns, the
        // queue is closed and the generator drains to completion.
        let generator_result = generator_handle
            .join()
            .unwrap_or_else(|_| Err(EngineError::Internal("generator worker panicked".to_owned())));
        (receiver_result, generator_result)
    });

    first_error(receiver_result, generator_result)?;

    let mut snapshot = stats.snapshot();
    snapshot.io_errors = errors.get();
    debug!(?snapshot, "receiver session finished");
    Ok((snapshot.is_success(), snapshot))
}

/// Collapses the two worker results into the error the caller sees.
fn first_error(
    receiver: Result<(), EngineError>,
    generator: Result<(), EngineError>,
) -> Result<(), EngineError> {
    match (receiver, generator) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), Ok(())) => Err(e),
        (Ok(()), Err(e)) => Err(e),
        (Err(receiver_err), Err(generator_err)) => {
            // Interruption is a symptom of the sibling's failure, not a
            // cause; prefer the substantive error.
            let (primary, suppressed) =
                if matches!(receiver_err, EngineError::Interrupted) {
                    (generator_err, receiver_err)
                } else {
                    (receiver_err, generator_err)
                };
            error!(suppressed = %suppressed, "suppressing secondary worker failure");
            Err(primary)
        }
    }
}

/// The core negotiates empty rule sets only: a bare zero-length terminator
/// in each configured direction, on the raw stream before multiplexing
/// starts.
fn write_empty_filter_rules<W: Write>(
    config: &SessionConfig,
    writer: &mut W,
) -> Result<(), EngineError> {
    if config.filter_mode != crate::config::FilterMode::None {
        writer.write_all(&0i32.to_le_bytes())?;
        writer.flush()?;
    }
    Ok(())
}

fn read_empty_filter_rules<R: Read>(
    config: &SessionConfig,
    reader: &mut PrefetchReader<R>,
) -> Result<(), EngineError> {
    if config.filter_mode != crate::config::FilterMode::None {
        let mut raw = [0u8; 4];
        reader.read_exact_buf(&mut raw)?;
        let len = i32::from_le_bytes(raw);
        if len != 0 {
            return Err(protocol::ProtocolError::Violation(format!(
                "peer sent {len} bytes of filter rules; only empty rule sets are supported"
            ))
            .into());
        }
    }
    Ok(())
}

fn derive_seed() -> i32 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now.as_secs() as i32) ^ (now.subsec_nanos() as i32)
}
