//! In-memory duplex transport and session helpers shared by the
//! integration tests.
#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::path::PathBuf;

use crossbeam_channel::{unbounded, Receiver, Sender};
use engine::{run_receiver, run_sender, SessionConfig, Statistics};
use metadata::LocalFilesystem;

/// Reading half of one pipe direction.
pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
}

/// Writing half of one pipe direction.
pub struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.buf.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = (self.buf.len() - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Builds the two endpoints of an in-memory duplex connection.
pub fn duplex() -> ((PipeReader, PipeWriter), (PipeReader, PipeWriter)) {
    let (a_to_b, from_a) = unbounded();
    let (b_to_a, from_b) = unbounded();
    (
        (
            PipeReader { rx: from_b, buf: Vec::new(), pos: 0 },
            PipeWriter { tx: a_to_b },
        ),
        (
            PipeReader { rx: from_a, buf: Vec::new(), pos: 0 },
            PipeWriter { tx: b_to_a },
        ),
    )
}

/// Installs the test tracing subscriber once; respects `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Runs a full sender/receiver session over an in-memory connection and
/// returns both sides' `(success, statistics)` results.
pub fn run_session(
    config: &SessionConfig,
    sources: Vec<PathBuf>,
    dest: PathBuf,
) -> ((bool, Statistics), (bool, Statistics)) {
    init_tracing();
    let ((sender_read, sender_write), (receiver_read, receiver_write)) = duplex();

    let sender_config = config.clone();
    let sender_thread = std::thread::spawn(move || {
        run_sender(
            &sender_config,
            &LocalFilesystem::new(),
            &sources,
            sender_read,
            sender_write,
        )
    });

    let receiver_result = run_receiver(
        config,
        &LocalFilesystem::new(),
        &dest,
        receiver_read,
        receiver_write,
    )
    .expect("receiver session succeeds");

    let sender_result = sender_thread
        .join()
        .expect("sender thread finishes")
        .expect("sender session succeeds");

    (sender_result, receiver_result)
}
