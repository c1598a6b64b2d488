//! Generator role: walks received file-list segments and emits block
//! checksums for the files the receiving side wants.
//!
//! The generator owns the outbound half of the receive-side connection.
//! Work arrives as [`GeneratorJob`]s from the receiver thread: freshly
//! decoded segments, retry requests for files that failed verification, and
//! phase transitions. For each wanted regular file it writes the file's
//! index, an itemize word with the transfer bit, and the signature of the
//! local replica (an all-zero header when none exists). Directory creation
//! and symlink materialisation happen here too, with directory attribute
//! fix-ups deferred until the first tear-down phase so they are applied
//! after the directory's contents stopped changing.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use checksums::strong::seeded_block_digest;
use checksums::{RollingChecksum, SumHeader};
use crossbeam_channel::Receiver as JobReceiver;
use flist::{path::resolve_under_root, FileInfo, Filelist};
use metadata::{FileAttrs, FileType, Filesystem};
use protocol::channel::SharedWriter;
use protocol::varint::IndexEncoder;
use protocol::{ChannelWrite, MessageCode, TextCodec, INDEX_DONE, INDEX_OFFSET};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{EngineError, IoErrorBits};
use crate::item;
use crate::phase::TransferPhase;

/// Work items flowing from the receiver thread to the generator.
#[derive(Debug)]
pub enum GeneratorJob {
    /// A segment was installed at this position in the shared file list.
    Segment(usize),
    /// Re-request the file at this index after a failed verification.
    Resend(i32),
    /// The receiver advanced to this phase; acknowledge with `DONE`.
    AdvancePhase(TransferPhase),
    /// Stop without further output (error path).
    Finish,
}

/// The request-producing half of the receiving side.
pub struct Generator<'a, W: Write> {
    config: &'a SessionConfig,
    fs: &'a (dyn Filesystem + Sync),
    codec: TextCodec,
    tx: SharedWriter<W>,
    ndx_out: IndexEncoder,
    filelist: Arc<Mutex<Filelist>>,
    dest_root: PathBuf,
    seed: i32,
    errors: IoErrorBits,
    jobs: JobReceiver<GeneratorJob>,
    deferred: Vec<(PathBuf, FileAttrs)>,
}

impl<'a, W: Write> Generator<'a, W> {
    /// Builds a generator over the shared outbound writer.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'a SessionConfig,
        fs: &'a (dyn Filesystem + Sync),
        codec: TextCodec,
        tx: SharedWriter<W>,
        filelist: Arc<Mutex<Filelist>>,
        dest_root: PathBuf,
        seed: i32,
        errors: IoErrorBits,
        jobs: JobReceiver<GeneratorJob>,
    ) -> Self {
        Self {
            config,
            fs,
            codec,
            tx,
            ndx_out: IndexEncoder::new(),
            filelist,
            dest_root,
            seed,
            errors,
            jobs,
            deferred: Vec::new(),
        }
    }

    /// Processes jobs until the stop phase or channel closure.
    pub fn run(mut self) -> Result<(), EngineError> {
        while let Ok(job) = self.jobs.recv() {
            match job {
                GeneratorJob::Segment(position) => self.process_segment(position)?,
                GeneratorJob::Resend(index) => self.resend(index)?,
                GeneratorJob::AdvancePhase(phase) => {
                    if phase == TransferPhase::TearDown1 {
                        self.run_deferred_jobs();
                    }
                    self.ndx_out.write_index(&mut self.tx, INDEX_DONE)?;
                    self.tx.flush()?;
                    if phase.is_stop() {
                        return Ok(());
                    }
                }
                GeneratorJob::Finish => return Ok(()),
            }
        }
        // Channel closed: the receiver went away, taking the session's
        // outcome with it.
        Ok(())
    }

    fn members_of(&self, position: usize) -> Vec<(i32, Arc<FileInfo>)> {
        let list = self.filelist.lock().unwrap_or_else(PoisonError::into_inner);
        list.segments()[position]
            .iter()
            .map(|(index, info)| (index, Arc::clone(info)))
            .collect()
    }

    fn process_segment(&mut self, position: usize) -> Result<(), EngineError> {
        let members = self.members_of(position);

        for (index, info) in &members {
            self.process_entry(*index, info)?;
        }

        if self.config.recursive {
            for (index, info) in &members {
                if info.is_directory() && !info.is_dot_dir() {
                    self.ndx_out
                        .write_index(&mut self.tx, INDEX_OFFSET - index)?;
                }
            }
        }

        self.ndx_out.write_index(&mut self.tx, INDEX_DONE)?;
        self.tx.flush()?;
        Ok(())
    }

    fn process_entry(&mut self, index: i32, info: &FileInfo) -> Result<(), EngineError> {
        let Some(name) = info.name() else {
            self.report_entry_error(&format!(
                "cannot represent file name {:?} locally",
                String::from_utf8_lossy(info.name_bytes())
            ))?;
            return Ok(());
        };

        if self.config.list_only {
            info!(index, name, kind = ?info.file_type(), "list entry");
            return Ok(());
        }

        let path = match resolve_under_root(&self.dest_root, name) {
            Ok(path) => path,
            Err(e) => {
                // The entry stays in the list so indices remain aligned with
                // the peer; it is simply never opened.
                self.report_entry_error(&e.to_string())?;
                return Ok(());
            }
        };

        match info.file_type() {
            FileType::Directory => {
                if let Err(e) = self.fs.create_dir(&path) {
                    self.report_entry_error(&e.to_string())?;
                    return Ok(());
                }
                self.deferred.push((path, info.attrs().clone()));
            }
            FileType::Symlink => self.make_symlink(index, info, &path)?,
            FileType::BlockDevice | FileType::CharDevice | FileType::Fifo | FileType::Socket => {
                debug!(index, name, "special entry itemized, local creation not supported");
            }
            FileType::Regular => self.request_regular(index, info, &path)?,
            FileType::Unknown => {
                debug!(index, name, "skipping entry of unknown type");
            }
        }
        Ok(())
    }

    fn make_symlink(&mut self, index: i32, info: &FileInfo, path: &Path) -> Result<(), EngineError> {
        if !self.config.preserve_links {
            return Ok(());
        }
        let Some(target) = info.symlink_target() else {
            return Ok(());
        };
        let Some(target_str) = self.codec.decode(target) else {
            self.report_entry_error("symlink target is not representable locally")?;
            return Ok(());
        };
        match self.fs.make_symlink(path, Path::new(&target_str)) {
            Ok(()) => {
                debug!(index, path = %path.display(), flags = item::LOCAL_CHANGE, "symlink applied");
            }
            Err(e) => self.report_entry_error(&e.to_string())?,
        }
        Ok(())
    }

    fn request_regular(
        &mut self,
        index: i32,
        info: &FileInfo,
        path: &Path,
    ) -> Result<(), EngineError> {
        let replica = match self.fs.stat_if_exists(path) {
            Ok(replica) => replica.filter(FileAttrs::is_regular),
            Err(e) => {
                self.report_entry_error(&e.to_string())?;
                return Ok(());
            }
        };

        let iflags = item::itemize_regular(self.config, info, replica.as_ref());
        let wanted = replica
            .as_ref()
            .is_none_or(|r| !r.quick_check_matches(info.attrs()))
            || self.config.always_itemize;
        if !wanted {
            debug!(index, path = %path.display(), "replica up to date");
            return Ok(());
        }

        self.send_request(index, iflags | item::TRANSFER, replica.as_ref(), path)
    }

    fn send_request(
        &mut self,
        index: i32,
        iflags: u16,
        replica: Option<&FileAttrs>,
        path: &Path,
    ) -> Result<(), EngineError> {
        self.ndx_out.write_index(&mut self.tx, index)?;
        self.tx.put_char(iflags)?;

        match replica {
            Some(attrs) => self.write_sums(attrs.size, path)?,
            None => self.write_sum_header(&SumHeader::EMPTY)?,
        }
        self.tx.flush()?;
        Ok(())
    }

    fn write_sum_header(&mut self, header: &SumHeader) -> Result<(), EngineError> {
        self.tx.put_int(header.chunk_count() as i32)?;
        self.tx.put_int(header.block_length() as i32)?;
        self.tx.put_int(header.digest_length() as i32)?;
        self.tx.put_int(header.remainder() as i32)?;
        Ok(())
    }

    /// Reads the replica block by block, emitting one `(rolling, strong)`
    /// row per chunk.
    fn write_sums(&mut self, size: u64, path: &Path) -> Result<(), EngineError> {
        let header = SumHeader::for_file_size(size);
        let file = match File::open(path) {
            Ok(file) => file,
            Err(_) => {
                // Vanished since the stat; advertise "no replica".
                self.write_sum_header(&SumHeader::EMPTY)?;
                return Ok(());
            }
        };
        self.write_sum_header(&header)?;

        let mut reader = BufReader::new(file);
        let mut block = vec![0u8; header.block_length() as usize];
        for chunk_index in 0..header.chunk_count() {
            let want = header.chunk_length(chunk_index) as usize;
            let mut filled = 0;
            while filled < want {
                match reader.read(&mut block[filled..want]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e.into()),
                }
            }
            // A short read means the file shrank under us; the padded zero
            // tail simply yields digests the sender will not match.
            block[filled..want].fill(0);

            let rolling = RollingChecksum::of(&block[..want]).value();
            let strong = seeded_block_digest(&block[..want], self.seed);
            self.tx.put_int(rolling as i32)?;
            self.tx.put_bytes(&strong[..header.digest_length()])?;
        }
        Ok(())
    }

    fn resend(&mut self, index: i32) -> Result<(), EngineError> {
        let entry = {
            let list = self.filelist.lock().unwrap_or_else(PoisonError::into_inner);
            list.segment_with(index)
                .and_then(|segment| segment.get(index))
                .cloned()
        };
        let Some(info) = entry else {
            return Err(EngineError::Internal(format!(
                "resend requested for unknown index {index}"
            )));
        };
        let Some(name) = info.name() else {
            return Ok(());
        };
        let path = resolve_under_root(&self.dest_root, name)?;
        let replica = self
            .fs
            .stat_if_exists(&path)
            .ok()
            .flatten()
            .filter(FileAttrs::is_regular);

        info!(index, path = %path.display(), "re-requesting file after digest mismatch");
        self.send_request(
            index,
            item::itemize_regular(self.config, &info, replica.as_ref()) | item::TRANSFER,
            replica.as_ref(),
            &path,
        )
    }

    /// Applies deferred directory attributes, children-first so parent
    /// mtimes are not disturbed again.
    fn run_deferred_jobs(&mut self) {
        let jobs = std::mem::take(&mut self.deferred);
        for (path, attrs) in jobs.into_iter().rev() {
            let perms = if self.config.preserve_permissions {
                attrs.perms()
            } else {
                self.config.default_dir_perms
            };
            if let Err(e) = self.fs.set_mode(&path, perms) {
                self.errors.record(IoErrorBits::GENERAL);
                warn!(path = %path.display(), error = %e, "directory chmod failed");
            }
            if self.config.preserve_times {
                if let Err(e) = self.fs.set_mtime(&path, attrs.mtime) {
                    self.errors.record(IoErrorBits::GENERAL);
                    warn!(path = %path.display(), error = %e, "directory mtime failed");
                }
            }
        }
    }

    fn report_entry_error(&mut self, text: &str) -> Result<(), EngineError> {
        self.errors.record(IoErrorBits::GENERAL);
        warn!("{text}");
        let payload = self
            .codec
            .encode(text)
            .unwrap_or_else(|| text.as_bytes().to_vec());
        self.tx.send_message(MessageCode::Error, &payload)?;
        Ok(())
    }
}
