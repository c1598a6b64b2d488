//! Receiver role: decodes file-list segments, applies delta streams to
//! temp files, verifies digests, and installs the results.
//!
//! The receiver owns the inbound half of the receive-side connection. It
//! feeds decoded segments and retry requests to the generator through the
//! job queue and never writes protocol data itself; its only outbound
//! traffic is out-of-band diagnostics.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use checksums::{Md5, SumHeader};
use crossbeam_channel::Sender as JobSender;
use flist::{
    path::resolve_under_root, DecodedEntry, FileInfo, Filelist, FlistDecoder, SegmentBuilder,
};
use metadata::{FileAttrs, Filesystem};
use protocol::channel::{Demux, SharedWriter};
use protocol::varint::IndexDecoder;
use protocol::{
    ChannelRead, MessageCode, ProtocolError, TextCodec, INDEX_DONE, INDEX_EOF, INDEX_OFFSET,
};
use rustc_hash::{FxHashMap, FxHashSet};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{EngineError, IoErrorBits};
use crate::generator::GeneratorJob;
use crate::item;
use crate::messages::SessionMessages;
use crate::phase::TransferPhase;
use crate::stats::SharedStatistics;

const COPY_CHUNK: usize = 32 * 1024;

/// How one file's reconstruction ended.
enum ReceiveOutcome {
    /// Temp file verified and renamed into place.
    Installed { literal: u64, matched: u64 },
    /// The replica already equals the source; nothing was renamed.
    ReplicaKept { matched: u64 },
    /// Digest comparison failed.
    Mismatch,
    /// The entry could not be written locally; the stream was drained.
    Discarded,
}

/// The reply-consuming half of the receiving side.
pub struct Receiver<'a, R: Read, W: Write> {
    config: &'a SessionConfig,
    fs: &'a (dyn Filesystem + Sync),
    codec: TextCodec,
    rx: Demux<R, W, SessionMessages>,
    tx: SharedWriter<W>,
    messages: SessionMessages,
    ndx_in: IndexDecoder,
    decoder: FlistDecoder,
    filelist: Arc<Mutex<Filelist>>,
    dest_root: PathBuf,
    jobs: JobSender<GeneratorJob>,
    stats: SharedStatistics,
    errors: IoErrorBits,
    transferred: FxHashSet<i32>,
    resend_pending: FxHashSet<i32>,
    uid_by_name: FxHashMap<String, Option<u32>>,
    gid_by_name: FxHashMap<String, Option<u32>>,
    segments_submitted: u64,
    segments_drained: u64,
    eof_seen: bool,
    phase: TransferPhase,
}

impl<'a, R: Read, W: Write> Receiver<'a, R, W> {
    /// Builds a receiver over an established connection.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'a SessionConfig,
        fs: &'a (dyn Filesystem + Sync),
        codec: TextCodec,
        rx: Demux<R, W, SessionMessages>,
        tx: SharedWriter<W>,
        messages: SessionMessages,
        filelist: Arc<Mutex<Filelist>>,
        dest_root: PathBuf,
        jobs: JobSender<GeneratorJob>,
        stats: SharedStatistics,
        errors: IoErrorBits,
    ) -> Self {
        Self {
            config,
            fs,
            codec,
            rx,
            tx,
            messages,
            ndx_in: IndexDecoder::new(),
            decoder: FlistDecoder::new(config.codec_options(), codec),
            filelist,
            dest_root,
            jobs,
            stats,
            errors,
            transferred: FxHashSet::default(),
            resend_pending: FxHashSet::default(),
            uid_by_name: FxHashMap::default(),
            gid_by_name: FxHashMap::default(),
            segments_submitted: 0,
            segments_drained: 0,
            eof_seen: false,
            phase: TransferPhase::Transfer,
        }
    }

    /// Runs the receiver until both peers agree to stop.
    pub fn run(mut self) -> Result<(), EngineError> {
        self.preflight()?;
        self.install_segment(None)?;

        while !self.phase.is_stop() {
            let index = self.ndx_in.read_index(&mut self.rx)?;
            match index {
                INDEX_DONE => self.handle_done()?,
                INDEX_EOF => self.handle_eof()?,
                index if index < 0 => self.handle_expansion(index)?,
                index => self.receive_file(index)?,
            }
            self.drain_no_send()?;
        }

        let _ = self.jobs.send(GeneratorJob::Finish);
        Ok(())
    }

    fn preflight(&mut self) -> Result<(), EngineError> {
        match self.fs.stat_if_exists(&self.dest_root)? {
            Some(attrs) if attrs.is_directory() => Ok(()),
            Some(_) => Err(EngineError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "destination {} exists and is not a directory",
                    self.dest_root.display()
                ),
            ))),
            None => {
                self.fs.create_dir(&self.dest_root)?;
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Wire dispatch
    // ------------------------------------------------------------------

    fn handle_done(&mut self) -> Result<(), EngineError> {
        match self.phase {
            TransferPhase::Transfer => {
                self.segments_drained += 1;
                if self.segments_drained > self.segments_submitted {
                    return Err(ProtocolError::UnexpectedIndex {
                        index: INDEX_DONE,
                        context: "more segment acknowledgements than segments",
                    }
                    .into());
                }
                self.maybe_advance()?;
            }
            TransferPhase::TearDown1 => {
                self.phase = TransferPhase::TearDown2;
                self.send_job(GeneratorJob::AdvancePhase(TransferPhase::TearDown2))?;
            }
            TransferPhase::TearDown2 => {
                self.phase = TransferPhase::Stop;
                self.send_job(GeneratorJob::AdvancePhase(TransferPhase::Stop))?;
            }
            TransferPhase::Stop => {
                return Err(ProtocolError::UnexpectedIndex {
                    index: INDEX_DONE,
                    context: "DONE after the stop phase",
                }
                .into());
            }
        }
        debug!(phase = ?self.phase, "receiver phase state");
        Ok(())
    }

    fn handle_eof(&mut self) -> Result<(), EngineError> {
        if !self.config.recursive {
            return Err(ProtocolError::UnexpectedIndex {
                index: INDEX_EOF,
                context: "EOF is only valid in recursive mode",
            }
            .into());
        }
        if self.eof_seen {
            return Err(ProtocolError::UnexpectedIndex {
                index: INDEX_EOF,
                context: "EOF arrived twice",
            }
            .into());
        }
        if self.lock_filelist().is_expandable() {
            return Err(ProtocolError::Violation(
                "peer ended the file list while stub directories await expansion".to_owned(),
            )
            .into());
        }
        self.eof_seen = true;
        self.maybe_advance()
    }

    fn handle_expansion(&mut self, index: i32) -> Result<(), EngineError> {
        let dir_index = INDEX_OFFSET - index;
        if dir_index < 0 {
            return Err(ProtocolError::UnexpectedIndex {
                index,
                context: "negative index outside the stub-offset range",
            }
            .into());
        }
        let stub = self.lock_filelist().take_stub(dir_index)?;
        debug!(dir_index, name = ?stub.name(), "expanding stub directory");
        self.install_segment(Some(stub))
    }

    /// Decodes one segment off the wire, installs it, and hands it to the
    /// generator.
    fn install_segment(&mut self, directory: Option<Arc<FileInfo>>) -> Result<(), EngineError> {
        let before = self.rx.data_consumed();
        let mut builder = SegmentBuilder::new(directory);
        loop {
            match self.decoder.decode_entry(&mut self.rx)? {
                DecodedEntry::Entry(info) => builder.add(info),
                DecodedEntry::End { io_error } => {
                    if io_error != 0 {
                        self.errors.record(io_error);
                    }
                    break;
                }
            }
        }
        let list_bytes = self.rx.data_consumed() - before;

        let (position, num_files, total_size, segments) = {
            let mut list = self.lock_filelist();
            let position = list.new_segment(builder);
            (
                position,
                list.num_files() as u64,
                list.total_file_size(),
                list.expanded_segments() as u64,
            )
        };
        self.stats.update(|stats| {
            stats.num_files = num_files;
            stats.total_file_size = total_size;
            stats.expanded_segments = segments;
            stats.total_file_list_size += list_bytes;
        });

        self.segments_submitted += 1;
        self.send_job(GeneratorJob::Segment(position))
    }

    fn maybe_advance(&mut self) -> Result<(), EngineError> {
        if self.phase != TransferPhase::Transfer {
            return Ok(());
        }
        let drained = self.segments_drained == self.segments_submitted;
        let eof_ok = !self.config.recursive || self.eof_seen;
        if drained && eof_ok && self.resend_pending.is_empty() && !self.lock_filelist().is_expandable()
        {
            if !self.errors.is_clean() {
                self.tx
                    .send_message(MessageCode::IoError, &self.errors.get().to_le_bytes())?;
            }
            self.phase = TransferPhase::TearDown1;
            self.send_job(GeneratorJob::AdvancePhase(TransferPhase::TearDown1))?;
        }
        Ok(())
    }

    fn drain_no_send(&mut self) -> Result<(), EngineError> {
        for index in self.messages.take_no_send() {
            warn!(index, "clearing state for file the sender refused");
            self.resend_pending.remove(&index);
            if let Some(segment) = self.lock_filelist().segment_with_mut(index) {
                segment.remove(index);
            }
        }
        self.maybe_advance()
    }

    // ------------------------------------------------------------------
    // File reconstruction
    // ------------------------------------------------------------------

    fn receive_file(&mut self, index: i32) -> Result<(), EngineError> {
        let iflags = self.rx.get_char()?;
        if iflags & item::TRANSFER == 0 {
            return Ok(());
        }
        let header = self.read_sum_header()?;

        let entry = self
            .lock_filelist()
            .segment_with(index)
            .and_then(|segment| segment.get(index))
            .cloned()
            .ok_or(ProtocolError::UnexpectedIndex {
                index,
                context: "file data for an index outside every segment",
            })?;

        let dest = match entry.name().map(|n| resolve_under_root(&self.dest_root, n)) {
            Some(Ok(dest)) => Some(dest),
            Some(Err(security)) => {
                self.report_security(&security)?;
                None
            }
            None => {
                self.report_text_error("file name is not representable locally")?;
                None
            }
        };

        let outcome = match dest.as_deref() {
            Some(dest) => self.reconstruct(&header, &entry, dest)?,
            None => {
                self.drain_tokens()?;
                ReceiveOutcome::Discarded
            }
        };

        match outcome {
            ReceiveOutcome::Installed { literal, matched } => {
                self.stats.update(|stats| {
                    stats.num_transferred_files += 1;
                    stats.total_literal_size += literal;
                    stats.total_matched_size += matched;
                });
                self.finish_entry(index);
                info!(index, literal, matched, "file installed");
            }
            ReceiveOutcome::ReplicaKept { matched } => {
                if let Some(dest) = dest.as_deref() {
                    self.apply_attrs(dest, entry.attrs());
                }
                self.stats.update(|stats| {
                    stats.num_transferred_files += 1;
                    stats.total_matched_size += matched;
                });
                self.finish_entry(index);
                info!(index, matched, "replica already current, rename skipped");
            }
            ReceiveOutcome::Mismatch => self.handle_mismatch(index)?,
            ReceiveOutcome::Discarded => {
                self.finish_entry(index);
            }
        }
        Ok(())
    }

    fn handle_mismatch(&mut self, index: i32) -> Result<(), EngineError> {
        if self.transferred.contains(&index) {
            self.errors.record(IoErrorBits::TRANSFER);
            self.report_xfer_error(&format!(
                "file index {index} failed verification after retry"
            ))?;
            self.finish_entry(index);
        } else {
            self.transferred.insert(index);
            self.resend_pending.insert(index);
            warn!(index, "digest mismatch, requesting re-send");
            self.send_job(GeneratorJob::Resend(index))?;
        }
        Ok(())
    }

    fn finish_entry(&mut self, index: i32) {
        self.resend_pending.remove(&index);
        if let Some(segment) = self.lock_filelist().segment_with_mut(index) {
            segment.remove(index);
        }
    }

    fn read_sum_header(&mut self) -> Result<SumHeader, EngineError> {
        let chunk_count = self.rx.get_int()?;
        let block_length = self.rx.get_int()?;
        let digest_length = self.rx.get_int()?;
        let remainder = self.rx.get_int()?;
        for (field, value) in [
            ("chunk count", chunk_count),
            ("block length", block_length),
            ("digest length", digest_length),
            ("remainder", remainder),
        ] {
            if value < 0 {
                return Err(ProtocolError::NegativeValue {
                    field,
                    value: i64::from(value),
                }
                .into());
            }
        }
        Ok(SumHeader::new(
            chunk_count as u32,
            block_length as u32,
            digest_length as u32,
            remainder as u32,
        )?)
    }

    /// Applies the token stream for one file.
    fn reconstruct(
        &mut self,
        header: &SumHeader,
        entry: &FileInfo,
        dest: &Path,
    ) -> Result<ReceiveOutcome, EngineError> {
        let replica_attrs = match self.fs.stat_if_exists(dest) {
            Ok(attrs) => attrs.filter(FileAttrs::is_regular),
            Err(_) => None,
        };
        let mut replica = replica_attrs
            .as_ref()
            .and_then(|_| std::fs::File::open(dest).ok());

        let parent = dest.parent().unwrap_or(&self.dest_root);
        let mut temp = match NamedTempFile::new_in(parent) {
            Ok(temp) => temp,
            Err(e) => {
                self.errors.record(IoErrorBits::GENERAL);
                self.report_xfer_error(&format!(
                    "cannot create temporary file in {}: {e}",
                    parent.display()
                ))?;
                self.drain_tokens()?;
                return Ok(ReceiveOutcome::Discarded);
            }
        };

        let block_len = u64::from(header.block_length());
        let mut md5 = Md5::new();
        let mut literal_total = 0u64;
        let mut matched_total = 0u64;

        // Deferred write: while the matched chunks are exactly 0, 1, 2, ...
        // and no literal has arrived, the temp file stays untouched.
        let mut deferring = self.config.deferred_write && replica.is_some();
        let mut next_seq: u32 = 0;
        let mut block = vec![0u8; (header.block_length() as usize).max(1)];

        loop {
            let token = self.rx.get_int()?;
            if token == 0 {
                break;
            }

            if token > 0 {
                if deferring {
                    self.catch_up(replica.as_mut(), header, next_seq, temp.as_file_mut())?;
                    deferring = false;
                }
                let mut remaining = token as usize;
                let mut chunk = [0u8; COPY_CHUNK];
                while remaining > 0 {
                    let take = remaining.min(COPY_CHUNK);
                    self.rx.get_bytes(&mut chunk[..take])?;
                    md5.update(&chunk[..take]);
                    temp.as_file_mut().write_all(&chunk[..take])?;
                    remaining -= take;
                }
                literal_total += token as u64;
                continue;
            }

            let chunk_index = -(token + 1) as u32;
            if header.block_length() == 0 {
                return Err(ProtocolError::Violation(
                    "matched-block token with a zero block length".to_owned(),
                )
                .into());
            }
            if chunk_index >= header.chunk_count() {
                return Err(ProtocolError::Violation(format!(
                    "matched-block token {chunk_index} outside {} chunks",
                    header.chunk_count()
                ))
                .into());
            }
            let len = header.chunk_length(chunk_index) as usize;
            matched_total += len as u64;

            if deferring && chunk_index == next_seq {
                if let Some(replica) = replica.as_mut() {
                    read_block(replica, chunk_index as u64 * block_len, &mut block[..len]);
                    md5.update(&block[..len]);
                }
                next_seq += 1;
                continue;
            }
            if deferring {
                self.catch_up(replica.as_mut(), header, next_seq, temp.as_file_mut())?;
                deferring = false;
            }
            match replica.as_mut() {
                Some(replica) => {
                    read_block(replica, chunk_index as u64 * block_len, &mut block[..len]);
                    md5.update(&block[..len]);
                    temp.as_file_mut().write_all(&block[..len])?;
                }
                None => {
                    // No replica to copy from; leave a hole and let the
                    // digest comparison force a full re-send.
                    debug!(chunk_index, "matched token without a local replica");
                }
            }
        }

        let mut peer_digest = [0u8; 16];
        self.rx.get_bytes(&mut peer_digest)?;
        let local_digest = md5.finalize();

        if local_digest != peer_digest {
            debug!("digest mismatch during reconstruction");
            return Ok(ReceiveOutcome::Mismatch);
        }

        if deferring && literal_total == 0 && next_seq == header.chunk_count() {
            let replica_size = replica_attrs.map_or(0, |attrs| attrs.size);
            if replica_size == header.file_size() {
                // The replica is the result; the scoped temp file deletes
                // itself on drop.
                return Ok(ReceiveOutcome::ReplicaKept {
                    matched: matched_total,
                });
            }
        }
        if deferring {
            self.catch_up(replica.as_mut(), header, next_seq, temp.as_file_mut())?;
        }

        self.install(temp, dest, entry.attrs())?;
        Ok(ReceiveOutcome::Installed {
            literal: literal_total,
            matched: matched_total,
        })
    }

    /// Retroactively copies the sequentially matched prefix from the
    /// replica into the temp file when deferral ends.
    fn catch_up(
        &self,
        replica: Option<&mut std::fs::File>,
        header: &SumHeader,
        chunks: u32,
        temp: &mut std::fs::File,
    ) -> Result<(), EngineError> {
        let Some(replica) = replica else {
            return Ok(());
        };
        let block_len = u64::from(header.block_length());
        let mut block = vec![0u8; header.block_length() as usize];
        for chunk_index in 0..chunks {
            let len = header.chunk_length(chunk_index) as usize;
            read_block(replica, chunk_index as u64 * block_len, &mut block[..len]);
            temp.write_all(&block[..len])?;
        }
        Ok(())
    }

    /// Applies preserved attributes to `path` per the session feature set.
    ///
    /// Ownership is applied by local id: unless `numeric_ids` is set, a
    /// name carried in the peer's id mapping is replayed against the local
    /// account database and wins over the raw wire id.
    fn apply_attrs(&mut self, path: &Path, attrs: &FileAttrs) {
        let perms = if self.config.preserve_permissions {
            attrs.perms()
        } else {
            self.config.default_file_perms
        };
        if let Err(e) = self.fs.set_mode(path, perms) {
            warn!(error = %e, "cannot apply permissions");
        }
        if self.config.preserve_times {
            if let Err(e) = self.fs.set_mtime(path, attrs.mtime) {
                warn!(error = %e, "cannot apply mtime");
            }
        }
        if self.config.preserve_user || self.config.preserve_group {
            let uid = self.config.preserve_user.then(|| self.resolve_uid(&attrs.user));
            let gid = self.config.preserve_group.then(|| self.resolve_gid(&attrs.group));
            // chown may clear setuid/setgid bits; they are intentionally not
            // restored here.
            if let Err(e) = self.fs.set_owner(path, uid, gid) {
                debug!(error = %e, "cannot apply ownership");
            }
        }
    }

    fn resolve_uid(&mut self, user: &metadata::User) -> u32 {
        if self.config.numeric_ids || user.name.is_empty() {
            return user.uid;
        }
        let fs = self.fs;
        let local = *self
            .uid_by_name
            .entry(user.name.clone())
            .or_insert_with(|| fs.uid_for_name(&user.name));
        resolve_id(user.uid, &user.name, local)
    }

    fn resolve_gid(&mut self, group: &metadata::Group) -> u32 {
        if self.config.numeric_ids || group.name.is_empty() {
            return group.gid;
        }
        let fs = self.fs;
        let local = *self
            .gid_by_name
            .entry(group.name.clone())
            .or_insert_with(|| fs.gid_for_name(&group.name));
        resolve_id(group.gid, &group.name, local)
    }

    fn install(
        &mut self,
        temp: NamedTempFile,
        dest: &Path,
        attrs: &FileAttrs,
    ) -> Result<(), EngineError> {
        temp.as_file().sync_data().ok();
        let temp_path = temp.path().to_path_buf();
        self.apply_attrs(&temp_path, attrs);

        match temp.persist(dest) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.errors.record(IoErrorBits::GENERAL);
                self.report_xfer_error(&format!(
                    "cannot rename into {}: {}",
                    dest.display(),
                    e.error
                ))?;
                Ok(())
            }
        }
    }

    /// Consumes and discards a token stream plus trailing digest.
    fn drain_tokens(&mut self) -> Result<(), EngineError> {
        loop {
            let token = self.rx.get_int()?;
            if token == 0 {
                break;
            }
            if token > 0 {
                self.rx.skip(token as usize)?;
            }
        }
        self.rx.skip(16)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared-state helpers
    // ------------------------------------------------------------------

    fn lock_filelist(&self) -> std::sync::MutexGuard<'_, Filelist> {
        self.filelist.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_job(&self, job: GeneratorJob) -> Result<(), EngineError> {
        self.jobs.send(job).map_err(|_| EngineError::Interrupted)
    }

    fn report_security(&mut self, security: &flist::SecurityError) -> Result<(), EngineError> {
        self.errors.record(IoErrorBits::GENERAL);
        warn!("{security}");
        let text = security.to_string();
        let payload = self
            .codec
            .encode(&text)
            .unwrap_or_else(|| text.as_bytes().to_vec());
        self.tx.send_message(MessageCode::Error, &payload)?;
        Ok(())
    }

    fn report_text_error(&mut self, text: &str) -> Result<(), EngineError> {
        self.errors.record(IoErrorBits::GENERAL);
        warn!("{text}");
        let payload = self
            .codec
            .encode(text)
            .unwrap_or_else(|| text.as_bytes().to_vec());
        self.tx.send_message(MessageCode::Error, &payload)?;
        Ok(())
    }

    fn report_xfer_error(&mut self, text: &str) -> Result<(), EngineError> {
        warn!("{text}");
        let payload = self
            .codec
            .encode(text)
            .unwrap_or_else(|| text.as_bytes().to_vec());
        self.tx.send_message(MessageCode::ErrorXfer, &payload)?;
        Ok(())
    }
}

/// Picks the ownership id to apply: the local id for a mapped name when one
/// resolves, else the peer's numeric id.
fn resolve_id(wire_id: u32, name: &str, local: Option<u32>) -> u32 {
    match local {
        Some(local) => {
            if local != wire_id {
                debug!(name, wire_id, local, "mapped owner name to local id");
            }
            local
        }
        None => {
            debug!(name, wire_id, "owner name unknown locally, keeping the numeric id");
            wire_id
        }
    }
}

/// Reads `out.len()` bytes at `offset`, zero-filling whatever the replica
/// can no longer provide.
fn read_block(replica: &mut std::fs::File, offset: u64, out: &mut [u8]) {
    let mut filled = 0;
    if replica.seek(SeekFrom::Start(offset)).is_ok() {
        while filled < out.len() {
            match replica.read(&mut out[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
    }
    out[filled..].fill(0);
}

#[cfg(test)]
mod tests {
    use super::resolve_id;

    #[test]
    fn mapped_names_win_over_wire_ids() {
        assert_eq!(resolve_id(1000, "postgres", Some(70)), 70);
        assert_eq!(resolve_id(70, "postgres", Some(70)), 70);
    }

    #[test]
    fn unknown_names_fall_back_to_the_numeric_id() {
        assert_eq!(resolve_id(1000, "no-such-account", None), 1000);
    }
}
