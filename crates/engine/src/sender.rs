//! Sender role: streams the file list, answers checksum requests with
//! matched-block tokens and literal data.
//!
//! The sender is single-threaded. After transmitting the initial file-list
//! segment it sits in a request loop: every wire item is either a phase
//! `DONE` to echo, a stub-directory expansion to answer with a fresh
//! segment, or a file index plus signature table to match against the local
//! file.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use checksums::strong::seeded_block_digest;
use checksums::{Md5, RollingChecksum, SumHeader, SumTable};
use flist::{FileDetail, FileInfo, Filelist, FlistEncoder, SegmentBuilder};
use metadata::{FileAttrs, FileType, Filesystem};
use protocol::channel::{Demux, SharedWriter};
use protocol::varint::{IndexDecoder, IndexEncoder};
use protocol::{
    ChannelRead, ChannelWrite, MessageCode, ProtocolError, TextCodec, INDEX_DONE, INDEX_EOF,
    INDEX_OFFSET,
};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{EngineError, IoErrorBits};
use crate::item;
use crate::messages::SessionMessages;
use crate::phase::TransferPhase;
use crate::stats::Statistics;
use crate::LITERAL_BURST;

/// The sending side of one session.
pub struct Sender<'a, R: Read, W: Write> {
    config: &'a SessionConfig,
    fs: &'a (dyn Filesystem + Sync),
    codec: TextCodec,
    rx: Demux<R, W, SessionMessages>,
    tx: SharedWriter<W>,
    ndx_in: IndexDecoder,
    ndx_out: IndexEncoder,
    encoder: FlistEncoder,
    filelist: Filelist,
    links: LinkTracker,
    seed: i32,
    errors: IoErrorBits,
    stats: Statistics,
    phase: TransferPhase,
    eof_sent: bool,
    segments_sent: u64,
    dones_received: u64,
}

impl<'a, R: Read, W: Write> Sender<'a, R, W> {
    /// Builds a sender over an established (post-handshake) connection.
    pub fn new(
        config: &'a SessionConfig,
        fs: &'a (dyn Filesystem + Sync),
        codec: TextCodec,
        rx: Demux<R, W, SessionMessages>,
        tx: SharedWriter<W>,
        seed: i32,
        errors: IoErrorBits,
    ) -> Self {
        Self {
            config,
            fs,
            codec,
            rx,
            tx,
            ndx_in: IndexDecoder::new(),
            ndx_out: IndexEncoder::new(),
            encoder: FlistEncoder::new(config.codec_options(), codec),
            filelist: Filelist::new(config.recursive),
            links: LinkTracker::default(),
            seed,
            errors,
            stats: Statistics::default(),
            phase: TransferPhase::Transfer,
            eof_sent: false,
            segments_sent: 0,
            dones_received: 0,
        }
    }

    /// Runs the sender to completion and returns its statistics.
    pub fn run(mut self, sources: &[PathBuf]) -> Result<Statistics, EngineError> {
        let builder = self.build_initial_list(sources)?;
        let segment_pos = self.filelist.new_segment(builder);
        self.send_segment(segment_pos, None)?;
        self.maybe_send_eof()?;
        self.tx.flush()?;

        loop {
            let index = self.ndx_in.read_index(&mut self.rx)?;
            match index {
                INDEX_DONE => {
                    // The first `segments_sent` DONEs are per-segment drain
                    // markers to relay; anything beyond ends a phase.
                    self.dones_received += 1;
                    if self.dones_received > self.segments_sent {
                        self.phase = self.phase.next();
                        debug!(phase = ?self.phase, "sender advanced phase");
                    }
                    self.ndx_out.write_index(&mut self.tx, INDEX_DONE)?;
                    self.tx.flush()?;
                    if self.phase.is_stop() {
                        break;
                    }
                }
                INDEX_EOF => {
                    return Err(ProtocolError::UnexpectedIndex {
                        index,
                        context: "EOF flows from sender to receiver only",
                    }
                    .into());
                }
                index if index < 0 => {
                    let dir_index = INDEX_OFFSET - index;
                    self.expand_stub(dir_index, index)?;
                }
                index => {
                    let iflags = self.rx.get_char()?;
                    if iflags & item::TRANSFER == 0 {
                        continue;
                    }
                    let table = self.read_sum_table()?;
                    self.serve_file(index, iflags, &table)?;
                    self.tx.flush()?;
                }
            }
        }

        self.stats.io_errors = self.errors.get();
        Ok(self.stats)
    }

    // ------------------------------------------------------------------
    // File-list construction
    // ------------------------------------------------------------------

    fn build_initial_list(&mut self, sources: &[PathBuf]) -> Result<SegmentBuilder, EngineError> {
        if sources.is_empty() {
            return Err(EngineError::Internal("no source paths".to_owned()));
        }

        let mut builder = SegmentBuilder::new(None);
        if sources.len() == 1 {
            let root = &sources[0];
            let attrs = self.fs.stat(root)?;
            if attrs.is_directory() {
                let dot = FileInfo::new(b".".to_vec(), Some(".".to_owned()), attrs, FileDetail::Plain)
                    .map_err(|e| EngineError::Internal(e.to_string()))?
                    .with_local_path(root.clone());
                builder.add(dot);
                self.push_children(&mut builder, root, None)?;
                return Ok(builder);
            }
        }

        for source in sources {
            let attrs = match self.fs.stat_if_exists(source)? {
                Some(attrs) => attrs,
                None => {
                    self.report_local_error(
                        IoErrorBits::VANISHED,
                        &format!("source {} vanished", source.display()),
                    )?;
                    continue;
                }
            };
            if attrs.is_directory() {
                return Err(EngineError::Internal(
                    "directory sources must be the sole transfer argument".to_owned(),
                ));
            }
            let Some(name) = source.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if let Some(info) = self.make_entry(&name, source.clone(), attrs)? {
                builder.add(info);
            }
        }
        Ok(builder)
    }

    fn push_children(
        &mut self,
        builder: &mut SegmentBuilder,
        dir_path: &Path,
        prefix: Option<&str>,
    ) -> Result<(), EngineError> {
        let children = match self.fs.read_dir(dir_path) {
            Ok(children) => children,
            Err(e) => {
                self.report_local_error(IoErrorBits::GENERAL, &e.to_string())?;
                return Ok(());
            }
        };

        for (os_name, attrs) in children {
            let Some(base) = os_name.to_str() else {
                self.errors.record(IoErrorBits::GENERAL);
                warn!(name = ?os_name, "skipping file with unencodable local name");
                continue;
            };
            let name = match prefix {
                Some(prefix) => format!("{prefix}/{base}"),
                None => base.to_owned(),
            };
            let path = dir_path.join(base);
            if let Some(info) = self.make_entry(&name, path, attrs)? {
                builder.add(info);
            }
        }
        Ok(())
    }

    fn make_entry(
        &mut self,
        name: &str,
        path: PathBuf,
        attrs: FileAttrs,
    ) -> Result<Option<FileInfo>, EngineError> {
        let Some(name_bytes) = self.codec.encode(name) else {
            self.errors.record(IoErrorBits::GENERAL);
            warn!(name, "name not representable in the session charset");
            return Ok(None);
        };

        let detail = match attrs.file_type() {
            FileType::Symlink => {
                if !self.config.preserve_links {
                    return Ok(None);
                }
                match self.fs.read_link_target(&path) {
                    Ok(target) => FileDetail::Symlink { target },
                    Err(e) => {
                        self.report_local_error(IoErrorBits::GENERAL, &e.to_string())?;
                        return Ok(None);
                    }
                }
            }
            FileType::BlockDevice | FileType::CharDevice => {
                if !self.config.preserve_devices {
                    return Ok(None);
                }
                FileDetail::Device {
                    major: attrs.rdev_major,
                    minor: attrs.rdev_minor,
                }
            }
            FileType::Fifo | FileType::Socket => {
                if !self.config.preserve_specials {
                    return Ok(None);
                }
                FileDetail::Plain
            }
            FileType::Unknown => return Ok(None),
            FileType::Regular => match self.links.classify(&attrs, &name_bytes) {
                Some(target) => FileDetail::Hardlink { target },
                None => FileDetail::Plain,
            },
            FileType::Directory => FileDetail::Plain,
        };

        let info = FileInfo::new(name_bytes, Some(name.to_owned()), attrs, detail)
            .map_err(|e| EngineError::Internal(e.to_string()))?
            .with_local_path(path);
        Ok(Some(info))
    }

    fn send_segment(&mut self, position: usize, echo_index: Option<i32>) -> Result<(), EngineError> {
        if let Some(index) = echo_index {
            self.ndx_out.write_index(&mut self.tx, index)?;
        }

        let members: Vec<_> = self.filelist.segments()[position]
            .iter()
            .map(|(_, info)| std::sync::Arc::clone(info))
            .collect();

        let mut wire = Vec::new();
        for info in &members {
            let top_dir = info.is_dot_dir();
            self.encoder.encode_entry(&mut wire, info, top_dir)?;
        }
        self.encoder.encode_end(&mut wire, self.errors.get())?;

        self.stats.total_file_list_size += wire.len() as u64;
        self.stats.num_files += members.len() as u64;
        self.stats.expanded_segments += 1;
        self.stats.total_file_size = self.filelist.total_file_size();
        self.segments_sent += 1;
        self.tx.put_bytes(&wire)?;
        Ok(())
    }

    fn expand_stub(&mut self, dir_index: i32, wire_index: i32) -> Result<(), EngineError> {
        let stub = self.filelist.take_stub(dir_index)?;
        let Some(dir_path) = stub.local_path().map(Path::to_path_buf) else {
            return Err(EngineError::Internal(format!(
                "stub directory {dir_index} has no local path"
            )));
        };
        let prefix = stub.name().map(str::to_owned);

        let mut builder = SegmentBuilder::new(Some(std::sync::Arc::clone(&stub)));
        self.push_children(&mut builder, &dir_path, prefix.as_deref())?;
        let position = self.filelist.new_segment(builder);

        self.send_segment(position, Some(wire_index))?;
        self.maybe_send_eof()?;
        self.tx.flush()?;
        Ok(())
    }

    fn maybe_send_eof(&mut self) -> Result<(), EngineError> {
        if self.config.recursive && !self.eof_sent && !self.filelist.is_expandable() {
            self.ndx_out.write_index(&mut self.tx, INDEX_EOF)?;
            self.eof_sent = true;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delta transmission
    // ------------------------------------------------------------------

    fn read_sum_table(&mut self) -> Result<SumTable, EngineError> {
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
        let header = SumHeader::new(
            chunk_count as u32,
            block_length as u32,
            digest_length as u32,
            remainder as u32,
        )?;

        let mut table = SumTable::new(header);
        let mut digest = [0u8; checksums::sums::MAX_DIGEST_LENGTH];
        for _ in 0..header.chunk_count() {
            let rolling = self.rx.get_int()? as u32;
            self.rx.get_bytes(&mut digest[..header.digest_length()])?;
            table.push(rolling, &digest[..header.digest_length()]);
        }
        Ok(table)
    }

    fn serve_file(&mut self, index: i32, iflags: u16, table: &SumTable) -> Result<(), EngineError> {
        let entry = self
            .filelist
            .segment_with(index)
            .and_then(|segment| segment.get(index))
            .cloned()
            .ok_or(ProtocolError::UnexpectedIndex {
                index,
                context: "request for an index outside every segment",
            })?;

        let Some(path) = entry.local_path().map(Path::to_path_buf) else {
            return Err(EngineError::Internal(format!(
                "requested entry {index} has no local path"
            )));
        };

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                let bits = if e.kind() == std::io::ErrorKind::NotFound {
                    IoErrorBits::VANISHED
                } else {
                    IoErrorBits::GENERAL
                };
                self.errors.record(bits);
                warn!(path = %path.display(), error = %e, "cannot open requested file");
                self.tx
                    .send_message(MessageCode::NoSend, &index.to_le_bytes())?;
                return Ok(());
            }
        };

        self.ndx_out.write_index(&mut self.tx, index)?;
        self.tx.put_char(iflags)?;
        let header = table.header();
        self.tx.put_int(header.chunk_count() as i32)?;
        self.tx.put_int(header.block_length() as i32)?;
        self.tx.put_int(header.digest_length() as i32)?;
        self.tx.put_int(header.remainder() as i32)?;

        let mut reader = BufReader::new(file);
        let (literal, matched) = self.transmit_deltas(&mut reader, table)?;
        self.stats.total_literal_size += literal;
        self.stats.total_matched_size += matched;
        if literal > 0 || matched > 0 || entry.attrs().size == 0 {
            self.stats.num_transferred_files += 1;
        }
        info!(
            index,
            path = %path.display(),
            literal,
            matched,
            "file served"
        );
        Ok(())
    }

    /// Scans the file with a sliding window, emitting matched-block tokens
    /// and literal bursts, terminated by a zero token and the unseeded
    /// whole-file digest.
    fn transmit_deltas(
        &mut self,
        file: &mut impl Read,
        table: &SumTable,
    ) -> Result<(u64, u64), EngineError> {
        let header = *table.header();
        let block_len = header.block_length() as usize;
        let digest_len = header.digest_length();

        let mut file_md5 = Md5::new();
        let mut literals = LiteralBuffer::default();
        let mut matched_total = 0u64;

        if block_len == 0 || table.is_empty() {
            // No replica on the far side: the whole file goes as literals.
            let mut chunk = vec![0u8; LITERAL_BURST];
            loop {
                let n = read_some(file, &mut chunk)?;
                if n == 0 {
                    break;
                }
                file_md5.update(&chunk[..n]);
                literals.extend(&mut self.tx, &chunk[..n])?;
            }
            let literal_total = literals.finish(&mut self.tx)?;
            self.tx.put_int(0)?;
            self.tx.put_bytes(&file_md5.finalize())?;
            return Ok((literal_total, 0));
        }

        // Window storage: the live window is `win[start..]`; the bytes
        // before `start` have already been pushed into the literal buffer.
        let mut win: Vec<u8> = Vec::with_capacity(2 * block_len);
        read_exact_available(file, &mut win, block_len, &mut file_md5)?;
        let mut rolling = RollingChecksum::of(&win);
        let mut start = 0usize;
        let mut preferred: u32 = 0;

        while win.len() > start {
            let window = &win[start..];
            let mut hit = None;
            let mut candidates = table
                .candidates(rolling.value(), window.len() as u32, preferred)
                .peekable();
            if candidates.peek().is_some() {
                let strong = seeded_block_digest(window, self.seed);
                hit = candidates.find(|chunk| chunk.digest() == &strong[..digest_len]);
            }

            if let Some(chunk) = hit {
                literals.flush(&mut self.tx)?;
                self.tx.put_int(-(chunk.index as i32 + 1))?;
                matched_total += u64::from(chunk.length);
                preferred = chunk.index + 1;

                win.clear();
                start = 0;
                read_exact_available(file, &mut win, block_len, &mut file_md5)?;
                rolling.update_from_block(&win);
            } else {
                let departing = win[start];
                let mut one = [0u8; 1];
                if read_some(file, &mut one)? == 1 {
                    file_md5.update(&one);
                    win.push(one[0]);
                    rolling.roll(departing, one[0]);
                } else {
                    rolling.shrink(departing);
                }
                literals.push(&mut self.tx, departing)?;
                start += 1;
                if start >= block_len {
                    win.drain(..start);
                    start = 0;
                }
            }
        }

        let literal_total = literals.finish(&mut self.tx)?;
        self.tx.put_int(0)?;
        self.tx.put_bytes(&file_md5.finalize())?;
        Ok((literal_total, matched_total))
    }

    fn report_local_error(&mut self, bits: i32, text: &str) -> Result<(), EngineError> {
        self.errors.record(bits);
        warn!("{text}");
        let payload = self.codec.encode(text).unwrap_or_else(|| text.as_bytes().to_vec());
        self.tx.send_message(MessageCode::Warning, &payload)?;
        Ok(())
    }
}

/// Inode identities seen during the walk, so additional names for an
/// already-listed file are recorded as hard links instead of independent
/// entries. Bookkeeping only; link materialisation is out of scope and the
/// extra names still transfer their content.
#[derive(Debug, Default)]
struct LinkTracker {
    seen: FxHashMap<(u64, u64), Vec<u8>>,
}

impl LinkTracker {
    /// Returns the first-listed name when `attrs` identifies an inode that
    /// was already walked; records the identity otherwise.
    fn classify(&mut self, attrs: &FileAttrs, name_bytes: &[u8]) -> Option<Vec<u8>> {
        if attrs.nlink < 2 {
            return None;
        }
        let id = attrs.file_id?;
        match self.seen.entry(id) {
            std::collections::hash_map::Entry::Occupied(first) => Some(first.get().clone()),
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(name_bytes.to_vec());
                None
            }
        }
    }
}

/// Pending literal bytes, emitted in bursts of at most [`LITERAL_BURST`].
#[derive(Default)]
struct LiteralBuffer {
    buf: Vec<u8>,
    total: u64,
}

impl LiteralBuffer {
    fn push<W: ChannelWrite>(&mut self, writer: &mut W, byte: u8) -> Result<(), EngineError> {
        self.buf.push(byte);
        if self.buf.len() >= LITERAL_BURST {
            self.flush(writer)?;
        }
        Ok(())
    }

    fn extend<W: ChannelWrite>(&mut self, writer: &mut W, bytes: &[u8]) -> Result<(), EngineError> {
        for chunk in bytes.chunks(LITERAL_BURST) {
            self.buf.extend_from_slice(chunk);
            if self.buf.len() >= LITERAL_BURST {
                self.flush(writer)?;
            }
        }
        Ok(())
    }

    fn flush<W: ChannelWrite>(&mut self, writer: &mut W) -> Result<(), EngineError> {
        if !self.buf.is_empty() {
            writer.put_int(self.buf.len() as i32)?;
            writer.put_bytes(&self.buf)?;
            self.total += self.buf.len() as u64;
            self.buf.clear();
        }
        Ok(())
    }

    fn finish<W: ChannelWrite>(&mut self, writer: &mut W) -> Result<u64, EngineError> {
        self.flush(writer)?;
        Ok(self.total)
    }
}

/// Reads until `buf` is full or the stream ends; returns bytes read.
fn read_some(file: &mut impl Read, buf: &mut [u8]) -> Result<usize, EngineError> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Appends up to `want` bytes from `file` to `buf`, hashing them.
fn read_exact_available(
    file: &mut impl Read,
    buf: &mut Vec<u8>,
    want: usize,
    md5: &mut Md5,
) -> Result<(), EngineError> {
    let start = buf.len();
    buf.resize(start + want, 0);
    let got = read_some(file, &mut buf[start..])?;
    buf.truncate(start + got);
    md5.update(&buf[start..]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linked_attrs(id: (u64, u64), nlink: u64) -> FileAttrs {
        let mut attrs = FileAttrs::regular(0o644, 4, 1);
        attrs.nlink = nlink;
        attrs.file_id = Some(id);
        attrs
    }

    #[test]
    fn second_name_for_an_inode_is_classified_as_a_hard_link() {
        let mut links = LinkTracker::default();
        let attrs = linked_attrs((8, 4242), 2);

        assert_eq!(links.classify(&attrs, b"first"), None);
        assert_eq!(links.classify(&attrs, b"second"), Some(b"first".to_vec()));
        assert_eq!(
            links.classify(&attrs, b"third"),
            Some(b"first".to_vec()),
            "every later name points at the first-listed one"
        );
    }

    #[test]
    fn singly_linked_files_stay_plain() {
        let mut links = LinkTracker::default();
        let attrs = linked_attrs((8, 1), 1);
        assert_eq!(links.classify(&attrs, b"only"), None);
        assert_eq!(links.classify(&attrs, b"only"), None, "nothing was recorded");
    }

    #[test]
    fn distinct_inodes_never_alias() {
        let mut links = LinkTracker::default();
        assert_eq!(links.classify(&linked_attrs((8, 1), 2), b"a"), None);
        assert_eq!(links.classify(&linked_attrs((8, 2), 2), b"b"), None);
        assert_eq!(links.classify(&linked_attrs((9, 1), 2), b"c"), None);
    }

    #[test]
    fn missing_inode_identity_stays_plain() {
        let mut links = LinkTracker::default();
        let mut attrs = FileAttrs::regular(0o644, 4, 1);
        attrs.nlink = 3;
        assert_eq!(links.classify(&attrs, b"unknowable"), None);
    }
}
