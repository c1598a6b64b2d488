//! Sessions against scripted peers that bend or break the protocol.
//!
//! The scripts speak the wire format directly through the protocol crate's
//! primitives, which lets them send things the real roles never produce:
//! escaping path names, out-of-range checksum headers, and misplaced
//! sentinels.

mod support;

use std::thread;

use checksums::Md5;
use engine::{item, EngineError, SessionConfig};
use flist::{DecodedEntry, FileDetail, FileInfo, FlistDecoder, FlistEncoder};
use metadata::{FileAttrs, LocalFilesystem};
use protocol::channel::{Demux, DiscardMessages, PrefetchReader, SharedWriter};
use protocol::handshake::{
    exchange_versions_as_client, exchange_versions_as_server, read_seed, write_seed,
    ProtocolVersion,
};
use protocol::varint::{IndexDecoder, IndexEncoder};
use protocol::{ChannelRead, ChannelWrite, ProtocolError, TextCodec, INDEX_DONE, INDEX_EOF};
use support::{duplex, PipeReader, PipeWriter};

type ScriptChannel = (
    Demux<PipeReader, PipeWriter, DiscardMessages>,
    SharedWriter<PipeWriter>,
);

/// Performs the server-side handshake and wraps the transport in the
/// multiplexed channel pair.
fn script_server_channel(reader: PipeReader, mut writer: PipeWriter, seed: i32) -> ScriptChannel {
    let mut prefetch = PrefetchReader::new(reader);
    exchange_versions_as_server(&mut prefetch, &mut writer, ProtocolVersion::NEWEST)
        .expect("handshake succeeds");
    write_seed(&mut writer, seed).expect("seed written");

    let tx = SharedWriter::new(writer);
    let rx = Demux::from_reader(prefetch, tx.clone(), DiscardMessages);
    (rx, tx)
}

/// Client-side counterpart of [`script_server_channel`].
fn script_client_channel(reader: PipeReader, mut writer: PipeWriter) -> (ScriptChannel, i32) {
    let mut prefetch = PrefetchReader::new(reader);
    exchange_versions_as_client(&mut prefetch, &mut writer, ProtocolVersion::NEWEST)
        .expect("handshake succeeds");
    let seed = read_seed(&mut prefetch).expect("seed read");

    let tx = SharedWriter::new(writer);
    let rx = Demux::from_reader(prefetch, tx.clone(), DiscardMessages);
    ((rx, tx), seed)
}

fn regular_entry(name: &str, size: u64, mtime: i64) -> FileInfo {
    FileInfo::new(
        name.as_bytes().to_vec(),
        Some(name.to_owned()),
        FileAttrs::regular(0o644, size, mtime),
        FileDetail::Plain,
    )
    .expect("valid entry")
}

/// A peer that lists `../evil` keeps its slot in the list but never escapes
/// the destination root; the rest of the transfer proceeds normally.
#[test]
fn escaping_path_is_rejected_but_the_session_continues() {
    let temp = tempfile::tempdir().expect("create tempdir");
    let dst = temp.path().join("dst");

    let ((script_read, script_write), (receiver_read, receiver_write)) = duplex();

    let script = thread::spawn(move || {
        let (mut rx, mut tx) = script_server_channel(script_read, script_write, 0);

        let config = SessionConfig::default();
        let mut encoder = FlistEncoder::new(config.codec_options(), TextCodec::utf8());
        encoder
            .encode_entry(&mut tx, &regular_entry("../evil", 5, 1_000), false)
            .expect("encode entry");
        encoder
            .encode_entry(&mut tx, &regular_entry("ok.txt", 5, 1_000), false)
            .expect("encode entry");
        encoder.encode_end(&mut tx, 0).expect("encode end");
        tx.flush().expect("flush");

        let mut ndx_in = IndexDecoder::new();
        let mut ndx_out = IndexEncoder::new();
        let mut dones = 0;
        while dones < 4 {
            let index = ndx_in.read_index(&mut rx).expect("read index");
            if index == INDEX_DONE {
                ndx_out.write_index(&mut tx, INDEX_DONE).expect("echo done");
                tx.flush().expect("flush");
                dones += 1;
                continue;
            }
            assert_eq!(index, 2, "only the safe entry is requested");
            let iflags = rx.get_char().expect("item flags");
            assert_ne!(iflags & item::TRANSFER, 0);
            for _ in 0..4 {
                rx.get_int().expect("sum header field");
            }

            ndx_out.write_index(&mut tx, index).expect("echo index");
            tx.put_char(iflags).expect("echo flags");
            for _ in 0..4 {
                tx.put_int(0).expect("sum header");
            }
            tx.put_int(5).expect("literal length");
            tx.put_bytes(b"hello").expect("literal bytes");
            tx.put_int(0).expect("terminator");
            tx.put_bytes(&Md5::digest(b"hello")).expect("digest");
            tx.flush().expect("flush");
        }
    });

    let config = SessionConfig::default();
    let (success, stats) = engine::run_receiver(
        &config,
        &LocalFilesystem::new(),
        &dst,
        receiver_read,
        receiver_write,
    )
    .expect("session completes");

    script.join().expect("script finishes");

    assert!(!success, "error bits force a failed session");
    assert_ne!(stats.io_errors & engine::IoErrorBits::GENERAL, 0);
    assert_eq!(stats.num_files, 2, "the hostile entry kept its index slot");
    assert_eq!(
        std::fs::read(dst.join("ok.txt")).expect("safe file installed"),
        b"hello"
    );
    assert!(
        !temp.path().join("evil").exists(),
        "nothing escaped the destination root"
    );
}

/// A checksum header beyond the protocol bounds is fatal to the sender.
#[test]
fn oversized_block_length_is_a_protocol_error() {
    let temp = tempfile::tempdir().expect("create tempdir");
    let src = temp.path().join("src.bin");
    std::fs::write(&src, b"data").expect("write source");

    let ((sender_read, sender_write), (script_read, script_write)) = duplex();

    let config = SessionConfig::default();
    let sender_config = config.clone();
    let sources = vec![src];
    let sender = thread::spawn(move || {
        engine::run_sender(
            &sender_config,
            &LocalFilesystem::new(),
            &sources,
            sender_read,
            sender_write,
        )
    });

    let ((mut rx, mut tx), _seed) = script_client_channel(script_read, script_write);

    let mut decoder = FlistDecoder::new(config.codec_options(), TextCodec::utf8());
    loop {
        match decoder.decode_entry(&mut rx).expect("decode entry") {
            DecodedEntry::Entry(_) => {}
            DecodedEntry::End { .. } => break,
        }
    }

    let mut ndx_out = IndexEncoder::new();
    ndx_out.write_index(&mut tx, 1).expect("request index");
    tx.put_char(item::TRANSFER).expect("item flags");
    tx.put_int(1).expect("chunk count");
    tx.put_int((1 << 17) + 1).expect("oversized block length");
    tx.put_int(16).expect("digest length");
    tx.put_int(0).expect("remainder");
    tx.flush().expect("flush");

    let err = sender.join().expect("sender thread").unwrap_err();
    assert!(
        matches!(err, EngineError::Protocol(ProtocolError::BadSumHeader(_))),
        "{err}"
    );
}

/// The file-list EOF sentinel is only legal in recursive mode.
#[test]
fn eof_outside_recursive_mode_is_a_protocol_error() {
    let temp = tempfile::tempdir().expect("create tempdir");
    let dst = temp.path().join("dst");

    let ((script_read, script_write), (receiver_read, receiver_write)) = duplex();

    let script = thread::spawn(move || {
        let (mut rx, mut tx) = script_server_channel(script_read, script_write, 0);

        let config = SessionConfig::default();
        let mut encoder = FlistEncoder::new(config.codec_options(), TextCodec::utf8());
        encoder
            .encode_entry(&mut tx, &regular_entry("f", 1, 1), false)
            .expect("encode entry");
        encoder.encode_end(&mut tx, 0).expect("encode end");

        let mut ndx_out = IndexEncoder::new();
        ndx_out.write_index(&mut tx, INDEX_EOF).expect("bogus EOF");
        tx.flush().expect("flush");

        // Consume whatever the receiving side managed to emit.
        let mut sink = [0u8; 256];
        loop {
            match rx.get_bytes(&mut sink[..1]) {
                Ok(()) => {}
                Err(_) => break,
            }
        }
    });

    let config = SessionConfig::default();
    let err = engine::run_receiver(
        &config,
        &LocalFilesystem::new(),
        &dst,
        receiver_read,
        receiver_write,
    )
    .unwrap_err();

    assert!(
        matches!(
            err,
            EngineError::Protocol(ProtocolError::UnexpectedIndex { .. })
        ),
        "{err}"
    );
    script.join().expect("script finishes");
}
