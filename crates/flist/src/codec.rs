//! Incremental file-list wire codec.
//!
//! Entries are delta-compressed against the previous entry: a flag word
//! says which attributes repeat, the name is sent as a shared prefix length
//! plus a suffix, and uid/gid mappings are inlined the first time an id
//! appears. A zero flag byte terminates a list; with safe-file-list
//! semantics the terminator is instead the extended `IO_ERROR_ENDLIST` form
//! carrying the sender's accumulated I/O error word.
//!
//! # Upstream Reference
//!
//! - `flist.c` - `send_file_entry()` / `recv_file_entry()` - field order
//! - `rsync.h` - `XMIT_*` - flag bit values

use std::collections::HashMap;

use metadata::{FileAttrs, Group, User};
use protocol::charset::TextCodec;
use protocol::error::{ChannelError, ProtocolError};
use protocol::varint::{read_varint, read_varlong, write_varint, write_varlong};
use protocol::{ChannelRead, ChannelWrite};
use tracing::debug;

use crate::info::{FileDetail, FileInfo};
use crate::MAX_PATH_NAME_LENGTH;

/// Entry flag bits (`XMIT_*`).
pub mod flags {
    /// Entry is a top-level directory argument.
    pub const TOP_DIR: u16 = 0x0001;
    /// Mode equals the previous entry's mode.
    pub const SAME_MODE: u16 = 0x0002;
    /// A second, high flag byte follows.
    pub const EXTENDED_FLAGS: u16 = 0x0004;
    /// uid equals the previous entry's uid.
    pub const SAME_UID: u16 = 0x0008;
    /// gid equals the previous entry's gid.
    pub const SAME_GID: u16 = 0x0010;
    /// Name shares a prefix with the previous entry.
    pub const SAME_NAME: u16 = 0x0020;
    /// Name suffix length is a varint rather than one byte.
    pub const LONG_NAME: u16 = 0x0040;
    /// mtime equals the previous entry's mtime.
    pub const SAME_TIME: u16 = 0x0080;
    /// Device major equals the previous entry's major.
    pub const SAME_RDEV_MAJOR: u16 = 0x0100;
    /// A uid-to-name mapping is inlined after the uid.
    pub const USER_NAME_FOLLOWS: u16 = 0x0400;
    /// A gid-to-name mapping is inlined after the gid.
    pub const GROUP_NAME_FOLLOWS: u16 = 0x0800;
    /// With [`EXTENDED_FLAGS`]: list terminator carrying an io-error word.
    pub const IO_ERROR_ENDLIST: u16 = 0x1000;

    /// Every bit this implementation interprets.
    pub const KNOWN: u16 = TOP_DIR
        | SAME_MODE
        | EXTENDED_FLAGS
        | SAME_UID
        | SAME_GID
        | SAME_NAME
        | LONG_NAME
        | SAME_TIME
        | SAME_RDEV_MAJOR
        | USER_NAME_FOLLOWS
        | GROUP_NAME_FOLLOWS
        | IO_ERROR_ENDLIST;
}

/// Options both codec halves must agree on; derived from the negotiated
/// session feature set.
#[derive(Clone, Copy, Debug, Default)]
pub struct CodecOptions {
    /// Incremental recursion is active.
    pub recursive: bool,
    /// uids travel on the wire.
    pub preserve_uid: bool,
    /// gids travel on the wire.
    pub preserve_gid: bool,
    /// Symlink targets travel on the wire.
    pub preserve_links: bool,
    /// Device numbers travel on the wire for block/char devices.
    pub preserve_devices: bool,
    /// Device numbers travel on the wire for fifos/sockets.
    pub preserve_specials: bool,
    /// Suppress uid/gid name mappings.
    pub numeric_ids: bool,
    /// Require the extended io-error terminator.
    pub safe_file_list: bool,
}

/// The one-entry delta cache both halves keep in lockstep.
#[derive(Debug, Default)]
struct EntryCache {
    name: Vec<u8>,
    mode: u32,
    mtime: i64,
    uid: u32,
    gid: u32,
    rdev_major: u32,
}

impl EntryCache {
    fn store(&mut self, info: &FileInfo, major: u32) {
        self.name = info.name_bytes().to_vec();
        self.mode = info.attrs().mode;
        self.mtime = info.attrs().mtime;
        self.uid = info.attrs().user.uid;
        self.gid = info.attrs().group.gid;
        self.rdev_major = major;
    }
}

fn wants_device_numbers(opts: &CodecOptions, attrs: &FileAttrs) -> bool {
    let file_type = attrs.file_type();
    (file_type.is_device() && opts.preserve_devices)
        || (file_type.is_special() && opts.preserve_specials)
}

/// Streaming encoder for one list direction.
#[derive(Debug)]
pub struct FlistEncoder {
    opts: CodecOptions,
    codec: TextCodec,
    cache: EntryCache,
}

impl FlistEncoder {
    /// Creates an encoder with an empty delta cache.
    #[must_use]
    pub fn new(opts: CodecOptions, codec: TextCodec) -> Self {
        Self {
            opts,
            codec,
            cache: EntryCache::default(),
        }
    }

    /// Encodes one entry.
    pub fn encode_entry<W: ChannelWrite + ?Sized>(
        &mut self,
        writer: &mut W,
        info: &FileInfo,
        top_dir: bool,
    ) -> Result<(), ChannelError> {
        let attrs = info.attrs();
        let name = info.name_bytes();

        let mut flags: u16 = 0;
        if top_dir && info.is_directory() {
            flags |= flags::TOP_DIR;
        }
        if attrs.mode == self.cache.mode {
            flags |= flags::SAME_MODE;
        }
        if attrs.mtime == self.cache.mtime {
            flags |= flags::SAME_TIME;
        }

        let send_user_name;
        if self.opts.preserve_uid {
            if attrs.user.uid == self.cache.uid {
                flags |= flags::SAME_UID;
                send_user_name = false;
            } else {
                send_user_name =
                    !self.opts.numeric_ids && self.opts.recursive && !attrs.user.name.is_empty();
                if send_user_name {
                    flags |= flags::USER_NAME_FOLLOWS;
                }
            }
        } else {
            flags |= flags::SAME_UID;
            send_user_name = false;
        }

        let send_group_name;
        if self.opts.preserve_gid {
            if attrs.group.gid == self.cache.gid {
                flags |= flags::SAME_GID;
                send_group_name = false;
            } else {
                send_group_name =
                    !self.opts.numeric_ids && self.opts.recursive && !attrs.group.name.is_empty();
                if send_group_name {
                    flags |= flags::GROUP_NAME_FOLLOWS;
                }
            }
        } else {
            flags |= flags::SAME_GID;
            send_group_name = false;
        }

        let mut prefix = common_prefix(&self.cache.name, name).min(255);
        if prefix == name.len() {
            // The suffix must carry at least one byte.
            prefix -= 1;
        }
        let suffix = &name[prefix..];
        if prefix > 0 {
            flags |= flags::SAME_NAME;
        }
        if suffix.len() > 255 {
            flags |= flags::LONG_NAME;
        }

        let devices = wants_device_numbers(&self.opts, attrs);
        if devices && attrs.rdev_major == self.cache.rdev_major {
            flags |= flags::SAME_RDEV_MAJOR;
        }

        // A zero flag word would read as a terminator; mirror upstream and
        // tag non-directories with the harmless TOP_DIR bit.
        if flags == 0 && !info.is_directory() {
            flags |= flags::TOP_DIR;
        }
        if flags & 0xFF00 != 0 || flags == 0 {
            flags |= flags::EXTENDED_FLAGS;
            writer.put_char(flags)?;
        } else {
            writer.put_byte(flags as u8)?;
        }

        if flags & flags::SAME_NAME != 0 {
            writer.put_byte(prefix as u8)?;
        }
        if flags & flags::LONG_NAME != 0 {
            write_varint(writer, suffix.len() as i32)?;
        } else {
            writer.put_byte(suffix.len() as u8)?;
        }
        writer.put_bytes(suffix)?;

        write_varlong(writer, attrs.size as i64, 3)?;
        if flags & flags::SAME_TIME == 0 {
            write_varlong(writer, attrs.mtime, 4)?;
        }
        if flags & flags::SAME_MODE == 0 {
            writer.put_int(attrs.mode as i32)?;
        }

        if self.opts.preserve_uid && flags & flags::SAME_UID == 0 {
            write_varint(writer, attrs.user.uid as i32)?;
            if send_user_name {
                self.put_mapping_name(writer, &attrs.user.name)?;
            }
        }
        if self.opts.preserve_gid && flags & flags::SAME_GID == 0 {
            write_varint(writer, attrs.group.gid as i32)?;
            if send_group_name {
                self.put_mapping_name(writer, &attrs.group.name)?;
            }
        }

        if devices {
            if flags & flags::SAME_RDEV_MAJOR == 0 {
                write_varint(writer, attrs.rdev_major as i32)?;
            }
            write_varint(writer, attrs.rdev_minor as i32)?;
        }

        if self.opts.preserve_links {
            if let Some(target) = info.symlink_target() {
                write_varint(writer, target.len() as i32)?;
                writer.put_bytes(target)?;
            }
        }

        let major = if devices { attrs.rdev_major } else { self.cache.rdev_major };
        self.cache.store(info, major);
        Ok(())
    }

    fn put_mapping_name<W: ChannelWrite + ?Sized>(
        &self,
        writer: &mut W,
        name: &str,
    ) -> Result<(), ChannelError> {
        let bytes = self
            .codec
            .encode(name)
            .ok_or(ProtocolError::UndecodableText)?;
        let len = bytes.len().min(255);
        writer.put_byte(len as u8)?;
        writer.put_bytes(&bytes[..len])
    }

    /// Terminates the list. With safe-file-list semantics (or a nonzero
    /// error word) the extended terminator carries `io_error`.
    pub fn encode_end<W: ChannelWrite + ?Sized>(
        &mut self,
        writer: &mut W,
        io_error: i32,
    ) -> Result<(), ChannelError> {
        if self.opts.safe_file_list || io_error != 0 {
            writer.put_char(flags::EXTENDED_FLAGS | flags::IO_ERROR_ENDLIST)?;
            write_varint(writer, io_error)?;
        } else {
            writer.put_byte(0)?;
        }
        Ok(())
    }
}

/// One decoded wire item.
#[derive(Debug)]
pub enum DecodedEntry {
    /// A file-list entry.
    Entry(FileInfo),
    /// The list terminator and the peer's io-error word.
    End {
        /// Accumulated sender-side error bits, zero when clean.
        io_error: i32,
    },
}

/// Streaming decoder for one list direction.
#[derive(Debug)]
pub struct FlistDecoder {
    opts: CodecOptions,
    codec: TextCodec,
    cache: EntryCache,
    users: HashMap<u32, String>,
    groups: HashMap<u32, String>,
}

impl FlistDecoder {
    /// Creates a decoder with an empty delta cache.
    #[must_use]
    pub fn new(opts: CodecOptions, codec: TextCodec) -> Self {
        Self {
            opts,
            codec,
            cache: EntryCache::default(),
            users: HashMap::new(),
            groups: HashMap::new(),
        }
    }

    /// Name tables accumulated from inline mappings.
    #[must_use]
    pub fn known_users(&self) -> &HashMap<u32, String> {
        &self.users
    }

    /// Group name tables accumulated from inline mappings.
    #[must_use]
    pub fn known_groups(&self) -> &HashMap<u32, String> {
        &self.groups
    }

    /// Decodes the next item.
    pub fn decode_entry<R: ChannelRead + ?Sized>(
        &mut self,
        reader: &mut R,
    ) -> Result<DecodedEntry, ChannelError> {
        let first = reader.get_byte()?;
        if first == 0 {
            if self.opts.safe_file_list {
                return Err(ProtocolError::Violation(
                    "peer sent a bare list terminator where the io-error form is required"
                        .to_owned(),
                )
                .into());
            }
            return Ok(DecodedEntry::End { io_error: 0 });
        }

        let mut flags = u16::from(first);
        if flags & flags::EXTENDED_FLAGS != 0 {
            flags |= u16::from(reader.get_byte()?) << 8;
        }
        if flags & flags::IO_ERROR_ENDLIST != 0 {
            let io_error = read_varint(reader)?;
            return Ok(DecodedEntry::End { io_error });
        }
        if flags & !flags::KNOWN != 0 {
            debug!(flags, unknown = flags & !flags::KNOWN, "dropping unknown entry flag bits");
            flags &= flags::KNOWN;
        }

        let name_bytes = self.read_name(reader, flags)?;

        let size = read_varlong(reader, 3)?;
        if size < 0 {
            return Err(ProtocolError::NegativeValue { field: "file size", value: size }.into());
        }
        let mtime = if flags & flags::SAME_TIME != 0 {
            self.cache.mtime
        } else {
            let mtime = read_varlong(reader, 4)?;
            if mtime < 0 {
                return Err(
                    ProtocolError::NegativeValue { field: "mtime", value: mtime }.into()
                );
            }
            mtime
        };
        let mode = if flags & flags::SAME_MODE != 0 {
            self.cache.mode
        } else {
            reader.get_int()? as u32
        };

        let uid = self.read_id(
            reader,
            flags,
            flags::SAME_UID,
            flags::USER_NAME_FOLLOWS,
            self.opts.preserve_uid,
            self.cache.uid,
            IdKind::User,
        )?;
        let gid = self.read_id(
            reader,
            flags,
            flags::SAME_GID,
            flags::GROUP_NAME_FOLLOWS,
            self.opts.preserve_gid,
            self.cache.gid,
            IdKind::Group,
        )?;

        let mut attrs = FileAttrs {
            mode,
            size: size as u64,
            mtime,
            user: User {
                uid,
                name: self.users.get(&uid).cloned().unwrap_or_default(),
            },
            group: Group {
                gid,
                name: self.groups.get(&gid).cloned().unwrap_or_default(),
            },
            rdev_major: 0,
            rdev_minor: 0,
            // Link identity is local-only state; decoded entries have none.
            nlink: 1,
            file_id: None,
        };

        let devices = wants_device_numbers(&self.opts, &attrs);
        if devices {
            attrs.rdev_major = if flags & flags::SAME_RDEV_MAJOR != 0 {
                self.cache.rdev_major
            } else {
                id_from_varint(read_varint(reader)?, "device major")?
            };
            attrs.rdev_minor = id_from_varint(read_varint(reader)?, "device minor")?;
        }

        let detail = if attrs.file_type().is_device() && devices {
            FileDetail::Device {
                major: attrs.rdev_major,
                minor: attrs.rdev_minor,
            }
        } else if attrs.is_symlink() && self.opts.preserve_links {
            let len = read_varint(reader)?;
            if !(0..=MAX_PATH_NAME_LENGTH as i32).contains(&len) {
                return Err(ProtocolError::Violation(format!(
                    "symlink target length {len} out of range"
                ))
                .into());
            }
            let mut target = vec![0u8; len as usize];
            reader.get_bytes(&mut target)?;
            FileDetail::Symlink { target }
        } else {
            FileDetail::Plain
        };

        let decoded_name = self.codec.decode(&name_bytes);
        let major = if devices { attrs.rdev_major } else { self.cache.rdev_major };
        let info = FileInfo::new(name_bytes, decoded_name, attrs, detail)
            .map_err(|e| ProtocolError::Violation(e.to_string()))?;
        self.cache.store(&info, major);
        Ok(DecodedEntry::Entry(info))
    }

    fn read_name<R: ChannelRead + ?Sized>(
        &mut self,
        reader: &mut R,
        flags: u16,
    ) -> Result<Vec<u8>, ChannelError> {
        let prefix = if flags & flags::SAME_NAME != 0 {
            usize::from(reader.get_byte()?)
        } else {
            0
        };
        if prefix > self.cache.name.len() {
            return Err(ProtocolError::Violation(format!(
                "name prefix {prefix} exceeds previous name length {}",
                self.cache.name.len()
            ))
            .into());
        }

        let suffix_len = if flags & flags::LONG_NAME != 0 {
            let len = read_varint(reader)?;
            usize::try_from(len).map_err(|_| {
                ChannelError::from(ProtocolError::NegativeValue {
                    field: "name length",
                    value: i64::from(len),
                })
            })?
        } else {
            usize::from(reader.get_byte()?)
        };
        if suffix_len == 0 || prefix + suffix_len > MAX_PATH_NAME_LENGTH {
            return Err(ProtocolError::Violation(format!(
                "path name length {} out of range",
                prefix + suffix_len
            ))
            .into());
        }

        let mut name = Vec::with_capacity(prefix + suffix_len);
        name.extend_from_slice(&self.cache.name[..prefix]);
        let start = name.len();
        name.resize(prefix + suffix_len, 0);
        reader.get_bytes(&mut name[start..])?;
        Ok(name)
    }

    fn read_id<R: ChannelRead + ?Sized>(
        &mut self,
        reader: &mut R,
        flags: u16,
        same_bit: u16,
        name_bit: u16,
        preserved: bool,
        cached: u32,
        kind: IdKind,
    ) -> Result<u32, ChannelError> {
        if !preserved {
            if flags & same_bit == 0 {
                return Err(ProtocolError::Violation(format!(
                    "{} id transmitted although the session does not preserve it",
                    kind.label()
                ))
                .into());
            }
            return Ok(0);
        }
        if flags & same_bit != 0 {
            return Ok(cached);
        }

        let id = id_from_varint(read_varint(reader)?, kind.label())?;
        if flags & name_bit != 0 {
            if !self.opts.recursive {
                return Err(ProtocolError::Violation(format!(
                    "inline {} name mapping outside recursive mode",
                    kind.label()
                ))
                .into());
            }
            let len = usize::from(reader.get_byte()?);
            let mut bytes = vec![0u8; len];
            reader.get_bytes(&mut bytes)?;
            let name = self
                .codec
                .decode(&bytes)
                .ok_or(ProtocolError::UndecodableText)?;
            match kind {
                IdKind::User => self.users.insert(id, name),
                IdKind::Group => self.groups.insert(id, name),
            };
        }
        Ok(id)
    }
}

#[derive(Clone, Copy, Debug)]
enum IdKind {
    User,
    Group,
}

impl IdKind {
    const fn label(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
        }
    }
}

fn id_from_varint(raw: i32, field: &'static str) -> Result<u32, ChannelError> {
    u32::try_from(raw).map_err(|_| {
        ChannelError::from(ProtocolError::NegativeValue {
            field,
            value: i64::from(raw),
        })
    })
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use metadata::FileType;

    fn opts() -> CodecOptions {
        CodecOptions {
            recursive: true,
            preserve_uid: true,
            preserve_gid: true,
            preserve_links: true,
            preserve_devices: true,
            preserve_specials: false,
            numeric_ids: false,
            safe_file_list: false,
        }
    }

    fn regular(name: &str, size: u64, mtime: i64, uid: u32) -> FileInfo {
        let mut attrs = FileAttrs::regular(0o644, size, mtime);
        attrs.user = User { uid, name: format!("u{uid}") };
        attrs.group = Group { gid: 100, name: "users".to_owned() };
        FileInfo::new(
            name.as_bytes().to_vec(),
            Some(name.to_owned()),
            attrs,
            FileDetail::Plain,
        )
        .expect("valid entry")
    }

    fn round_trip(entries: &[FileInfo], options: CodecOptions) -> (Vec<FileInfo>, i32) {
        let mut wire = Vec::new();
        let mut encoder = FlistEncoder::new(options, TextCodec::utf8());
        for (i, entry) in entries.iter().enumerate() {
            encoder
                .encode_entry(&mut wire, entry, i == 0 && entry.is_directory())
                .expect("encode succeeds");
        }
        encoder.encode_end(&mut wire, 0).expect("encode end");

        let mut slice = wire.as_slice();
        let mut decoder = FlistDecoder::new(options, TextCodec::utf8());
        let mut decoded = Vec::new();
        let io_error = loop {
            match decoder.decode_entry(&mut slice).expect("decode succeeds") {
                DecodedEntry::Entry(info) => decoded.push(info),
                DecodedEntry::End { io_error } => break io_error,
            }
        };
        assert!(slice.is_empty(), "decoder must consume the whole list");
        (decoded, io_error)
    }

    #[test]
    fn entries_round_trip_with_delta_compression() {
        let entries = vec![
            regular("alpha.txt", 100, 1_700_000_000, 1000),
            regular("alpha.tzt", 200, 1_700_000_000, 1000),
            regular("beta", 0, 1_600_000_000, 0),
        ];
        let (decoded, io_error) = round_trip(&entries, opts());

        assert_eq!(io_error, 0);
        assert_eq!(decoded.len(), 3);
        for (original, copy) in entries.iter().zip(&decoded) {
            assert_eq!(original.name_bytes(), copy.name_bytes());
            assert_eq!(original.attrs().size, copy.attrs().size);
            assert_eq!(original.attrs().mtime, copy.attrs().mtime);
            assert_eq!(original.attrs().mode, copy.attrs().mode);
            assert_eq!(original.attrs().user.uid, copy.attrs().user.uid);
        }
        assert_eq!(decoded[0].attrs().user.name, "u1000");
        assert_eq!(decoded[2].attrs().user.name, "u0");
    }

    #[test]
    fn shared_prefixes_shrink_the_wire_form() {
        let long_a = format!("dir/{}a", "x".repeat(200));
        let long_b = format!("dir/{}b", "x".repeat(200));
        let entries = vec![
            regular(&long_a, 1, 1, 1000),
            regular(&long_b, 1, 1, 1000),
        ];

        let mut wire = Vec::new();
        let mut encoder = FlistEncoder::new(opts(), TextCodec::utf8());
        encoder.encode_entry(&mut wire, &entries[0], false).expect("encode");
        let first_len = wire.len();
        encoder.encode_entry(&mut wire, &entries[1], false).expect("encode");
        let second_len = wire.len() - first_len;

        assert!(second_len < 16, "delta entry only carries the suffix: {second_len}");
        let (decoded, _) = round_trip(&entries, opts());
        assert_eq!(decoded[1].name(), Some(long_b.as_str()));
    }

    #[test]
    fn symlinks_carry_their_targets() {
        let mut attrs = FileAttrs::regular(0o777, 0, 5);
        attrs.mode = FileType::Symlink.mode_bits() | 0o777;
        let link = FileInfo::new(
            b"link".to_vec(),
            Some("link".to_owned()),
            attrs,
            FileDetail::Symlink { target: b"../target".to_vec() },
        )
        .expect("valid symlink");

        let (decoded, _) = round_trip(&[link], opts());
        assert_eq!(decoded[0].symlink_target(), Some(b"../target".as_slice()));
    }

    #[test]
    fn devices_reuse_the_cached_major() {
        let dev = |name: &str, major: u32, minor: u32| {
            let mut attrs = FileAttrs::regular(0o660, 0, 9);
            attrs.mode = FileType::BlockDevice.mode_bits() | 0o660;
            attrs.rdev_major = major;
            attrs.rdev_minor = minor;
            FileInfo::new(
                name.as_bytes().to_vec(),
                Some(name.to_owned()),
                attrs,
                FileDetail::Device { major, minor },
            )
            .expect("valid device")
        };
        let entries = vec![dev("sda1", 8, 1), dev("sda2", 8, 2)];
        let (decoded, _) = round_trip(&entries, opts());
        assert_eq!(decoded[1].attrs().rdev_major, 8);
        assert_eq!(decoded[1].attrs().rdev_minor, 2);
    }

    #[test]
    fn directories_round_trip() {
        let dir = FileInfo::new(
            b".".to_vec(),
            Some(".".to_owned()),
            FileAttrs::directory(0o755, 1_700_000_000),
            FileDetail::Plain,
        )
        .expect("valid dot dir");
        let (decoded, _) = round_trip(&[dir], opts());
        assert!(decoded[0].is_dot_dir());
        assert!(decoded[0].is_directory());
    }

    #[test]
    fn unpreserved_ids_require_the_same_flags() {
        let mut no_uid = opts();
        no_uid.preserve_uid = false;

        // Encoded with uid preservation on, decoded with it off: the entry
        // lacks SAME_UID, which the decoder must reject.
        let mut wire = Vec::new();
        let mut encoder = FlistEncoder::new(opts(), TextCodec::utf8());
        encoder
            .encode_entry(&mut wire, &regular("f", 1, 1, 1234), false)
            .expect("encode succeeds");

        let mut slice = wire.as_slice();
        let mut decoder = FlistDecoder::new(no_uid, TextCodec::utf8());
        let err = decoder.decode_entry(&mut slice).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn name_mappings_outside_recursive_mode_are_rejected() {
        let mut non_recursive = opts();
        non_recursive.recursive = false;

        let mut wire = Vec::new();
        let mut encoder = FlistEncoder::new(opts(), TextCodec::utf8());
        encoder
            .encode_entry(&mut wire, &regular("f", 1, 1, 1234), false)
            .expect("encode succeeds");

        let mut slice = wire.as_slice();
        let mut decoder = FlistDecoder::new(non_recursive, TextCodec::utf8());
        let err = decoder.decode_entry(&mut slice).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn oversized_paths_are_rejected() {
        let mut wire = Vec::new();
        wire.push((flags::LONG_NAME | flags::TOP_DIR) as u8);
        write_varint(&mut wire, MAX_PATH_NAME_LENGTH as i32 + 1).expect("varint");

        let mut slice = wire.as_slice();
        let mut decoder = FlistDecoder::new(opts(), TextCodec::utf8());
        let err = decoder.decode_entry(&mut slice).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn bad_prefix_reference_is_rejected() {
        let mut wire = Vec::new();
        wire.push((flags::SAME_NAME | flags::TOP_DIR) as u8);
        wire.push(10); // prefix longer than the (empty) previous name

        let mut slice = wire.as_slice();
        let mut decoder = FlistDecoder::new(opts(), TextCodec::utf8());
        let err = decoder.decode_entry(&mut slice).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn safe_file_list_terminator_carries_the_error_word() {
        let mut safe = opts();
        safe.safe_file_list = true;

        let mut wire = Vec::new();
        let mut encoder = FlistEncoder::new(safe, TextCodec::utf8());
        encoder.encode_end(&mut wire, 5).expect("encode end");

        let mut slice = wire.as_slice();
        let mut decoder = FlistDecoder::new(safe, TextCodec::utf8());
        match decoder.decode_entry(&mut slice).expect("decode succeeds") {
            DecodedEntry::End { io_error } => assert_eq!(io_error, 5),
            DecodedEntry::Entry(_) => panic!("expected terminator"),
        }
    }

    #[test]
    fn bare_terminator_is_rejected_under_safe_file_list() {
        let mut safe = opts();
        safe.safe_file_list = true;

        let wire = vec![0u8];
        let mut slice = wire.as_slice();
        let mut decoder = FlistDecoder::new(safe, TextCodec::utf8());
        let err = decoder.decode_entry(&mut slice).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn undecodable_names_survive_as_untransferrable() {
        let mut attrs = FileAttrs::regular(0o644, 1, 1);
        attrs.user = User::from_uid(0);
        attrs.group = Group::from_gid(0);
        let raw = FileInfo::new(
            vec![0xFF, 0xFE, b'x'],
            None,
            attrs,
            FileDetail::Plain,
        )
        .expect("valid entry");

        let (decoded, _) = round_trip(&[raw], opts());
        assert_eq!(decoded[0].name(), None, "name survives undecoded");
        assert_eq!(decoded[0].name_bytes(), &[0xFF, 0xFE, b'x']);
    }
}
