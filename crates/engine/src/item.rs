//! Item flag word sent with every generator request.
//!
//! The 16-bit word describes what the generator observed about the local
//! replica so the far side (and the local log) can itemise the change.
//! Values are upstream rsync's `ITEM_*` bits.

use flist::FileInfo;
use metadata::FileAttrs;

use crate::config::SessionConfig;

/// Some attribute changed on an existing entry.
pub const REPORT_CHANGE: u16 = 1 << 1;
/// Size differs.
pub const REPORT_SIZE: u16 = 1 << 2;
/// Modification time differs.
pub const REPORT_TIME: u16 = 1 << 3;
/// Permission bits differ.
pub const REPORT_PERMS: u16 = 1 << 4;
/// Owner differs.
pub const REPORT_OWNER: u16 = 1 << 5;
/// Group differs.
pub const REPORT_GROUP: u16 = 1 << 6;
/// No replica existed; the entry is new.
pub const IS_NEW: u16 = 1 << 13;
/// The change was applied locally without transfer (mkdir, symlink).
pub const LOCAL_CHANGE: u16 = 1 << 14;
/// File content travels over the wire.
pub const TRANSFER: u16 = 1 << 15;

/// Computes the itemize word for a regular-file entry against the local
/// replica state.
#[must_use]
pub fn itemize_regular(
    config: &SessionConfig,
    entry: &FileInfo,
    replica: Option<&FileAttrs>,
) -> u16 {
    let attrs = entry.attrs();
    let Some(replica) = replica else {
        return IS_NEW;
    };

    let mut flags = 0;
    if replica.size != attrs.size {
        flags |= REPORT_SIZE;
    }
    if replica.mtime != attrs.mtime {
        flags |= REPORT_TIME;
    }
    if config.preserve_permissions && replica.perms() != attrs.perms() {
        flags |= REPORT_PERMS;
    }
    if config.preserve_user && replica.user.uid != attrs.user.uid {
        flags |= REPORT_OWNER;
    }
    if config.preserve_group && replica.group.gid != attrs.group.gid {
        flags |= REPORT_GROUP;
    }
    if flags != 0 {
        flags |= REPORT_CHANGE;
    }
    flags
}
