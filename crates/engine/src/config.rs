//! Typed session configuration.
//!
//! The engine never parses command lines or daemon config files; an outer
//! layer hands it this struct. Feature booleans map one-to-one onto the
//! negotiated wire behaviors, so both peers must be constructed from the
//! same values.

use flist::CodecOptions;
use protocol::TextCodec;

use crate::error::ConfigError;

/// Filter-rule exchange direction. The core only ever negotiates empty rule
/// sets; the mode exists so the handshake framing matches peers that send
/// one.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FilterMode {
    /// No rule exchange.
    #[default]
    None,
    /// This side would send rules.
    Send,
    /// This side would receive rules.
    Receive,
}

/// The complete option set a session runs under.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Expand directories into their own file-list segments on demand.
    pub recursive: bool,
    /// Apply source mtimes to installed files.
    pub preserve_times: bool,
    /// Apply source permission bits to installed files.
    pub preserve_permissions: bool,
    /// Transfer and apply uids.
    pub preserve_user: bool,
    /// Transfer and apply gids.
    pub preserve_group: bool,
    /// Transfer symlinks as symlinks.
    pub preserve_links: bool,
    /// Transfer block/character device entries.
    pub preserve_devices: bool,
    /// Transfer fifo/socket entries.
    pub preserve_specials: bool,
    /// Suppress uid/gid name mapping; apply raw ids.
    pub numeric_ids: bool,
    /// Skip writing replica-identical prefixes until a divergence appears.
    pub deferred_write: bool,
    /// Request transfer for every regular file, bypassing the quick check.
    pub always_itemize: bool,
    /// Emit metadata only; the generator requests nothing.
    pub list_only: bool,
    /// Require the io-error-carrying file-list terminator.
    pub safe_file_list: bool,
    /// Fallback owner name when the peer sends none.
    pub default_user: String,
    /// Fallback group name when the peer sends none.
    pub default_group: String,
    /// Permission bits for files created without preserved permissions.
    pub default_file_perms: u32,
    /// Permission bits for directories created without preserved permissions.
    pub default_dir_perms: u32,
    /// Session charset label; must round-trip the protocol's ASCII set.
    pub charset: String,
    /// Filter-rule exchange direction.
    pub filter_mode: FilterMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            recursive: false,
            preserve_times: true,
            preserve_permissions: true,
            preserve_user: false,
            preserve_group: false,
            preserve_links: false,
            preserve_devices: false,
            preserve_specials: false,
            numeric_ids: false,
            deferred_write: false,
            always_itemize: false,
            list_only: false,
            safe_file_list: false,
            default_user: "nobody".to_owned(),
            default_group: "nobody".to_owned(),
            default_file_perms: 0o644,
            default_dir_perms: 0o755,
            charset: "UTF-8".to_owned(),
            filter_mode: FilterMode::None,
        }
    }
}

impl SessionConfig {
    /// Builds the validated text codec for this session.
    pub fn text_codec(&self) -> Result<TextCodec, ConfigError> {
        Ok(TextCodec::new(&self.charset)?)
    }

    /// Projects the file-list codec options out of the feature set.
    #[must_use]
    pub fn codec_options(&self) -> CodecOptions {
        CodecOptions {
            recursive: self.recursive,
            preserve_uid: self.preserve_user,
            preserve_gid: self.preserve_group,
            preserve_links: self.preserve_links,
            preserve_devices: self.preserve_devices,
            preserve_specials: self.preserve_specials,
            numeric_ids: self.numeric_ids,
            safe_file_list: self.safe_file_list,
        }
    }
}
