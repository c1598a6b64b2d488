//! `@RSYNCD` session handshake.
//!
//! Before any framing is active, the peers exchange ASCII greeting lines of
//! the form `@RSYNCD: <major>.<minor>\n` (a stray `\r` before the newline is
//! tolerated). The server then transmits the 32-bit checksum seed that is
//! folded into every block digest for the session. Daemon-mode status lines
//! (`@RSYNCD: OK`, `@RSYNCD: EXIT`, `@RSYNCD: AUTHREQD <challenge>`,
//! `@ERROR ...`) are parsed here as well; anything other than `OK`
//! terminates the run after its trailing message has been read.

use std::fmt;
use std::io::{Read, Write};

use memchr::memchr;

use crate::channel::PrefetchReader;
use crate::error::{ChannelError, ProtocolError};

/// Greeting prefix shared by both handshake and daemon status lines.
pub const GREETING_PREFIX: &str = "@RSYNCD: ";

/// Upper bound on a handshake line; anything longer is a violation.
const MAX_LINE_LEN: usize = 256;

/// A `major.minor` protocol version pair.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ProtocolVersion {
    /// Major protocol number.
    pub major: i32,
    /// Sub-protocol number; zero for released protocols.
    pub minor: i32,
}

impl ProtocolVersion {
    /// Protocol 30, the version this engine speaks.
    pub const V30: Self = Self { major: 30, minor: 0 };

    /// Newest protocol version implemented.
    pub const NEWEST: Self = Self::V30;

    /// Parses the numeric portion of a greeting (`"30"` or `"30.0"`).
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::MalformedGreeting(text.to_owned());
        let (major, minor) = match text.split_once('.') {
            Some((major, minor)) => (
                major.parse().map_err(|_| malformed())?,
                minor.parse().map_err(|_| malformed())?,
            ),
            None => (text.parse().map_err(|_| malformed())?, 0),
        };
        if major <= 0 || minor < 0 {
            return Err(malformed());
        }
        Ok(Self { major, minor })
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Daemon status advertised after the version exchange.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DaemonStatus {
    /// Module selection accepted; the transfer proceeds.
    Ok,
    /// Listing finished; the daemon is closing the connection.
    Exit,
    /// Authentication required; carries the server's challenge.
    AuthRequired(String),
    /// Daemon-side failure; carries the message text.
    Error(String),
}

/// Reads one `\n`-terminated line, stripping an optional trailing `\r`.
pub fn read_line<R: Read>(reader: &mut PrefetchReader<R>) -> Result<String, ChannelError> {
    loop {
        if let Some(pos) = memchr(b'\n', reader.buffered_slice()) {
            let mut line = reader.buffered_slice()[..pos].to_vec();
            reader.consume(pos + 1);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return String::from_utf8(line).map_err(|err| {
                ProtocolError::MalformedGreeting(String::from_utf8_lossy(err.as_bytes()).into_owned())
                    .into()
            });
        }
        if reader.buffered() >= MAX_LINE_LEN {
            return Err(ProtocolError::MalformedGreeting(
                String::from_utf8_lossy(reader.buffered_slice()).into_owned(),
            )
            .into());
        }
        if reader.fill_some()? == 0 {
            return Err(ChannelError::unexpected_eof("handshake line truncated"));
        }
    }
}

/// Writes this side's greeting line.
pub fn write_greeting<W: Write>(writer: &mut W, version: ProtocolVersion) -> Result<(), ChannelError> {
    writer.write_all(format!("{GREETING_PREFIX}{version}\n").as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Reads and parses the peer's greeting line.
pub fn read_greeting<R: Read>(
    reader: &mut PrefetchReader<R>,
) -> Result<ProtocolVersion, ChannelError> {
    let line = read_line(reader)?;
    let rest = line
        .strip_prefix(GREETING_PREFIX)
        .ok_or_else(|| ProtocolError::MalformedGreeting(line.clone()))?;
    Ok(ProtocolVersion::parse(rest.trim())?)
}

/// Validates the peer's advertised version against ours.
///
/// A peer speaking an older protocol than this implementation cannot be
/// served; equal or newer is accepted and the session runs at our version.
pub fn check_peer_version(
    peer: ProtocolVersion,
    local: ProtocolVersion,
) -> Result<ProtocolVersion, ProtocolError> {
    if peer < local {
        return Err(ProtocolError::VersionMismatch { peer, local });
    }
    Ok(local)
}

/// Client-side version exchange: advertise, then read and check the reply.
pub fn exchange_versions_as_client<R: Read, W: Write>(
    reader: &mut PrefetchReader<R>,
    writer: &mut W,
    local: ProtocolVersion,
) -> Result<ProtocolVersion, ChannelError> {
    write_greeting(writer, local)?;
    let peer = read_greeting(reader)?;
    Ok(check_peer_version(peer, local)?)
}

/// Server-side version exchange: read the client's line, then respond.
pub fn exchange_versions_as_server<R: Read, W: Write>(
    reader: &mut PrefetchReader<R>,
    writer: &mut W,
    local: ProtocolVersion,
) -> Result<ProtocolVersion, ChannelError> {
    let peer = read_greeting(reader)?;
    write_greeting(writer, local)?;
    Ok(check_peer_version(peer, local)?)
}

/// Transmits the session checksum seed (server side).
pub fn write_seed<W: Write>(writer: &mut W, seed: i32) -> Result<(), ChannelError> {
    writer.write_all(&seed.to_le_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Receives the session checksum seed (client side).
pub fn read_seed<R: Read>(reader: &mut PrefetchReader<R>) -> Result<i32, ChannelError> {
    let mut raw = [0u8; 4];
    reader.read_exact_buf(&mut raw)?;
    Ok(i32::from_le_bytes(raw))
}

/// Parses a daemon status line.
pub fn parse_status(line: &str) -> Result<DaemonStatus, ProtocolError> {
    if let Some(error) = line.strip_prefix("@ERROR") {
        return Ok(DaemonStatus::Error(error.trim_start_matches([' ', ':']).to_owned()));
    }
    let Some(rest) = line.strip_prefix(GREETING_PREFIX) else {
        return Err(ProtocolError::MalformedGreeting(line.to_owned()));
    };
    match rest.trim() {
        "OK" => Ok(DaemonStatus::Ok),
        "EXIT" => Ok(DaemonStatus::Exit),
        other => match other.strip_prefix("AUTHREQD ") {
            Some(challenge) => Ok(DaemonStatus::AuthRequired(challenge.to_owned())),
            None => Err(ProtocolError::MalformedGreeting(line.to_owned())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefetch(bytes: &[u8]) -> PrefetchReader<&[u8]> {
        PrefetchReader::new(bytes)
    }

    #[test]
    fn greeting_round_trips() {
        let mut wire = Vec::new();
        write_greeting(&mut wire, ProtocolVersion::V30).expect("write succeeds");
        assert_eq!(wire, b"@RSYNCD: 30.0\n");

        let version = read_greeting(&mut prefetch(&wire)).expect("read succeeds");
        assert_eq!(version, ProtocolVersion::V30);
    }

    #[test]
    fn carriage_return_is_tolerated() {
        let version = read_greeting(&mut prefetch(b"@RSYNCD: 30.0\r\n")).expect("read succeeds");
        assert_eq!(version, ProtocolVersion::V30);
    }

    #[test]
    fn bare_major_version_parses() {
        assert_eq!(
            ProtocolVersion::parse("31").expect("parse succeeds"),
            ProtocolVersion { major: 31, minor: 0 }
        );
    }

    #[test]
    fn malformed_greetings_are_rejected() {
        for line in ["HELO\n", "@RSYNCD: x.y\n", "@RSYNCD: -3.0\n"] {
            assert!(read_greeting(&mut prefetch(line.as_bytes())).is_err(), "{line:?}");
        }
    }

    #[test]
    fn older_peer_is_rejected() {
        let err = check_peer_version(
            ProtocolVersion { major: 29, minor: 0 },
            ProtocolVersion::V30,
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::VersionMismatch { .. }));
    }

    #[test]
    fn newer_peer_runs_at_local_version() {
        let negotiated = check_peer_version(
            ProtocolVersion { major: 31, minor: 0 },
            ProtocolVersion::V30,
        )
        .expect("newer peer accepted");
        assert_eq!(negotiated, ProtocolVersion::V30);
    }

    #[test]
    fn seed_is_little_endian() {
        let mut wire = Vec::new();
        write_seed(&mut wire, 0x0102_0304).expect("write succeeds");
        assert_eq!(wire, vec![0x04, 0x03, 0x02, 0x01]);
        assert_eq!(read_seed(&mut prefetch(&wire)).expect("read succeeds"), 0x0102_0304);
    }

    #[test]
    fn status_lines_parse() {
        assert_eq!(parse_status("@RSYNCD: OK").expect("ok"), DaemonStatus::Ok);
        assert_eq!(parse_status("@RSYNCD: EXIT").expect("exit"), DaemonStatus::Exit);
        assert_eq!(
            parse_status("@RSYNCD: AUTHREQD abc123").expect("auth"),
            DaemonStatus::AuthRequired("abc123".to_owned())
        );
        assert_eq!(
            parse_status("@ERROR: unknown module").expect("error"),
            DaemonStatus::Error("unknown module".to_owned())
        );
        assert!(parse_status("@RSYNCD: NOPE").is_err());
    }

    #[test]
    fn truncated_line_reports_eof() {
        let err = read_greeting(&mut prefetch(b"@RSYNCD: 30.0")).unwrap_err();
        assert!(matches!(err, ChannelError::Io(_)));
    }
}
