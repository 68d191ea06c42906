//! Hello handshake framing & feature negotiation (L10).

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CoreError, CoreResult};
use crate::protocol::wire::Hello;

pub const MAGIC_V1: u32 = 0x2EA7D90B;
pub const MAGIC_V2: u32 = 0x2EA7D90C;
pub const MAGIC_LEGACY_V13: u32 = 0x9F79BC40;

pub const MAX_HELLO_LEN: usize = 32767;

/// Which hello variant a peer sent, derived from the magic prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloMagic {
    V1,
    V2,
}

/// Encodes `hello` as `[4B magic][2B big-endian length][protobuf body]`.
pub fn encode(hello: &Hello, magic: HelloMagic) -> CoreResult<BytesMut> {
    if hello.timestamp == 0 {
        return Err(CoreError::ProtocolViolation(
            "hello timestamp must be non-zero".to_string(),
        ));
    }
    let magic_value = match magic {
        HelloMagic::V1 => MAGIC_V1,
        HelloMagic::V2 => MAGIC_V2,
    };

    let body_len = hello.encoded_len();
    if body_len > MAX_HELLO_LEN {
        return Err(CoreError::FrameTooLong(body_len));
    }

    let mut buf = BytesMut::with_capacity(4 + 2 + body_len);
    buf.put_u32(magic_value);
    buf.put_u16(body_len as u16);
    hello
        .encode(&mut buf)
        .map_err(|e| CoreError::MalformedMessage(e.to_string()))?;
    Ok(buf)
}

/// Parses a fully-buffered `[magic][len][body]` frame already read from
/// the wire. Rejects the legacy magic with `TooOldVersion`, anything else
/// unrecognized with `UnknownMagic`.
pub fn decode(mut buf: &[u8]) -> CoreResult<Hello> {
    if buf.len() < 6 {
        return Err(CoreError::MalformedMessage("frame too short".to_string()));
    }
    let magic = buf.get_u32();
    classify_magic(magic)?;

    let len = buf.get_u16() as usize;
    if len > MAX_HELLO_LEN {
        return Err(CoreError::FrameTooLong(len));
    }
    if buf.len() < len {
        return Err(CoreError::MalformedMessage(
            "buffer shorter than declared length".to_string(),
        ));
    }

    let hello = Hello::decode(&buf[..len]).map_err(|e| CoreError::MalformedMessage(e.to_string()))?;
    if hello.timestamp == 0 {
        return Err(CoreError::ProtocolViolation(
            "hello timestamp must be non-zero".to_string(),
        ));
    }
    Ok(hello)
}

fn classify_magic(magic: u32) -> CoreResult<HelloMagic> {
    match magic {
        MAGIC_V1 => Ok(HelloMagic::V1),
        MAGIC_V2 => Ok(HelloMagic::V2),
        MAGIC_LEGACY_V13 => Err(CoreError::TooOldVersion),
        _ => Err(CoreError::UnknownMagic),
    }
}

/// Writes the hello frame to an async sink, used on both ends of a
/// freshly-established connection.
pub async fn write_hello<W: AsyncWrite + Unpin>(
    writer: &mut W,
    hello: &Hello,
    magic: HelloMagic,
) -> CoreResult<()> {
    let buf = encode(hello, magic)?;
    writer.write_all(&buf).await?;
    Ok(())
}

/// Reads and parses a hello frame from an async source.
pub async fn read_hello<R: AsyncRead + Unpin>(reader: &mut R) -> CoreResult<Hello> {
    let mut header = [0u8; 6];
    reader.read_exact(&mut header).await?;
    let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    classify_magic(magic)?;
    let len = u16::from_be_bytes([header[4], header[5]]) as usize;
    if len > MAX_HELLO_LEN {
        return Err(CoreError::FrameTooLong(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let hello = Hello::decode(body.as_slice())
        .map_err(|e| CoreError::MalformedMessage(e.to_string()))?;
    if hello.timestamp == 0 {
        return Err(CoreError::ProtocolViolation(
            "hello timestamp must be non-zero".to_string(),
        ));
    }
    Ok(hello)
}

/// Parsed semantic version, loosely matching `vMAJOR.MINOR[.PATCH][-suffix]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClientVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ClientVersion {
    pub fn is_v2_capable(&self) -> bool {
        self.major >= 2
    }
}

/// Parses version strings loosely; several legacy textual patterns are
/// accepted in addition to the canonical `vMAJOR.MINOR.PATCH[-suffix]`.
pub fn parse_version(raw: &str) -> Option<ClientVersion> {
    let trimmed = raw.trim().trim_start_matches(['v', 'V']);
    let core = trimmed.split(['-', '+']).next().unwrap_or(trimmed);
    let mut parts = core.split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next().unwrap_or("0").parse().ok().unwrap_or(0);
    let patch: u32 = parts.next().unwrap_or("0").parse().ok().unwrap_or(0);
    Some(ClientVersion { major, minor, patch })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureSet {
    pub multipath_connections: bool,
    pub enhanced_compression: bool,
    pub improved_indexing: bool,
}

impl FeatureSet {
    pub fn empty() -> Self {
        Self {
            multipath_connections: false,
            enhanced_compression: false,
            improved_indexing: false,
        }
    }

    /// Feature set implied by a version number alone (no feature bits on
    /// the wire yet).
    pub fn from_version(version: ClientVersion) -> Self {
        Self {
            multipath_connections: version >= (ClientVersion { major: 2, minor: 0, patch: 0 }),
            enhanced_compression: version >= (ClientVersion { major: 2, minor: 1, patch: 0 }),
            improved_indexing: version >= (ClientVersion { major: 2, minor: 2, patch: 0 }),
        }
    }

    pub fn intersect(&self, other: &FeatureSet) -> FeatureSet {
        FeatureSet {
            multipath_connections: self.multipath_connections && other.multipath_connections,
            enhanced_compression: self.enhanced_compression && other.enhanced_compression,
            improved_indexing: self.improved_indexing && other.improved_indexing,
        }
    }
}

/// Negotiates (protocol-name, feature-set) from both peers' parsed
/// versions.
pub fn negotiate(local: ClientVersion, remote: ClientVersion) -> (&'static str, FeatureSet) {
    if local.is_v2_capable() && remote.is_v2_capable() {
        let features = FeatureSet::from_version(local).intersect(&FeatureSet::from_version(remote));
        ("bep/2.0", features)
    } else {
        ("bep/1.0", FeatureSet::empty())
    }
}

/// Per-protocol success/failure tracker used to pick between `bep/1.0`
/// and `bep/2.0` on reconnect. The explore/exploit mix for
/// low-attempt-count peers is left as a caller-tunable knob rather than
/// baked into a fixed ratio (see DESIGN.md Open Question 1).
#[derive(Debug, Clone, Copy, Default)]
struct ProtocolStats {
    attempts: u32,
    successes: u32,
}

impl ProtocolStats {
    fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProtocolHealthConfig {
    pub min_attempts_for_preference: u32,
}

impl Default for ProtocolHealthConfig {
    fn default() -> Self {
        Self {
            min_attempts_for_preference: 3,
        }
    }
}

#[derive(Default)]
pub struct ProtocolHealthMonitor {
    v1: std::sync::Mutex<ProtocolStats>,
    v2: std::sync::Mutex<ProtocolStats>,
    config: ProtocolHealthConfig,
}

impl ProtocolHealthMonitor {
    pub fn new(config: ProtocolHealthConfig) -> Self {
        Self {
            v1: std::sync::Mutex::new(ProtocolStats::default()),
            v2: std::sync::Mutex::new(ProtocolStats::default()),
            config,
        }
    }

    pub fn record(&self, protocol: &str, success: bool) {
        let stats = if protocol == "bep/1.0" { &self.v1 } else { &self.v2 };
        let mut stats = stats.lock().unwrap();
        stats.attempts += 1;
        if success {
            stats.successes += 1;
        }
    }

    /// Preferred protocol for the next reconnect attempt.
    pub fn prefer(&self) -> &'static str {
        let v1 = *self.v1.lock().unwrap();
        let v2 = *self.v2.lock().unwrap();

        if v1.attempts < self.config.min_attempts_for_preference
            || v2.attempts < self.config.min_attempts_for_preference
        {
            return "bep/2.0";
        }

        if v1.success_rate() > 0.9 && v1.success_rate() > v2.success_rate() {
            "bep/1.0"
        } else if v2.success_rate() > 0.8 {
            "bep/2.0"
        } else {
            "bep/2.0"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hello(ts: i64) -> Hello {
        Hello {
            device_name: "device-a".to_string(),
            client_name: "peersync".to_string(),
            client_version: "v2.1.0".to_string(),
            num_connections: 3,
            timestamp: ts,
        }
    }

    #[test]
    fn encode_decode_round_trips() {
        let hello = sample_hello(1234567890);
        let encoded = encode(&hello, HelloMagic::V2).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, hello);
    }

    #[test]
    fn rejects_zero_timestamp() {
        let hello = sample_hello(0);
        let result = encode(&hello, HelloMagic::V1);
        assert!(result.is_err());
    }

    #[test]
    fn legacy_magic_is_too_old() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAGIC_LEGACY_V13);
        buf.put_u16(0);
        assert!(matches!(decode(&buf), Err(CoreError::TooOldVersion)));
    }

    #[test]
    fn unknown_magic_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(0xDEAD_BEEF);
        buf.put_u16(0);
        assert!(matches!(decode(&buf), Err(CoreError::UnknownMagic)));
    }

    #[test]
    fn parses_loose_version_strings() {
        assert_eq!(
            parse_version("v2.1.0"),
            Some(ClientVersion { major: 2, minor: 1, patch: 0 })
        );
        assert_eq!(
            parse_version("1.9"),
            Some(ClientVersion { major: 1, minor: 9, patch: 0 })
        );
        assert_eq!(
            parse_version("v2.2.3-rc1"),
            Some(ClientVersion { major: 2, minor: 2, patch: 3 })
        );
    }

    #[test]
    fn negotiates_v2_when_both_capable() {
        let local = parse_version("v2.2.0").unwrap();
        let remote = parse_version("v2.1.0").unwrap();
        let (proto, features) = negotiate(local, remote);
        assert_eq!(proto, "bep/2.0");
        assert!(features.enhanced_compression);
        assert!(!features.improved_indexing);
    }

    #[test]
    fn negotiates_v1_when_either_not_capable() {
        let local = parse_version("v2.2.0").unwrap();
        let remote = parse_version("v1.5.0").unwrap();
        let (proto, features) = negotiate(local, remote);
        assert_eq!(proto, "bep/1.0");
        assert_eq!(features, FeatureSet::empty());
    }

    #[test]
    fn protocol_health_prefers_v1_when_strongly_more_reliable() {
        let monitor = ProtocolHealthMonitor::new(ProtocolHealthConfig::default());
        for _ in 0..10 {
            monitor.record("bep/1.0", true);
        }
        for _ in 0..10 {
            monitor.record("bep/2.0", false);
        }
        assert_eq!(monitor.prefer(), "bep/1.0");
    }

    #[test]
    fn protocol_health_defaults_to_v2_below_attempt_threshold() {
        let monitor = ProtocolHealthMonitor::new(ProtocolHealthConfig::default());
        monitor.record("bep/1.0", true);
        assert_eq!(monitor.prefer(), "bep/2.0");
    }
}
