// Telemetry payload header: `ts=<unix-ms>|seq=<n>|` followed by filler bytes.
//
// The header is the only wire contract between the two ends of the link. Publishers
// stamp it, consumers parse it back to compute one-way latency and detect gaps.
use bytes::{BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

pub const TS_KEY: &[u8] = b"ts=";
pub const SEQ_KEY: &[u8] = b"seq=";
pub const DELIMITER: u8 = b'|';
/// Byte used to pad payloads up to their target size.
pub const FILLER: u8 = b'x';

/// Fields recovered from an inbound payload.
///
/// Parsing is tolerant: a missing or malformed field becomes `None` instead of
/// failing the receive path.
///
/// ```
/// use link_wire::PayloadHeader;
///
/// let header = PayloadHeader::parse(b"ts=1700000000000|seq=42|xxxx");
/// assert_eq!(header.publish_ts_ms, Some(1_700_000_000_000));
/// assert_eq!(header.seq, Some(42));
///
/// let garbage = PayloadHeader::parse(b"hello");
/// assert!(garbage.publish_ts_ms.is_none() && garbage.seq.is_none());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadHeader {
    pub publish_ts_ms: Option<u64>,
    pub seq: Option<u64>,
}

impl PayloadHeader {
    pub fn parse(payload: &[u8]) -> Self {
        Self {
            publish_ts_ms: parse_field(payload, TS_KEY),
            seq: parse_field(payload, SEQ_KEY),
        }
    }

    /// One-way latency against a receive timestamp, if it can be trusted.
    pub fn latency_ms(&self, recv_ts_ms: u64) -> Option<u64> {
        one_way_latency_ms(self.publish_ts_ms, recv_ts_ms)
    }
}

/// Render just the header for a given publish time and sequence number.
pub fn encode_header(publish_ts_ms: u64, seq: u64) -> String {
    format!("ts={publish_ts_ms}|seq={seq}|")
}

/// Build a payload of at least `target_len` bytes.
///
/// The header is never truncated: when it is already `target_len` bytes or
/// longer, the payload is exactly the header.
///
/// ```
/// use link_wire::build_payload;
///
/// let payload = build_payload(5, 1, 16);
/// assert_eq!(&payload[..], b"ts=5|seq=1|xxxxx");
///
/// let short_target = build_payload(1_700_000_000_000, 7, 4);
/// assert_eq!(&short_target[..], b"ts=1700000000000|seq=7|");
/// ```
pub fn build_payload(publish_ts_ms: u64, seq: u64, target_len: usize) -> Bytes {
    let header = encode_header(publish_ts_ms, seq);
    let mut buf = BytesMut::with_capacity(target_len.max(header.len()));
    buf.put_slice(header.as_bytes());
    if buf.len() < target_len {
        buf.resize(target_len, FILLER);
    }
    buf.freeze()
}

/// `recv - publish` when both are known and the clocks did not run backwards.
pub fn one_way_latency_ms(publish_ts_ms: Option<u64>, recv_ts_ms: u64) -> Option<u64> {
    let publish_ts_ms = publish_ts_ms?;
    recv_ts_ms.checked_sub(publish_ts_ms)
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn parse_field(payload: &[u8], key: &[u8]) -> Option<u64> {
    let start = find(payload, key)? + key.len();
    let rest = &payload[start..];
    let end = rest.iter().position(|byte| *byte == DELIMITER)?;
    parse_digits(&rest[..end])
}

fn parse_digits(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for byte in digits {
        if !byte.is_ascii_digit() {
            return None;
        }
        value = value
            .checked_mul(10)?
            .checked_add(u64::from(byte - b'0'))?;
    }
    Some(value)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
