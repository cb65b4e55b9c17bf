// Fixed payload vectors shared with the peer implementation. Any change here is a
// wire break for consumers already parsing these headers.
use link_wire::{PayloadHeader, build_payload};

struct Vector {
    ts: u64,
    seq: u64,
    target: usize,
    expected: &'static [u8],
}

const VECTORS: &[Vector] = &[
    Vector {
        ts: 0,
        seq: 1,
        target: 0,
        expected: b"ts=0|seq=1|",
    },
    Vector {
        ts: 1_700_000_000_123,
        seq: 1,
        target: 32,
        expected: b"ts=1700000000123|seq=1|xxxxxxxxx",
    },
    Vector {
        ts: 1_700_000_000_123,
        seq: 123_456,
        target: 29,
        expected: b"ts=1700000000123|seq=123456|x",
    },
    Vector {
        ts: 42,
        seq: 18_446_744_073_709_551_615,
        target: 8,
        expected: b"ts=42|seq=18446744073709551615|",
    },
];

#[test]
fn vectors_match_payload_encoding() {
    for vector in VECTORS {
        let payload = build_payload(vector.ts, vector.seq, vector.target);
        assert_eq!(
            payload.as_ref(),
            vector.expected,
            "payload mismatch for ts={} seq={}",
            vector.ts,
            vector.seq
        );
        assert!(payload.len() >= vector.target);

        let header = PayloadHeader::parse(&payload);
        assert_eq!(header.publish_ts_ms, Some(vector.ts));
        assert_eq!(header.seq, Some(vector.seq));
    }
}

#[test]
fn peer_payloads_with_foreign_filler_still_parse() {
    let header = PayloadHeader::parse(b"ts=1700000000999|seq=77|{\"driver\":\"d-1\"}");
    assert_eq!(header.publish_ts_ms, Some(1_700_000_000_999));
    assert_eq!(header.seq, Some(77));
}
