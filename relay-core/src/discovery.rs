//! Discovery datagrams: query encoding, responder decision, response decoding.
//! Stateless; the host owns the socket.

use crate::protocol::{DiscoveryQuery, DiscoveryRecord, PROTOCOL_TAG};
use crate::wire::{decode_payload, encode_payload, FrameEncodeError};

/// Datagram a prober sends.
pub fn query_datagram() -> Result<Vec<u8>, FrameEncodeError> {
    encode_payload(&DiscoveryQuery {
        protocol: PROTOCOL_TAG.to_string(),
    })
}

/// Reply for one received datagram, or `None` if it is malformed or for another protocol.
pub fn answer(datagram: &[u8], record: &DiscoveryRecord) -> Option<Vec<u8>> {
    let query: DiscoveryQuery = decode_payload(datagram).ok()?;
    if query.protocol != PROTOCOL_TAG {
        return None;
    }
    encode_payload(record).ok()
}

/// Parse a responder's reply. Records for another protocol are discarded.
pub fn parse_record(datagram: &[u8]) -> Option<DiscoveryRecord> {
    let record: DiscoveryRecord = decode_payload(datagram).ok()?;
    (record.protocol == PROTOCOL_TAG).then_some(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DiscoveryRecord {
        DiscoveryRecord {
            protocol: PROTOCOL_TAG.to_string(),
            port: 8520,
            name: "office".to_string(),
            current: 3,
            max: 64,
        }
    }

    #[test]
    fn matching_query_is_answered() {
        let reply = answer(&query_datagram().unwrap(), &record()).unwrap();
        assert_eq!(parse_record(&reply), Some(record()));
    }

    #[test]
    fn mismatched_protocol_is_ignored() {
        let query = encode_payload(&DiscoveryQuery {
            protocol: "relay/0".to_string(),
        })
        .unwrap();
        assert!(answer(&query, &record()).is_none());
    }

    #[test]
    fn garbage_is_ignored() {
        assert!(answer(&[0xff, 0x01], &record()).is_none());
        assert!(answer(&[], &record()).is_none());
        assert!(parse_record(&[7, 7, 7]).is_none());
    }

    #[test]
    fn foreign_record_is_discarded() {
        let mut other = record();
        other.protocol = "other/2".to_string();
        let bytes = encode_payload(&other).unwrap();
        assert!(parse_record(&bytes).is_none());
    }
}
