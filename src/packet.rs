//! Wake-on-LAN magic packet decoding
//!
//! A magic packet is six `0xFF` bytes followed by sixteen repetitions of the
//! target MAC address: 6 + 16*6 = 102 bytes. Anything after the sixteenth
//! repetition is ignored (some senders append a SecureOn password).

/// Minimum size of a WoL magic packet (6 sync bytes + 16 MAC repetitions)
pub const MAGIC_PACKET_LEN: usize = 6 + 16 * 6;

/// Validates a magic packet payload and extracts the target MAC address.
///
/// Returns the MAC in canonical lowercase `xx:xx:xx:xx:xx:xx` form, or
/// `None` if the payload is not a well-formed magic packet:
/// shorter than 102 bytes, missing the `0xFF` sync stream, or with any of
/// the 16 six-byte groups differing from the first.
pub fn decode_magic_payload(payload: &[u8]) -> Option<String> {
    if payload.len() < MAGIC_PACKET_LEN {
        return None;
    }

    if payload[..6].iter().any(|&b| b != 0xFF) {
        return None;
    }

    // The MAC is taken from the first repetition; the remaining 15 must match.
    let mac = &payload[6..12];
    for rep in 1..16 {
        let offset = 6 + rep * 6;
        if &payload[offset..offset + 6] != mac {
            return None;
        }
    }

    let mut out = [0u8; 6];
    out.copy_from_slice(mac);
    Some(format_mac(&out))
}

/// Returns true iff all six bytes are `0xFF` (the Ethernet broadcast address).
pub fn is_broadcast_mac(mac: &[u8; 6]) -> bool {
    mac.iter().all(|&b| b == 0xFF)
}

/// Formats a six-byte MAC address as lowercase `xx:xx:xx:xx:xx:xx`.
pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Builds a well-formed magic packet payload for the given MAC.
///
/// Used by tests and benchmarks; the operator never sends WoL packets.
pub fn build_magic_packet(mac: &[u8; 6]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(MAGIC_PACKET_LEN);
    packet.extend_from_slice(&[0xFF; 6]);
    for _ in 0..16 {
        packet.extend_from_slice(mac);
    }
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

    #[test]
    fn decodes_well_formed_packet() {
        let packet = build_magic_packet(&SAMPLE_MAC);
        assert_eq!(packet.len(), MAGIC_PACKET_LEN);
        assert_eq!(
            decode_magic_payload(&packet).as_deref(),
            Some("52:54:00:12:34:56")
        );
    }

    #[test]
    fn mac_is_formatted_lowercase() {
        let mac = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        let packet = build_magic_packet(&mac);
        assert_eq!(
            decode_magic_payload(&packet).as_deref(),
            Some("aa:bb:cc:dd:ee:ff")
        );
    }

    #[test]
    fn rejects_payload_one_byte_short() {
        let mut packet = build_magic_packet(&SAMPLE_MAC);
        packet.truncate(MAGIC_PACKET_LEN - 1);
        assert_eq!(decode_magic_payload(&packet), None);
    }

    #[test]
    fn accepts_payload_with_trailing_garbage() {
        // Trailing bytes (e.g. a SecureOn password) are ignored; the MAC is
        // taken from the first repetition.
        let mut packet = build_magic_packet(&SAMPLE_MAC);
        packet.push(0xDE);
        assert_eq!(
            decode_magic_payload(&packet).as_deref(),
            Some("52:54:00:12:34:56")
        );

        packet.extend_from_slice(&[0x00; 64]);
        assert_eq!(
            decode_magic_payload(&packet).as_deref(),
            Some("52:54:00:12:34:56")
        );
    }

    #[test]
    fn rejects_bad_sync_stream() {
        let mut packet = build_magic_packet(&SAMPLE_MAC);
        packet[3] = 0xFE;
        assert_eq!(decode_magic_payload(&packet), None);
    }

    #[test]
    fn rejects_mismatched_repetition() {
        for rep in 1..16 {
            let mut packet = build_magic_packet(&SAMPLE_MAC);
            packet[6 + rep * 6 + 2] ^= 0x01;
            assert_eq!(
                decode_magic_payload(&packet),
                None,
                "repetition {rep} mismatch must invalidate the packet"
            );
        }
    }

    #[test]
    fn rejects_empty_and_tiny_payloads() {
        assert_eq!(decode_magic_payload(&[]), None);
        assert_eq!(decode_magic_payload(&[0xFF; 6]), None);
        assert_eq!(decode_magic_payload(&[0xFF; 101]), None);
    }

    #[test]
    fn all_ff_payload_decodes_to_broadcast_mac() {
        // 102 bytes of 0xFF is a valid magic packet for ff:ff:ff:ff:ff:ff.
        let packet = vec![0xFF; MAGIC_PACKET_LEN];
        assert_eq!(
            decode_magic_payload(&packet).as_deref(),
            Some("ff:ff:ff:ff:ff:ff")
        );
    }

    #[test]
    fn round_trips_arbitrary_macs() {
        // decode(build(mac)) == format(mac) for a spread of MAC values.
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        for _ in 0..256 {
            let mut mac = [0u8; 6];
            for byte in &mut mac {
                // xorshift, deterministic across runs
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                *byte = (seed & 0xFF) as u8;
            }
            let packet = build_magic_packet(&mac);
            assert_eq!(decode_magic_payload(&packet), Some(format_mac(&mac)));
        }
    }

    #[test]
    fn broadcast_mac_check() {
        assert!(is_broadcast_mac(&[0xFF; 6]));
        assert!(!is_broadcast_mac(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE]));
        assert!(!is_broadcast_mac(&SAMPLE_MAC));
    }
}
