//! Text codec for the control channel.
//!
//! The wire contract is asymmetric and inherited from the deployed peers:
//! inbound frames are decoded as Shift-JIS, outbound text is encoded as
//! plain ASCII. The two directions only agree on the ASCII range, and an
//! ASCII payload round-tripping unchanged is the one guarantee the channel
//! makes.

use bytes::Bytes;
use encoding_rs::SHIFT_JIS;

/// Decode an inbound frame as Shift-JIS text.
///
/// Every frame is Shift-JIS, including ones that happen to start with a
/// UTF-8 or UTF-16 byte-order mark, so no BOM sniffing. Malformed
/// sequences become U+FFFD instead of an error, so decoding never fails.
/// Peers that send fixed-size frames pad them with zeroes; trailing NULs
/// are trimmed so such a frame decodes to its content alone. Interior
/// NULs are preserved.
pub fn decode_inbound(frame: &[u8]) -> String {
    let (decoded, _) = SHIFT_JIS.decode_without_bom_handling(frame);
    decoded.trim_end_matches('\0').to_string()
}

/// Encode outbound text as ASCII.
///
/// Characters outside the ASCII range are replaced with `?`, matching what
/// the single-byte peers expect to receive.
pub fn encode_outbound(text: &str) -> Bytes {
    let mut encoded = Vec::with_capacity(text.len());
    for ch in text.chars() {
        encoded.push(if ch.is_ascii() { ch as u8 } else { b'?' });
    }
    Bytes::from(encoded)
}
