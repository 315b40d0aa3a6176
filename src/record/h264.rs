//! H.264 access unit inspection

use bytes::Bytes;

const NALU_TYPE_IDR: u8 = 5;

/// Whether the access unit contains an IDR picture
pub fn idr_present(au: &[Bytes]) -> bool {
    au.iter()
        .any(|nalu| !nalu.is_empty() && nalu[0] & 0x1F == NALU_TYPE_IDR)
}
