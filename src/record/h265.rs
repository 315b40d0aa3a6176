//! H.265 access unit inspection

use bytes::Bytes;

// IRAP NAL unit types: BLA_W_LP (16) through RSV_IRAP_VCL23 (23)
const NALU_TYPE_IRAP_FIRST: u8 = 16;
const NALU_TYPE_IRAP_LAST: u8 = 23;

/// Whether the access unit is a random access point
pub fn is_random_access(au: &[Bytes]) -> bool {
    au.iter().any(|nalu| {
        if nalu.is_empty() {
            return false;
        }
        let nalu_type = (nalu[0] >> 1) & 0x3F;
        (NALU_TYPE_IRAP_FIRST..=NALU_TYPE_IRAP_LAST).contains(&nalu_type)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_random_access() {
        // IDR_W_RADL has NAL type 19: (19 << 1) = 0x26
        let au = vec![Bytes::from_static(&[0x26, 0x01])];
        assert!(is_random_access(&au));

        // CRA_NUT has NAL type 21: (21 << 1) = 0x2A
        let au = vec![Bytes::from_static(&[0x2A, 0x01])];
        assert!(is_random_access(&au));

        // TRAIL_R has NAL type 1: (1 << 1) = 0x02
        let au = vec![Bytes::from_static(&[0x02, 0x01])];
        assert!(!is_random_access(&au));

        assert!(!is_random_access(&[]));
    }
}
