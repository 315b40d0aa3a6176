//! DTS derivation for H.26x tracks
//!
//! The extractor is created when the first random-access unit of a track
//! arrives and derives one DTS per access unit afterwards. Streams are
//! expected in decode order equal to presentation order; a PTS regression
//! means reordered pictures, which this recorder does not support, and is
//! reported as an error so the caller can drop the unit and keep going.

use std::time::Duration;

use super::RecorderError;

/// Per-track DTS extractor state
#[derive(Debug, Default)]
pub struct DtsExtractor {
    prev_pts: Option<Duration>,
}

impl DtsExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the DTS of an access unit from its PTS
    pub fn extract(&mut self, pts: Duration) -> Result<Duration, RecorderError> {
        if let Some(prev) = self.prev_pts {
            if pts < prev {
                return Err(RecorderError::Timing(format!(
                    "PTS went backwards ({:?} after {:?}); streams with B-frames are not supported",
                    pts, prev
                )));
            }
        }
        self.prev_pts = Some(pts);
        Ok(pts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_stream() {
        let mut ex = DtsExtractor::new();
        for ms in [0u64, 40, 80, 120] {
            let pts = Duration::from_millis(ms);
            assert_eq!(ex.extract(pts).unwrap(), pts);
        }
    }

    #[test]
    fn test_equal_pts_allowed() {
        let mut ex = DtsExtractor::new();
        let pts = Duration::from_millis(40);
        assert!(ex.extract(pts).is_ok());
        assert!(ex.extract(pts).is_ok());
    }

    #[test]
    fn test_regression_is_error() {
        let mut ex = DtsExtractor::new();
        ex.extract(Duration::from_millis(120)).unwrap();
        let err = ex.extract(Duration::from_millis(80)).unwrap_err();
        assert!(matches!(err, RecorderError::Timing(_)));

        // the extractor keeps working for later units
        assert!(ex.extract(Duration::from_millis(160)).is_ok());
    }
}
