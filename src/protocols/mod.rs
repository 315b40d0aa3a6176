//! Wire-protocol adapters
//!
//! Thin layers over the protocol libraries (and the in-tree MPEG-TS
//! codec) that expose exactly what the sources and the recorder need.

pub mod flv;
pub mod mpegts;
pub mod rtmp;
pub mod tls;
