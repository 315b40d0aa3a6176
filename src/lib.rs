//! Multi-protocol media relay and recorder
//!
//! Pulls live audio/video from publishers (RTMP/RTMPS, SRT), feeds the
//! decoded elementary streams through a per-path stream fabric, and
//! records them to disk as segmented MPEG-TS. Access is guarded by a
//! pluggable authentication manager.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          streamgate                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌──────────────┐     authorizes      ┌───────────────────┐  │
//! │  │ Auth Manager │◀────────────────────│ protocol frontends│  │
//! │  └──────────────┘                     └───────────────────┘  │
//! │                                                              │
//! │  ┌──────────────┐   units   ┌────────┐   units   ┌────────┐  │
//! │  │ Static Source│──────────▶│ Stream │──────────▶│Recorder│  │
//! │  │ (RTMP / SRT) │           │ fabric │           │ (TS)   │  │
//! │  └──────────────┘           └────────┘           └────────┘  │
//! │         ▲ supervised, cancellable          segments on disk  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod config;
pub mod core;
pub mod logger;
pub mod protocols;
pub mod record;
pub mod source;
pub mod stream;
