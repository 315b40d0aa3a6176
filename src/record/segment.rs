//! On-disk segments
//!
//! A segment is written under a temporary name and atomically renamed on
//! close, so a crash never leaves a half-segment with the final name.
//! Filenames come from a per-path template expanded with the segment's
//! wall-clock start time and sequence number.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Where the sink currently sends bytes
enum SinkTarget {
    /// No segment is active; writing is an error
    Disconnected,

    /// Bytes are dropped; used to drain the buffer above when a segment
    /// is discarded after an I/O error
    Discard,

    File(File),
}

/// The swappable sink at the bottom of the recorder's writer stack
///
/// The buffered writer above it is reused across segments; retargeting
/// the sink is what moves a recording session from one file to the next.
#[derive(Clone)]
pub(crate) struct DynamicSink {
    target: Arc<Mutex<SinkTarget>>,
}

impl DynamicSink {
    pub fn new() -> Self {
        Self {
            target: Arc::new(Mutex::new(SinkTarget::Disconnected)),
        }
    }

    pub fn set_file(&self, file: File) {
        *self.target.lock().unwrap() = SinkTarget::File(file);
    }

    pub fn set_discard(&self) {
        *self.target.lock().unwrap() = SinkTarget::Discard;
    }

    /// Detach and return the current file, leaving the sink disconnected
    pub fn take_file(&self) -> Option<File> {
        let mut target = self.target.lock().unwrap();
        match std::mem::replace(&mut *target, SinkTarget::Disconnected) {
            SinkTarget::File(f) => Some(f),
            _ => None,
        }
    }
}

impl Write for DynamicSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.target.lock().unwrap() {
            SinkTarget::File(f) => f.write(buf),
            SinkTarget::Discard => Ok(buf.len()),
            SinkTarget::Disconnected => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no active segment",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.target.lock().unwrap() {
            SinkTarget::File(f) => f.flush(),
            SinkTarget::Discard => Ok(()),
            SinkTarget::Disconnected => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no active segment",
            )),
        }
    }
}

/// State of the segment currently being written
pub(crate) struct Segment {
    pub final_path: PathBuf,
    pub tmp_path: PathBuf,
    pub start_dts: Duration,
    pub start_ntp: DateTime<Utc>,
    pub last_flush: Duration,
}

impl Segment {
    /// Create the segment file and its parent directories
    pub fn create(
        template: &str,
        path_name: &str,
        start_ntp: DateTime<Utc>,
        start_dts: Duration,
        sequence: u64,
    ) -> io::Result<(Segment, File)> {
        let final_path = expand_path_template(template, path_name, start_ntp, sequence);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut tmp_path = final_path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let file = File::create(&tmp_path)?;
        Ok((
            Segment {
                final_path,
                tmp_path,
                start_dts,
                start_ntp,
                last_flush: start_dts,
            },
            file,
        ))
    }

    /// Atomically promote the temporary file to its final name
    pub fn commit(&self) -> io::Result<()> {
        fs::rename(&self.tmp_path, &self.final_path)
    }

    /// Remove the temporary file after a failure
    pub fn discard(&self) {
        let _ = fs::remove_file(&self.tmp_path);
    }
}

/// Expand a segment filename template
///
/// Placeholders: `%path`, `%Y` `%m` `%d` `%H` `%M` `%S` (start time),
/// `%f` (microseconds), `%s` (sequence number). A `.ts` extension is
/// appended when missing.
pub fn expand_path_template(
    template: &str,
    path_name: &str,
    ntp: DateTime<Utc>,
    sequence: u64,
) -> PathBuf {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;

    while let Some(idx) = rest.find('%') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx + 1..];

        if let Some(stripped) = rest.strip_prefix("path") {
            out.push_str(path_name);
            rest = stripped;
            continue;
        }
        let placeholder = rest.chars().next();
        match placeholder {
            Some('Y') => out.push_str(&format!("{:04}", ntp.year())),
            Some('m') => out.push_str(&format!("{:02}", ntp.month())),
            Some('d') => out.push_str(&format!("{:02}", ntp.day())),
            Some('H') => out.push_str(&format!("{:02}", ntp.hour())),
            Some('M') => out.push_str(&format!("{:02}", ntp.minute())),
            Some('S') => out.push_str(&format!("{:02}", ntp.second())),
            Some('f') => out.push_str(&format!("{:06}", ntp.timestamp_subsec_micros())),
            Some('s') => out.push_str(&sequence.to_string()),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
        if let Some(c) = placeholder {
            rest = &rest[c.len_utf8()..];
        }
    }
    out.push_str(rest);

    if !out.ends_with(".ts") {
        out.push_str(".ts");
    }
    PathBuf::from(out)
}
