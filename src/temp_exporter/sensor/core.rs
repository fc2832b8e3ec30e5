// Temp Exporter - Temperature metrics exporter for Prometheus
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use std::error::Error;
use std::fmt::{self, Formatter};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Multiplier converting the millidegree values exposed by hwmon and thermal
/// zones into degrees celsius.
pub const MILLIDEGREES: f64 = 0.001;

/// Most bytes the line reader will consume from a single pseudo-file.
pub(crate) const MAX_LINE_BYTES: u64 = 256;

/// Temperature, in degrees celsius
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(transparent)]
pub struct TemperatureCelsius(f64);

impl From<TemperatureCelsius> for f64 {
    fn from(v: TemperatureCelsius) -> Self {
        v.0
    }
}

impl From<f64> for TemperatureCelsius {
    fn from(v: f64) -> Self {
        Self(v)
    }
}

impl fmt::Display for TemperatureCelsius {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}c", self.0)
    }
}

/// Backend a temperature reading was discovered by.
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum SensorSource {
    Hwmon,
    ThermalZone,
    CliBackend,
}

impl SensorSource {
    pub fn as_label(&self) -> &'static str {
        match self {
            SensorSource::Hwmon => "hwmon",
            SensorSource::ThermalZone => "thermal",
            SensorSource::CliBackend => "sensors_cli",
        }
    }
}

impl fmt::Display for SensorSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.as_label().fmt(f)
    }
}

/// Potential kinds of errors that can be encountered discovering or reading sensors
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum SensorErrorKind {
    NotFound,
    PermissionDenied,
    Empty,
    Malformed,
    Timeout,
    BackendUnavailable,
    Io,
}

impl SensorErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            SensorErrorKind::NotFound => "not_found",
            SensorErrorKind::PermissionDenied => "permission_denied",
            SensorErrorKind::Empty => "empty",
            SensorErrorKind::Malformed => "malformed",
            SensorErrorKind::Timeout => "timeout",
            SensorErrorKind::BackendUnavailable => "backend_unavailable",
            SensorErrorKind::Io => "io",
        }
    }
}

impl From<io::ErrorKind> for SensorErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => SensorErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => SensorErrorKind::PermissionDenied,
            _ => SensorErrorKind::Io,
        }
    }
}

/// Error discovering sensors or reading a value from one of them
#[derive(Debug)]
pub enum SensorError {
    KindMsg(SensorErrorKind, &'static str),
    KindMsgCause(SensorErrorKind, &'static str, Box<dyn Error + Send + Sync>),
    Io(SensorErrorKind, PathBuf, io::Error),
}

impl SensorError {
    /// Wrap an I/O error for the given path, deriving the kind from the I/O error.
    pub(crate) fn from_io(path: &Path, e: io::Error) -> Self {
        SensorError::Io(e.kind().into(), path.to_path_buf(), e)
    }

    pub fn kind(&self) -> SensorErrorKind {
        match self {
            SensorError::KindMsg(kind, _) => *kind,
            SensorError::KindMsgCause(kind, _, _) => *kind,
            SensorError::Io(kind, _, _) => *kind,
        }
    }
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SensorError::KindMsg(_, msg) => msg.fmt(f),
            SensorError::KindMsgCause(_, msg, ref e) => write!(f, "{}: {}", msg, e),
            SensorError::Io(_, path, ref e) => write!(f, "{}: {}", path.display(), e),
        }
    }
}

impl Error for SensorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SensorError::KindMsgCause(_, _, ref e) => Some(e.as_ref()),
            SensorError::Io(_, _, ref e) => Some(e),
            _ => None,
        }
    }
}

/// Read the first line of a small pseudo-file, trimmed of surrounding whitespace.
///
/// At most `MAX_LINE_BYTES` are read since some sysfs attributes behave like
/// streams. An error with kind `Empty` is returned when the file has no content
/// at all and `Malformed` when the line isn't valid UTF-8.
pub fn read_first_line<P: AsRef<Path>>(path: P) -> Result<String, SensorError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| SensorError::from_io(path, e))?;

    let mut buf = Vec::with_capacity(MAX_LINE_BYTES as usize);
    file.take(MAX_LINE_BYTES)
        .read_to_end(&mut buf)
        .map_err(|e| SensorError::from_io(path, e))?;

    if buf.is_empty() {
        return Err(SensorError::KindMsg(SensorErrorKind::Empty, "no line before end of file"));
    }

    let line = match buf.iter().position(|&b| b == b'\n') {
        Some(end) => &buf[..end],
        None => &buf[..],
    };

    std::str::from_utf8(line)
        .map(|s| s.trim().to_owned())
        .map_err(|e| SensorError::KindMsgCause(SensorErrorKind::Malformed, "line is not valid UTF-8", Box::new(e)))
}

/// Entries of a directory as `(file name, path)` pairs.
pub(crate) type DirListing = Result<Vec<(String, PathBuf)>, SensorError>;

/// List the entries of a directory sorted by file name.
///
/// A base directory that doesn't exist is reported as `BackendUnavailable` since
/// it means the kernel doesn't expose this kind of sensor at all.
pub(crate) fn sorted_entries(dir: &Path) -> DirListing {
    let entries = fs::read_dir(dir).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => SensorError::KindMsgCause(
            SensorErrorKind::BackendUnavailable,
            "sensor base directory does not exist",
            Box::new(e),
        ),
        _ => SensorError::from_io(dir, e),
    })?;

    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| SensorError::from_io(dir, e))?;
        out.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
    }

    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// Read the first line of a file, treating any error or blank content as absent.
pub(crate) fn read_optional_line(path: &Path) -> Option<String> {
    read_first_line(path).ok().filter(|s| !s.is_empty())
}

/// Return the index `N` if `name` is of the form `temp<N>_input` where `N` is one
/// or more ASCII digits.
pub fn temp_input_index(name: &str) -> Option<&str> {
    let index = name.strip_prefix("temp")?.strip_suffix("_input")?;
    if !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) {
        Some(index)
    } else {
        None
    }
}

/// A temperature input located during discovery that hasn't been read yet.
#[derive(Clone, Debug, PartialEq)]
pub struct RawSensorDescriptor {
    pub source: SensorSource,
    pub chip: String,
    pub sensor_name: String,
    pub label: String,
    pub source_path: PathBuf,
    pub scale_factor: f64,
}

impl RawSensorDescriptor {
    /// Read the raw value from `source_path` and convert it to degrees celsius.
    pub fn read(&self) -> Result<TemperatureCelsius, SensorError> {
        let raw = read_first_line(&self.source_path)?;
        normalize(&raw, self.scale_factor)
    }
}

/// Parse a raw numeric reading and scale it to degrees celsius.
pub fn normalize(raw: &str, scale_factor: f64) -> Result<TemperatureCelsius, SensorError> {
    let value = raw
        .trim()
        .parse::<f64>()
        .map_err(|e| SensorError::KindMsgCause(SensorErrorKind::Malformed, "raw value is not numeric", Box::new(e)))?;

    if !value.is_finite() {
        return Err(SensorError::KindMsg(
            SensorErrorKind::Malformed,
            "raw value is not a finite number",
        ));
    }

    Ok(TemperatureCelsius::from(value * scale_factor))
}

/// A reading reported by the sensors command, already in degrees celsius.
#[derive(Clone, Debug, PartialEq)]
pub struct CliReading {
    pub chip: String,
    pub section_name: String,
    pub label: String,
    pub value: TemperatureCelsius,
}
