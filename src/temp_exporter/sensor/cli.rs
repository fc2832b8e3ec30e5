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

use crate::sensor::core::{temp_input_index, CliReading, SensorError, SensorErrorKind, TemperatureCelsius};
use serde_json::{Map, Value};
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{event, Level};

pub const DEFAULT_SENSORS_PATH: &str = "sensors";
pub const DEFAULT_SENSORS_TIMEOUT: Duration = Duration::from_secs(2);

const JSON_FLAG: &str = "-j";
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Read temperatures from the JSON report of the lm-sensors `sensors` command.
///
/// The report is a mapping of chip to section to fields. Every `temp<N>_input` field
/// with a numeric value becomes a reading, labeled by a sibling `temp<N>_label` string
/// field when there is one. Values are already in degrees celsius.
#[derive(Debug, Clone)]
pub struct SensorsCli {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl SensorsCli {
    pub fn new<S: Into<String>>(program: S, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: vec![JSON_FLAG.to_owned()],
            timeout,
        }
    }

    /// Run an arbitrary program and arguments in place of `sensors -j`.
    #[cfg(test)]
    pub(crate) fn with_args(program: &str, args: &[&str], timeout: Duration) -> Self {
        Self {
            program: program.to_owned(),
            args: args.iter().map(|s| s.to_string()).collect(),
            timeout,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the command and parse its report. Any failure to run the command, a
    /// non-zero exit, a timeout, or output that isn't a JSON object fails the whole
    /// call. Unexpected shapes within the report are skipped.
    pub fn discover(&self) -> Result<Vec<CliReading>, SensorError> {
        let output = self.run()?;
        let readings = parse_report(&output)?;

        event!(
            Level::DEBUG,
            message = "parsed sensors command report",
            program = %self.program,
            num_readings = readings.len(),
        );

        Ok(readings)
    }

    fn run(&self) -> Result<Vec<u8>, SensorError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SensorError::from_io(Path::new(&self.program), e))?;

        let mut stdout = child.stdout.take().ok_or(SensorError::KindMsg(
            SensorErrorKind::Io,
            "unable to capture sensors command output",
        ))?;

        // Drain output while waiting so a large report can't block the command on a full pipe.
        // Output arrives over a channel since anything the command left running in the
        // background can hold the pipe open after the command itself exits.
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = tx.send(stdout.read_to_end(&mut buf).map(|_| buf));
        });

        let start = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if start.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(SensorError::KindMsg(
                        SensorErrorKind::Timeout,
                        "sensors command did not finish before timeout",
                    ));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(SensorError::from_io(Path::new(&self.program), e)),
            }
        };

        if !status.success() {
            return Err(SensorError::KindMsgCause(
                SensorErrorKind::BackendUnavailable,
                "sensors command failed",
                format!("{}", status).into(),
            ));
        }

        match rx.recv_timeout(self.timeout.saturating_sub(start.elapsed())) {
            Ok(res) => res.map_err(|e| SensorError::from_io(Path::new(&self.program), e)),
            Err(RecvTimeoutError::Timeout) => Err(SensorError::KindMsg(
                SensorErrorKind::Timeout,
                "sensors command output not finished before timeout",
            )),
            Err(RecvTimeoutError::Disconnected) => Err(SensorError::KindMsg(
                SensorErrorKind::Io,
                "sensors output reader stopped without a result",
            )),
        }
    }
}

impl Default for SensorsCli {
    fn default() -> Self {
        Self::new(DEFAULT_SENSORS_PATH, DEFAULT_SENSORS_TIMEOUT)
    }
}

/// Parse a `sensors -j` report into readings.
pub fn parse_report(output: &[u8]) -> Result<Vec<CliReading>, SensorError> {
    let root: Value = serde_json::from_slice(output).map_err(|e| {
        SensorError::KindMsgCause(
            SensorErrorKind::Malformed,
            "unable to decode sensors command output",
            Box::new(e),
        )
    })?;

    let chips = root.as_object().ok_or(SensorError::KindMsg(
        SensorErrorKind::Malformed,
        "sensors command output is not a JSON object",
    ))?;

    let mut readings = Vec::new();
    for (chip, sections) in chips {
        // Chips also carry plain string fields such as "Adapter"
        let sections = match sections.as_object() {
            Some(s) => s,
            None => continue,
        };

        for (section, fields) in sections {
            if let Some(fields) = fields.as_object() {
                readings.extend(section_readings(chip, section, fields));
            }
        }
    }

    Ok(readings)
}

fn section_readings<'a>(
    chip: &'a str,
    section: &'a str,
    fields: &'a Map<String, Value>,
) -> impl Iterator<Item = CliReading> + 'a {
    fields.iter().filter_map(move |(name, value)| {
        let index = temp_input_index(name)?;
        let celsius = value.as_f64()?;
        let label = fields
            .get(&format!("temp{}_label", index))
            .and_then(Value::as_str)
            .unwrap_or_default();

        Some(CliReading {
            chip: chip.to_owned(),
            section_name: section.to_owned(),
            label: label.to_owned(),
            value: TemperatureCelsius::from(celsius),
        })
    })
}
