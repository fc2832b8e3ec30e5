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

use crate::sensor::core::{
    read_optional_line, sorted_entries, temp_input_index, DirListing, RawSensorDescriptor, SensorError, SensorSource,
    MILLIDEGREES,
};
use std::path::{Path, PathBuf};
use tracing::{event, Level};

pub const DEFAULT_HWMON_PATH: &str = "/sys/class/hwmon";

/// Locate `temp<N>_input` files of every chip under a hwmon style directory.
///
/// Each immediate subdirectory of the base path is a chip. The chip is named by
/// the contents of its `name` file when present, otherwise by the directory name.
/// Values are not read here, only the paths to read them from at scrape time.
#[derive(Debug, Clone)]
pub struct HwmonDiscoverer {
    base: PathBuf,
}

impl HwmonDiscoverer {
    pub fn new<P: Into<PathBuf>>(base: P) -> Self {
        Self { base: base.into() }
    }

    pub fn discover(&self) -> Result<Vec<RawSensorDescriptor>, SensorError> {
        self.discover_with(sorted_entries)
    }

    /// Discover chips using `list_dir` to list both the base path and each chip
    /// directory. A chip whose listing fails contributes nothing.
    pub(crate) fn discover_with<F>(&self, list_dir: F) -> Result<Vec<RawSensorDescriptor>, SensorError>
    where
        F: Fn(&Path) -> DirListing,
    {
        let mut sensors = Vec::new();

        for (dir_name, chip_dir) in list_dir(&self.base)? {
            if !chip_dir.is_dir() {
                continue;
            }

            let chip = read_optional_line(&chip_dir.join("name")).unwrap_or(dir_name);
            match list_dir(&chip_dir) {
                Ok(entries) => sensors.extend(Self::chip_sensors(&chip, &chip_dir, entries)),
                Err(e) => {
                    event!(
                        Level::DEBUG,
                        message = "skipping unreadable hwmon chip",
                        chip = %chip,
                        error = %e,
                    );
                }
            }
        }

        Ok(sensors)
    }

    fn chip_sensors(chip: &str, chip_dir: &Path, entries: Vec<(String, PathBuf)>) -> Vec<RawSensorDescriptor> {
        let mut sensors = Vec::new();

        for (file_name, path) in entries {
            let index = match temp_input_index(&file_name) {
                Some(i) => i,
                None => continue,
            };

            sensors.push(RawSensorDescriptor {
                source: SensorSource::Hwmon,
                chip: chip.to_owned(),
                // The chip name doubles as the sensor name, the input path is what
                // tells multiple inputs of the same chip apart.
                sensor_name: chip.to_owned(),
                label: Self::resolve_label(chip_dir, index),
                source_path: path,
                scale_factor: MILLIDEGREES,
            });
        }

        sensors
    }

    /// Label from `temp<N>_label`, falling back to `temp<N>_type` (e.g. `Tctl` or `Tdie`),
    /// or an empty string if neither is usable.
    fn resolve_label(chip_dir: &Path, index: &str) -> String {
        read_optional_line(&chip_dir.join(format!("temp{}_label", index)))
            .or_else(|| read_optional_line(&chip_dir.join(format!("temp{}_type", index))))
            .unwrap_or_default()
    }
}

impl Default for HwmonDiscoverer {
    fn default() -> Self {
        Self::new(DEFAULT_HWMON_PATH)
    }
}
