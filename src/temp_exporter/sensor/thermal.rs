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
    read_optional_line, sorted_entries, RawSensorDescriptor, SensorError, SensorSource, MILLIDEGREES,
};
use std::path::PathBuf;

pub const DEFAULT_THERMAL_PATH: &str = "/sys/class/thermal";

/// Chip label used for every thermal zone reading.
pub const THERMAL_CHIP: &str = "thermal";

const ZONE_PREFIX: &str = "thermal_zone";

/// Locate the `temp` file of each `thermal_zone*` directory under a thermal style
/// directory. Zones without a `temp` file (cooling devices only, for example) are
/// skipped.
#[derive(Debug, Clone)]
pub struct ThermalZoneDiscoverer {
    base: PathBuf,
}

impl ThermalZoneDiscoverer {
    pub fn new<P: Into<PathBuf>>(base: P) -> Self {
        Self { base: base.into() }
    }

    pub fn discover(&self) -> Result<Vec<RawSensorDescriptor>, SensorError> {
        let mut sensors = Vec::new();

        for (zone_name, zone_dir) in sorted_entries(&self.base)? {
            if !zone_name.starts_with(ZONE_PREFIX) || !zone_dir.is_dir() {
                continue;
            }

            let temp = zone_dir.join("temp");
            if !temp.exists() {
                continue;
            }

            sensors.push(RawSensorDescriptor {
                source: SensorSource::ThermalZone,
                chip: THERMAL_CHIP.to_owned(),
                sensor_name: read_optional_line(&zone_dir.join("type")).unwrap_or_default(),
                // Zone types like "acpitz" repeat, the directory name keeps series distinct
                label: zone_name,
                source_path: temp,
                scale_factor: MILLIDEGREES,
            });
        }

        Ok(sensors)
    }
}

impl Default for ThermalZoneDiscoverer {
    fn default() -> Self {
        Self::new(DEFAULT_THERMAL_PATH)
    }
}
