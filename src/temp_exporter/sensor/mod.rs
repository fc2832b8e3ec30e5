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

mod cli;
mod core;
mod hwmon;
mod thermal;

pub use crate::sensor::cli::{parse_report, SensorsCli, DEFAULT_SENSORS_PATH, DEFAULT_SENSORS_TIMEOUT};
pub use crate::sensor::core::{
    normalize, read_first_line, temp_input_index, CliReading, RawSensorDescriptor, SensorError, SensorErrorKind,
    SensorSource, TemperatureCelsius, MILLIDEGREES,
};
pub use crate::sensor::hwmon::{HwmonDiscoverer, DEFAULT_HWMON_PATH};
pub use crate::sensor::thermal::{ThermalZoneDiscoverer, DEFAULT_THERMAL_PATH, THERMAL_CHIP};
