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

//! Export hwmon, thermal zone, and lm-sensors temperatures as Prometheus metrics.
//!
//! ## Features
//!
//! `temp-exporter` discovers the temperature sensors a Linux kernel exposes under
//! `/sys/class/hwmon` and `/sys/class/thermal`, optionally merges in the output of the
//! lm-sensors `sensors -j` command, and exports them as Prometheus metrics. Sensors are
//! discovered and read each time Prometheus scrapes the exporter. There is no background
//! polling and nothing is stored between scrapes, so sensors that disappear (hot-unplugged
//! drives, for example) stop being exported immediately.
//!
//! The following metrics are exported:
//!
//! * `temp_exporter_temperature_celsius{chip, sensor, label}` - Degrees celsius measured by each sensor.
//! * `temp_exporter_scrape_duration_seconds` - Time spent discovering and reading sensors for the last scrape.
//! * `temp_exporter_discovery_errors_total{source, kind}` - Failures of an entire backend by type.
//!
//! The `temp_exporter` prefix can be changed with the `--namespace` flag.
//!
//! ### Labels
//!
//! * hwmon: `chip` and `sensor` are the contents of the chip's `name` file (or the `hwmonN`
//!   directory name), `label` is the contents of `tempN_label`, falling back to `tempN_type`.
//! * Thermal zones: `chip` is `thermal`, `sensor` is the contents of the zone's `type` file,
//!   and `label` is the zone directory name (e.g. `thermal_zone0`).
//! * `sensors -j`: `chip` is the chip identifier (e.g. `coretemp-isa-0000`), `sensor` is the
//!   section name (e.g. `Core 0`), and `label` is the matching `tempN_label` field, if any.
//!
//! When more than one backend reports the same `chip`, `sensor`, and `label`, the value from
//! `sensors -j` wins, then thermal zones, then hwmon.
//!
//! ## Build
//!
//! `temp-exporter` is a Rust program and must be built from source using a [Rust toolchain](https://rustup.rs/).
//!
//! ```text
//! cargo build --release
//! ```
//!
//! ## Run
//!
//! `temp-exporter` only needs read access to sysfs and doesn't need to run as `root`. The
//! `sensors` command is optional, install `lm-sensors` to use it or disable it with
//! `--no-sensors-cli` to avoid a warning when it isn't available.
//!
//! ```text
//! ./target/release/temp-exporter --bind 0.0.0.0:9102
//! ```
//!
//! ### Prometheus
//!
//! Prometheus metrics are exposed on port `9102` at `/metrics`. Once `temp-exporter`
//! is running, configure scrapes of it by your Prometheus server. Add the host running
//! `temp-exporter` as a target under the Prometheus `scrape_configs` section as described by
//! the example below.
//!
//! ```yaml
//! # Sample config for Prometheus.
//!
//! global:
//!   scrape_interval:     1m
//!   evaluation_interval: 1m
//!   external_labels:
//!       monitor: 'my_prom'
//!
//! scrape_configs:
//!   - job_name: temp_exporter
//!     static_configs:
//!       - targets: ['example:9102']
//! ```
//!

pub mod http;
pub mod metrics;
pub mod sensor;
