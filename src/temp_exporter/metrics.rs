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

use crate::sensor::{
    HwmonDiscoverer, RawSensorDescriptor, SensorError, SensorSource, SensorsCli, TemperatureCelsius,
    ThermalZoneDiscoverer,
};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, Gauge, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::collections::btree_map::{self, BTreeMap};
use std::error::Error;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task;
use tracing::{event, span, Instrument, Level};

pub const DEFAULT_NAMESPACE: &str = "temp_exporter";
pub const DEFAULT_SCRAPE_TIMEOUT: Duration = Duration::from_secs(10);

/// Which backends to read sensors from and how to name the exported metrics.
///
/// A backend set to `None` is disabled.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub namespace: String,
    pub hwmon: Option<HwmonDiscoverer>,
    pub thermal: Option<ThermalZoneDiscoverer>,
    pub sensors_cli: Option<SensorsCli>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_owned(),
            hwmon: Some(HwmonDiscoverer::default()),
            thermal: Some(ThermalZoneDiscoverer::default()),
            sensors_cli: Some(SensorsCli::default()),
        }
    }
}

/// Identity of a single temperature time series.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReadingKey {
    pub chip: String,
    pub sensor: String,
    pub label: String,
}

impl ReadingKey {
    pub fn new<C, S, L>(chip: C, sensor: S, label: L) -> Self
    where
        C: Into<String>,
        S: Into<String>,
        L: Into<String>,
    {
        Self {
            chip: chip.into(),
            sensor: sensor.into(),
            label: label.into(),
        }
    }
}

/// Temperature for each distinct series seen during a single scrape. Inserting
/// a key that is already present replaces the previous value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GaugeSet {
    values: BTreeMap<ReadingKey, f64>,
}

impl GaugeSet {
    pub fn upsert(&mut self, key: ReadingKey, temp: TemperatureCelsius) {
        self.values.insert(key, temp.into());
    }

    pub fn get(&self, key: &ReadingKey) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, ReadingKey, f64> {
        self.values.iter()
    }
}

/// Result of one complete discovery and read cycle.
#[derive(Debug, Clone)]
pub struct Scrape {
    pub readings: GaugeSet,
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct ScrapeState {
    cli_warned: bool,
}

/// Prometheus Collector implementation that discovers and reads temperature sensors
/// each time it is collected. Temperatures from hwmon, thermal zones, and the
/// `sensors` command are merged into a single gauge labeled by chip, sensor, and label.
///
/// Scrapes are serialized by a mutex and the gauge is only reset and repopulated
/// while that mutex is held, so a collection never sees a partially built set.
pub struct TemperatureMetrics {
    hwmon: Option<HwmonDiscoverer>,
    thermal: Option<ThermalZoneDiscoverer>,
    sensors_cli: Option<SensorsCli>,
    state: Mutex<ScrapeState>,
    temperature: GaugeVec,
    scrape_duration: Gauge,
    errors: IntCounterVec,
}

impl TemperatureMetrics {
    pub fn new(config: CollectorConfig) -> Result<Self, prometheus::Error> {
        let temperature = GaugeVec::new(
            Opts::new("temperature_celsius", "Temperature in celsius read from system sensors")
                .namespace(config.namespace.clone()),
            &["chip", "sensor", "label"],
        )?;

        let scrape_duration = Gauge::with_opts(
            Opts::new("scrape_duration_seconds", "Duration of the last temperature collection")
                .namespace(config.namespace.clone()),
        )?;

        let errors = IntCounterVec::new(
            Opts::new("discovery_errors_total", "Number of failed sensor backend reads by type")
                .namespace(config.namespace),
            &["source", "kind"],
        )?;

        Ok(Self {
            hwmon: config.hwmon,
            thermal: config.thermal,
            sensors_cli: config.sensors_cli,
            state: Mutex::new(ScrapeState::default()),
            temperature,
            scrape_duration,
            errors,
        })
    }

    /// Discover and read every sensor of the enabled backends, replacing the exported
    /// gauge values with the result. Failures only reduce the number of readings.
    pub fn scrape(&self) -> Scrape {
        let mut state = self.lock_state();
        self.scrape_locked(&mut state)
    }

    fn lock_state(&self) -> MutexGuard<'_, ScrapeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scrape_locked(&self, state: &mut ScrapeState) -> Scrape {
        let start = Instant::now();
        let mut descriptors = Vec::new();

        if let Some(hwmon) = &self.hwmon {
            match hwmon.discover() {
                Ok(found) => descriptors.extend(found),
                Err(e) => self.discovery_failed(SensorSource::Hwmon, &e),
            }
        }

        if let Some(thermal) = &self.thermal {
            match thermal.discover() {
                Ok(found) => descriptors.extend(found),
                Err(e) => self.discovery_failed(SensorSource::ThermalZone, &e),
            }
        }

        let mut readings = GaugeSet::default();
        for descriptor in descriptors {
            Self::read_descriptor(&mut readings, descriptor);
        }

        if let Some(cli) = &self.sensors_cli {
            match cli.discover() {
                Ok(found) => {
                    for r in found {
                        readings.upsert(ReadingKey::new(r.chip, r.section_name, r.label), r.value);
                    }
                }
                Err(e) => self.sensors_cli_failed(state, cli, &e),
            }
        }

        let scrape = Scrape {
            readings,
            duration: start.elapsed(),
        };
        self.publish(&scrape);

        event!(
            Level::DEBUG,
            message = "collected temperature readings",
            num_readings = scrape.readings.len(),
            duration_secs = scrape.duration.as_secs_f64(),
        );

        scrape
    }

    fn read_descriptor(readings: &mut GaugeSet, descriptor: RawSensorDescriptor) {
        match descriptor.read() {
            Ok(temp) => {
                let key = ReadingKey::new(descriptor.chip, descriptor.sensor_name, descriptor.label);
                readings.upsert(key, temp);
            }
            Err(e) => {
                // Sensors come and go with hot-plug and driver state, skip quietly
                event!(
                    Level::TRACE,
                    message = "skipping unreadable sensor",
                    path = %descriptor.source_path.display(),
                    error = %e,
                );
            }
        }
    }

    fn discovery_failed(&self, source: SensorSource, e: &SensorError) {
        self.errors
            .with_label_values(&[source.as_label(), e.kind().as_label()])
            .inc();

        event!(
            Level::WARN,
            message = "unable to discover sensors",
            source = %source,
            error = %e,
        );
    }

    fn sensors_cli_failed(&self, state: &mut ScrapeState, cli: &SensorsCli, e: &SensorError) {
        self.errors
            .with_label_values(&[SensorSource::CliBackend.as_label(), e.kind().as_label()])
            .inc();

        if state.cli_warned {
            event!(
                Level::DEBUG,
                message = "unable to read sensors command",
                program = %cli.program(),
                error = %e,
            );
        } else {
            state.cli_warned = true;
            event!(
                Level::WARN,
                message = "unable to read sensors command, disable it or install lm-sensors (further failures logged at debug)",
                program = %cli.program(),
                timeout_ms = cli.timeout().as_millis() as u64,
                error = %e,
            );
        }
    }

    fn publish(&self, scrape: &Scrape) {
        self.temperature.reset();
        for (key, celsius) in scrape.readings.iter() {
            self.temperature
                .with_label_values(&[key.chip.as_str(), key.sensor.as_str(), key.label.as_str()])
                .set(*celsius);
        }

        self.scrape_duration.set(scrape.duration.as_secs_f64());
    }

    #[cfg(test)]
    fn cli_warned(&self) -> bool {
        self.lock_state().cli_warned
    }
}

impl Collector for TemperatureMetrics {
    fn desc(&self) -> Vec<&Desc> {
        let mut descs = Vec::new();
        descs.extend(self.temperature.desc());
        descs.extend(self.scrape_duration.desc());
        descs.extend(self.errors.desc());
        descs
    }

    fn collect(&self) -> Vec<MetricFamily> {
        // Hold the lock until the gauges are collected so that a concurrent scrape
        // can't reset them in between.
        let mut state = self.lock_state();
        self.scrape_locked(&mut state);

        let mut mfs = Vec::new();
        mfs.extend(self.temperature.collect());
        mfs.extend(self.scrape_duration.collect());
        mfs.extend(self.errors.collect());
        mfs
    }
}

/// Error exposing Prometheus metrics in the text exposition format.
#[derive(Debug)]
pub enum ExpositionError {
    Runtime(&'static str, Box<dyn Error + Send + Sync + 'static>),
    Encoding(&'static str, Box<dyn Error + Send + Sync + 'static>),
    Timeout(&'static str, Duration),
}

impl fmt::Display for ExpositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpositionError::Runtime(msg, ref e) => write!(f, "{}: {}", msg, e),
            ExpositionError::Encoding(msg, ref e) => write!(f, "{}: {}", msg, e),
            ExpositionError::Timeout(msg, timeout) => write!(f, "{} after {:?}", msg, timeout),
        }
    }
}

impl Error for ExpositionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ExpositionError::Runtime(_, ref e) => Some(e.as_ref()),
            ExpositionError::Encoding(_, ref e) => Some(e.as_ref()),
            ExpositionError::Timeout(_, _) => None,
        }
    }
}

/// Wrapper that exposes metrics from a Prometheus registry in the text exposition format.
///
/// This wrapper gathers all metrics from the registry in a separate thread, managed by the
/// tokio runtime in order to avoid blocking the future it is called from.
#[derive(Debug)]
pub struct MetricsExposition {
    registry: Registry,
    timeout: Duration,
}

impl MetricsExposition {
    pub fn new(registry: Registry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// Collect all metrics from the registry and encode them in the Prometheus text exposition
    /// format, returning an error if metrics couldn't be collected or encoded in time.
    pub async fn encoded_text(&self) -> Result<Vec<u8>, ExpositionError> {
        let registry = self.registry.clone();

        // Registry::gather() calls the collect() method of each registered collector. Our
        // collector walks sysfs and may wait on the sensors command for up to its timeout.
        // Run it in a thread pool to avoid blocking the future serving the HTTP request.
        let gather = task::spawn_blocking(move || {
            let metric_families = registry.gather();
            let mut buffer = Vec::new();
            let encoder = TextEncoder::new();

            event!(
                Level::DEBUG,
                message = "encoding metric families to text exposition format",
                num_metrics = metric_families.len(),
            );

            encoder
                .encode(&metric_families, &mut buffer)
                .map_err(|e| ExpositionError::Encoding("unable to encode Prometheus metrics", Box::new(e)))
                .map(|_| buffer)
        })
        .instrument(span!(Level::DEBUG, "temp_exporter_gather"));

        tokio::time::timeout(self.timeout, gather)
            .await
            .map_err(|_| ExpositionError::Timeout("timed out gathering Prometheus metrics", self.timeout))?
            .map_err(|e| ExpositionError::Runtime("unable to gather Prometheus metrics", Box::new(e)))?
    }
}

#[cfg(test)]
mod test {
    use super::{CollectorConfig, MetricsExposition, ReadingKey, TemperatureMetrics, DEFAULT_NAMESPACE};
    use crate::sensor::test::{echo_script, write, SysfsTree};
    use crate::sensor::{HwmonDiscoverer, SensorsCli, ThermalZoneDiscoverer, THERMAL_CHIP};
    use prometheus::core::Collector;
    use prometheus::Registry;
    use std::fs;
    use std::time::Duration;

    fn config(tree: &SysfsTree) -> CollectorConfig {
        CollectorConfig {
            namespace: "test".to_owned(),
            hwmon: Some(HwmonDiscoverer::new(tree.hwmon())),
            thermal: Some(ThermalZoneDiscoverer::new(tree.thermal())),
            sensors_cli: None,
        }
    }

    fn cli(json: &str) -> SensorsCli {
        SensorsCli::with_args("sh", &["-c", &echo_script(json)], Duration::from_secs(5))
    }

    fn failing_cli() -> SensorsCli {
        SensorsCli::with_args("sh", &["-c", "exit 1"], Duration::from_secs(5))
    }

    fn errors(metrics: &TemperatureMetrics, source: &str, kind: &str) -> u64 {
        metrics.errors.with_label_values(&[source, kind]).get()
    }

    #[test]
    fn test_default_config() {
        let config = CollectorConfig::default();

        assert_eq!(DEFAULT_NAMESPACE, config.namespace);
        assert!(config.hwmon.is_some());
        assert!(config.thermal.is_some());
        assert!(config.sensors_cli.is_some());
    }

    #[test]
    fn test_scrape_hwmon_and_thermal() {
        let tree = SysfsTree::new();
        let chip = tree.chip("hwmon0", Some("k10temp"));
        write(&chip, "temp1_input", "39625\n");
        write(&chip, "temp1_label", "Tctl\n");
        tree.zone("thermal_zone0", Some("acpitz"), Some("27800"));

        let metrics = TemperatureMetrics::new(config(&tree)).unwrap();
        let scrape = metrics.scrape();

        assert_eq!(2, scrape.readings.len());
        assert_eq!(
            Some(39.625),
            scrape.readings.get(&ReadingKey::new("k10temp", "k10temp", "Tctl"))
        );
        assert_eq!(
            Some(27.8),
            scrape.readings.get(&ReadingKey::new(THERMAL_CHIP, "acpitz", "thermal_zone0"))
        );
    }

    #[test]
    fn test_scrape_skips_unreadable_values() {
        let tree = SysfsTree::new();
        let chip = tree.chip("hwmon0", Some("nct6775"));
        write(&chip, "temp1_input", "N/A\n");
        write(&chip, "temp2_input", "");
        write(&chip, "temp3_input", "35000\n");
        write(&chip, "temp3_label", "SYSTIN\n");

        let metrics = TemperatureMetrics::new(config(&tree)).unwrap();
        let scrape = metrics.scrape();

        assert_eq!(1, scrape.readings.len());
        assert_eq!(
            Some(35.0),
            scrape.readings.get(&ReadingKey::new("nct6775", "nct6775", "SYSTIN"))
        );
    }

    #[test]
    fn test_scrape_cli_reading() {
        let tree = SysfsTree::new();
        let mut config = config(&tree);
        config.sensors_cli = Some(cli(
            r#"{"coretemp-isa-0000":{"Core 0":{"temp2_input": 39.0, "temp2_label":"Core 0"}}}"#,
        ));

        let metrics = TemperatureMetrics::new(config).unwrap();
        let scrape = metrics.scrape();

        assert_eq!(1, scrape.readings.len());
        assert_eq!(
            Some(39.0),
            scrape.readings.get(&ReadingKey::new("coretemp-isa-0000", "Core 0", "Core 0"))
        );
    }

    #[test]
    fn test_scrape_cli_overrides_hwmon() {
        let tree = SysfsTree::new();
        let chip = tree.chip("hwmon0", Some("acpitz"));
        write(&chip, "temp1_input", "40000\n");
        write(&chip, "temp1_label", "zone\n");

        let mut config = config(&tree);
        config.sensors_cli = Some(cli(
            r#"{"acpitz":{"acpitz":{"temp1_input": 52.5, "temp1_label": "zone"}}}"#,
        ));

        let metrics = TemperatureMetrics::new(config).unwrap();
        let scrape = metrics.scrape();

        assert_eq!(1, scrape.readings.len());
        assert_eq!(Some(52.5), scrape.readings.get(&ReadingKey::new("acpitz", "acpitz", "zone")));
    }

    #[test]
    fn test_scrape_thermal_overrides_hwmon() {
        let tree = SysfsTree::new();
        let chip = tree.chip("hwmon0", Some(THERMAL_CHIP));
        write(&chip, "temp1_input", "40000\n");
        write(&chip, "temp1_label", "thermal_zone0\n");
        tree.zone("thermal_zone0", Some(THERMAL_CHIP), Some("27800"));

        let metrics = TemperatureMetrics::new(config(&tree)).unwrap();
        let scrape = metrics.scrape();

        assert_eq!(1, scrape.readings.len());
        assert_eq!(
            Some(27.8),
            scrape
                .readings
                .get(&ReadingKey::new(THERMAL_CHIP, THERMAL_CHIP, "thermal_zone0"))
        );
    }

    #[test]
    fn test_scrape_idempotent() {
        let tree = SysfsTree::new();
        let chip = tree.chip("hwmon0", Some("coretemp"));
        write(&chip, "temp1_input", "41000\n");
        write(&chip, "temp2_input", "43000\n");
        write(&chip, "temp2_label", "Core 1\n");
        tree.zone("thermal_zone0", Some("x86_pkg_temp"), Some("44000"));

        let metrics = TemperatureMetrics::new(config(&tree)).unwrap();
        let first = metrics.scrape();
        let second = metrics.scrape();

        assert_eq!(3, first.readings.len());
        assert_eq!(first.readings, second.readings);
    }

    #[test]
    fn test_scrape_removes_stale_series() {
        let tree = SysfsTree::new();
        let chip = tree.chip("hwmon0", Some("coretemp"));
        write(&chip, "temp1_input", "41000\n");
        write(&chip, "temp1_label", "Core 0\n");
        write(&chip, "temp2_input", "43000\n");
        write(&chip, "temp2_label", "Core 1\n");

        let metrics = TemperatureMetrics::new(config(&tree)).unwrap();
        assert_eq!(2, metrics.scrape().readings.len());

        fs::remove_file(chip.join("temp2_input")).unwrap();
        let scrape = metrics.scrape();

        assert_eq!(1, scrape.readings.len());
        assert_eq!(None, scrape.readings.get(&ReadingKey::new("coretemp", "coretemp", "Core 1")));
        assert_eq!(1, metrics.temperature.collect()[0].get_metric().len());
    }

    #[test]
    fn test_scrape_missing_hwmon_base() {
        let tree = SysfsTree::new();
        tree.zone("thermal_zone0", Some("acpitz"), Some("27800"));
        let mut config = config(&tree);
        config.hwmon = Some(HwmonDiscoverer::new(tree.missing()));

        let metrics = TemperatureMetrics::new(config).unwrap();
        let scrape = metrics.scrape();

        assert_eq!(1, scrape.readings.len());
        assert!(metrics.scrape_duration.get() >= 0.0);
        assert_eq!(1, errors(&metrics, "hwmon", "backend_unavailable"));
    }

    #[test]
    fn test_scrape_nothing_enabled() {
        let metrics = TemperatureMetrics::new(CollectorConfig {
            namespace: "test".to_owned(),
            hwmon: None,
            thermal: None,
            sensors_cli: None,
        })
        .unwrap();

        let scrape = metrics.scrape();

        assert!(scrape.readings.is_empty());
        assert_eq!(scrape.duration.as_secs_f64(), metrics.scrape_duration.get());
    }

    #[test]
    fn test_scrape_cli_failure_warns_once() {
        let tree = SysfsTree::new();
        let chip = tree.chip("hwmon0", Some("k10temp"));
        write(&chip, "temp1_input", "45000\n");
        let mut config = config(&tree);
        config.sensors_cli = Some(failing_cli());

        let metrics = TemperatureMetrics::new(config).unwrap();
        assert!(!metrics.cli_warned());

        assert_eq!(1, metrics.scrape().readings.len());
        assert!(metrics.cli_warned());
        assert_eq!(1, metrics.scrape().readings.len());
        assert!(metrics.cli_warned());
        assert_eq!(2, errors(&metrics, "sensors_cli", "backend_unavailable"));
    }

    #[test]
    fn test_cli_warning_per_instance() {
        let tree = SysfsTree::new();
        let mut config = config(&tree);
        config.sensors_cli = Some(failing_cli());

        let first = TemperatureMetrics::new(config.clone()).unwrap();
        let second = TemperatureMetrics::new(config).unwrap();
        first.scrape();

        assert!(first.cli_warned());
        assert!(!second.cli_warned());
    }

    #[test]
    fn test_collect_metric_families() {
        let tree = SysfsTree::new();
        let chip = tree.chip("hwmon0", Some("k10temp"));
        write(&chip, "temp1_input", "45000\n");
        write(&chip, "temp1_label", "Tctl\n");

        let metrics = TemperatureMetrics::new(config(&tree)).unwrap();
        let mfs = metrics.collect();

        let temperature = mfs
            .iter()
            .find(|mf| mf.get_name() == "test_temperature_celsius")
            .unwrap();
        assert_eq!(1, temperature.get_metric().len());
        assert_eq!(45.0, temperature.get_metric()[0].get_gauge().get_value());
        assert!(mfs.iter().any(|mf| mf.get_name() == "test_scrape_duration_seconds"));
    }

    #[test]
    fn test_invalid_namespace() {
        let mut config = CollectorConfig::default();
        config.namespace = "not a valid namespace".to_owned();

        assert!(TemperatureMetrics::new(config).is_err());
    }

    #[tokio::test]
    async fn test_exposition_encoded_text() {
        let tree = SysfsTree::new();
        tree.zone("thermal_zone0", Some("acpitz"), Some("27800"));

        let registry = Registry::new();
        registry
            .register(Box::new(TemperatureMetrics::new(config(&tree)).unwrap()))
            .unwrap();

        let exposition = MetricsExposition::new(registry, Duration::from_secs(5));
        let text = String::from_utf8(exposition.encoded_text().await.unwrap()).unwrap();

        assert!(text.contains("# TYPE test_temperature_celsius gauge"));
        assert!(text.contains("label=\"thermal_zone0\""));
        assert!(text.contains("test_scrape_duration_seconds"));
    }
}
