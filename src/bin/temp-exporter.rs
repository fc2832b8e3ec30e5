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

use clap::{crate_version, Parser};
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{io, process};
use temp_exporter::http::{http_route, RequestContext};
use temp_exporter::metrics::{
    CollectorConfig, MetricsExposition, TemperatureMetrics, DEFAULT_NAMESPACE, DEFAULT_SCRAPE_TIMEOUT,
};
use temp_exporter::sensor::{
    HwmonDiscoverer, SensorsCli, ThermalZoneDiscoverer, DEFAULT_HWMON_PATH, DEFAULT_SENSORS_PATH,
    DEFAULT_SENSORS_TIMEOUT, DEFAULT_THERMAL_PATH,
};
use tokio::signal::unix::{self, SignalKind};
use tracing::{event, span, Instrument, Level};

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 9102);
const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Expose hwmon, thermal zone, and lm-sensors temperatures as Prometheus metrics
///
/// Discover temperature sensors exposed by the kernel under /sys/class/hwmon and
/// /sys/class/thermal, and optionally reported by the lm-sensors `sensors -j` command,
/// each time metrics are scraped. Readings are converted to degrees celsius and exposed
/// as a single gauge labeled by chip, sensor, and label.
#[derive(Debug, Parser)]
#[clap(name = "temp-exporter", version = crate_version!())]
struct TempExporterApplication {
    /// Base directory of hwmon chips
    #[clap(long, default_value = DEFAULT_HWMON_PATH)]
    hwmon_path: PathBuf,

    /// Base directory of thermal zones
    #[clap(long, default_value = DEFAULT_THERMAL_PATH)]
    thermal_path: PathBuf,

    /// Don't read sensors from hwmon
    #[clap(long)]
    no_hwmon: bool,

    /// Don't read sensors from thermal zones
    #[clap(long)]
    no_thermal: bool,

    /// Don't read sensors using the lm-sensors `sensors` command
    #[clap(long)]
    no_sensors_cli: bool,

    /// Path to the lm-sensors `sensors` command
    #[clap(long, default_value = DEFAULT_SENSORS_PATH)]
    sensors_cli_path: String,

    /// Kill the `sensors` command if it hasn't finished after this many milliseconds
    #[clap(long, default_value_t = DEFAULT_SENSORS_TIMEOUT.as_millis() as u64)]
    sensors_timeout_millis: u64,

    /// Prefix for the names of all exported metrics
    #[clap(long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// HTTP path to expose metrics at
    #[clap(long, default_value = DEFAULT_METRICS_PATH)]
    metrics_path: String,

    /// Fail a request for metrics if reading sensors takes longer than this many seconds
    #[clap(long, default_value_t = DEFAULT_SCRAPE_TIMEOUT.as_secs())]
    scrape_timeout_secs: u64,

    /// Log the method, path, status, and duration of each HTTP request
    #[clap(long)]
    log_requests: bool,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Address to bind to. By default, temp-exporter will bind to public address since
    /// the purpose is to expose metrics to an external system (Prometheus or another
    /// agent for ingestion)
    #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,
}

impl TempExporterApplication {
    fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            namespace: self.namespace.clone(),
            hwmon: (!self.no_hwmon).then(|| HwmonDiscoverer::new(self.hwmon_path.clone())),
            thermal: (!self.no_thermal).then(|| ThermalZoneDiscoverer::new(self.thermal_path.clone())),
            sensors_cli: (!self.no_sensors_cli).then(|| {
                SensorsCli::new(
                    self.sensors_cli_path.clone(),
                    Duration::from_millis(self.sensors_timeout_millis),
                )
            }),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let opts = TempExporterApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let startup = Instant::now();
    let metrics = TemperatureMetrics::new(opts.collector_config()).unwrap_or_else(|e| {
        event!(
            Level::ERROR,
            message = "failed to create sensor metric collector",
            namespace = %opts.namespace,
            error = %e,
        );

        process::exit(1)
    });

    let reg = prometheus::default_registry().clone();
    reg.register(Box::new(metrics)).unwrap_or_else(|e| {
        event!(
            Level::ERROR,
            message = "failed to register sensor metric collector",
            error = %e,
        );

        process::exit(1)
    });

    let exposition = MetricsExposition::new(reg, Duration::from_secs(opts.scrape_timeout_secs));
    let context = Arc::new(RequestContext::new(exposition, opts.metrics_path.clone(), opts.log_requests));
    let service = make_service_fn(move |_| {
        let context = context.clone();

        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                http_route(req, context.clone()).instrument(span!(Level::DEBUG, "temp_exporter_request"))
            }))
        }
    });
    let server = Server::try_bind(&opts.bind).unwrap_or_else(|e| {
        event!(
            Level::ERROR,
            message = "server failed to start",
            address = %opts.bind,
            error = %e,
        );

        process::exit(1);
    });

    event!(
        Level::INFO,
        message = "server started",
        version = crate_version!(),
        address = %opts.bind,
        metrics_path = %opts.metrics_path,
        hwmon = !opts.no_hwmon,
        thermal = !opts.no_thermal,
        sensors_cli = !opts.no_sensors_cli,
    );

    server
        .serve(service)
        .with_graceful_shutdown(async {
            // Wait for either SIGTERM or SIGINT to shutdown
            tokio::select! {
                _ = sigterm() => {}
                _ = sigint() => {}
            }
        })
        .await?;

    event!(
        Level::INFO,
        message = "server shutdown",
        runtime_secs = %startup.elapsed().as_secs(),
    );

    Ok(())
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}
