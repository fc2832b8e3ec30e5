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

use crate::metrics::MetricsExposition;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Method, Request, Response, StatusCode};
use prometheus::TEXT_FORMAT;
use std::sync::Arc;
use std::time::Instant;
use tracing::{event, Level};

const PLAIN_TEXT: &str = "text/plain; charset=utf-8";
const HEALTH_PATH: &str = "/healthz";

/// Global state shared between all HTTP requests via Arc.
pub struct RequestContext {
    exposition: MetricsExposition,
    metrics_path: String,
    log_requests: bool,
}

impl RequestContext {
    pub fn new<S: Into<String>>(exposition: MetricsExposition, metrics_path: S, log_requests: bool) -> Self {
        RequestContext {
            exposition,
            metrics_path: metrics_path.into(),
            log_requests,
        }
    }
}

pub async fn http_route(req: Request<Body>, context: Arc<RequestContext>) -> Result<Response<Body>, hyper::Error> {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let res = match (&method, path.as_ref()) {
        (&Method::GET, p) if p == context.metrics_path => match context.exposition.encoded_text().await {
            Ok(buffer) => http_body(StatusCode::OK, TEXT_FORMAT, buffer),
            Err(e) => {
                event!(
                    Level::ERROR,
                    message = "error scraping metrics",
                    error = %e,
                );

                http_status_no_body(StatusCode::INTERNAL_SERVER_ERROR)
            }
        },

        (_, p) if p == context.metrics_path => http_status_no_body(StatusCode::METHOD_NOT_ALLOWED),

        (&Method::GET, HEALTH_PATH) => http_body(StatusCode::OK, PLAIN_TEXT, "ok"),

        (&Method::GET, "/") => http_body(
            StatusCode::OK,
            PLAIN_TEXT,
            format!(
                "Temperature Exporter\nMetrics: {}\nHealth: {}\n",
                context.metrics_path, HEALTH_PATH
            ),
        ),

        _ => http_status_no_body(StatusCode::NOT_FOUND),
    };

    if context.log_requests {
        event!(
            Level::INFO,
            message = "handled request",
            method = %method,
            path = %path,
            status = res.status().as_u16(),
            duration_ms = start.elapsed().as_millis() as u64,
        );
    }

    Ok(res)
}

fn http_body<B: Into<Body>>(code: StatusCode, content_type: &'static str, body: B) -> Response<Body> {
    let mut res = Response::new(body.into());
    *res.status_mut() = code;
    res.headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static(content_type));
    res
}

fn http_status_no_body(code: StatusCode) -> Response<Body> {
    let mut res = Response::new(Body::empty());
    *res.status_mut() = code;
    res
}

#[cfg(test)]
mod test {
    use super::{http_route, RequestContext};
    use crate::metrics::{CollectorConfig, MetricsExposition, TemperatureMetrics};
    use crate::sensor::test::SysfsTree;
    use crate::sensor::{HwmonDiscoverer, ThermalZoneDiscoverer};
    use hyper::{Body, Method, Request, StatusCode};
    use prometheus::Registry;
    use std::sync::Arc;
    use std::time::Duration;

    fn context(tree: &SysfsTree) -> Arc<RequestContext> {
        let registry = Registry::new();
        let metrics = TemperatureMetrics::new(CollectorConfig {
            namespace: "test".to_owned(),
            hwmon: Some(HwmonDiscoverer::new(tree.hwmon())),
            thermal: Some(ThermalZoneDiscoverer::new(tree.thermal())),
            sensors_cli: None,
        })
        .unwrap();
        registry.register(Box::new(metrics)).unwrap();

        let exposition = MetricsExposition::new(registry, Duration::from_secs(5));
        Arc::new(RequestContext::new(exposition, "/metrics", false))
    }

    fn request(method: Method, path: &str) -> Request<Body> {
        Request::builder().method(method).uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_route_metrics() {
        let tree = SysfsTree::new();
        tree.zone("thermal_zone0", Some("acpitz"), Some("27800"));

        let res = http_route(request(Method::GET, "/metrics"), context(&tree)).await.unwrap();
        assert_eq!(StatusCode::OK, res.status());

        let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("test_temperature_celsius"));
    }

    #[tokio::test]
    async fn test_route_metrics_wrong_method() {
        let tree = SysfsTree::new();
        let res = http_route(request(Method::POST, "/metrics"), context(&tree)).await.unwrap();

        assert_eq!(StatusCode::METHOD_NOT_ALLOWED, res.status());
    }

    #[tokio::test]
    async fn test_route_health() {
        let tree = SysfsTree::new();
        let res = http_route(request(Method::GET, "/healthz"), context(&tree)).await.unwrap();
        assert_eq!(StatusCode::OK, res.status());

        let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
        assert_eq!(&b"ok"[..], &body[..]);
    }

    #[tokio::test]
    async fn test_route_index_and_not_found() {
        let tree = SysfsTree::new();
        let ctx = context(&tree);

        let index = http_route(request(Method::GET, "/"), ctx.clone()).await.unwrap();
        assert_eq!(StatusCode::OK, index.status());

        let missing = http_route(request(Method::GET, "/nope"), ctx).await.unwrap();
        assert_eq!(StatusCode::NOT_FOUND, missing.status());
    }
}
