use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use lazy_static::lazy_static;
use prometheus::core::{Collector, Desc};
use prometheus::proto::{self, MetricFamily, MetricType};
use prometheus::{Registry, TextEncoder};
use tracing::error;

use crate::exporter::runner::Runner;

lazy_static! {
    static ref SERVER_ID: Desc = gauge_desc("speedtest_server_id", "Speedtest server ID.");
    static ref JITTER: Desc = gauge_desc(
        "speedtest_jitter_latency_milliseconds",
        "Speedtest jitter latency in milliseconds.",
    );
    static ref PING: Desc = gauge_desc(
        "speedtest_ping_latency_milliseconds",
        "Speedtest ping latency in milliseconds.",
    );
    static ref DOWNLOAD_SPEED: Desc = gauge_desc(
        "speedtest_download_bits_per_second",
        "Speedtest download speed in bits per second.",
    );
    static ref UPLOAD_SPEED: Desc = gauge_desc(
        "speedtest_upload_bits_per_second",
        "Speedtest upload speed in bits per second.",
    );
    static ref UP: Desc = gauge_desc("speedtest_up", "Speedtest up status.");
}

fn gauge_desc(name: &str, help: &str) -> Desc {
    Desc::new(name.to_string(), help.to_string(), Vec::new(), HashMap::new())
        .expect("valid metric descriptor")
}

// Single-sample unlabeled gauge family, the only shape this exporter emits.
fn const_gauge(desc: &Desc, value: f64) -> MetricFamily {
    let mut gauge = proto::Gauge::default();
    gauge.set_value(value);
    let mut metric = proto::Metric::default();
    metric.set_gauge(gauge);
    let mut family = MetricFamily::default();
    family.set_name(desc.fq_name.clone());
    family.set_help(desc.help.clone());
    family.set_field_type(MetricType::GAUGE);
    family.mut_metric().push(metric);
    family
}

/// Prometheus collector that runs one speedtest per scrape.
pub struct SpeedtestCollector<R> {
    runner: R,
    // Serializes overlapping scrapes so their probes cannot contend for
    // bandwidth and skew each other's readings.
    probe_guard: Mutex<()>,
}

impl<R: Runner> SpeedtestCollector<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            probe_guard: Mutex::new(()),
        }
    }
}

impl<R: Runner> Collector for SpeedtestCollector<R> {
    fn desc(&self) -> Vec<&Desc> {
        vec![&*SERVER_ID, &*JITTER, &*PING, &*DOWNLOAD_SPEED, &*UPLOAD_SPEED, &*UP]
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let _probe = self.probe_guard.lock().unwrap_or_else(PoisonError::into_inner);

        match self.runner.run() {
            Ok(result) => vec![
                const_gauge(&SERVER_ID, result.server_id as f64),
                const_gauge(&JITTER, result.jitter_ms),
                const_gauge(&PING, result.ping_ms),
                const_gauge(&DOWNLOAD_SPEED, result.download_bps),
                const_gauge(&UPLOAD_SPEED, result.upload_bps),
                const_gauge(&UP, 1.0),
            ],
            Err(err) => {
                error!(error = %err, "speedtest failed");
                vec![const_gauge(&UP, 0.0)]
            }
        }
    }
}

/// Registry owner for the exporter's metrics.
#[derive(Clone)]
pub struct SpeedtestMetrics {
    registry: Arc<Registry>,
}

impl SpeedtestMetrics {
    /// Creates a registry with the speedtest collector registered, plus
    /// the process collector when `process_metrics` is set.
    pub fn new<R>(runner: R, process_metrics: bool) -> Result<Self, prometheus::Error>
    where
        R: Runner + 'static,
    {
        let registry = Arc::new(Registry::new());

        registry.register(Box::new(SpeedtestCollector::new(runner)))?;
        if process_metrics {
            register_process_collector(&registry)?;
        }

        Ok(Self { registry })
    }

    /// Gets metrics data in Prometheus format. Triggers a full probe, so
    /// callers on an async runtime should move this onto a blocking thread.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        encoder.encode_to_string(&metric_families).unwrap_or_else(|err| {
            error!(error = %err, "error encoding metrics");
            String::new()
        })
    }
}

#[cfg(target_os = "linux")]
fn register_process_collector(registry: &Registry) -> Result<(), prometheus::Error> {
    use prometheus::process_collector::ProcessCollector;

    registry.register(Box::new(ProcessCollector::for_self()))
}

#[cfg(not(target_os = "linux"))]
fn register_process_collector(_registry: &Registry) -> Result<(), prometheus::Error> {
    Ok(())
}

/// HTTP server to expose /metrics endpoint
pub mod http_server {
    use super::*;
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::service::service_fn;
    use hyper::{Method, Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use hyper_util::server::conn::auto::Builder;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::task;
    use tracing::{error, info};

    /// Starts the metrics HTTP server with graceful shutdown support
    pub async fn start_metrics_server(
        metrics: Arc<SpeedtestMetrics>,
        addr: SocketAddr,
        mut shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(addr).await?;

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            let metrics = metrics.clone();

                            tokio::task::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    handle_request(req, metrics.clone())
                                });

                                if let Err(err) = Builder::new(hyper_util::rt::TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    error!(error = ?err, "error serving connection");
                                }
                            });
                        }
                        Err(err) => {
                            error!(error = %err, "failed to accept connection");
                        }
                    }
                }
                _ = &mut shutdown_rx => {
                    info!("metrics server shutting down gracefully");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_request<B>(
        req: Request<B>,
        metrics: Arc<SpeedtestMetrics>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/metrics") => {
                // A scrape blocks for the whole probe; keep it off the
                // async worker threads.
                let output = match task::spawn_blocking(move || metrics.gather()).await {
                    Ok(output) => output,
                    Err(err) => {
                        error!(error = %err, "metrics gather task failed");
                        String::new()
                    }
                };
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "text/plain; charset=utf-8")
                    .body(Full::new(Bytes::from(output)))
                    .unwrap())
            }
            (&Method::GET, "/") => {
                let body = r#"<html>
<head><title>Speedwatch Metrics</title></head>
<body>
<h1>Speedwatch Metrics</h1>
<p>See the <a href='/metrics'>metrics</a>.</p>
</body>
</html>"#;
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "text/html")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap())
            }
            _ => {
                Ok(Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Full::new(Bytes::from("Not Found")))
                    .unwrap())
            }
        }
    }

}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::exporter::runner::{ProbeError, SpeedtestResult};
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct FakeRunner {
        result: Option<SpeedtestResult>,
        run_calls: AtomicUsize,
    }

    impl FakeRunner {
        pub(crate) fn ok(result: SpeedtestResult) -> Self {
            Self {
                result: Some(result),
                run_calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                result: None,
                run_calls: AtomicUsize::new(0),
            }
        }
    }

    impl Runner for FakeRunner {
        fn run(&self) -> Result<SpeedtestResult, ProbeError> {
            self.run_calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone().ok_or(ProbeError::NoServers)
        }
    }

    pub(crate) fn ok_result() -> SpeedtestResult {
        SpeedtestResult {
            server_id: 12345,
            download_bps: 100_000_000.0,
            upload_bps: 50_000_000.0,
            jitter_ms: 5.2,
            ping_ms: 25.7,
        }
    }

    #[test]
    fn describe_returns_six_descriptors_without_probing() {
        let collector = SpeedtestCollector::new(FakeRunner::ok(ok_result()));

        let descs = collector.desc();

        assert_eq!(descs.len(), 6);
        assert_eq!(collector.runner.run_calls.load(Ordering::SeqCst), 0);

        let names: Vec<&str> = descs.iter().map(|desc| desc.fq_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "speedtest_server_id",
                "speedtest_jitter_latency_milliseconds",
                "speedtest_ping_latency_milliseconds",
                "speedtest_download_bits_per_second",
                "speedtest_upload_bits_per_second",
                "speedtest_up",
            ]
        );
    }

    #[test]
    fn collect_emits_six_gauges_from_one_run() {
        let collector = SpeedtestCollector::new(FakeRunner::ok(ok_result()));

        let families = collector.collect();

        assert_eq!(families.len(), 6);
        assert_eq!(collector.runner.run_calls.load(Ordering::SeqCst), 1);
        for family in &families {
            assert_eq!(family.get_field_type(), MetricType::GAUGE);
            assert_eq!(family.get_metric().len(), 1);
            assert!(family.get_metric()[0].get_label().is_empty());
        }
    }

    #[test]
    fn collect_maps_result_fields_onto_metrics() {
        let collector = SpeedtestCollector::new(FakeRunner::ok(ok_result()));

        let families = collector.collect();

        let value_of = |name: &str| {
            families
                .iter()
                .find(|family| family.get_name() == name)
                .map(|family| family.get_metric()[0].get_gauge().get_value())
                .unwrap()
        };
        assert_eq!(value_of("speedtest_server_id"), 12345.0);
        assert_eq!(value_of("speedtest_jitter_latency_milliseconds"), 5.2);
        assert_eq!(value_of("speedtest_ping_latency_milliseconds"), 25.7);
        assert_eq!(value_of("speedtest_download_bits_per_second"), 100_000_000.0);
        assert_eq!(value_of("speedtest_upload_bits_per_second"), 50_000_000.0);
        assert_eq!(value_of("speedtest_up"), 1.0);
    }

    #[test]
    fn failed_probe_emits_only_up_zero() {
        let collector = SpeedtestCollector::new(FakeRunner::failing());

        let families = collector.collect();

        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_name(), "speedtest_up");
        assert_eq!(families[0].get_metric()[0].get_gauge().get_value(), 0.0);
    }

    #[test]
    fn exposition_contains_expected_lines() {
        let metrics = SpeedtestMetrics::new(FakeRunner::ok(ok_result()), false).unwrap();

        let output = metrics.gather();

        for line in [
            "# HELP speedtest_server_id Speedtest server ID.",
            "# TYPE speedtest_server_id gauge",
            "speedtest_server_id 12345",
            "speedtest_jitter_latency_milliseconds 5.2",
            "speedtest_ping_latency_milliseconds 25.7",
            "speedtest_download_bits_per_second 100000000",
            "speedtest_upload_bits_per_second 50000000",
            "speedtest_up 1",
        ] {
            assert!(output.contains(line), "missing {line:?} in:\n{output}");
        }
    }

    #[test]
    fn exposition_of_zero_valued_result() {
        let result = SpeedtestResult {
            server_id: 3,
            download_bps: 0.0,
            upload_bps: 0.0,
            jitter_ms: 0.0,
            ping_ms: 0.0,
        };
        let metrics = SpeedtestMetrics::new(FakeRunner::ok(result), false).unwrap();

        let output = metrics.gather();

        for line in [
            "speedtest_server_id 3",
            "speedtest_jitter_latency_milliseconds 0",
            "speedtest_ping_latency_milliseconds 0",
            "speedtest_download_bits_per_second 0",
            "speedtest_upload_bits_per_second 0",
            "speedtest_up 1",
        ] {
            assert!(output.contains(line), "missing {line:?} in:\n{output}");
        }
    }

    #[test]
    fn failed_probe_omits_measurement_metrics_from_exposition() {
        let metrics = SpeedtestMetrics::new(FakeRunner::failing(), false).unwrap();

        let output = metrics.gather();

        assert!(output.contains("speedtest_up 0"));
        assert!(!output.contains("speedtest_server_id"));
        assert!(!output.contains("speedtest_download_bits_per_second"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn process_metrics_are_registered_on_demand() {
        let with = SpeedtestMetrics::new(FakeRunner::ok(ok_result()), true).unwrap();
        assert!(with.gather().contains("process_cpu_seconds_total"));

        let without = SpeedtestMetrics::new(FakeRunner::ok(ok_result()), false).unwrap();
        assert!(!without.gather().contains("process_cpu_seconds_total"));
    }
}
