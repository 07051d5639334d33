use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

// Public speedtest.net server directory. Servers listed here speak the
// legacy HTTP measurement protocol under /speedtest/.
const SERVER_LIST_URL: &str =
    "https://www.speedtest.net/api/js/servers?engine=js&https_functional=true&limit=10";

const LATENCY_PATH: &str = "/speedtest/latency.txt";
const DOWNLOAD_PATH: &str = "/speedtest/random4000x4000.jpg";
const UPLOAD_PATH: &str = "/speedtest/upload.php";

const LATENCY_SAMPLES: usize = 5;
const RANK_CANDIDATES: usize = 5;
const UPLOAD_BYTES: usize = 4 * 1024 * 1024;

const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const LATENCY_TIMEOUT: Duration = Duration::from_secs(5);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

/// A speedtest server as published by the server directory.
#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    pub id: String,
    pub host: String,
    #[serde(default)]
    pub sponsor: String,
    #[serde(default)]
    pub name: String,
}

/// Raw output of the latency phase: minimum observed round trip and the
/// mean absolute difference between consecutive round trips.
#[derive(Debug, Clone, Copy)]
pub struct LatencySample {
    pub ping: Duration,
    pub jitter: Duration,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unknown server id: {0}")]
    UnknownServer(String),

    #[error("server list is empty")]
    NoServers,
}

/// External measurement capability. Throughput phases report bytes per
/// second; callers own any unit conversion.
pub trait SpeedtestClient: Send + Sync {
    /// Looks up a single server by its directory ID.
    fn fetch_server(&self, id: &str) -> Result<Server, ClientError>;

    /// Fetches the full list of candidate servers.
    fn fetch_servers(&self) -> Result<Vec<Server>, ClientError>;

    /// Orders servers by network proximity, closest first. Servers that
    /// cannot be reached are dropped from the ranking.
    fn rank(&self, servers: Vec<Server>) -> Result<Vec<Server>, ClientError>;

    fn measure_latency(&self, server: &Server) -> Result<LatencySample, ClientError>;

    fn measure_download(&self, server: &Server) -> Result<f64, ClientError>;

    fn measure_upload(&self, server: &Server) -> Result<f64, ClientError>;

    /// Drops per-probe transient state held for this server.
    fn release(&self, server: &Server);
}

/// [`SpeedtestClient`] over the legacy HTTP measurement protocol: timed
/// GETs against latency.txt, a sized payload GET for download and a
/// payload POST for upload.
pub struct HttpSpeedtestClient {
    http: reqwest::blocking::Client,
    list_url: String,
    // Server list fetched once per probe, cleared by release().
    server_cache: Mutex<Option<Vec<Server>>>,
}

impl HttpSpeedtestClient {
    pub fn new() -> Result<Self, ClientError> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!("speedwatch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            list_url: SERVER_LIST_URL.to_string(),
            server_cache: Mutex::new(None),
        })
    }

    fn server_list(&self) -> Result<Vec<Server>, ClientError> {
        let mut cache = self.server_cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(servers) = cache.as_ref() {
            return Ok(servers.clone());
        }

        let servers: Vec<Server> = self
            .http
            .get(&self.list_url)
            .timeout(LIST_TIMEOUT)
            .send()?
            .error_for_status()?
            .json()?;
        debug!(count = servers.len(), "fetched server list");

        *cache = Some(servers.clone());
        Ok(servers)
    }

    // One timed round trip to the latency endpoint, body included.
    fn sample_rtt(&self, server: &Server) -> Result<Duration, ClientError> {
        let url = format!("http://{}{}", server.host, LATENCY_PATH);
        let start = Instant::now();
        let response = self.http.get(&url).timeout(LATENCY_TIMEOUT).send()?.error_for_status()?;
        let _ = response.bytes()?;
        Ok(start.elapsed())
    }
}

impl SpeedtestClient for HttpSpeedtestClient {
    fn fetch_server(&self, id: &str) -> Result<Server, ClientError> {
        self.server_list()?
            .into_iter()
            .find(|server| server.id == id)
            .ok_or_else(|| ClientError::UnknownServer(id.to_string()))
    }

    fn fetch_servers(&self) -> Result<Vec<Server>, ClientError> {
        let servers = self.server_list()?;
        if servers.is_empty() {
            return Err(ClientError::NoServers);
        }
        Ok(servers)
    }

    fn rank(&self, servers: Vec<Server>) -> Result<Vec<Server>, ClientError> {
        let mut ranked: Vec<(Duration, Server)> = Vec::new();
        for server in servers.into_iter().take(RANK_CANDIDATES) {
            match self.sample_rtt(&server) {
                Ok(rtt) => ranked.push((rtt, server)),
                Err(err) => {
                    debug!(id = %server.id, host = %server.host, error = %err, "dropping unreachable server");
                }
            }
        }
        ranked.sort_by_key(|(rtt, _)| *rtt);
        Ok(ranked.into_iter().map(|(_, server)| server).collect())
    }

    fn measure_latency(&self, server: &Server) -> Result<LatencySample, ClientError> {
        let mut samples = Vec::with_capacity(LATENCY_SAMPLES);
        for _ in 0..LATENCY_SAMPLES {
            samples.push(self.sample_rtt(server)?);
        }

        let ping = samples.iter().min().copied().unwrap_or_default();
        let mut spread = Duration::ZERO;
        for pair in samples.windows(2) {
            spread += if pair[0] > pair[1] { pair[0] - pair[1] } else { pair[1] - pair[0] };
        }
        let jitter = spread / (samples.len().saturating_sub(1).max(1)) as u32;

        Ok(LatencySample { ping, jitter })
    }

    fn measure_download(&self, server: &Server) -> Result<f64, ClientError> {
        let url = format!("http://{}{}", server.host, DOWNLOAD_PATH);
        let start = Instant::now();
        let response = self.http.get(&url).timeout(TRANSFER_TIMEOUT).send()?.error_for_status()?;
        let body = response.bytes()?;
        Ok(throughput(body.len(), start.elapsed()))
    }

    fn measure_upload(&self, server: &Server) -> Result<f64, ClientError> {
        let url = format!("http://{}{}", server.host, UPLOAD_PATH);
        let payload = vec![0u8; UPLOAD_BYTES];
        let start = Instant::now();
        let response = self
            .http
            .post(&url)
            .timeout(TRANSFER_TIMEOUT)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(payload)
            .send()?
            .error_for_status()?;
        let _ = response.bytes()?;
        Ok(throughput(UPLOAD_BYTES, start.elapsed()))
    }

    fn release(&self, server: &Server) {
        debug!(id = %server.id, "releasing probe context");
        *self.server_cache.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

fn throughput(bytes: usize, elapsed: Duration) -> f64 {
    let seconds = elapsed.as_secs_f64();
    if seconds <= 0.0 {
        return 0.0;
    }
    bytes as f64 / seconds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throughput_is_bytes_per_second() {
        assert_eq!(throughput(1_000_000, Duration::from_secs(2)), 500_000.0);
        assert_eq!(throughput(0, Duration::from_secs(1)), 0.0);
    }

    #[test]
    fn throughput_guards_zero_elapsed() {
        assert_eq!(throughput(1_000_000, Duration::ZERO), 0.0);
    }
}
