use std::fmt;

use thiserror::Error;
use tracing::{info, warn};

use crate::client::{ClientError, LatencySample, Server, SpeedtestClient};

/// Results of one speedtest run, already normalized: throughput in bits
/// per second, latencies in milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedtestResult {
    pub server_id: i64,
    pub download_bps: f64,
    pub upload_bps: f64,
    pub jitter_ms: f64,
    pub ping_ms: f64,
}

/// The three measurement phases, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePhase {
    Latency,
    Download,
    Upload,
}

impl fmt::Display for ProbePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbePhase::Latency => "latency",
            ProbePhase::Download => "download",
            ProbePhase::Upload => "upload",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("server resolution failed: {0}")]
    Resolution(#[source] ClientError),

    #[error("no reachable servers after ranking")]
    NoServers,

    #[error("{phase} phase failed: {source}")]
    Phase {
        phase: ProbePhase,
        #[source]
        source: ClientError,
    },

    #[error("server id {0:?} is not numeric")]
    InvalidServerId(String),
}

/// A speedtest runner. One call, one full probe.
pub trait Runner: Send + Sync {
    /// Executes the speedtest against the configured server selection.
    fn run(&self) -> Result<SpeedtestResult, ProbeError>;
}

/// [`Runner`] backed by a [`SpeedtestClient`]. The server selection is
/// bound at construction: a directory ID, or `None` to probe the closest
/// server found at run time.
pub struct SpeedtestRunner<C> {
    server_id: Option<String>,
    client: C,
}

impl<C: SpeedtestClient> SpeedtestRunner<C> {
    pub fn new(server_id: Option<String>, client: C) -> Self {
        Self { server_id, client }
    }

    fn resolve_server(&self) -> Result<Server, ProbeError> {
        match &self.server_id {
            Some(id) => self.client.fetch_server(id).map_err(ProbeError::Resolution),
            None => {
                warn!("no server configured, finding the best server");
                let servers = self.client.fetch_servers().map_err(ProbeError::Resolution)?;
                let ranked = self.client.rank(servers).map_err(ProbeError::Resolution)?;
                ranked.into_iter().next().ok_or(ProbeError::NoServers)
            }
        }
    }

    // Phases run strictly in order so one phase's traffic cannot skew
    // another's bandwidth reading. The first failure aborts the rest.
    fn probe(&self, server: &Server) -> Result<(LatencySample, f64, f64), ProbeError> {
        let latency = self
            .client
            .measure_latency(server)
            .map_err(|source| ProbeError::Phase { phase: ProbePhase::Latency, source })?;
        let download = self
            .client
            .measure_download(server)
            .map_err(|source| ProbeError::Phase { phase: ProbePhase::Download, source })?;
        let upload = self
            .client
            .measure_upload(server)
            .map_err(|source| ProbeError::Phase { phase: ProbePhase::Upload, source })?;
        Ok((latency, download, upload))
    }
}

impl<C: SpeedtestClient> Runner for SpeedtestRunner<C> {
    fn run(&self) -> Result<SpeedtestResult, ProbeError> {
        let server = self.resolve_server()?;
        info!(id = %server.id, sponsor = %server.sponsor, "selected server");

        info!("running speedtest");
        let outcome = self.probe(&server);
        // Release must happen even when a phase failed.
        self.client.release(&server);
        let (latency, download_bytes, upload_bytes) = outcome?;

        let server_id: i64 = server
            .id
            .parse()
            .map_err(|_| ProbeError::InvalidServerId(server.id.clone()))?;

        let result = SpeedtestResult {
            server_id,
            download_bps: download_bytes * 8.0,
            upload_bps: upload_bytes * 8.0,
            jitter_ms: latency.jitter.as_secs_f64() * 1000.0,
            ping_ms: latency.ping.as_secs_f64() * 1000.0,
        };
        info!(
            ping = result.ping_ms,
            jitter = result.jitter_ms,
            download = result.download_bps,
            upload = result.upload_bps,
            "speedtest completed"
        );

        Ok(result)
    }
}
