mod metric;
mod runner;

pub use metric::http_server;
pub use metric::SpeedtestMetrics;
pub use runner::{ProbeError, ProbePhase, Runner, SpeedtestResult, SpeedtestRunner};
