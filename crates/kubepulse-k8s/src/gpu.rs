//! Host GPU telemetry via `nvidia-smi`
//!
//! The probe is optional: a disabled probe, a missing binary or a failing
//! command all produce an empty list rather than an error. A command that
//! does not answer within the timeout is killed and also reads as no GPUs.

use std::time::Duration;

use kubepulse_types::{GpuInfo, GpuMemory, GpuPower, GpuUtilization};

const QUERY_FIELDS: &str = "index,name,utilization.gpu,utilization.memory,memory.used,memory.total,temperature.gpu,power.draw,power.limit";
const FIELD_COUNT: usize = 9;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs `nvidia-smi` (or a compatible command) and parses its CSV rows
#[derive(Clone, Debug)]
pub struct GpuProbe {
    command: Option<String>,
    timeout: Duration,
}

impl GpuProbe {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// A probe that never reports any GPU
    pub fn disabled() -> Self {
        Self {
            command: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bound how long one query may run
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.command.is_some()
    }

    /// Query the GPUs on this host
    pub async fn query(&self) -> Vec<GpuInfo> {
        let Some(command) = &self.command else {
            return Vec::new();
        };

        let query = tokio::process::Command::new(command)
            .arg(format!("--query-gpu={QUERY_FIELDS}"))
            .arg("--format=csv,noheader,nounits")
            .kill_on_drop(true)
            .output();

        // Dropping the timed-out future kills the child
        let output = match tokio::time::timeout(self.timeout, query).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::debug!(%command, error = %e, "gpu telemetry unavailable");
                return Vec::new();
            }
            Err(_) => {
                tracing::debug!(%command, timeout = ?self.timeout, "gpu query timed out");
                return Vec::new();
            }
        };

        if !output.status.success() {
            tracing::debug!(%command, status = %output.status, "gpu query exited with failure");
            return Vec::new();
        }

        parse_rows(&String::from_utf8_lossy(&output.stdout))
    }
}

impl Default for GpuProbe {
    fn default() -> Self {
        Self::new("nvidia-smi")
    }
}

/// Parse `--format=csv,noheader,nounits` output, one GPU per line.
/// Short rows and rows without a numeric index are skipped.
pub fn parse_rows(output: &str) -> Vec<GpuInfo> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(parse_row)
        .collect()
}

fn parse_row(line: &str) -> Option<GpuInfo> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < FIELD_COUNT {
        tracing::debug!(row = %line, "skipping short gpu row");
        return None;
    }

    // "[N/A]" and friends read as zero
    let number = |i: usize| fields[i].parse::<f64>().unwrap_or(0.0);

    Some(GpuInfo {
        index: fields[0].parse().ok()?,
        name: fields[1].to_string(),
        utilization: GpuUtilization {
            gpu: number(2),
            memory: number(3),
        },
        memory: GpuMemory {
            used: number(4),
            total: number(5),
        },
        temperature: number(6),
        power: GpuPower {
            draw: number(7),
            limit: number(8),
        },
    })
}
