use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::error::ProbeError;

/// Reports the duration of a media file in seconds.
#[async_trait]
pub trait MediaProbe: Send + Sync {
  async fn duration(&self, path: &str) -> Result<f64, ProbeError>;
}

pub struct FfprobeProbe {
  ffprobe_path: PathBuf,
  timeout: Duration,
}

impl FfprobeProbe {
  pub fn new(ffprobe_path: impl Into<PathBuf>, timeout: Duration) -> Self {
    Self { ffprobe_path: ffprobe_path.into(), timeout }
  }

  fn parse_duration(path: &str, output: &[u8]) -> Result<f64, ProbeError> {
    #[derive(Deserialize)]
    struct ProbeOutput {
      format: ProbeFormat,
    }

    #[derive(Deserialize)]
    struct ProbeFormat {
      duration: Option<String>,
    }

    let probe: ProbeOutput = serde_json::from_slice(output).map_err(|e| ProbeError::Failed {
      path: path.to_string(),
      reason: format!("unreadable ffprobe output: {}", e),
    })?;

    probe
      .format
      .duration
      .and_then(|d| d.trim().parse::<f64>().ok())
      .filter(|d| d.is_finite())
      .ok_or_else(|| ProbeError::MissingDuration { path: path.to_string() })
  }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
  async fn duration(&self, path: &str) -> Result<f64, ProbeError> {
    let mut command = Command::new(&self.ffprobe_path);
    command
      .args(["-v", "quiet", "-print_format", "json", "-show_format"])
      .arg(path)
      .kill_on_drop(true);

    let output = timeout(self.timeout, command.output())
      .await
      .map_err(|_| ProbeError::Timeout { path: path.to_string(), timeout: self.timeout })?
      .map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
          ProbeError::NotFound(self.ffprobe_path.clone())
        } else {
          ProbeError::Io(e)
        }
      })?;

    if !output.status.success() {
      return Err(ProbeError::Failed {
        path: path.to_string(),
        reason: format!("ffprobe exited with {}: {}", output.status, String::from_utf8_lossy(&output.stderr).trim()),
      });
    }

    let duration = Self::parse_duration(path, &output.stdout)?;
    debug!("Probed {}: {}s", path, duration);
    Ok(duration)
  }
}
