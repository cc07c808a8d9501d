use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  pub rabbitmq_url: String,
  pub server_host: IpAddr,
  pub server_port: u16,
  pub topics: Topics,
  pub timing: Timing,
  pub ffprobe_path: String,
  pub probe_timeout: Duration,
  /// Upper bound on concurrent task admissions (each one runs a probe).
  pub max_in_flight: usize,
  /// Unsettled deliveries the broker may push at once. Registry traffic only gets
  /// through while fewer than this many admissions are waiting.
  pub prefetch: u16,
}

#[derive(Debug, Clone)]
pub struct Topics {
  pub manager: String,
  pub splitter: String,
  /// Prefix of each conversion worker's own inbound topic.
  pub conversion: String,
}

impl Topics {
  pub fn worker(&self, worker_id: &str) -> String {
    format!("{}.{}", self.conversion, worker_id)
  }
}

impl Default for Topics {
  fn default() -> Self {
    Self {
      manager: "vconvd-manager".into(),
      splitter: "vconvd-splitter".into(),
      conversion: "vconvd-conversion".into(),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Timing {
  pub liveness_timeout: Duration,
  pub sweep_interval: Duration,
  pub no_capacity_delay: Duration,
  pub retry_backoff: Duration,
  /// Zero means tasks recirculate until they succeed.
  pub max_retry_attempts: u32,
}

impl Default for Timing {
  fn default() -> Self {
    Self {
      liveness_timeout: Duration::from_secs(10),
      sweep_interval: Duration::from_secs(5),
      no_capacity_delay: Duration::from_secs(5),
      retry_backoff: Duration::from_secs(600),
      max_retry_attempts: 0,
    }
  }
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let timing = Timing::default();
    let defaults = Topics::default();

    Ok(Self {
      database_url: lookup("DATABASE_URL").ok_or_else(|| anyhow!("DATABASE_URL is not set"))?,
      rabbitmq_url: lookup("RABBITMQ_URL").ok_or_else(|| anyhow!("RABBITMQ_URL is not set"))?,
      server_host: parse_or(&lookup, "SERVER_HOST", IpAddr::from([127, 0, 0, 1]))?,
      server_port: parse_or(&lookup, "SERVER_PORT", 8089)?,
      topics: Topics {
        manager: lookup("MANAGER_TOPIC").unwrap_or(defaults.manager),
        splitter: lookup("SPLITTER_TOPIC").unwrap_or(defaults.splitter),
        conversion: lookup("CONVERSION_TOPIC").unwrap_or(defaults.conversion),
      },
      timing: Timing {
        liveness_timeout: secs_or(&lookup, "LIVENESS_TIMEOUT_SECS", timing.liveness_timeout)?,
        sweep_interval: secs_or(&lookup, "SWEEP_INTERVAL_SECS", timing.sweep_interval)?,
        no_capacity_delay: secs_or(&lookup, "NO_CAPACITY_DELAY_SECS", timing.no_capacity_delay)?,
        retry_backoff: secs_or(&lookup, "RETRY_BACKOFF_SECS", timing.retry_backoff)?,
        max_retry_attempts: parse_or(&lookup, "MAX_RETRY_ATTEMPTS", timing.max_retry_attempts)?,
      },
      ffprobe_path: lookup("FFPROBE_PATH").unwrap_or_else(|| "ffprobe".into()),
      probe_timeout: secs_or(&lookup, "PROBE_TIMEOUT_SECS", Duration::from_secs(60))?,
      max_in_flight: parse_or(&lookup, "MAX_IN_FLIGHT", 4usize)?.max(1),
      prefetch: parse_or(&lookup, "PREFETCH", 64u16)?.max(1),
    })
  }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  match lookup(key) {
    Some(raw) => raw.trim().parse().with_context(|| format!("invalid value for {}: {:?}", key, raw)),
    None => Ok(default),
  }
}

fn secs_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration> {
  let secs = parse_or(lookup, key, default.as_secs())?;
  if secs == 0 {
    return Err(anyhow!("{} must be greater than zero", key));
  }
  Ok(Duration::from_secs(secs))
}
