//! Splits a media duration into one time-range chunk per live worker.

use crate::error::PlanError;
use crate::models::{Chunk, ChunkStatus};

/// Seconds trimmed from every chunk so that adjacent ranges never overlap.
/// Not last-chunk aware: the final chunk may stop short of the end of the media.
pub const OVERRUN_GUARD_SECS: f64 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPlan {
  pub chunk_length: f64,
  pub chunks: Vec<Chunk>,
}

/// Deterministic for identical inputs, so replanning a retried task yields the same chunks.
pub fn plan(worker_count: usize, duration_secs: f64) -> Result<ChunkPlan, PlanError> {
  if worker_count == 0 {
    return Err(PlanError::NoWorkers);
  }
  if !duration_secs.is_finite() || duration_secs < 0.0 {
    return Err(PlanError::InvalidDuration(duration_secs));
  }

  let chunk_length = (duration_secs / worker_count as f64).ceil();
  if chunk_length <= 0.0 {
    return Err(PlanError::ZeroChunkLength { duration: duration_secs, workers: worker_count });
  }

  let chunks = (0..worker_count)
    .map(|i| Chunk {
      sequence: i as u32 + 1,
      offset: i as f64 * chunk_length,
      length: chunk_length - OVERRUN_GUARD_SECS,
      file: String::new(),
      status: ChunkStatus::Pending,
    })
    .collect();

  Ok(ChunkPlan { chunk_length, chunks })
}
