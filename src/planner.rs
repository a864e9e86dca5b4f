//! Host memory planning for a capture
//!
//! Every stream writes into the same ramdisk, so the plan checks the output
//! root is volatile, purges stale output, and, when buffers are not
//! recycled, makes sure the whole capture fits in free memory.

use crate::backend::HostServices;
use crate::config::{RunConfig, UNBOUNDED_NBUFFERS};
use crate::error::{Result, StreamError};
use crate::unit::Unit;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// Memory kept free when sizing the buffer count automatically
pub const AUTO_SIZE_RESERVE: u64 = 2 * GIB;

/// Memory that must remain free once the capture is accounted for
pub const HEADROOM: u64 = GIB;

/// Buffer sizing for a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapacityPlan {
    /// Bytes per buffer, from the link driver
    pub buffer_size: u64,
    /// Buffers per stream handed to each data-mover
    pub buffer_count: u64,
    pub total_streams: usize,
    /// Free host memory when planned
    pub free_memory: u64,
    /// Bytes the capture will occupy when buffers are not recycled
    pub memory_needed: Option<u64>,
    /// Duration limit, when one was requested
    pub duration: Option<Duration>,
}

impl CapacityPlan {
    pub fn buffer_mb(&self) -> f64 {
        self.buffer_size as f64 / MIB as f64
    }

    /// Per-stream capture size in MB
    pub fn max_mb(&self) -> f64 {
        self.buffer_count as f64 * self.buffer_mb()
    }
}

/// Plan the capture for every link of every unit
pub fn plan(units: &[Arc<Unit>], config: &RunConfig, services: &HostServices) -> Result<CapacityPlan> {
    let links: Vec<u32> = units
        .iter()
        .flat_map(|unit| unit.links().map(|s| s.link).collect::<Vec<_>>())
        .collect();
    plan_links(&links, config, services)
}

/// Plan the capture for a set of local links
pub fn plan_links(links: &[u32], config: &RunConfig, services: &HostServices) -> Result<CapacityPlan> {
    let root = &config.host.output_root;
    if !services.host.is_volatile(root)? {
        return Err(StreamError::Capacity(format!(
            "{} is not a ramdisk (tmpfs or ramfs required)",
            root.display()
        )));
    }
    if config.stream.delete {
        tracing::info!("Purging stale output under {}", root.display());
        services.host.purge_outputs(root)?;
    }

    let first = links
        .first()
        .ok_or_else(|| StreamError::Config("no links to stream".to_string()))?;
    let buffer_size = services.registry.buffer_length(*first)?;
    if buffer_size == 0 {
        return Err(StreamError::Registry(format!(
            "afhba.{} reports a zero buffer length",
            first
        )));
    }

    let free_memory = services.host.free_memory()?;
    size(links.len(), buffer_size, free_memory, config)
}

/// Buffer count and memory check, given the host's numbers
pub fn size(
    total_streams: usize,
    buffer_size: u64,
    free_memory: u64,
    config: &RunConfig,
) -> Result<CapacityPlan> {
    let stream = &config.stream;
    let duration = stream.duration();
    let mut plan = CapacityPlan {
        buffer_size,
        buffer_count: stream.nbuffers,
        total_streams,
        free_memory,
        memory_needed: None,
        duration,
    };

    if !stream.recycle {
        if duration.is_some() {
            return Err(StreamError::Config(
                "a duration limit needs recycle enabled".to_string(),
            ));
        }

        let per_buffer_row = total_streams as u64 * buffer_size;
        if stream.auto_size {
            plan.buffer_count = free_memory.saturating_sub(AUTO_SIZE_RESERVE) / per_buffer_row.max(1);
            tracing::info!("Auto-sized to {} buffers per stream", plan.buffer_count);
        }

        let needed = per_buffer_row.saturating_mul(plan.buffer_count);
        let available = free_memory.saturating_sub(HEADROOM);
        plan.memory_needed = Some(needed);
        if needed > available {
            return Err(StreamError::Capacity(format!(
                "Not enough memory: needed {} MB, available {} MB",
                needed / MIB,
                available / MIB
            )));
        }
    }

    if duration.is_some() {
        plan.buffer_count = UNBOUNDED_NBUFFERS;
    }
    Ok(plan)
}
