// SPDX-License-Identifier: CEPL-1.0
use std::sync::Arc;

use anyhow::{bail, Result};
use ash::vk;
use tracing::debug;

use crate::context::DeviceContext;

/// Converts two raw timestamps to milliseconds. `period_ns` is the device's
/// `timestamp_period`; a wrapped or reversed pair yields 0.
pub fn timestamp_delta_ms(start: u64, end: u64, period_ns: f32) -> f64 {
    end.saturating_sub(start) as f64 * period_ns as f64 / 1_000_000.0
}

/// Thin owner of a `vk::QueryPool`.
pub struct QueryPool {
    ctx: Arc<DeviceContext>,
    pool: vk::QueryPool,
    ty: vk::QueryType,
    count: u32,
}

impl QueryPool {
    /// `statistics` is only read for `PIPELINE_STATISTICS` pools.
    pub fn new(
        ctx: Arc<DeviceContext>,
        ty: vk::QueryType,
        count: u32,
        statistics: vk::QueryPipelineStatisticFlags,
    ) -> Result<Self> {
        if count == 0 {
            bail!("query pool needs at least one query");
        }
        if ty == vk::QueryType::TIMESTAMP && !ctx.timestamps_supported() {
            bail!("device does not support timestamps on its graphics queue");
        }
        let ci = vk::QueryPoolCreateInfo {
            s_type: vk::StructureType::QUERY_POOL_CREATE_INFO,
            query_type: ty,
            query_count: count,
            pipeline_statistics: if ty == vk::QueryType::PIPELINE_STATISTICS {
                statistics
            } else {
                vk::QueryPipelineStatisticFlags::empty()
            },
            ..Default::default()
        };
        let pool = unsafe { ctx.device().create_query_pool(&ci, None)? };
        debug!("query pool: {ty:?} x{count}");
        Ok(Self {
            ctx,
            pool,
            ty,
            count,
        })
    }

    pub fn timestamps(ctx: Arc<DeviceContext>, count: u32) -> Result<Self> {
        Self::new(
            ctx,
            vk::QueryType::TIMESTAMP,
            count,
            vk::QueryPipelineStatisticFlags::empty(),
        )
    }

    #[inline]
    pub fn handle(&self) -> vk::QueryPool {
        self.pool
    }
    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }
    #[inline]
    pub fn query_type(&self) -> vk::QueryType {
        self.ty
    }

    /// Must be recorded outside a render pass.
    pub unsafe fn reset(&self, cmd: vk::CommandBuffer, first: u32, count: u32) {
        debug_assert!(first + count <= self.count);
        unsafe { self.ctx.device().cmd_reset_query_pool(cmd, self.pool, first, count) };
    }

    pub unsafe fn write_timestamp(&self, cmd: vk::CommandBuffer, stage: vk::PipelineStageFlags, query: u32) {
        debug_assert!(query < self.count);
        unsafe {
            self.ctx
                .device()
                .cmd_write_timestamp(cmd, stage, self.pool, query)
        };
    }

    fn check_range(&self, first: u32, count: u32) -> Result<()> {
        if count == 0 || first.checked_add(count).map_or(true, |end| end > self.count) {
            bail!("queries {first}..{} out of range (pool holds {})", first.saturating_add(count), self.count);
        }
        Ok(())
    }

    /// Reads `count` 64-bit results starting at `first`. Without `WAIT` a
    /// not-yet-available query returns `Err(vk::Result::NOT_READY)` wrapped.
    pub fn results_u64(&self, first: u32, count: u32, flags: vk::QueryResultFlags) -> Result<Vec<u64>> {
        self.check_range(first, count)?;
        let mut out = vec![0u64; count as usize];
        unsafe {
            self.ctx.device().get_query_pool_results(
                self.pool,
                first,
                &mut out,
                flags | vk::QueryResultFlags::TYPE_64,
            )?
        };
        Ok(out)
    }

    pub fn results_u32(&self, first: u32, count: u32, flags: vk::QueryResultFlags) -> Result<Vec<u32>> {
        self.check_range(first, count)?;
        let mut out = vec![0u32; count as usize];
        unsafe {
            self.ctx.device().get_query_pool_results(
                self.pool,
                first,
                &mut out,
                flags & !vk::QueryResultFlags::TYPE_64,
            )?
        };
        Ok(out)
    }

    pub fn all_results_u64(&self, flags: vk::QueryResultFlags) -> Result<Vec<u64>> {
        self.results_u64(0, self.count, flags)
    }
}

impl Drop for QueryPool {
    fn drop(&mut self) {
        unsafe { self.ctx.device().destroy_query_pool(self.pool, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_uses_timestamp_period() {
        assert_eq!(timestamp_delta_ms(0, 1_000_000, 1.0), 1.0);
        assert!((timestamp_delta_ms(100, 2_100, 83.333) - 0.166_666).abs() < 1e-4);
    }

    #[test]
    fn reversed_pair_is_zero() {
        assert_eq!(timestamp_delta_ms(50, 10, 1.0), 0.0);
    }
}
