// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! One hash partition of the build input: a build-row stream plus,
//! while the partition is in memory, a hash table over it.

use std::sync::Arc;

use crate::exec::chunk::Chunk;
use crate::exec::join::hash_context::{JoinHashContext, KeyEncoder};
use crate::exec::join::hash_table::JoinHashTable;
use crate::exec::join::row_stream::{BuildRowStream, UnpinMode};
use crate::exec::join::EqJoinConjunct;
use crate::runtime::profile::{CounterRef, RuntimeProfile, ScopedTimer};
use crate::runtime::reservation::BufferPoolClient;
use crate::runtime::runtime_state::RuntimeState;

/// Counters shared by the builder and its partitions.
#[derive(Debug)]
pub(crate) struct BuilderMetrics {
    pub partitions_created: CounterRef,
    pub largest_partition_percent: CounterRef,
    pub max_partition_level: CounterRef,
    pub num_build_rows_partitioned: CounterRef,
    pub num_spilled_partitions: CounterRef,
    pub num_repartitions: CounterRef,
    pub num_hash_table_builds_skipped: CounterRef,
    pub num_hash_buckets: CounterRef,
    pub partition_build_rows_timer: CounterRef,
    pub build_hash_table_timer: CounterRef,
    pub repartition_timer: CounterRef,
}

/// Engine-wide context injected into a hash-table build; partitions hold no
/// back pointer to the builder.
pub(crate) struct TableBuildContext<'a> {
    pub state: &'a RuntimeState,
    pub ht_ctx: &'a mut JoinHashContext,
    pub key_encoder: &'a KeyEncoder,
    pub build_exprs: &'a [EqJoinConjunct],
    pub stores_nulls: bool,
    pub client: &'a Arc<BufferPoolClient>,
    pub metrics: &'a BuilderMetrics,
}

#[derive(Debug)]
pub struct Partition {
    level: i32,
    is_spilled: bool,
    closed: bool,
    build_rows: Option<BuildRowStream>,
    hash_tbl: Option<JoinHashTable>,
}

impl Partition {
    pub(crate) fn new(level: i32, build_rows: BuildRowStream) -> Self {
        Self {
            level,
            is_spilled: false,
            closed: false,
            build_rows: Some(build_rows),
            hash_tbl: None,
        }
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn is_spilled(&self) -> bool {
        self.is_spilled
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn can_spill(&self) -> bool {
        !self.closed && !self.is_spilled
    }

    pub fn build_rows(&self) -> Option<&BuildRowStream> {
        self.build_rows.as_ref()
    }

    pub(crate) fn build_rows_mut(&mut self) -> Result<&mut BuildRowStream, String> {
        self.build_rows
            .as_mut()
            .ok_or_else(|| "partition build stream is closed".to_string())
    }

    pub fn hash_tbl(&self) -> Option<&JoinHashTable> {
        self.hash_tbl.as_ref()
    }

    pub fn hash_tbl_mut(&mut self) -> Option<&mut JoinHashTable> {
        self.hash_tbl.as_mut()
    }

    pub fn num_rows(&self) -> i64 {
        self.build_rows.as_ref().map(|s| s.num_rows()).unwrap_or(0)
    }

    /// Stream payload plus the estimated bucket array if a table were built
    /// over it now.
    pub fn estimated_in_mem_size(&self) -> i64 {
        match self.build_rows.as_ref() {
            Some(stream) => stream.byte_size() + JoinHashTable::estimate_size(stream.num_rows()),
            None => 0,
        }
    }

    /// Drop the hash table and unpin the stream. One-way within the
    /// partition's lifetime; repeated spills only re-unpin.
    pub(crate) fn spill(
        &mut self,
        mode: UnpinMode,
        metrics: &BuilderMetrics,
        profile: &RuntimeProfile,
    ) -> Result<(), String> {
        debug_assert!(!self.closed, "cannot spill a closed partition");
        if let Some(table) = self.hash_tbl.take() {
            // Match info only appears during probing, and probed partitions
            // are never spill victims; losing it here would corrupt results.
            debug_assert!(!table.has_matches());
            drop(table);
        }
        self.build_rows_mut()?.unpin_stream(mode)?;
        if !self.is_spilled {
            metrics.num_spilled_partitions.add(1);
            if metrics.num_spilled_partitions.value() == 1 {
                profile.append_exec_option("Spilled");
            }
        }
        self.is_spilled = true;
        Ok(())
    }

    /// Pin the stream and build the hash table over it. `Ok(false)` leaves
    /// the partition without a table when any allocation along the way does
    /// not fit; the caller then spills it.
    pub(crate) fn build_hash_table(&mut self, ctx: &mut TableBuildContext<'_>) -> Result<bool, String> {
        let _timer = ScopedTimer::new(Arc::clone(&ctx.metrics.build_hash_table_timer));
        let level = self.level;
        let stream = self.build_rows_mut()?;
        if !stream.pin_stream()? {
            return Ok(false);
        }
        ctx.ht_ctx.set_level(level)?;
        let num_rows = stream.num_rows();
        // Bucket count assumes distinct keys. Duplicates only waste bucket
        // memory, which is small next to the pinned build rows.
        let Some(mut table) = JoinHashTable::try_new(Arc::clone(ctx.client), num_rows)? else {
            return Ok(false);
        };
        if !stream.prepare_for_read(false)? {
            return Ok(false);
        }
        let mut row_id: u32 = 0;
        loop {
            let chunk = match self.build_rows_mut()?.get_next()? {
                Some(chunk) => chunk,
                None => break,
            };
            ctx.state.check_cancelled()?;
            ctx.state.check_query_state()?;
            let mut key_arrays = Vec::with_capacity(ctx.build_exprs.len());
            for conjunct in ctx.build_exprs {
                key_arrays.push(conjunct.build_expr.evaluate(&chunk)?);
            }
            let keys = ctx.key_encoder.encode(&key_arrays)?;
            for row in 0..chunk.len() {
                if keys.has_null_key(row) && !ctx.stores_nulls {
                    // A NULL key can never match; keep it out of the table.
                    row_id += 1;
                    continue;
                }
                let hash = ctx.ht_ctx.hash_row(keys.key_bytes(row));
                table.insert(keys.key_bytes(row), hash, row_id)?;
                row_id += 1;
            }
            if !table.refresh_accounting() {
                return Ok(false);
            }
        }
        ctx.metrics.num_hash_buckets.add(table.num_buckets() as i64);
        self.hash_tbl = Some(table);
        self.is_spilled = false;
        Ok(true)
    }

    /// Terminal. With a receiver, still-resident rows are flushed into it so
    /// downstream operators can retain them.
    pub(crate) fn close(&mut self, out: Option<&mut Vec<Chunk>>) {
        if self.closed {
            return;
        }
        self.hash_tbl = None;
        if let Some(mut stream) = self.build_rows.take() {
            stream.close(out);
        }
        self.closed = true;
    }

    #[cfg(test)]
    pub(crate) fn set_level(&mut self, level: i32) {
        self.level = level;
    }

    pub fn debug_string(&self) -> String {
        if self.closed {
            return "<Partition> closed".to_string();
        }
        let mut out = format!(
            "<Partition> level={}{}",
            self.level,
            if self.is_spilled { " spilled" } else { "" }
        );
        if let Some(stream) = self.build_rows.as_ref() {
            out.push_str(&format!(
                " build_rows={} bytes_pinned={}",
                stream.num_rows(),
                stream.bytes_pinned()
            ));
        }
        if let Some(table) = self.hash_tbl.as_ref() {
            out.push_str(&format!(" hash_tbl_rows={}", table.size()));
        }
        out
    }
}
