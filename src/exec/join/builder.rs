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
//! Build side of the partitioned hash join.
//!
//! The builder fans build rows out over `PARTITION_FANOUT` partitions by the
//! high bits of the level hash, spilling the largest partition whenever an
//! append runs out of reservation. After the input is consumed it reserves
//! probe buffers, builds hash tables over the partitions that fit and parks
//! the probe reservation until the probe phase claims it. Spilled partitions
//! come back through `begin_spilled_probe`, which repartitions recursively
//! at the next hash level when a partition's table still does not fit.

use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;

use crate::common::logging::debug;
use crate::exec::chunk::Chunk;
use crate::exec::expr::ScalarEvaluator;
use crate::exec::join::filter::FilterContext;
use crate::exec::join::hash_context::{
    JoinHashContext, KeyEncoder, MAX_PARTITION_DEPTH, PARTITION_FANOUT,
};
use crate::exec::join::partition::{BuilderMetrics, Partition, TableBuildContext};
use crate::exec::join::row_stream::{BuildRowStream, UnpinMode};
use crate::exec::join::{EqJoinConjunct, JoinType};
use crate::exec::runtime_filter::RuntimeFilterDesc;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::{attach_mem_tracker, RuntimeProfile, ScopedTimer, TUnit};
use crate::runtime::reservation::{BufferPoolClient, SavedReservation};
use crate::runtime::runtime_state::{RuntimeFilterMode, RuntimeState};

/// Join-phase states. Transitions outside the listed edges are bugs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashJoinState {
    PartitioningBuild,
    PartitioningProbe,
    ProbingSpilledPartition,
    RepartitioningBuild,
    RepartitioningProbe,
}

impl HashJoinState {
    pub fn as_str(self) -> &'static str {
        match self {
            HashJoinState::PartitioningBuild => "PartitioningBuild",
            HashJoinState::PartitioningProbe => "PartitioningProbe",
            HashJoinState::ProbingSpilledPartition => "ProbingSpilledPartition",
            HashJoinState::RepartitioningBuild => "RepartitioningBuild",
            HashJoinState::RepartitioningProbe => "RepartitioningProbe",
        }
    }
}

/// Index of a partition in the builder's ownership set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionId(pub(crate) usize);

/// Snapshot of the active fanout published to the probe side.
#[derive(Clone, Debug)]
pub struct HashPartitionsView {
    pub level: i32,
    pub partitions: Vec<PartitionId>,
    pub non_empty_build: bool,
}

/// Result of bringing a spilled partition back for probing.
#[derive(Debug)]
pub enum SpilledProbeOutcome {
    /// The partition's hash table fit in memory; probe it directly.
    InMemory { level: i32 },
    /// No probe rows exist; the build rows only need to be read out.
    ProbeOnly { level: i32 },
    /// The table did not fit; the partition was repartitioned into a new
    /// fanout at the next level.
    Repartitioned {
        partitions: HashPartitionsView,
        level: i32,
    },
}

fn prepare_for_read_failed(join_node_id: i32) -> String {
    format!(
        "Memory limit exceeded: Failed to acquire initial read buffer for stream in hash join \
         node {join_node_id}. Reducing query concurrency or increasing the memory limit may help \
         this query to complete successfully."
    )
}

pub struct HashJoinBuilder {
    join_node_id: i32,
    join_node_label: String,
    join_type: JoinType,
    build_schema: SchemaRef,
    spillable_buffer_size: i64,
    max_row_buffer_size: i64,
    client: Arc<BufferPoolClient>,
    profile: RuntimeProfile,
    mem_tracker: Arc<MemTracker>,
    metrics: BuilderMetrics,

    build_exprs: Vec<EqJoinConjunct>,
    filter_ctxs: Vec<FilterContext>,
    ht_ctx: JoinHashContext,
    key_encoder: Option<KeyEncoder>,

    all_partitions: Vec<Partition>,
    hash_partitions: Vec<PartitionId>,
    null_aware_partition: Option<PartitionId>,
    probe_stream_reservation: SavedReservation,
    state: HashJoinState,
    non_empty_build: bool,
    closed: bool,
}

impl HashJoinBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        join_node_id: i32,
        join_node_label: impl Into<String>,
        join_type: JoinType,
        build_schema: SchemaRef,
        state: &RuntimeState,
        client: Arc<BufferPoolClient>,
        spillable_buffer_size: i64,
        max_row_buffer_size: i64,
    ) -> Self {
        let profile = RuntimeProfile::new(format!(
            "Hash Join Builder (join_node_id={join_node_id})"
        ));
        let metrics = BuilderMetrics {
            partitions_created: profile.add_counter("PartitionsCreated", TUnit::Unit),
            largest_partition_percent: profile.add_counter("LargestPartitionPercent", TUnit::Unit),
            max_partition_level: profile.add_counter("MaxPartitionLevel", TUnit::Unit),
            num_build_rows_partitioned: profile.add_counter("BuildRowsPartitioned", TUnit::Unit),
            num_spilled_partitions: profile.add_counter("SpilledPartitions", TUnit::Unit),
            num_repartitions: profile.add_counter("NumRepartitions", TUnit::Unit),
            num_hash_table_builds_skipped: profile
                .add_counter("NumHashTableBuildsSkipped", TUnit::Unit),
            num_hash_buckets: profile.add_counter("NumHashBuckets", TUnit::Unit),
            partition_build_rows_timer: profile.add_timer("BuildRowsPartitionTime"),
            build_hash_table_timer: profile.add_timer("HashTablesBuildTime"),
            repartition_timer: profile.add_timer("RepartitionTime"),
        };
        let mem_tracker = MemTracker::new_child(
            format!("Hash Join Builder (join_node_id={join_node_id})"),
            state.mem_tracker(),
        );
        let ht_ctx = JoinHashContext::new(state.fragment_hash_seed());
        Self {
            join_node_id,
            join_node_label: join_node_label.into(),
            join_type,
            build_schema,
            spillable_buffer_size,
            max_row_buffer_size,
            client,
            profile,
            mem_tracker,
            metrics,
            build_exprs: Vec::new(),
            filter_ctxs: Vec::new(),
            ht_ctx,
            key_encoder: None,
            all_partitions: Vec::new(),
            hash_partitions: Vec::new(),
            null_aware_partition: None,
            probe_stream_reservation: SavedReservation::new(),
            state: HashJoinState::PartitioningBuild,
            non_empty_build: false,
            closed: false,
        }
    }

    /// Register the equality conjuncts and the runtime filters this join
    /// produces. Filter descriptors are gated on the query options.
    pub fn init_exprs_and_filters(
        &mut self,
        state: &RuntimeState,
        eq_join_conjuncts: Vec<EqJoinConjunct>,
        filters: Vec<(RuntimeFilterDesc, Box<dyn ScalarEvaluator>)>,
    ) -> Result<(), String> {
        self.build_exprs = eq_join_conjuncts;
        for (desc, expr_eval) in filters {
            let options = state.query_options();
            debug_assert!(
                options.runtime_filter_mode == RuntimeFilterMode::Global
                    || desc.is_broadcast_join
                    || options.num_nodes == 1,
                "filter {} not producible under the current filter mode",
                desc.filter_id
            );
            debug_assert!(
                !options.disable_row_runtime_filtering || desc.applied_on_partition_columns,
                "row runtime filtering is disabled for filter {}",
                desc.filter_id
            );
            state.filter_bank().register_filter(desc.clone())?;
            self.filter_ctxs.push(FilterContext::new(desc, expr_eval));
        }
        Ok(())
    }

    /// Create the level-0 fanout and the filter scratch summaries. The
    /// null-aware variant also gets its auxiliary partition here.
    pub fn open(&mut self, state: &RuntimeState) -> Result<(), String> {
        if self.closed {
            return Err("hash join builder is closed".to_string());
        }
        if !self.hash_partitions.is_empty() {
            return Err("hash join builder is already open".to_string());
        }
        if self.key_encoder.is_none() {
            let mut key_types = Vec::with_capacity(self.build_exprs.len());
            for conjunct in &self.build_exprs {
                key_types.push(conjunct.build_expr.data_type(self.build_schema.as_ref())?);
            }
            self.key_encoder = Some(KeyEncoder::try_new(&key_types)?);
        }
        self.create_hash_partitions(state, 0)?;
        self.allocate_runtime_filters(state)?;
        if self.join_type == JoinType::NullAwareLeftAnti {
            let pid = self.create_and_prepare_partition(state, 0)?;
            self.null_aware_partition = Some(pid);
        }
        debug!(
            "hash join build open: node_id={} join_type={} build_keys={} runtime_filters={}",
            self.join_node_id,
            self.join_type.as_str(),
            self.build_exprs.len(),
            self.filter_ctxs.len()
        );
        Ok(())
    }

    /// Partition one chunk of build rows into the active fanout.
    pub fn send(&mut self, state: &RuntimeState, chunk: &Chunk) -> Result<(), String> {
        let _timer = ScopedTimer::new(Arc::clone(&self.metrics.partition_build_rows_timer));
        let build_filters = self.ht_ctx.level() == 0 && !self.filter_ctxs.is_empty();
        let is_null_aware = self.join_type == JoinType::NullAwareLeftAnti;
        self.process_build_chunk(state, chunk, build_filters, is_null_aware)?;
        self.metrics
            .num_build_rows_partitioned
            .add(chunk.len() as i64);
        Ok(())
    }

    fn process_build_chunk(
        &mut self,
        _state: &RuntimeState,
        chunk: &Chunk,
        build_filters: bool,
        is_null_aware: bool,
    ) -> Result<(), String> {
        if chunk.is_empty() {
            return Ok(());
        }
        let mut key_arrays = Vec::with_capacity(self.build_exprs.len());
        for conjunct in &self.build_exprs {
            key_arrays.push(conjunct.build_expr.evaluate(chunk)?);
        }
        let key_encoder = self
            .key_encoder
            .as_ref()
            .ok_or_else(|| "hash join builder is not open".to_string())?;
        let keys = key_encoder.encode(&key_arrays)?;
        drop(key_arrays);

        let mut targets = Vec::with_capacity(chunk.len());
        for row in 0..chunk.len() {
            if is_null_aware && keys.has_null_key(row) {
                let pid = self
                    .null_aware_partition
                    .ok_or_else(|| "null-aware partition is missing".to_string())?;
                targets.push(pid);
            } else {
                let hash = self.ht_ctx.hash_row(keys.key_bytes(row));
                targets.push(self.hash_partitions[JoinHashContext::partition_index(hash)]);
            }
        }
        for (row, pid) in targets.into_iter().enumerate() {
            self.append_row(pid, &chunk.batch, row)?;
        }
        if build_filters {
            for ctx in &mut self.filter_ctxs {
                ctx.insert(chunk)?;
            }
        }
        Ok(())
    }

    /// Append with the spill-on-OOM fallback: keep spilling victims until
    /// the row fits. Spilling one partition does not guarantee the append
    /// succeeds, so this loops.
    fn append_row(&mut self, pid: PartitionId, batch: &RecordBatch, row: usize) -> Result<(), String> {
        loop {
            let appended = self.all_partitions[pid.0]
                .build_rows_mut()?
                .add_row(batch, row)?;
            if appended {
                return Ok(());
            }
            self.spill_partition(UnpinMode::UnpinAllExceptCurrent)?;
        }
    }

    /// Finish the current build input: publish filters (level 0 only),
    /// build hash tables, reserve probe buffers and move to the probe state.
    pub fn finalize(&mut self, state: &RuntimeState) -> Result<(), String> {
        let mut num_build_rows: i64 = 0;
        for &pid in &self.hash_partitions {
            num_build_rows += self.all_partitions[pid.0].num_rows();
        }
        if num_build_rows > 0 {
            let mut largest: i64 = 0;
            for &pid in &self.hash_partitions {
                largest = largest.max(self.all_partitions[pid.0].num_rows());
            }
            self.metrics
                .largest_partition_percent
                .update_max(largest * 100 / num_build_rows);
        }
        debug!(
            "hash join build (node_id={}) partitioned {} rows at level {}: {}",
            self.join_node_id,
            num_build_rows,
            self.ht_ctx.level(),
            self.debug_string()
        );

        if self.ht_ctx.level() == 0 {
            self.publish_runtime_filters(state, num_build_rows)?;
            self.non_empty_build |= num_build_rows > 0;
        }

        if let Some(pid) = self.null_aware_partition {
            if self.all_partitions[pid.0].is_spilled() {
                // Its tail pages are no longer needed in core; free them for
                // the hash tables of the other partitions.
                let (metrics, profile) = (&self.metrics, &self.profile);
                self.all_partitions[pid.0].spill(UnpinMode::UnpinAll, metrics, profile)?;
            }
        }

        self.build_hash_tables_and_reserve_probe_buffers(state)?;
        match self.state {
            HashJoinState::PartitioningBuild => self.update_state(HashJoinState::PartitioningProbe),
            _ => {
                debug_assert_eq!(self.state, HashJoinState::RepartitioningBuild);
                self.update_state(HashJoinState::RepartitioningProbe);
            }
        }
        Ok(())
    }

    /// Release every partition and return parked reservation to the client.
    pub fn close(&mut self, _state: &RuntimeState) {
        if self.closed {
            return;
        }
        self.close_and_delete_partitions(None);
        let leftover = self.probe_stream_reservation.get();
        if leftover > 0 {
            let _ = self
                .client
                .restore_reservation(&self.probe_stream_reservation, leftover);
        }
        attach_mem_tracker(&self.profile, &self.mem_tracker);
        self.closed = true;
    }

    /// Return to `PartitioningBuild` for the next build input. The parked
    /// probe reservation must already have been claimed.
    pub fn reset(&mut self, out: Option<&mut Vec<Chunk>>) {
        debug_assert_eq!(0, self.probe_stream_reservation.get());
        self.state = HashJoinState::PartitioningBuild;
        self.non_empty_build = false;
        self.close_and_delete_partitions(out);
    }

    fn update_state(&mut self, next: HashJoinState) {
        let valid = match self.state {
            HashJoinState::PartitioningBuild => next == HashJoinState::PartitioningProbe,
            HashJoinState::PartitioningProbe
            | HashJoinState::RepartitioningProbe
            | HashJoinState::ProbingSpilledPartition => {
                next == HashJoinState::RepartitioningBuild
                    || next == HashJoinState::ProbingSpilledPartition
            }
            HashJoinState::RepartitioningBuild => next == HashJoinState::RepartitioningProbe,
        };
        assert!(
            valid,
            "invalid hash join state transition: {} -> {}",
            self.state.as_str(),
            next.as_str()
        );
        self.state = next;
        debug!(
            "hash join build (node_id={}) transitioned to {}",
            self.join_node_id,
            next.as_str()
        );
    }

    fn create_and_prepare_partition(
        &mut self,
        state: &RuntimeState,
        level: i32,
    ) -> Result<PartitionId, String> {
        let stream = BuildRowStream::new(
            self.join_node_label.clone(),
            self.build_schema.clone(),
            Arc::clone(&self.client),
            Arc::clone(&self.mem_tracker),
            Arc::clone(state.spill_manager()),
            self.spillable_buffer_size,
            self.max_row_buffer_size,
        );
        let mut partition = Partition::new(level, stream);
        let got_buffer = partition.build_rows_mut()?.prepare_for_write()?;
        if !got_buffer {
            return Err(format!(
                "insufficient reservation for initial write buffer in hash join {}: {}",
                self.join_node_id,
                self.client.debug_string()
            ));
        }
        self.all_partitions.push(partition);
        Ok(PartitionId(self.all_partitions.len() - 1))
    }

    fn create_hash_partitions(&mut self, state: &RuntimeState, level: i32) -> Result<(), String> {
        debug_assert!(self.hash_partitions.is_empty());
        self.ht_ctx.set_level(level)?;
        for _ in 0..PARTITION_FANOUT {
            let pid = self.create_and_prepare_partition(state, level)?;
            self.hash_partitions.push(pid);
        }
        self.metrics.partitions_created.add(PARTITION_FANOUT as i64);
        self.metrics.max_partition_level.update_max(level as i64);
        Ok(())
    }

    /// Greedy victim selection: the null-aware partition first when it is
    /// spillable (it is probed last, so spilling it does not bottleneck
    /// near-term work); otherwise the partition freeing the most memory.
    fn spill_partition(&mut self, mode: UnpinMode) -> Result<PartitionId, String> {
        debug_assert_eq!(self.hash_partitions.len(), PARTITION_FANOUT);
        let mut best: Option<PartitionId> = None;
        if let Some(pid) = self.null_aware_partition {
            if self.all_partitions[pid.0].can_spill() {
                best = Some(pid);
            }
        }
        if best.is_none() {
            let mut max_freed_mem: i64 = 0;
            for &pid in &self.hash_partitions {
                let partition = &self.all_partitions[pid.0];
                if !partition.can_spill() {
                    continue;
                }
                let mut mem = partition
                    .build_rows()
                    .map(|s| s.bytes_pinned())
                    .unwrap_or(0);
                if let Some(table) = partition.hash_tbl() {
                    // Tables never hold match info during build phases,
                    // which is the only time spilling happens.
                    debug_assert!(!table.has_matches());
                    mem += table.byte_size();
                }
                if mem > max_freed_mem {
                    max_freed_mem = mem;
                    best = Some(pid);
                }
            }
        }
        let Some(pid) = best else {
            return Err(format!(
                "Internal error: could not find a partition to spill in hash join {}: \n{}\nClient:\n{}",
                self.join_node_id,
                self.debug_string(),
                self.client.debug_string()
            ));
        };
        debug!(
            "hash join build (node_id={}) spilling partition: {}",
            self.join_node_id,
            self.all_partitions[pid.0].debug_string()
        );
        let (metrics, profile) = (&self.metrics, &self.profile);
        self.all_partitions[pid.0].spill(mode, metrics, profile)?;
        Ok(pid)
    }

    // All build rows of the current input are partitioned at this point, but
    // hash tables still need to be built. Probe buffers are reserved before
    // any table is built: reserving them can force more partitions to spill,
    // and building a table first would waste that work.
    //
    // Afterwards every partition either has a hash table or is spilled.
    // Keep-vs-spill is a 0-1 knapsack (value: IO saved, weight: bytes
    // freed); the greedy policy below is the contract.
    fn build_hash_tables_and_reserve_probe_buffers(
        &mut self,
        state: &RuntimeState,
    ) -> Result<(), String> {
        debug_assert_eq!(self.hash_partitions.len(), PARTITION_FANOUT);
        for &pid in &self.hash_partitions.clone() {
            let partition = &mut self.all_partitions[pid.0];
            if partition.num_rows() == 0 {
                partition.close(None);
            } else if partition.is_spilled() {
                // No build-side data of a spilled partition is needed in
                // memory before its own probe pass.
                partition.build_rows_mut()?.unpin_stream(UnpinMode::UnpinAll)?;
            }
        }

        let input_is_spilled = self.ht_ctx.level() > 0;
        self.reserve_probe_buffers(input_is_spilled)?;

        for pid in self.hash_partitions.clone() {
            {
                let partition = &self.all_partitions[pid.0];
                if partition.is_closed() || partition.is_spilled() {
                    continue;
                }
                debug_assert!(partition
                    .build_rows()
                    .map(|s| s.is_pinned())
                    .unwrap_or(false));
            }
            let built = self.build_partition_hash_table(state, pid)?;
            if !built {
                let (metrics, profile) = (&self.metrics, &self.profile);
                self.all_partitions[pid.0].spill(UnpinMode::UnpinAll, metrics, profile)?;
            }
        }
        // Building tables may have spilled more partitions; those need probe
        // buffers too.
        self.reserve_probe_buffers(input_is_spilled)?;
        Ok(())
    }

    fn build_partition_hash_table(
        &mut self,
        state: &RuntimeState,
        pid: PartitionId,
    ) -> Result<bool, String> {
        let stores_nulls = self.hash_table_stores_nulls();
        let key_encoder = self
            .key_encoder
            .as_ref()
            .ok_or_else(|| "hash join builder is not open".to_string())?;
        let mut ctx = TableBuildContext {
            state,
            ht_ctx: &mut self.ht_ctx,
            key_encoder,
            build_exprs: &self.build_exprs,
            stores_nulls,
            client: &self.client,
            metrics: &self.metrics,
        };
        self.all_partitions[pid.0].build_hash_table(&mut ctx)
    }

    /// One probe write buffer per spilled partition, plus one read buffer
    /// when this build's input is itself a spilled partition. Spills more
    /// partitions until the reservation fits, then parks it.
    fn reserve_probe_buffers(&mut self, input_is_spilled: bool) -> Result<(), String> {
        debug_assert_eq!(self.hash_partitions.len(), PARTITION_FANOUT);
        let num_probe_streams =
            self.num_spilled_partitions() as i64 + if input_is_spilled { 1 } else { 0 };
        let per_stream = self.spillable_buffer_size;
        let mut addtl_reservation =
            num_probe_streams * per_stream - self.probe_stream_reservation.get();
        while addtl_reservation > self.client.unused_reservation() {
            let spilled = self.spill_partition(UnpinMode::UnpinAll)?;
            // The null-aware partition never gets a probe stream.
            if Some(spilled) != self.null_aware_partition {
                addtl_reservation += per_stream;
            }
        }
        if addtl_reservation > 0 {
            self.client
                .save_reservation(&self.probe_stream_reservation, addtl_reservation)?;
        }
        Ok(())
    }

    fn num_spilled_partitions(&self) -> usize {
        self.hash_partitions
            .iter()
            .filter(|pid| {
                let p = &self.all_partitions[pid.0];
                !p.is_closed() && p.is_spilled()
            })
            .count()
    }

    fn transfer_probe_stream_reservation(
        &mut self,
        probe_client: &Arc<BufferPoolClient>,
    ) -> Result<(), String> {
        // An extra buffer is needed for reading a spilled input stream,
        // unless this is the initial partitioning pass.
        let num_buffers = self.num_spilled_partitions() as i64
            + if self.state == HashJoinState::PartitioningProbe {
                0
            } else {
                1
            };
        let saved = self.probe_stream_reservation.get();
        debug_assert!(saved >= self.spillable_buffer_size * num_buffers);
        if saved > 0 {
            probe_client.restore_reservation(&self.probe_stream_reservation, saved)?;
        }
        Ok(())
    }

    /// Precondition: `PartitioningProbe`. Hands the parked probe reservation
    /// to the probe client and exposes the fanout.
    pub fn begin_initial_probe(
        &mut self,
        probe_client: &Arc<BufferPoolClient>,
    ) -> Result<HashPartitionsView, String> {
        assert_eq!(self.state, HashJoinState::PartitioningProbe);
        assert_eq!(self.hash_partitions.len(), PARTITION_FANOUT);
        self.transfer_probe_stream_reservation(probe_client)?;
        Ok(self.hash_partitions_view())
    }

    /// Bring a spilled partition back for probing: either its hash table
    /// fits now, or it is repartitioned into a fresh fanout one level down.
    pub fn begin_spilled_probe(
        &mut self,
        state: &RuntimeState,
        empty_probe: bool,
        pid: PartitionId,
        probe_client: &Arc<BufferPoolClient>,
    ) -> Result<SpilledProbeOutcome, String> {
        assert!(self.all_partitions[pid.0].is_spilled());
        assert!(self.hash_partitions.is_empty());
        let level = self.all_partitions[pid.0].level();

        if empty_probe {
            // No probe rows exist, so the table is never needed; this is
            // only reachable when unmatched build rows must be emitted,
            // otherwise the partition would have been closed already.
            debug_assert!(self.join_type.needs_unmatched_build_rows());
            let got_buffer = self.all_partitions[pid.0]
                .build_rows_mut()?
                .prepare_for_read(true)?;
            if !got_buffer {
                return Err(prepare_for_read_failed(self.join_node_id));
            }
            self.metrics.num_hash_table_builds_skipped.add(1);
            self.update_state(HashJoinState::ProbingSpilledPartition);
            return Ok(SpilledProbeOutcome::ProbeOnly { level });
        }

        // Set aside the probe-read buffer before building so the table
        // cannot eat the memory the probe stream will need.
        self.client
            .save_reservation(&self.probe_stream_reservation, self.spillable_buffer_size)?;

        let built = self.build_partition_hash_table(state, pid)?;
        if built {
            self.transfer_probe_stream_reservation(probe_client)?;
            self.update_state(HashJoinState::ProbingSpilledPartition);
            return Ok(SpilledProbeOutcome::InMemory { level });
        }

        // Still does not fit; repartition one level down.
        self.update_state(HashJoinState::RepartitioningBuild);
        let next_level = level + 1;
        if next_level >= MAX_PARTITION_DEPTH {
            return Err(format!(
                "Cannot perform hash join at node with id {}. The input data was partitioned the \
                 maximum number of {} times. This could mean there is significant skew in the data \
                 or the memory limit is set too low.",
                self.join_node_id, MAX_PARTITION_DEPTH
            ));
        }

        // Free the table and pinned pages for the new fanout, and lend the
        // parked probe buffer to the repartition pass; it re-reserves as
        // much as the new spilled set needs.
        {
            let (metrics, profile) = (&self.metrics, &self.profile);
            self.all_partitions[pid.0].spill(UnpinMode::UnpinAll, metrics, profile)?;
        }
        self.client
            .restore_reservation(&self.probe_stream_reservation, self.spillable_buffer_size)?;

        debug_assert_eq!(
            self.all_partitions[pid.0]
                .build_rows()
                .map(|s| s.bytes_pinned())
                .unwrap_or(0),
            0
        );
        let num_input_rows = self.all_partitions[pid.0].num_rows();
        self.repartition_build_input(state, pid)?;

        let largest_partition_rows = self.largest_partition_rows();
        debug_assert!(
            num_input_rows >= largest_partition_rows,
            "a partition cannot hold more rows than its input"
        );
        if num_input_rows == largest_partition_rows {
            return Err(format!(
                "Cannot perform hash join at node with id {}. Repartitioning did not reduce the \
                 size of a spilled partition. Repartitioning level {}. Number of rows {}:\n{}\n{}",
                self.join_node_id,
                next_level,
                num_input_rows,
                self.debug_string(),
                self.client.debug_string()
            ));
        }
        self.transfer_probe_stream_reservation(probe_client)?;
        Ok(SpilledProbeOutcome::Repartitioned {
            partitions: self.hash_partitions_view(),
            level: self.ht_ctx.level(),
        })
    }

    /// Stream a spilled partition's rows through the normal `send()` path
    /// into a fresh fanout at the next level.
    fn repartition_build_input(
        &mut self,
        state: &RuntimeState,
        input: PartitionId,
    ) -> Result<(), String> {
        let new_level = self.all_partitions[input.0].level() + 1;
        debug_assert!(new_level >= 1);
        let _timer = ScopedTimer::new(Arc::clone(&self.metrics.repartition_timer));
        self.metrics.num_repartitions.add(1);

        let got_buffer = self.all_partitions[input.0]
            .build_rows_mut()?
            .prepare_for_read(true)?;
        if !got_buffer {
            return Err(prepare_for_read_failed(self.join_node_id));
        }
        self.create_hash_partitions(state, new_level)?;

        loop {
            state.check_cancelled()?;
            state.check_query_state()?;
            let chunk = match self.all_partitions[input.0].build_rows_mut()?.get_next()? {
                Some(chunk) => chunk,
                None => break,
            };
            self.send(state, &chunk)?;
        }

        self.all_partitions[input.0].close(None);
        self.finalize(state)
    }

    fn largest_partition_rows(&self) -> i64 {
        let mut max_rows = 0;
        for &pid in &self.hash_partitions {
            let partition = &self.all_partitions[pid.0];
            if partition.is_closed() {
                continue;
            }
            max_rows = max_rows.max(partition.num_rows());
        }
        max_rows
    }

    /// Release the fanout after a probe pass. Spilled partitions survive
    /// when retained by the mask; in-memory partitions survive when the
    /// join still owes their unmatched rows.
    pub fn done_probing_hash_partitions(
        &mut self,
        retain_partition: &[bool],
        output_partitions: &mut Vec<PartitionId>,
        mut batch: Option<&mut Vec<Chunk>>,
    ) {
        debug_assert!(output_partitions.is_empty());
        debug_assert_eq!(retain_partition.len(), self.hash_partitions.len());
        for (i, &pid) in self.hash_partitions.clone().iter().enumerate() {
            let partition = &mut self.all_partitions[pid.0];
            if partition.is_closed() {
                continue;
            }
            if partition.is_spilled() {
                debug_assert!(partition.hash_tbl().is_none());
                debug_assert_eq!(
                    partition.build_rows().map(|s| s.bytes_pinned()).unwrap_or(0),
                    0,
                    "spilled partitions were fully unpinned after the build"
                );
                if !retain_partition[i] {
                    self.metrics.num_hash_table_builds_skipped.add(1);
                    partition.close(None);
                }
            } else if self.join_type.needs_unmatched_build_rows() {
                output_partitions.push(pid);
            } else {
                partition.close(batch.as_deref_mut());
            }
        }
        self.hash_partitions.clear();
    }

    /// Counterpart of `done_probing_hash_partitions` for one spilled
    /// partition brought back via `begin_spilled_probe`.
    pub fn done_probing_single_partition(
        &mut self,
        pid: PartitionId,
        output_partitions: &mut Vec<PartitionId>,
        batch: Option<&mut Vec<Chunk>>,
    ) {
        if self.join_type.needs_unmatched_build_rows() {
            output_partitions.push(pid);
        } else if self.join_type.is_left_semi() {
            self.all_partitions[pid.0].close(None);
        } else {
            self.all_partitions[pid.0].close(batch);
        }
    }

    fn close_and_delete_partitions(&mut self, mut out: Option<&mut Vec<Chunk>>) {
        for partition in &mut self.all_partitions {
            partition.close(out.as_deref_mut());
        }
        self.all_partitions.clear();
        self.hash_partitions.clear();
        self.null_aware_partition = None;
    }

    fn allocate_runtime_filters(&mut self, state: &RuntimeState) -> Result<(), String> {
        debug_assert!(
            self.join_type != JoinType::NullAwareLeftAnti || self.filter_ctxs.is_empty(),
            "runtime filters are not supported with NULL_AWARE_LEFT_ANTI joins"
        );
        for ctx in &mut self.filter_ctxs {
            ctx.allocate(state.filter_bank())?;
        }
        Ok(())
    }

    /// Publish each filter at the end of level 0. A Bloom filter whose
    /// predicted false-positive rate over `num_build_rows` is too high
    /// publishes the always-true sentinel instead: a high-FP filter costs
    /// coordinator CPU and scan work without pruning anything. The row count
    /// is a poor NDV proxy for multi-column expressions.
    fn publish_runtime_filters(
        &mut self,
        state: &RuntimeState,
        num_build_rows: i64,
    ) -> Result<(), String> {
        if self.filter_ctxs.is_empty() {
            return Ok(());
        }
        let bank = state.filter_bank();
        let mut num_enabled_filters: usize = 0;
        for ctx in &mut self.filter_ctxs {
            let mut bloom = None;
            if ctx.local_bloom.is_some() {
                if bank.fp_rate_too_high(ctx.desc.filter_size_bytes, num_build_rows) {
                    ctx.local_bloom = None;
                } else {
                    bloom = ctx.local_bloom.take();
                    num_enabled_filters += 1;
                }
            } else if let Some(min_max) = ctx.local_min_max.as_ref() {
                if !min_max.always_true() {
                    num_enabled_filters += 1;
                }
            }
            bank.update_filter_from_local(ctx.desc.filter_id, bloom, ctx.local_min_max.take())?;
        }

        let total = self.filter_ctxs.len();
        let plural = if total == 1 { "" } else { "s" };
        let info_string = if num_enabled_filters == total {
            format!("{total} of {total} Runtime Filter{plural} Published")
        } else {
            format!(
                "{num_enabled_filters} of {total} Runtime Filter{plural} Published, {} Disabled",
                total - num_enabled_filters
            )
        };
        self.profile.add_info_string("Runtime filters", info_string);
        Ok(())
    }

    fn hash_table_stores_nulls(&self) -> bool {
        self.join_type == JoinType::RightOuter
            || self.join_type == JoinType::RightAnti
            || self.join_type == JoinType::FullOuter
            || self.build_exprs.iter().any(|c| c.is_not_distinct_from)
    }

    fn hash_partitions_view(&self) -> HashPartitionsView {
        HashPartitionsView {
            level: self.ht_ctx.level(),
            partitions: self.hash_partitions.clone(),
            non_empty_build: self.non_empty_build,
        }
    }

    pub fn state(&self) -> HashJoinState {
        self.state
    }

    pub fn non_empty_build(&self) -> bool {
        self.non_empty_build
    }

    pub fn num_hash_partitions(&self) -> usize {
        self.hash_partitions.len()
    }

    pub fn hash_partitions(&self) -> &[PartitionId] {
        &self.hash_partitions
    }

    pub fn null_aware_partition(&self) -> Option<PartitionId> {
        self.null_aware_partition
    }

    pub fn partition(&self, pid: PartitionId) -> &Partition {
        &self.all_partitions[pid.0]
    }

    pub fn probe_stream_reservation(&self) -> i64 {
        self.probe_stream_reservation.get()
    }

    pub fn profile(&self) -> &RuntimeProfile {
        &self.profile
    }

    pub fn debug_string(&self) -> String {
        let mut out = format!(
            "HashJoinBuilder state={} hash partitions: {}:\n",
            self.state.as_str(),
            self.hash_partitions.len()
        );
        for (i, &pid) in self.hash_partitions.iter().enumerate() {
            out.push_str(&format!(
                "  Hash partition {i} {}\n",
                self.all_partitions[pid.0].debug_string()
            ));
        }
        if let Some(pid) = self.null_aware_partition {
            out.push_str(&format!(
                "  Null-aware partition: {}\n",
                self.all_partitions[pid.0].debug_string()
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::expr::ColumnRef;
    use crate::runtime::runtime_state::QueryOptions;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};

    const PAGE: i64 = 4096;

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, true),
            Field::new("v", DataType::Utf8, true),
        ]))
    }

    fn test_chunk(keys: &[i64]) -> Chunk {
        let values: Vec<String> = keys.iter().map(|k| format!("payload-{k:032}")).collect();
        Chunk::new(
            RecordBatch::try_new(
                test_schema(),
                vec![
                    Arc::new(Int64Array::from(keys.to_vec())),
                    Arc::new(StringArray::from(values)),
                ],
            )
            .unwrap(),
        )
    }

    fn test_builder(
        state: &RuntimeState,
        reservation: i64,
        join_type: JoinType,
    ) -> (Arc<BufferPoolClient>, HashJoinBuilder) {
        let client = Arc::new(BufferPoolClient::new("join-build", reservation));
        let mut builder = HashJoinBuilder::new(
            1,
            "HASH_JOIN_NODE (id=1)",
            join_type,
            test_schema(),
            state,
            Arc::clone(&client),
            PAGE,
            64 * PAGE,
        );
        builder
            .init_exprs_and_filters(
                state,
                vec![EqJoinConjunct {
                    build_expr: Box::new(ColumnRef::new(0)),
                    is_not_distinct_from: false,
                }],
                Vec::new(),
            )
            .unwrap();
        (client, builder)
    }

    #[test]
    #[should_panic(expected = "invalid hash join state transition")]
    fn invalid_state_transition_is_fatal() {
        let state = RuntimeState::new(QueryOptions::default(), None).unwrap();
        let (_client, mut builder) = test_builder(&state, 1 << 24, JoinType::Inner);
        // PartitioningBuild can only move to PartitioningProbe.
        builder.update_state(HashJoinState::RepartitioningProbe);
    }

    #[test]
    fn depth_bound_is_a_user_visible_error() {
        let state = RuntimeState::new(QueryOptions::default(), None).unwrap();
        let (client, mut builder) = test_builder(&state, 18 * PAGE, JoinType::Inner);
        builder.open(&state).unwrap();
        let keys: Vec<i64> = (0..2000).collect();
        for chunk in keys.chunks(256) {
            builder.send(&state, &test_chunk(chunk)).unwrap();
        }
        builder.finalize(&state).unwrap();
        builder.begin_initial_probe(&client).unwrap();

        let retain = vec![true; PARTITION_FANOUT];
        let mut out = Vec::new();
        builder.done_probing_hash_partitions(&retain, &mut out, None);
        let spilled: Vec<PartitionId> = (0..builder.all_partitions.len())
            .map(PartitionId)
            .filter(|pid| {
                let p = builder.partition(*pid);
                !p.is_closed() && p.is_spilled()
            })
            .collect();
        assert!(!spilled.is_empty());
        let pid = spilled[0];
        builder.all_partitions[pid.0].set_level(MAX_PARTITION_DEPTH - 1);

        // Squeeze the budget so the partition's hash table cannot be built;
        // the only way forward would be repartitioning past the depth bound.
        assert!(client.try_consume(17 * PAGE));
        let err = builder
            .begin_spilled_probe(&state, false, pid, &client)
            .unwrap_err();
        assert!(
            err.contains("partitioned the maximum number"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn spill_with_no_victim_is_internal_error() {
        let state = RuntimeState::new(QueryOptions::default(), None).unwrap();
        let (_client, mut builder) = test_builder(&state, 1 << 24, JoinType::Inner);
        builder.open(&state).unwrap();
        for &pid in &builder.hash_partitions.clone() {
            let (metrics, profile) = (&builder.metrics, &builder.profile);
            builder.all_partitions[pid.0]
                .spill(UnpinMode::UnpinAllExceptCurrent, metrics, profile)
                .unwrap();
        }
        let err = builder
            .spill_partition(UnpinMode::UnpinAllExceptCurrent)
            .unwrap_err();
        assert!(err.contains("could not find a partition to spill"));
    }
}
