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
//! Shared fixtures for the join build integration tests.

use std::sync::Arc;

use arrow::array::{Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

use spilljoin::exec::chunk::Chunk;
use spilljoin::exec::expr::{ColumnRef, ScalarEvaluator};
use spilljoin::exec::runtime_filter::RuntimeFilterDesc;
use spilljoin::runtime::reservation::BufferPoolClient;
use spilljoin::runtime::runtime_state::RuntimeState;
use spilljoin::{EqJoinConjunct, HashJoinBuilder, JoinType, PartitionId};

pub const PAGE: i64 = 4096;
pub const NODE_ID: i32 = 3;

pub fn test_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, true),
        Field::new("v", DataType::Utf8, true),
    ]))
}

pub fn chunk_of(keys: &[Option<i64>]) -> Chunk {
    let values: Vec<Option<String>> = keys
        .iter()
        .map(|k| k.map(|k| format!("build-row-payload-{k:020}")))
        .collect();
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

pub fn chunk_of_keys(keys: &[i64]) -> Chunk {
    let keys: Vec<Option<i64>> = keys.iter().copied().map(Some).collect();
    chunk_of(&keys)
}

pub fn send_keys(builder: &mut HashJoinBuilder, state: &RuntimeState, keys: &[i64]) {
    for batch in keys.chunks(500) {
        builder.send(state, &chunk_of_keys(batch)).unwrap();
    }
}

pub fn make_builder(
    state: &RuntimeState,
    reservation: i64,
    join_type: JoinType,
    filters: Vec<RuntimeFilterDesc>,
) -> (Arc<BufferPoolClient>, HashJoinBuilder) {
    let client = Arc::new(BufferPoolClient::new("join-build", reservation));
    let mut builder = HashJoinBuilder::new(
        NODE_ID,
        format!("HASH_JOIN_NODE (id={NODE_ID})"),
        join_type,
        test_schema(),
        state,
        Arc::clone(&client),
        PAGE,
        64 * PAGE,
    );
    let filters = filters
        .into_iter()
        .map(|desc| (desc, Box::new(ColumnRef::new(0)) as Box<dyn ScalarEvaluator>))
        .collect();
    builder
        .init_exprs_and_filters(
            state,
            vec![EqJoinConjunct {
                build_expr: Box::new(ColumnRef::new(0)),
                is_not_distinct_from: false,
            }],
            filters,
        )
        .unwrap();
    (client, builder)
}

pub fn counter(builder: &HashJoinBuilder, name: &str) -> i64 {
    builder
        .profile()
        .counter(name)
        .map(|c| c.value())
        .unwrap_or(0)
}

pub fn live_partitions(builder: &HashJoinBuilder, pids: &[PartitionId]) -> Vec<PartitionId> {
    pids.iter()
        .copied()
        .filter(|pid| !builder.partition(*pid).is_closed())
        .collect()
}

pub fn total_rows(builder: &HashJoinBuilder, pids: &[PartitionId]) -> i64 {
    pids.iter()
        .map(|pid| builder.partition(*pid).num_rows())
        .sum()
}
