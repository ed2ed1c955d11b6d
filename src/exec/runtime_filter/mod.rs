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
pub mod bloom;
pub mod min_max;

pub use bloom::BloomFilter;
pub use min_max::{MinMaxFilter, MinMaxValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeFilterType {
    Bloom,
    MinMax,
}

/// Planner-assigned description of a runtime filter this join produces.
#[derive(Clone, Debug)]
pub struct RuntimeFilterDesc {
    pub filter_id: i32,
    pub filter_type: RuntimeFilterType,
    /// Bloom bitmap size in bytes; ignored for min/max filters.
    pub filter_size_bytes: i64,
    pub is_broadcast_join: bool,
    pub applied_on_partition_columns: bool,
}

/// A published build-side summary, as seen by upstream scans.
///
/// `AlwaysTrue` is the sentinel published in place of a summary whose
/// predicted false-positive rate is too high to justify its cost.
#[derive(Clone, Debug)]
pub enum RuntimeFilter {
    AlwaysTrue,
    Bloom(BloomFilter),
    MinMax(MinMaxFilter),
}

impl RuntimeFilter {
    pub fn is_always_true(&self) -> bool {
        matches!(self, RuntimeFilter::AlwaysTrue)
    }
}
