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
//! Process-wide runtime-filter registry.
//!
//! Producers register filter descriptors, allocate scratch summaries while
//! build rows flow, and publish the finished filter (or the always-true
//! sentinel) once. Scans read published filters independently.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::exec::runtime_filter::{
    bloom, BloomFilter, MinMaxFilter, RuntimeFilter, RuntimeFilterDesc, RuntimeFilterType,
};

/// Publishing a Bloom filter whose predicted false-positive rate exceeds
/// this ceiling costs coordinator CPU and scan-time work without benefit.
const MAX_FP_RATE: f64 = 0.75;

#[derive(Debug)]
struct BankEntry {
    desc: RuntimeFilterDesc,
    published: Option<RuntimeFilter>,
}

#[derive(Debug, Default)]
pub struct RuntimeFilterBank {
    filters: Mutex<HashMap<i32, BankEntry>>,
}

impl RuntimeFilterBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_filter(&self, desc: RuntimeFilterDesc) -> Result<(), String> {
        let mut guard = self.filters.lock().unwrap_or_else(|e| e.into_inner());
        if guard.contains_key(&desc.filter_id) {
            return Err(format!(
                "runtime filter {} is already registered",
                desc.filter_id
            ));
        }
        guard.insert(
            desc.filter_id,
            BankEntry {
                desc,
                published: None,
            },
        );
        Ok(())
    }

    pub fn allocate_scratch_bloom(&self, filter_id: i32) -> Result<BloomFilter, String> {
        let guard = self.filters.lock().unwrap_or_else(|e| e.into_inner());
        let entry = guard
            .get(&filter_id)
            .ok_or_else(|| format!("runtime filter {filter_id} is not registered"))?;
        if entry.desc.filter_type != RuntimeFilterType::Bloom {
            return Err(format!("runtime filter {filter_id} is not a bloom filter"));
        }
        Ok(BloomFilter::with_size_bytes(entry.desc.filter_size_bytes))
    }

    pub fn allocate_scratch_min_max(&self, filter_id: i32) -> Result<MinMaxFilter, String> {
        let guard = self.filters.lock().unwrap_or_else(|e| e.into_inner());
        let entry = guard
            .get(&filter_id)
            .ok_or_else(|| format!("runtime filter {filter_id} is not registered"))?;
        if entry.desc.filter_type != RuntimeFilterType::MinMax {
            return Err(format!(
                "runtime filter {filter_id} is not a min/max filter"
            ));
        }
        Ok(MinMaxFilter::new())
    }

    /// Estimate the false-positive rate of a Bloom filter of `filter_size`
    /// bytes over `observed_ndv` values. `observed_ndv` is usually the build
    /// row count, which overestimates the NDV when keys repeat.
    pub fn fp_rate_too_high(&self, filter_size: i64, observed_ndv: i64) -> bool {
        bloom::estimated_fp_rate(filter_size, observed_ndv) > MAX_FP_RATE
    }

    /// Publish the local summary for `filter_id`. A bloom-typed filter with
    /// no summary, and a min/max summary that became vacuous, publish the
    /// always-true sentinel.
    pub fn update_filter_from_local(
        &self,
        filter_id: i32,
        bloom_filter: Option<BloomFilter>,
        min_max_filter: Option<MinMaxFilter>,
    ) -> Result<(), String> {
        let mut guard = self.filters.lock().unwrap_or_else(|e| e.into_inner());
        let entry = guard
            .get_mut(&filter_id)
            .ok_or_else(|| format!("runtime filter {filter_id} is not registered"))?;
        let published = match entry.desc.filter_type {
            RuntimeFilterType::Bloom => match bloom_filter {
                Some(bf) => RuntimeFilter::Bloom(bf),
                None => RuntimeFilter::AlwaysTrue,
            },
            RuntimeFilterType::MinMax => match min_max_filter {
                Some(mm) if !mm.always_true() => RuntimeFilter::MinMax(mm),
                _ => RuntimeFilter::AlwaysTrue,
            },
        };
        entry.published = Some(published);
        Ok(())
    }

    pub fn published_filter(&self, filter_id: i32) -> Option<RuntimeFilter> {
        let guard = self.filters.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(&filter_id).and_then(|e| e.published.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bloom_desc(filter_id: i32, size: i64) -> RuntimeFilterDesc {
        RuntimeFilterDesc {
            filter_id,
            filter_type: RuntimeFilterType::Bloom,
            filter_size_bytes: size,
            is_broadcast_join: true,
            applied_on_partition_columns: false,
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let bank = RuntimeFilterBank::new();
        bank.register_filter(bloom_desc(1, 1024)).unwrap();
        assert!(bank.register_filter(bloom_desc(1, 1024)).is_err());
    }

    #[test]
    fn bloom_publish_and_sentinel() {
        let bank = RuntimeFilterBank::new();
        bank.register_filter(bloom_desc(7, 1024)).unwrap();
        let scratch = bank.allocate_scratch_bloom(7).unwrap();
        bank.update_filter_from_local(7, Some(scratch), None).unwrap();
        assert!(!bank.published_filter(7).unwrap().is_always_true());

        bank.register_filter(bloom_desc(8, 1024)).unwrap();
        bank.update_filter_from_local(8, None, None).unwrap();
        assert!(bank.published_filter(8).unwrap().is_always_true());
    }

    #[test]
    fn vacuous_min_max_publishes_sentinel() {
        let bank = RuntimeFilterBank::new();
        bank.register_filter(RuntimeFilterDesc {
            filter_id: 3,
            filter_type: RuntimeFilterType::MinMax,
            filter_size_bytes: 0,
            is_broadcast_join: true,
            applied_on_partition_columns: false,
        })
        .unwrap();
        let mm = bank.allocate_scratch_min_max(3).unwrap();
        bank.update_filter_from_local(3, None, Some(mm)).unwrap();
        // Empty build input publishes an (empty) range filter, not the
        // sentinel; only a vacuous summary degrades.
        assert!(!bank.published_filter(3).unwrap().is_always_true());
    }

    #[test]
    fn fp_gate() {
        let bank = RuntimeFilterBank::new();
        assert!(bank.fp_rate_too_high(1024, 10_000_000));
        assert!(!bank.fp_rate_too_high(1024 * 1024, 1_000));
    }
}
