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
//! Level-parameterized row hashing for recursive partitioning.
//!
//! Level 0 hashes with CRC32C, levels >= 1 with seeded xxHash64; the two
//! families are independent, so rows that collide into one partition at
//! level L are redistributed at level L + 1. Partition selection uses the
//! high bits of the hash and hash-table bucketing uses the low bits, so a
//! row's partition does not correlate with its intra-partition bucket.

use std::hash::Hasher;

use arrow::array::{Array, ArrayRef};
use arrow::datatypes::DataType;
use arrow::row::{RowConverter, Rows, SortField};
use twox_hash::XxHash64;

pub const PARTITION_FANOUT_BITS: u32 = 4;
pub const PARTITION_FANOUT: usize = 1 << PARTITION_FANOUT_BITS;
pub const MAX_PARTITION_DEPTH: i32 = 16;

#[derive(Debug)]
pub struct JoinHashContext {
    level: i32,
    seed: u32,
}

impl JoinHashContext {
    pub fn new(seed: u32) -> Self {
        Self { level: 0, seed }
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn set_level(&mut self, level: i32) -> Result<(), String> {
        if !(0..MAX_PARTITION_DEPTH).contains(&level) {
            return Err(format!(
                "hash context level {level} out of range [0, {MAX_PARTITION_DEPTH})"
            ));
        }
        self.level = level;
        Ok(())
    }

    pub fn hash_row(&self, key: &[u8]) -> u32 {
        if self.level == 0 {
            mix_u32(crc32c::crc32c_append(self.seed, key))
        } else {
            let seed = ((self.seed as u64) << 32) | self.level as u64;
            let mut hasher = XxHash64::with_seed(seed);
            hasher.write(key);
            let h = hasher.finish();
            (h ^ (h >> 32)) as u32
        }
    }

    pub fn partition_index(hash: u32) -> usize {
        (hash >> (32 - PARTITION_FANOUT_BITS)) as usize
    }
}

fn mix_u32(a: u32) -> u32 {
    let kmul: u64 = 0xcc9e2d51;
    let l = (a as u64).wrapping_mul(kmul);
    (l ^ (l >> 32)) as u32
}

/// Serializes build-key columns into per-row comparable byte strings; the
/// bytes feed both the hash context and hash-table equality.
pub struct KeyEncoder {
    converter: RowConverter,
}

impl KeyEncoder {
    pub fn try_new(key_types: &[DataType]) -> Result<Self, String> {
        if key_types.is_empty() {
            return Err("hash join requires at least one build key".to_string());
        }
        let fields = key_types
            .iter()
            .map(|dt| SortField::new(dt.clone()))
            .collect();
        let converter = RowConverter::new(fields).map_err(|e| e.to_string())?;
        Ok(Self { converter })
    }

    pub fn encode(&self, key_arrays: &[ArrayRef]) -> Result<SerializedKeys, String> {
        let num_rows = key_arrays.first().map(|a| a.len()).unwrap_or(0);
        for array in key_arrays {
            if array.len() != num_rows {
                return Err("build key arrays have mismatched lengths".to_string());
            }
        }
        let rows = self
            .converter
            .convert_columns(key_arrays)
            .map_err(|e| e.to_string())?;
        let mut null_flags = vec![false; num_rows];
        for array in key_arrays {
            if array.null_count() == 0 {
                continue;
            }
            for (row, flag) in null_flags.iter_mut().enumerate() {
                if array.is_null(row) {
                    *flag = true;
                }
            }
        }
        Ok(SerializedKeys { rows, null_flags })
    }
}

pub struct SerializedKeys {
    rows: Rows,
    null_flags: Vec<bool>,
}

impl SerializedKeys {
    pub fn len(&self) -> usize {
        self.null_flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.null_flags.is_empty()
    }

    pub fn key_bytes(&self, row: usize) -> &[u8] {
        self.rows.row(row).data()
    }

    /// True when any key column is NULL on this row.
    pub fn has_null_key(&self, row: usize) -> bool {
        self.null_flags[row]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use std::sync::Arc;

    fn keys_for(values: &[i64]) -> SerializedKeys {
        let encoder = KeyEncoder::try_new(&[DataType::Int64]).unwrap();
        let array: ArrayRef = Arc::new(Int64Array::from(values.to_vec()));
        encoder.encode(&[array]).unwrap()
    }

    #[test]
    fn hash_is_stable_within_a_level() {
        let ctx = JoinHashContext::new(42);
        let keys = keys_for(&[7, 7, 8]);
        assert_eq!(
            ctx.hash_row(keys.key_bytes(0)),
            ctx.hash_row(keys.key_bytes(1))
        );
        assert_ne!(
            ctx.hash_row(keys.key_bytes(0)),
            ctx.hash_row(keys.key_bytes(2))
        );
    }

    #[test]
    fn levels_use_independent_hash_functions() {
        let mut ctx = JoinHashContext::new(42);
        let values: Vec<i64> = (0..512).collect();
        let keys = keys_for(&values);
        let level0: Vec<u32> = (0..keys.len()).map(|i| ctx.hash_row(keys.key_bytes(i))).collect();
        ctx.set_level(1).unwrap();
        let level1: Vec<u32> = (0..keys.len()).map(|i| ctx.hash_row(keys.key_bytes(i))).collect();
        ctx.set_level(2).unwrap();
        let level2: Vec<u32> = (0..keys.len()).map(|i| ctx.hash_row(keys.key_bytes(i))).collect();

        // Rows sharing a partition at one level must not all share it at the
        // next, otherwise repartitioning could never make progress.
        let same01 = level0
            .iter()
            .zip(&level1)
            .filter(|(a, b)| JoinHashContext::partition_index(**a) == JoinHashContext::partition_index(**b))
            .count();
        assert!(same01 < 200, "levels 0 and 1 correlate: {same01} of 512");
        let same12 = level1
            .iter()
            .zip(&level2)
            .filter(|(a, b)| JoinHashContext::partition_index(**a) == JoinHashContext::partition_index(**b))
            .count();
        assert!(same12 < 200, "levels 1 and 2 correlate: {same12} of 512");
    }

    #[test]
    fn partition_index_uses_high_bits() {
        assert_eq!(JoinHashContext::partition_index(0), 0);
        assert_eq!(JoinHashContext::partition_index(u32::MAX), PARTITION_FANOUT - 1);
        assert_eq!(JoinHashContext::partition_index(1 << 28), 1);
    }

    #[test]
    fn level_bounds_are_enforced() {
        let mut ctx = JoinHashContext::new(1);
        assert!(ctx.set_level(MAX_PARTITION_DEPTH).is_err());
        assert!(ctx.set_level(-1).is_err());
        assert!(ctx.set_level(MAX_PARTITION_DEPTH - 1).is_ok());
    }

    #[test]
    fn null_flags_mark_null_keys() {
        let encoder = KeyEncoder::try_new(&[DataType::Int64]).unwrap();
        let array: ArrayRef = Arc::new(Int64Array::from(vec![Some(1), None, Some(3)]));
        let keys = encoder.encode(&[array]).unwrap();
        assert!(!keys.has_null_key(0));
        assert!(keys.has_null_key(1));
        assert!(!keys.has_null_key(2));
    }

    #[test]
    fn empty_key_list_is_rejected() {
        assert!(KeyEncoder::try_new(&[]).is_err());
    }
}
