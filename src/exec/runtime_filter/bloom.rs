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
//! Split-block Bloom filter for runtime membership pruning.
//!
//! The directory is an array of 256-bit blocks; each inserted key sets one
//! bit in each of the 8 lanes of its block. Typed Arrow arrays are hashed
//! value-wise; NULLs never enter the filter because a NULL key cannot match
//! an equality predicate.

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float64Array, Int32Array, Int64Array, StringArray,
};
use arrow::datatypes::DataType;

const SALT: [u32; 8] = [
    0x47b6137b, 0x44974d91, 0x8824ad5b, 0xa2b7289d, 0x705495c7, 0x2df1424b, 0x9efc4947, 0x5c6bfb31,
];

const CRC_HASH_SEED: u32 = 0x811C9DC5;
const BUCKET_WORDS: usize = 8;
const BUCKET_BYTES: i64 = (BUCKET_WORDS * 4) as i64;

#[derive(Clone, Debug)]
pub struct BloomFilter {
    log_num_buckets: u32,
    directory_mask: u32,
    directory: Vec<u32>,
}

impl BloomFilter {
    /// Size the directory from a byte budget; the bucket count is the
    /// largest power of two of 32-byte blocks that fits.
    pub fn with_size_bytes(size_bytes: i64) -> Self {
        let mut buckets = (size_bytes / BUCKET_BYTES).max(1) as u64;
        if !buckets.is_power_of_two() {
            // Round down so the directory never exceeds the byte budget.
            buckets = ((buckets + 1).next_power_of_two() / 2).max(1);
        }
        let log_num_buckets = buckets.trailing_zeros();
        Self {
            log_num_buckets,
            directory_mask: (buckets - 1) as u32,
            directory: vec![0u32; buckets as usize * BUCKET_WORDS],
        }
    }

    pub fn size_bytes(&self) -> i64 {
        (self.directory.len() * 4) as i64
    }

    pub fn insert_hash(&mut self, hash: u64) {
        let bucket_idx = (hash as u32) & self.directory_mask;
        let key = (hash >> self.log_num_buckets) as u32;
        let masks = make_mask(key);
        let base = bucket_idx as usize * BUCKET_WORDS;
        for i in 0..BUCKET_WORDS {
            self.directory[base + i] |= masks[i];
        }
    }

    pub fn find_hash(&self, hash: u64) -> bool {
        let bucket_idx = (hash as u32) & self.directory_mask;
        let key = (hash >> self.log_num_buckets) as u32;
        let masks = make_mask(key);
        let base = bucket_idx as usize * BUCKET_WORDS;
        for i in 0..BUCKET_WORDS {
            if (self.directory[base + i] & masks[i]) == 0 {
                return false;
            }
        }
        true
    }

    pub fn insert_array(&mut self, array: &ArrayRef) -> Result<(), String> {
        let len = array.len();
        match array.data_type() {
            DataType::Boolean => {
                let arr = as_typed::<BooleanArray>(array, "Boolean")?;
                for i in 0..len {
                    if arr.is_null(i) {
                        continue;
                    }
                    let v = if arr.value(i) { 1u64 } else { 0u64 };
                    self.insert_hash(mix_u64(v));
                }
            }
            DataType::Int32 => {
                let arr = as_typed::<Int32Array>(array, "Int32")?;
                for i in 0..len {
                    if arr.is_null(i) {
                        continue;
                    }
                    self.insert_hash(mix_u64(arr.value(i) as i64 as u64));
                }
            }
            DataType::Int64 => {
                let arr = as_typed::<Int64Array>(array, "Int64")?;
                for i in 0..len {
                    if arr.is_null(i) {
                        continue;
                    }
                    self.insert_hash(mix_u64(arr.value(i) as u64));
                }
            }
            DataType::Float64 => {
                let arr = as_typed::<Float64Array>(array, "Float64")?;
                for i in 0..len {
                    if arr.is_null(i) {
                        continue;
                    }
                    self.insert_hash(mix_u64(arr.value(i).to_bits()));
                }
            }
            DataType::Date32 => {
                let arr = as_typed::<Date32Array>(array, "Date32")?;
                for i in 0..len {
                    if arr.is_null(i) {
                        continue;
                    }
                    self.insert_hash(mix_u64(arr.value(i) as i64 as u64));
                }
            }
            DataType::Utf8 => {
                let arr = as_typed::<StringArray>(array, "Utf8")?;
                for i in 0..len {
                    if arr.is_null(i) {
                        continue;
                    }
                    self.insert_hash(slice_hash(arr.value(i).as_bytes()));
                }
            }
            other => {
                return Err(format!("unsupported runtime bloom filter type: {other:?}"));
            }
        }
        Ok(())
    }

    pub fn find_i64(&self, value: i64) -> bool {
        self.find_hash(mix_u64(value as u64))
    }

    pub fn find_utf8(&self, value: &str) -> bool {
        self.find_hash(slice_hash(value.as_bytes()))
    }
}

/// Predicted false-positive rate of a split-block filter of `size_bytes`
/// holding `ndv` distinct values: each key sets 8 bits.
pub fn estimated_fp_rate(size_bytes: i64, ndv: i64) -> f64 {
    if ndv <= 0 {
        return 0.0;
    }
    let bits = (size_bytes.max(BUCKET_BYTES) * 8) as f64;
    let fill = 1.0 - (-8.0 * ndv as f64 / bits).exp();
    fill.powi(8)
}

fn make_mask(key: u32) -> [u32; 8] {
    let mut masks = [0u32; 8];
    for i in 0..8 {
        let v = key.wrapping_mul(SALT[i]) >> 27;
        masks[i] = 1u32 << v;
    }
    masks
}

fn mix_u32(a: u32) -> u32 {
    let kmul: u64 = 0xcc9e2d51;
    let l = (a as u64).wrapping_mul(kmul);
    (l ^ (l >> 32)) as u32
}

fn mix_u64(a: u64) -> u64 {
    let k: u64 = 0xde5fb9d2630458e9;
    let prod = (a as u128) * (k as u128);
    let l = prod as u64;
    let h = (prod >> 64) as u64;
    h.wrapping_add(l)
}

fn slice_hash(data: &[u8]) -> u64 {
    if data.len() < 8 {
        return mix_u32(crc32c::crc32c_append(CRC_HASH_SEED, data)) as u64;
    }
    // CRC over aligned 8-byte words plus the (possibly overlapping) tail.
    let mut crc = CRC_HASH_SEED;
    let words = data.len() / 8;
    for w in 0..words {
        crc = crc32c::crc32c_append(crc, &data[w * 8..w * 8 + 8]);
    }
    let start = data.len() - 8;
    crc = crc32c::crc32c_append(crc, &data[start..]);
    mix_u64(crc as u64)
}

fn as_typed<'a, T: 'static>(array: &'a ArrayRef, name: &str) -> Result<&'a T, String> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| format!("runtime bloom filter type mismatch for {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn inserted_values_are_found() {
        let mut bf = BloomFilter::with_size_bytes(64 * 1024);
        let array: ArrayRef = Arc::new(Int64Array::from((0..1000).collect::<Vec<i64>>()));
        bf.insert_array(&array).unwrap();
        for v in 0..1000 {
            assert!(bf.find_i64(v));
        }
        let misses = (10_000..11_000).filter(|v| bf.find_i64(*v)).count();
        assert!(misses < 50, "false positive count too high: {misses}");
    }

    #[test]
    fn nulls_are_skipped() {
        let mut bf = BloomFilter::with_size_bytes(1024);
        let array: ArrayRef = Arc::new(Int64Array::from(vec![Some(7), None]));
        bf.insert_array(&array).unwrap();
        assert!(bf.find_i64(7));
    }

    #[test]
    fn string_values_round_trip() {
        let mut bf = BloomFilter::with_size_bytes(4096);
        let array: ArrayRef = Arc::new(StringArray::from(vec!["alpha", "beta", "a long string value"]));
        bf.insert_array(&array).unwrap();
        assert!(bf.find_utf8("alpha"));
        assert!(bf.find_utf8("a long string value"));
        assert!(!bf.find_utf8("gamma") || !bf.find_utf8("delta"));
    }

    #[test]
    fn fp_rate_grows_with_ndv() {
        let small = estimated_fp_rate(1024, 100);
        let large = estimated_fp_rate(1024, 1_000_000);
        assert!(small < large);
        assert!(large > 0.99);
        assert!(estimated_fp_rate(1024 * 1024, 100) < 0.01);
    }

    #[test]
    fn directory_sized_from_bytes() {
        let bf = BloomFilter::with_size_bytes(1024);
        assert_eq!(bf.size_bytes(), 1024);
        let bf = BloomFilter::with_size_bytes(100);
        assert_eq!(bf.size_bytes(), 64);
    }
}
