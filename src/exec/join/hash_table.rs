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
//! Per-partition hash table over the pinned build stream.
//!
//! Open-addressed, quadratically probed buckets keyed by the low hash bits;
//! duplicates hang off their bucket's group as a row chain. The bucket
//! array is sized once from the stream's row count before insertion starts.
//! All memory is charged to the buffer-pool client; a failed charge aborts
//! the build and the caller spills the partition.

use std::mem;
use std::sync::Arc;

use crate::runtime::reservation::BufferPoolClient;

const ROW_NONE: u32 = u32::MAX;
const GROUP_NONE: u32 = u32::MAX;

#[derive(Clone, Copy, Debug)]
struct Bucket {
    hash: u32,
    group: u32,
}

#[derive(Debug)]
pub struct JoinHashTable {
    buckets: Vec<Bucket>,
    bucket_mask: u32,
    key_data: Vec<u8>,
    key_offsets: Vec<u32>,
    group_head: Vec<u32>,
    row_next: Vec<u32>,
    matched: Vec<bool>,
    num_rows: u32,
    client: Arc<BufferPoolClient>,
    accounted_bytes: i64,
}

impl JoinHashTable {
    pub fn estimate_num_buckets(num_rows: i64) -> i64 {
        (num_rows.max(1) as u64 * 2).next_power_of_two().max(16) as i64
    }

    /// Bucket-array bytes for a table over `num_rows` rows; used to estimate
    /// a partition's in-memory footprint before building anything.
    pub fn estimate_size(num_rows: i64) -> i64 {
        Self::estimate_num_buckets(num_rows) * mem::size_of::<Bucket>() as i64
    }

    /// Allocate the bucket array from the client's reservation. `Ok(None)`
    /// when the reservation does not fit.
    pub fn try_new(client: Arc<BufferPoolClient>, num_rows: i64) -> Result<Option<Self>, String> {
        let num_buckets = Self::estimate_num_buckets(num_rows);
        let bucket_bytes = num_buckets * mem::size_of::<Bucket>() as i64;
        if !client.try_consume(bucket_bytes) {
            return Ok(None);
        }
        Ok(Some(Self {
            buckets: vec![
                Bucket {
                    hash: 0,
                    group: GROUP_NONE,
                };
                num_buckets as usize
            ],
            bucket_mask: (num_buckets - 1) as u32,
            key_data: Vec::new(),
            key_offsets: vec![0],
            group_head: Vec::new(),
            row_next: Vec::new(),
            matched: Vec::new(),
            num_rows: 0,
            client,
            accounted_bytes: bucket_bytes,
        }))
    }

    pub fn size(&self) -> i64 {
        self.num_rows as i64
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn byte_size(&self) -> i64 {
        self.accounted_bytes
    }

    /// Insert a row under its serialized key; equal keys chain as
    /// duplicates. `row_id` is the row's ordinal in the partition's build
    /// stream, including rows that were dropped before insertion.
    pub fn insert(&mut self, key: &[u8], hash: u32, row_id: u32) -> Result<(), String> {
        let mut idx = hash & self.bucket_mask;
        let mut step = 0u32;
        loop {
            let bucket = self.buckets[idx as usize];
            if bucket.group == GROUP_NONE {
                let group = self.group_head.len() as u32;
                self.key_data.extend_from_slice(key);
                self.key_offsets.push(self.key_data.len() as u32);
                self.group_head.push(ROW_NONE);
                self.buckets[idx as usize] = Bucket { hash, group };
                self.link_row(group, row_id);
                return Ok(());
            }
            if bucket.hash == hash && self.group_key(bucket.group) == key {
                self.link_row(bucket.group, row_id);
                return Ok(());
            }
            step += 1;
            if step as usize >= self.buckets.len() {
                return Err("join hash table is full".to_string());
            }
            idx = (idx + step) & self.bucket_mask;
        }
    }

    /// Re-account grown side arrays against the reservation. `false` means
    /// the charge did not fit; the caller tears the table down and spills.
    pub fn refresh_accounting(&mut self) -> bool {
        let bytes = self.tracked_bytes();
        let delta = bytes - self.accounted_bytes;
        if delta > 0 {
            if !self.client.try_consume(delta) {
                return false;
            }
        } else if delta < 0 {
            self.client.release(-delta);
        }
        self.accounted_bytes = bytes;
        true
    }

    pub fn find(&self, key: &[u8], hash: u32) -> Option<u32> {
        let mut idx = hash & self.bucket_mask;
        let mut step = 0u32;
        loop {
            let bucket = self.buckets[idx as usize];
            if bucket.group == GROUP_NONE {
                return None;
            }
            if bucket.hash == hash && self.group_key(bucket.group) == key {
                return Some(bucket.group);
            }
            step += 1;
            if step as usize >= self.buckets.len() {
                return None;
            }
            idx = (idx + step) & self.bucket_mask;
        }
    }

    /// Rows of a group, head first. Within a group the order among
    /// duplicates is unspecified.
    pub fn group_rows(&self, group: u32) -> Vec<u32> {
        let mut rows = Vec::new();
        let mut row = self.group_head[group as usize];
        while row != ROW_NONE {
            rows.push(row);
            row = self.row_next[row as usize];
        }
        rows
    }

    pub fn num_groups(&self) -> usize {
        self.group_head.len()
    }

    /// Probe-side hook: flag a build row as matched.
    pub fn set_matched(&mut self, row_id: u32) {
        if let Some(slot) = self.matched.get_mut(row_id as usize) {
            *slot = true;
        }
    }

    pub fn has_matches(&self) -> bool {
        self.matched.iter().any(|m| *m)
    }

    fn link_row(&mut self, group: u32, row_id: u32) {
        let slot = row_id as usize;
        if slot >= self.row_next.len() {
            self.row_next.resize(slot + 1, ROW_NONE);
            self.matched.resize(slot + 1, false);
        }
        self.row_next[slot] = self.group_head[group as usize];
        self.group_head[group as usize] = row_id;
        self.num_rows += 1;
    }

    fn group_key(&self, group: u32) -> &[u8] {
        let start = self.key_offsets[group as usize] as usize;
        let end = self.key_offsets[group as usize + 1] as usize;
        &self.key_data[start..end]
    }

    fn tracked_bytes(&self) -> i64 {
        fn vec_bytes<T>(v: &Vec<T>) -> i64 {
            (v.capacity() * mem::size_of::<T>()) as i64
        }
        vec_bytes(&self.buckets)
            + vec_bytes(&self.key_data)
            + vec_bytes(&self.key_offsets)
            + vec_bytes(&self.group_head)
            + vec_bytes(&self.row_next)
            + vec_bytes(&self.matched)
    }
}

impl Drop for JoinHashTable {
    fn drop(&mut self) {
        self.client.release(self.accounted_bytes);
    }
}
