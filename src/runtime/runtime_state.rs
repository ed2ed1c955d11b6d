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
//! Per-fragment-instance execution context.
//!
//! Carries the query options, the cancellation/error flags checked at batch
//! boundaries, the runtime-filter bank and the spill-file manager. All join
//! build methods take `&RuntimeState` rather than storing it, so one state
//! can serve several operators of the fragment.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::exec::spill::SpillFileManager;
use crate::runtime::filter_bank::RuntimeFilterBank;
use crate::runtime::mem_tracker::MemTracker;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeFilterMode {
    Off,
    Local,
    Global,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrefetchMode {
    None,
    HtBucket,
}

#[derive(Clone, Debug)]
pub struct QueryOptions {
    pub batch_size: usize,
    pub runtime_filter_mode: RuntimeFilterMode,
    pub disable_row_runtime_filtering: bool,
    pub prefetch_mode: PrefetchMode,
    pub num_nodes: i32,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            batch_size: 4096,
            runtime_filter_mode: RuntimeFilterMode::Global,
            disable_row_runtime_filtering: false,
            prefetch_mode: PrefetchMode::HtBucket,
            num_nodes: 1,
        }
    }
}

#[derive(Debug)]
pub struct RuntimeState {
    query_options: QueryOptions,
    fragment_hash_seed: u32,
    cancelled: AtomicBool,
    error: Mutex<Option<String>>,
    mem_tracker: Arc<MemTracker>,
    filter_bank: Arc<RuntimeFilterBank>,
    spill_manager: Arc<SpillFileManager>,
}

impl RuntimeState {
    pub fn new(query_options: QueryOptions, spill_dir: Option<PathBuf>) -> Result<Self, String> {
        let spill_manager = match spill_dir {
            Some(dir) => SpillFileManager::new(dir)?,
            None => SpillFileManager::with_temp_dir()?,
        };
        Ok(Self {
            query_options,
            fragment_hash_seed: 0x9747b28c,
            cancelled: AtomicBool::new(false),
            error: Mutex::new(None),
            mem_tracker: MemTracker::new_root("fragment"),
            filter_bank: Arc::new(RuntimeFilterBank::new()),
            spill_manager: Arc::new(spill_manager),
        })
    }

    pub fn query_options(&self) -> &QueryOptions {
        &self.query_options
    }

    pub fn batch_size(&self) -> usize {
        self.query_options.batch_size
    }

    pub fn fragment_hash_seed(&self) -> u32 {
        self.fragment_hash_seed
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    pub fn filter_bank(&self) -> &Arc<RuntimeFilterBank> {
        &self.filter_bank
    }

    pub fn spill_manager(&self) -> &Arc<SpillFileManager> {
        &self.spill_manager
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn check_cancelled(&self) -> Result<(), String> {
        if self.is_cancelled() {
            return Err("query is cancelled".to_string());
        }
        Ok(())
    }

    /// Record the first error seen by any operator of this fragment.
    pub fn set_error(&self, err: String) {
        let mut guard = self.error.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    pub fn check_query_state(&self) -> Result<(), String> {
        let guard = self.error.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_short_circuits() {
        let state = RuntimeState::new(QueryOptions::default(), None).unwrap();
        assert!(state.check_cancelled().is_ok());
        state.cancel();
        assert!(state.check_cancelled().is_err());
    }

    #[test]
    fn first_error_sticks() {
        let state = RuntimeState::new(QueryOptions::default(), None).unwrap();
        state.set_error("disk failed".to_string());
        state.set_error("later error".to_string());
        assert_eq!(state.check_query_state().unwrap_err(), "disk failed");
    }
}
