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
//! Runtime profile tree: named counters, scoped timers and info strings.
//!
//! Operators create their counters up front and mutate them through shared
//! `CounterRef` handles on the hot path; the tree itself is only walked when
//! a profile is reported.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::runtime::mem_tracker::MemTracker;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TUnit {
    Unit,
    Bytes,
    TimeNs,
}

const EXEC_OPTION_KEY: &str = "ExecOption";

#[derive(Clone, Debug)]
pub struct RuntimeProfile {
    inner: Arc<RuntimeProfileInner>,
}

#[derive(Debug)]
struct RuntimeProfileInner {
    name: String,
    counters: Mutex<HashMap<String, CounterRef>>,
    info_strings: Mutex<BTreeMap<String, String>>,
    children: Mutex<Vec<RuntimeProfile>>,
}

impl RuntimeProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RuntimeProfileInner {
                name: name.into(),
                counters: Mutex::new(HashMap::new()),
                info_strings: Mutex::new(BTreeMap::new()),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Return the child with the given name, creating it if absent.
    pub fn child(&self, name: impl Into<String>) -> RuntimeProfile {
        let name = name.into();
        let mut children = self
            .inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = children.iter().find(|c| c.name() == name) {
            return existing.clone();
        }
        let child = RuntimeProfile::new(name);
        children.push(child.clone());
        child
    }

    pub fn children(&self) -> Vec<RuntimeProfile> {
        self.inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn add_counter(&self, name: impl Into<String>, unit: TUnit) -> CounterRef {
        let name = name.into();
        let mut guard = self
            .inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(counter) = guard.get(&name) {
            return Arc::clone(counter);
        }
        let counter = Arc::new(Counter::new(name.clone(), unit));
        guard.insert(name, Arc::clone(&counter));
        counter
    }

    pub fn add_timer(&self, name: impl Into<String>) -> CounterRef {
        self.add_counter(name, TUnit::TimeNs)
    }

    pub fn scoped_timer(&self, name: impl Into<String>) -> ScopedTimer {
        ScopedTimer::new(self.add_timer(name))
    }

    pub fn counter(&self, name: &str) -> Option<CounterRef> {
        self.inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn add_info_string(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut guard = self
            .inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard.insert(key.into(), value.into());
    }

    pub fn get_info_string(&self, key: &str) -> Option<String> {
        self.inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Append a short option marker (e.g. "Spilled") to the exec-option info
    /// string, comma-separated.
    pub fn append_exec_option(&self, option: impl AsRef<str>) {
        let mut guard = self
            .inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match guard.get_mut(EXEC_OPTION_KEY) {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(option.as_ref());
            }
            None => {
                guard.insert(EXEC_OPTION_KEY.to_string(), option.as_ref().to_string());
            }
        }
    }

    pub fn exec_options(&self) -> Option<String> {
        self.get_info_string(EXEC_OPTION_KEY)
    }
}

pub type CounterRef = Arc<Counter>;

#[derive(Debug)]
pub struct Counter {
    name: String,
    unit: TUnit,
    value: AtomicI64,
}

impl Counter {
    pub fn new(name: impl Into<String>, unit: TUnit) -> Self {
        Self {
            name: name.into(),
            unit,
            value: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> TUnit {
        self.unit
    }

    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// High-water-mark update: keeps the largest value ever set.
    pub fn update_max(&self, value: i64) {
        let mut prev = self.value.load(Ordering::Relaxed);
        while value > prev {
            match self
                .value
                .compare_exchange(prev, value, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

pub struct ScopedTimer {
    counter: CounterRef,
    start: Instant,
}

impl ScopedTimer {
    pub fn new(counter: CounterRef) -> Self {
        Self {
            counter,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        let elapsed_ns = self.start.elapsed().as_nanos();
        let elapsed_ns = i64::try_from(elapsed_ns).unwrap_or(i64::MAX);
        self.counter.add(elapsed_ns);
    }
}

/// Record a mem-tracker subtree as a profile child, one level per tracker.
pub fn attach_mem_tracker(profile: &RuntimeProfile, tracker: &Arc<MemTracker>) {
    let node = profile.child("MemTracker");
    fill_mem_tracker_profile(&node, tracker);
}

fn fill_mem_tracker_profile(profile: &RuntimeProfile, tracker: &Arc<MemTracker>) {
    profile.add_info_string("Label", tracker.label());
    profile
        .add_counter("CurrentMemoryBytes", TUnit::Bytes)
        .set(tracker.current());
    profile
        .add_counter("PeakMemoryBytes", TUnit::Bytes)
        .set(tracker.peak());
    for child in tracker.children() {
        let child_profile = profile.child(child.label().to_string());
        fill_mem_tracker_profile(&child_profile, &child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_shared_by_name() {
        let profile = RuntimeProfile::new("test");
        let a = profile.add_counter("Rows", TUnit::Unit);
        let b = profile.add_counter("Rows", TUnit::Unit);
        a.add(3);
        b.add(4);
        assert_eq!(profile.counter("Rows").unwrap().value(), 7);
    }

    #[test]
    fn update_max_keeps_high_water_mark() {
        let c = Counter::new("hwm", TUnit::Unit);
        c.update_max(10);
        c.update_max(4);
        assert_eq!(c.value(), 10);
        c.update_max(12);
        assert_eq!(c.value(), 12);
    }

    #[test]
    fn exec_options_append() {
        let profile = RuntimeProfile::new("test");
        profile.append_exec_option("Spilled");
        assert_eq!(profile.exec_options().as_deref(), Some("Spilled"));
        profile.append_exec_option("Codegen Disabled");
        assert_eq!(
            profile.exec_options().as_deref(),
            Some("Spilled, Codegen Disabled")
        );
    }

    #[test]
    fn scoped_timer_accumulates() {
        let profile = RuntimeProfile::new("test");
        {
            let _t = profile.scoped_timer("BuildTime");
        }
        assert!(profile.counter("BuildTime").unwrap().value() >= 0);
    }

    #[test]
    fn mem_tracker_attach_records_subtree() {
        let profile = RuntimeProfile::new("test");
        let root = MemTracker::new_root("op");
        let child = MemTracker::new_child("stream", &root);
        child.consume(64);
        attach_mem_tracker(&profile, &root);
        let node = profile.child("MemTracker");
        assert_eq!(node.counter("CurrentMemoryBytes").unwrap().value(), 64);
        assert_eq!(node.children().len(), 1);
    }
}
