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
//! Buffer-pool reservation accounting.
//!
//! A [`BufferPoolClient`] holds a granted reservation and tracks how much of
//! it is in use by pinned stream pages and hash-table allocations. Credit can
//! be parked in a [`SavedReservation`] between phases and restored later (or
//! restored into a different client) without returning it to the global pool.

use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug)]
pub struct BufferPoolClient {
    name: String,
    granted: AtomicI64,
    used: AtomicI64,
}

impl BufferPoolClient {
    pub fn new(name: impl Into<String>, reservation: i64) -> Self {
        Self {
            name: name.into(),
            granted: AtomicI64::new(reservation),
            used: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total reservation currently granted to this client.
    pub fn reservation(&self) -> i64 {
        self.granted.load(Ordering::Acquire)
    }

    pub fn used_reservation(&self) -> i64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn unused_reservation(&self) -> i64 {
        self.reservation() - self.used_reservation()
    }

    /// Claim `bytes` of unused reservation. Returns false without side
    /// effects when the claim does not fit; callers treat that as the
    /// spill signal, never as an error.
    pub fn try_consume(&self, bytes: i64) -> bool {
        if bytes <= 0 {
            return true;
        }
        let granted = self.granted.load(Ordering::Acquire);
        let mut used = self.used.load(Ordering::Acquire);
        loop {
            if used + bytes > granted {
                return false;
            }
            match self.used.compare_exchange(
                used,
                used + bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => used = actual,
            }
        }
    }

    pub fn release(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let prev = self.used.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "releasing more reservation than used");
    }

    /// Move `bytes` of unused reservation out of this client and park it in
    /// `saved`. The credit stays owned by the query; it is simply invisible
    /// to `try_consume` until restored.
    pub fn save_reservation(&self, saved: &SavedReservation, bytes: i64) -> Result<(), String> {
        if bytes <= 0 {
            return Ok(());
        }
        let used = self.used.load(Ordering::Acquire);
        let mut granted = self.granted.load(Ordering::Acquire);
        loop {
            if granted - used < bytes {
                return Err(format!(
                    "cannot save {} bytes of reservation: {}",
                    bytes,
                    self.debug_string()
                ));
            }
            match self.granted.compare_exchange(
                granted,
                granted - bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => granted = actual,
            }
        }
        saved.amount.fetch_add(bytes, Ordering::AcqRel);
        Ok(())
    }

    /// Move `bytes` of parked reservation back into this client's unused
    /// bucket.
    pub fn restore_reservation(&self, saved: &SavedReservation, bytes: i64) -> Result<(), String> {
        if bytes <= 0 {
            return Ok(());
        }
        let mut amount = saved.amount.load(Ordering::Acquire);
        loop {
            if amount < bytes {
                return Err(format!(
                    "cannot restore {bytes} bytes: only {amount} bytes saved"
                ));
            }
            match saved.amount.compare_exchange(
                amount,
                amount - bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => amount = actual,
            }
        }
        self.granted.fetch_add(bytes, Ordering::AcqRel);
        Ok(())
    }

    pub fn debug_string(&self) -> String {
        format!(
            "<BufferPoolClient>: name={} reservation={} used={} unused={}",
            self.name,
            self.reservation(),
            self.used_reservation(),
            self.unused_reservation()
        )
    }
}

/// A parked slice of buffer-pool reservation, held between phases.
#[derive(Debug, Default)]
pub struct SavedReservation {
    amount: AtomicI64,
}

impl SavedReservation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> i64 {
        self.amount.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_consume_respects_grant() {
        let client = BufferPoolClient::new("t", 100);
        assert!(client.try_consume(60));
        assert!(!client.try_consume(50));
        assert!(client.try_consume(40));
        assert_eq!(client.unused_reservation(), 0);
        client.release(100);
        assert_eq!(client.used_reservation(), 0);
    }

    #[test]
    fn save_and_restore_round_trip() {
        let client = BufferPoolClient::new("t", 100);
        let saved = SavedReservation::new();
        client.save_reservation(&saved, 30).unwrap();
        assert_eq!(client.reservation(), 70);
        assert_eq!(saved.get(), 30);
        // Parked credit is not consumable.
        assert!(!client.try_consume(80));
        client.restore_reservation(&saved, 30).unwrap();
        assert_eq!(client.reservation(), 100);
        assert_eq!(saved.get(), 0);
        assert!(client.try_consume(80));
    }

    #[test]
    fn save_beyond_unused_fails() {
        let client = BufferPoolClient::new("t", 100);
        assert!(client.try_consume(90));
        let saved = SavedReservation::new();
        assert!(client.save_reservation(&saved, 20).is_err());
        assert_eq!(saved.get(), 0);
    }

    #[test]
    fn restore_into_another_client() {
        let build = BufferPoolClient::new("build", 100);
        let probe = BufferPoolClient::new("probe", 0);
        let saved = SavedReservation::new();
        build.save_reservation(&saved, 64).unwrap();
        probe.restore_reservation(&saved, 64).unwrap();
        assert_eq!(probe.reservation(), 64);
        assert_eq!(build.reservation(), 36);
    }
}
