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
//! Build-row spool with pinned/unpinned buffer sequences.
//!
//! Rows accumulate in a fixed-size write buffer; full buffers seal into
//! pages. While the stream is pinned every page holds buffer-pool
//! reservation and stays in memory; unpinning flushes pages to a spill file
//! and releases their reservation. An append that cannot get reservation
//! reports `Ok(false)`, the caller's spill signal, rather than an error.

use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;

use crate::common::logging::warn;
use crate::exec::chunk::{interleave_rows, Chunk};
use crate::exec::spill::{ipc, PageLocation, SpillFile, SpillFileManager};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::reservation::BufferPoolClient;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnpinMode {
    UnpinAll,
    UnpinAllExceptCurrent,
}

#[derive(Debug)]
enum PageData {
    InMemory(Vec<u8>),
    OnDisk(PageLocation),
    Dropped,
}

#[derive(Debug)]
struct StreamPage {
    /// Reservation this page holds while resident; retained across unpin so
    /// a later pin claims the same amount.
    pinned_reservation: i64,
    data: PageData,
}

#[derive(Debug)]
pub struct BuildRowStream {
    label: String,
    schema: SchemaRef,
    client: Arc<BufferPoolClient>,
    tracker: Arc<MemTracker>,
    spill_manager: Arc<SpillFileManager>,
    default_page_bytes: i64,
    max_page_bytes: i64,

    pinned: bool,
    pages: Vec<StreamPage>,
    write_batches: Vec<RecordBatch>,
    write_rows: Vec<(u32, u32)>,
    write_bytes: i64,
    write_reservation: i64,
    read_buffer_reservation: i64,

    num_rows: i64,
    byte_size: i64,

    spill_file: Option<SpillFile>,
    read_pos: usize,
    write_page_read: bool,
    delete_on_read: bool,
    closed: bool,
}

impl BuildRowStream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        label: impl Into<String>,
        schema: SchemaRef,
        client: Arc<BufferPoolClient>,
        tracker: Arc<MemTracker>,
        spill_manager: Arc<SpillFileManager>,
        default_page_bytes: i64,
        max_page_bytes: i64,
    ) -> Self {
        Self {
            label: label.into(),
            schema,
            client,
            tracker,
            spill_manager,
            default_page_bytes,
            max_page_bytes,
            pinned: true,
            pages: Vec::new(),
            write_batches: Vec::new(),
            write_rows: Vec::new(),
            write_bytes: 0,
            write_reservation: 0,
            read_buffer_reservation: 0,
            num_rows: 0,
            byte_size: 0,
            spill_file: None,
            read_pos: 0,
            write_page_read: false,
            delete_on_read: false,
            closed: false,
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn num_rows(&self) -> i64 {
        self.num_rows
    }

    pub fn byte_size(&self) -> i64 {
        self.byte_size
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Reservation currently held by this stream: resident pages, the write
    /// buffer and the read buffer.
    pub fn bytes_pinned(&self) -> i64 {
        let resident: i64 = self
            .pages
            .iter()
            .filter(|p| matches!(p.data, PageData::InMemory(_)))
            .map(|p| p.pinned_reservation)
            .sum();
        resident + self.write_reservation + self.read_buffer_reservation
    }

    /// Acquire the initial write buffer. `Ok(false)` when reservation is
    /// exhausted.
    pub fn prepare_for_write(&mut self) -> Result<bool, String> {
        self.check_open()?;
        Ok(self.ensure_write_reservation(self.default_page_bytes))
    }

    /// Append one row of `batch`. `Ok(false)` means the stream could not get
    /// reservation for a page buffer; the caller spills a partition and
    /// retries.
    pub fn add_row(&mut self, batch: &RecordBatch, row: usize) -> Result<bool, String> {
        self.check_open()?;
        let row_bytes = estimate_row_bytes(batch);
        if row_bytes > self.max_page_bytes {
            return Err(format!(
                "row of {row_bytes} bytes exceeds max row buffer size {} in stream {}",
                self.max_page_bytes, self.label
            ));
        }
        if self.write_bytes > 0 && self.write_bytes + row_bytes > self.write_reservation {
            self.seal_write_page()?;
        }
        let target = self.default_page_bytes.max(row_bytes);
        if !self.ensure_write_reservation(target) {
            return Ok(false);
        }
        let batch_idx = match self.write_batches.last() {
            Some(last) if same_batch(last, batch) => self.write_batches.len() - 1,
            _ => {
                self.write_batches.push(batch.clone());
                self.write_batches.len() - 1
            }
        };
        self.write_rows.push((batch_idx as u32, row as u32));
        self.write_bytes += row_bytes;
        self.num_rows += 1;
        self.byte_size += row_bytes;
        self.tracker.consume(row_bytes);
        Ok(true)
    }

    /// Flush resident pages to disk and release their reservation.
    /// `UnpinAll` also flushes the in-progress write buffer; a stream
    /// unpinned that way cannot take further appends without reacquiring a
    /// buffer.
    pub fn unpin_stream(&mut self, mode: UnpinMode) -> Result<(), String> {
        self.check_open()?;
        self.pinned = false;
        for idx in 0..self.pages.len() {
            if !matches!(self.pages[idx].data, PageData::InMemory(_)) {
                continue;
            }
            let bytes = match std::mem::replace(&mut self.pages[idx].data, PageData::Dropped) {
                PageData::InMemory(bytes) => bytes,
                _ => unreachable!(),
            };
            let location = self.spill_file()?.append_page(&bytes)?;
            self.pages[idx].data = PageData::OnDisk(location);
            self.client.release(self.pages[idx].pinned_reservation);
        }
        if mode == UnpinMode::UnpinAll {
            self.seal_write_page()?;
            self.client.release(self.write_reservation);
            self.write_reservation = 0;
        }
        Ok(())
    }

    /// Bring all spilled pages back into memory. `Ok(false)` when the
    /// reservation for them does not fit; the stream is left unchanged.
    pub fn pin_stream(&mut self) -> Result<bool, String> {
        self.check_open()?;
        if self.pinned {
            return Ok(true);
        }
        let needed: i64 = self
            .pages
            .iter()
            .filter(|p| matches!(p.data, PageData::OnDisk(_)))
            .map(|p| p.pinned_reservation)
            .sum();
        if !self.client.try_consume(needed) {
            return Ok(false);
        }
        let mut loaded = Vec::new();
        for (idx, page) in self.pages.iter().enumerate() {
            if let PageData::OnDisk(location) = page.data {
                let file = match self.spill_file.as_mut() {
                    Some(file) => file,
                    None => {
                        self.client.release(needed);
                        return Err(format!("stream {} has no spill file to pin from", self.label));
                    }
                };
                match file.read_page(location) {
                    Ok(bytes) => loaded.push((idx, bytes)),
                    Err(e) => {
                        self.client.release(needed);
                        return Err(e);
                    }
                }
            }
        }
        for (idx, bytes) in loaded {
            self.pages[idx].data = PageData::InMemory(bytes);
        }
        self.pinned = true;
        Ok(true)
    }

    /// Position the read cursor at the first row. An unpinned stream needs
    /// one read buffer; `Ok(false)` when that buffer cannot be reserved.
    pub fn prepare_for_read(&mut self, delete_on_read: bool) -> Result<bool, String> {
        self.check_open()?;
        self.read_pos = 0;
        self.write_page_read = false;
        self.delete_on_read = delete_on_read;
        if !self.pinned && self.read_buffer_reservation == 0 {
            if !self.client.try_consume(self.default_page_bytes) {
                return Ok(false);
            }
            self.read_buffer_reservation = self.default_page_bytes;
        }
        Ok(true)
    }

    /// Sequential read: one chunk per page, then the partial write page.
    pub fn get_next(&mut self) -> Result<Option<Chunk>, String> {
        self.check_open()?;
        while self.read_pos < self.pages.len() {
            let idx = self.read_pos;
            self.read_pos += 1;
            let delete_on_read = self.delete_on_read;
            let page = &mut self.pages[idx];
            let bytes = match &mut page.data {
                PageData::InMemory(buf) => {
                    if delete_on_read {
                        std::mem::take(buf)
                    } else {
                        buf.clone()
                    }
                }
                PageData::OnDisk(location) => {
                    let location = *location;
                    match self.spill_file.as_mut() {
                        Some(file) => file.read_page(location)?,
                        None => {
                            return Err(format!(
                                "stream {} has no spill file to read from",
                                self.label
                            ))
                        }
                    }
                }
                PageData::Dropped => {
                    return Err(format!(
                        "stream {} page {idx} read after delete-on-read",
                        self.label
                    ))
                }
            };
            if delete_on_read {
                let page = &mut self.pages[idx];
                if matches!(page.data, PageData::InMemory(_)) {
                    self.client.release(page.pinned_reservation);
                    page.pinned_reservation = 0;
                }
                page.data = PageData::Dropped;
            }
            let batch = ipc::decode_page(&bytes)?;
            return Ok(Some(Chunk::new(batch)));
        }
        if !self.write_rows.is_empty() && !self.write_page_read {
            self.write_page_read = true;
            let indices: Vec<(usize, usize)> = self
                .write_rows
                .iter()
                .map(|(b, r)| (*b as usize, *r as usize))
                .collect();
            let batch = interleave_rows(&self.write_batches, &indices)?;
            if self.delete_on_read {
                self.write_rows.clear();
                self.write_batches.clear();
                self.write_bytes = 0;
            }
            return Ok(Some(Chunk::new(batch)));
        }
        Ok(None)
    }

    /// Terminal: release all reservation and delete the spill file. With a
    /// receiver, resident rows are decoded into it first so downstream
    /// operators can keep referencing them.
    pub fn close(&mut self, mut out: Option<&mut Vec<Chunk>>) {
        if self.closed {
            return;
        }
        if let Some(out) = out.as_deref_mut() {
            for page in &self.pages {
                if let PageData::InMemory(bytes) = &page.data {
                    match ipc::decode_page(bytes) {
                        Ok(batch) => out.push(Chunk::new(batch)),
                        Err(e) => warn!("stream {} close: dropping page: {e}", self.label),
                    }
                }
            }
            if !self.write_rows.is_empty() {
                let indices: Vec<(usize, usize)> = self
                    .write_rows
                    .iter()
                    .map(|(b, r)| (*b as usize, *r as usize))
                    .collect();
                match interleave_rows(&self.write_batches, &indices) {
                    Ok(batch) => out.push(Chunk::new(batch)),
                    Err(e) => warn!("stream {} close: dropping write page: {e}", self.label),
                }
            }
        }
        self.client.release(self.bytes_pinned());
        self.write_reservation = 0;
        self.read_buffer_reservation = 0;
        self.tracker.release(self.byte_size);
        self.pages.clear();
        self.write_rows.clear();
        self.write_batches.clear();
        self.write_bytes = 0;
        self.spill_file = None;
        self.closed = true;
    }

    fn check_open(&self) -> Result<(), String> {
        if self.closed {
            return Err(format!("stream {} is closed", self.label));
        }
        Ok(())
    }

    fn ensure_write_reservation(&mut self, target: i64) -> bool {
        if self.write_reservation >= target {
            return true;
        }
        let extra = target - self.write_reservation;
        if !self.client.try_consume(extra) {
            return false;
        }
        self.write_reservation = target;
        true
    }

    fn seal_write_page(&mut self) -> Result<(), String> {
        if self.write_rows.is_empty() {
            return Ok(());
        }
        let indices: Vec<(usize, usize)> = self
            .write_rows
            .iter()
            .map(|(b, r)| (*b as usize, *r as usize))
            .collect();
        let batch = interleave_rows(&self.write_batches, &indices)?;
        let encoded = ipc::encode_page(&batch)?;
        let pinned_reservation = self.write_reservation;
        if self.pinned {
            // The write buffer's reservation transfers to the sealed page;
            // the next append acquires a fresh buffer.
            self.pages.push(StreamPage {
                pinned_reservation,
                data: PageData::InMemory(encoded),
            });
            self.write_reservation = 0;
        } else {
            let location = self.spill_file()?.append_page(&encoded)?;
            self.pages.push(StreamPage {
                pinned_reservation,
                data: PageData::OnDisk(location),
            });
            // Keep a default-sized write buffer; shrink an enlarged one.
            if self.write_reservation > self.default_page_bytes {
                self.client
                    .release(self.write_reservation - self.default_page_bytes);
                self.write_reservation = self.default_page_bytes;
            }
        }
        self.write_rows.clear();
        self.write_batches.clear();
        self.write_bytes = 0;
        Ok(())
    }

    fn spill_file(&mut self) -> Result<&mut SpillFile, String> {
        if self.spill_file.is_none() {
            self.spill_file = Some(self.spill_manager.create_file()?);
        }
        Ok(self.spill_file.as_mut().expect("spill file just created"))
    }
}

impl Drop for BuildRowStream {
    fn drop(&mut self) {
        self.close(None);
    }
}

fn estimate_row_bytes(batch: &RecordBatch) -> i64 {
    let rows = batch.num_rows().max(1);
    ((batch.get_array_memory_size() + rows - 1) / rows).max(1) as i64
}

fn same_batch(a: &RecordBatch, b: &RecordBatch) -> bool {
    a.num_columns() > 0
        && b.num_columns() > 0
        && a.num_rows() == b.num_rows()
        && Arc::ptr_eq(a.column(0), b.column(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use tempfile::tempdir;

    const PAGE: i64 = 1024;

    struct Fixture {
        client: Arc<BufferPoolClient>,
        tracker: Arc<MemTracker>,
        manager: Arc<SpillFileManager>,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(reservation: i64) -> Self {
            let dir = tempdir().unwrap();
            Self {
                client: Arc::new(BufferPoolClient::new("test", reservation)),
                tracker: MemTracker::new_root("test"),
                manager: Arc::new(SpillFileManager::new(dir.path()).unwrap()),
                _dir: dir,
            }
        }

        fn stream(&self) -> BuildRowStream {
            BuildRowStream::new(
                "build",
                test_schema(),
                Arc::clone(&self.client),
                Arc::clone(&self.tracker),
                Arc::clone(&self.manager),
                PAGE,
                64 * PAGE,
            )
        }
    }

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, true),
            Field::new("v", DataType::Utf8, true),
        ]))
    }

    fn test_batch(start: i64, rows: usize) -> RecordBatch {
        let keys: Vec<i64> = (start..start + rows as i64).collect();
        let values: Vec<String> = keys.iter().map(|k| format!("value-{k:08}")).collect();
        RecordBatch::try_new(
            test_schema(),
            vec![
                Arc::new(Int64Array::from(keys)),
                Arc::new(StringArray::from(values)),
            ],
        )
        .unwrap()
    }

    fn append_all(stream: &mut BuildRowStream, batch: &RecordBatch) -> usize {
        let mut appended = 0;
        for row in 0..batch.num_rows() {
            if !stream.add_row(batch, row).unwrap() {
                break;
            }
            appended += 1;
        }
        appended
    }

    #[test]
    fn append_and_read_pinned() {
        let fx = Fixture::new(1024 * 1024);
        let mut stream = fx.stream();
        assert!(stream.prepare_for_write().unwrap());
        let batch = test_batch(0, 100);
        assert_eq!(append_all(&mut stream, &batch), 100);
        assert_eq!(stream.num_rows(), 100);

        assert!(stream.prepare_for_read(false).unwrap());
        let mut seen = 0;
        while let Some(chunk) = stream.get_next().unwrap() {
            seen += chunk.len();
        }
        assert_eq!(seen, 100);
        // Reads without delete keep every page; a second pass sees all rows.
        assert!(stream.prepare_for_read(false).unwrap());
        let mut seen_again = 0;
        while let Some(chunk) = stream.get_next().unwrap() {
            seen_again += chunk.len();
        }
        assert_eq!(seen_again, 100);
        stream.close(None);
        assert_eq!(fx.client.used_reservation(), 0);
    }

    #[test]
    fn append_signals_out_of_reservation() {
        let fx = Fixture::new(2 * PAGE);
        let mut stream = fx.stream();
        assert!(stream.prepare_for_write().unwrap());
        let batch = test_batch(0, 1000);
        let appended = append_all(&mut stream, &batch);
        assert!(appended > 0 && appended < 1000, "appended {appended}");
        // Unpinning frees sealed pages; the append can continue.
        stream.unpin_stream(UnpinMode::UnpinAllExceptCurrent).unwrap();
        assert!(!stream.is_pinned());
        assert!(stream.add_row(&batch, appended).unwrap());
        stream.close(None);
        assert_eq!(fx.client.used_reservation(), 0);
    }

    #[test]
    fn unpin_then_pin_round_trip() {
        let fx = Fixture::new(64 * PAGE);
        let mut stream = fx.stream();
        assert!(stream.prepare_for_write().unwrap());
        let batch = test_batch(0, 200);
        assert_eq!(append_all(&mut stream, &batch), 200);
        let pinned_before = stream.bytes_pinned();
        assert!(pinned_before > 0);

        stream.unpin_stream(UnpinMode::UnpinAll).unwrap();
        assert_eq!(stream.bytes_pinned(), 0);
        assert_eq!(fx.client.used_reservation(), 0);

        assert!(stream.pin_stream().unwrap());
        assert!(stream.is_pinned());
        assert!(stream.prepare_for_read(false).unwrap());
        let mut seen = 0;
        while let Some(chunk) = stream.get_next().unwrap() {
            seen += chunk.len();
        }
        assert_eq!(seen, 200);
        stream.close(None);
        assert_eq!(fx.client.used_reservation(), 0);
    }

    #[test]
    fn pin_fails_without_reservation() {
        let fx = Fixture::new(16 * PAGE);
        let mut stream = fx.stream();
        assert!(stream.prepare_for_write().unwrap());
        let batch = test_batch(0, 300);
        let mut row = 0;
        while row < 300 {
            if stream.add_row(&batch, row).unwrap() {
                row += 1;
            } else {
                stream.unpin_stream(UnpinMode::UnpinAllExceptCurrent).unwrap();
            }
        }
        stream.unpin_stream(UnpinMode::UnpinAll).unwrap();
        assert_eq!(fx.client.used_reservation(), 0);
        // Shrink the budget by claiming most of it elsewhere.
        assert!(fx.client.try_consume(15 * PAGE));
        assert!(!stream.pin_stream().unwrap());
        assert!(!stream.is_pinned());
        fx.client.release(15 * PAGE);
        assert!(stream.pin_stream().unwrap());
        stream.close(None);
        assert_eq!(fx.client.used_reservation(), 0);
    }

    #[test]
    fn unpinned_read_needs_a_buffer() {
        let fx = Fixture::new(4 * PAGE);
        let mut stream = fx.stream();
        assert!(stream.prepare_for_write().unwrap());
        let batch = test_batch(0, 150);
        let mut row = 0;
        while row < 150 {
            if stream.add_row(&batch, row).unwrap() {
                row += 1;
            } else {
                stream.unpin_stream(UnpinMode::UnpinAllExceptCurrent).unwrap();
            }
        }
        stream.unpin_stream(UnpinMode::UnpinAll).unwrap();
        assert!(fx.client.try_consume(4 * PAGE));
        assert!(!stream.prepare_for_read(true).unwrap());
        fx.client.release(PAGE);
        assert!(stream.prepare_for_read(true).unwrap());
        let mut seen = 0;
        while let Some(chunk) = stream.get_next().unwrap() {
            seen += chunk.len();
        }
        assert_eq!(seen, 150);
        fx.client.release(3 * PAGE);
        stream.close(None);
        assert_eq!(fx.client.used_reservation(), 0);
    }

    #[test]
    fn close_flushes_resident_rows_to_receiver() {
        let fx = Fixture::new(64 * PAGE);
        let mut stream = fx.stream();
        assert!(stream.prepare_for_write().unwrap());
        let batch = test_batch(0, 75);
        assert_eq!(append_all(&mut stream, &batch), 75);
        let mut out = Vec::new();
        stream.close(Some(&mut out));
        let total: usize = out.iter().map(|c| c.len()).sum();
        assert_eq!(total, 75);
        assert_eq!(fx.client.used_reservation(), 0);
        assert_eq!(fx.tracker.current(), 0);
    }
}
