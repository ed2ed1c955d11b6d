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
//! Spill file management for unpinned build-row pages.
//!
//! Each stream that unpins gets its own file; pages are appended as opaque
//! byte ranges and read back by offset. Files are deleted when the owning
//! stream closes.

pub mod ipc;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct SpillFileManager {
    dir: PathBuf,
    next_id: AtomicU64,
    pid: u32,
}

impl SpillFileManager {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, String> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| format!("create spill dir {} failed: {e}", dir.display()))?;
        Ok(Self {
            dir,
            next_id: AtomicU64::new(0),
            pid: std::process::id(),
        })
    }

    pub fn with_temp_dir() -> Result<Self, String> {
        Self::new(std::env::temp_dir().join("spilljoin-spill"))
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub fn create_file(&self) -> Result<SpillFile, String> {
        let mut attempts = 0;
        loop {
            let id = self.next_id.fetch_add(1, Ordering::AcqRel);
            let filename = format!("spill_{:x}_{:x}.ipc", self.pid, id);
            let path = self.dir.join(filename);
            let file = OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(&path);
            match file {
                Ok(file) => return Ok(SpillFile { path, file }),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && attempts < 3 => {
                    attempts += 1;
                    continue;
                }
                Err(err) => {
                    return Err(format!(
                        "create spill file {} failed: {err}",
                        path.display()
                    ));
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PageLocation {
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug)]
pub struct SpillFile {
    path: PathBuf,
    file: File,
}

impl SpillFile {
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn append_page(&mut self, bytes: &[u8]) -> Result<PageLocation, String> {
        let offset = self
            .file
            .seek(SeekFrom::End(0))
            .map_err(|e| format!("seek spill file {} failed: {e}", self.path.display()))?;
        self.file
            .write_all(bytes)
            .map_err(|e| format!("write spill file {} failed: {e}", self.path.display()))?;
        Ok(PageLocation {
            offset,
            len: bytes.len() as u64,
        })
    }

    pub fn read_page(&mut self, location: PageLocation) -> Result<Vec<u8>, String> {
        self.file
            .seek(SeekFrom::Start(location.offset))
            .map_err(|e| format!("seek spill file {} failed: {e}", self.path.display()))?;
        let mut bytes = vec![0u8; location.len as usize];
        self.file
            .read_exact(&mut bytes)
            .map_err(|e| format!("read spill file {} failed: {e}", self.path.display()))?;
        Ok(bytes)
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        // Best effort; a leaked temp file is not worth failing a query over.
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_read_pages() {
        let dir = tempdir().unwrap();
        let manager = SpillFileManager::new(dir.path()).unwrap();
        let mut file = manager.create_file().unwrap();
        let a = file.append_page(b"first page").unwrap();
        let b = file.append_page(b"second").unwrap();
        assert_eq!(file.read_page(b).unwrap(), b"second");
        assert_eq!(file.read_page(a).unwrap(), b"first page");
    }

    #[test]
    fn file_removed_on_drop() {
        let dir = tempdir().unwrap();
        let manager = SpillFileManager::new(dir.path()).unwrap();
        let path = {
            let mut file = manager.create_file().unwrap();
            file.append_page(b"x").unwrap();
            file.path().clone()
        };
        assert!(!path.exists());
    }

    #[test]
    fn file_names_are_unique() {
        let dir = tempdir().unwrap();
        let manager = SpillFileManager::new(dir.path()).unwrap();
        let a = manager.create_file().unwrap();
        let b = manager.create_file().unwrap();
        assert_ne!(a.path(), b.path());
    }
}
