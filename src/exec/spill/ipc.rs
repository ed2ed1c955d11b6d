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
use std::io::Cursor;

use arrow::array::RecordBatch;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;

/// Encode one batch as a self-contained Arrow IPC stream. Each spill page is
/// one such stream, so pages can be decoded independently of each other.
pub fn encode_page(batch: &RecordBatch) -> Result<Vec<u8>, String> {
    let mut buffer = Vec::new();
    let mut writer = StreamWriter::try_new(&mut buffer, batch.schema().as_ref())
        .map_err(|e| format!("spill page encode failed: {e}"))?;
    writer
        .write(batch)
        .map_err(|e| format!("spill page encode failed: {e}"))?;
    writer
        .finish()
        .map_err(|e| format!("spill page encode failed: {e}"))?;
    drop(writer);
    Ok(buffer)
}

pub fn decode_page(bytes: &[u8]) -> Result<RecordBatch, String> {
    let mut reader = StreamReader::try_new(Cursor::new(bytes), None)
        .map_err(|e| format!("spill page decode failed: {e}"))?;
    let batch = reader
        .next()
        .ok_or_else(|| "spill page did not contain a record batch".to_string())?
        .map_err(|e| format!("spill page decode failed: {e}"))?;
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    #[test]
    fn page_round_trip() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int32, false),
            Field::new("b", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![1, 2, 3])),
                Arc::new(StringArray::from(vec![Some("x"), None, Some("z")])),
            ],
        )
        .unwrap();
        let bytes = encode_page(&batch).unwrap();
        let decoded = decode_page(&bytes).unwrap();
        assert_eq!(decoded.num_rows(), 3);
        assert_eq!(decoded.num_columns(), 2);
    }
}
