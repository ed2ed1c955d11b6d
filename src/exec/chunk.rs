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
use arrow::array::{ArrayRef, RecordBatch};
use arrow::compute::interleave;
use arrow::datatypes::SchemaRef;

/// A chunk of data, consisting of multiple rows. Wrapper around an Arrow
/// RecordBatch.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub batch: RecordBatch,
}

impl Chunk {
    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    pub fn estimated_bytes(&self) -> usize {
        self.batch.get_array_memory_size()
    }
}

/// Gather scattered rows from several batches into one contiguous batch.
/// `indices` are `(batch index, row index)` pairs into `batches`.
pub fn interleave_rows(
    batches: &[RecordBatch],
    indices: &[(usize, usize)],
) -> Result<RecordBatch, String> {
    let first = batches
        .first()
        .ok_or_else(|| "interleave_rows requires at least one batch".to_string())?;
    let schema = first.schema();
    let mut columns = Vec::with_capacity(schema.fields().len());
    for col in 0..schema.fields().len() {
        let arrays: Vec<&dyn arrow::array::Array> =
            batches.iter().map(|b| b.column(col).as_ref()).collect();
        let gathered = interleave(&arrays, indices).map_err(|e| e.to_string())?;
        columns.push(gathered);
    }
    RecordBatch::try_new(schema, columns).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn test_batch(keys: &[i64]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, true),
            Field::new("v", DataType::Utf8, true),
        ]));
        let values: Vec<String> = keys.iter().map(|k| format!("v{k}")).collect();
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(keys.to_vec())),
                Arc::new(StringArray::from(values)),
            ],
        )
        .unwrap()
    }

    #[test]
    fn interleave_rows_across_batches() {
        let a = test_batch(&[1, 2, 3]);
        let b = test_batch(&[10, 20]);
        let out = interleave_rows(&[a, b], &[(0, 2), (1, 0), (0, 0)]).unwrap();
        assert_eq!(out.num_rows(), 3);
        let keys = out
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        let got: Vec<i64> = (0..3).map(|i| keys.value(i)).collect();
        assert_eq!(got, vec![3, 10, 1]);
    }
}
