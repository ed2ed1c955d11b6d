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
//! Seam to the external scalar-expression evaluator.
//!
//! The join build engine only needs "evaluate this key expression over a
//! chunk"; the real evaluator lives outside this crate. [`ColumnRef`] covers
//! pass-through key columns, which is what tests and simple plans use.

use std::fmt;

use arrow::array::ArrayRef;
use arrow::datatypes::{DataType, Schema};

use crate::exec::chunk::Chunk;

pub trait ScalarEvaluator: fmt::Debug + Send + Sync {
    /// Result type of this expression over rows of `schema`.
    fn data_type(&self, schema: &Schema) -> Result<DataType, String>;

    /// Evaluate the expression over every row of the chunk.
    fn evaluate(&self, chunk: &Chunk) -> Result<ArrayRef, String>;
}

/// Direct reference to an input column.
#[derive(Debug, Clone, Copy)]
pub struct ColumnRef {
    index: usize,
}

impl ColumnRef {
    pub fn new(index: usize) -> Self {
        Self { index }
    }
}

impl ScalarEvaluator for ColumnRef {
    fn data_type(&self, schema: &Schema) -> Result<DataType, String> {
        schema
            .fields()
            .get(self.index)
            .map(|f| f.data_type().clone())
            .ok_or_else(|| {
                format!(
                    "column {} out of range for schema with {} fields",
                    self.index,
                    schema.fields().len()
                )
            })
    }

    fn evaluate(&self, chunk: &Chunk) -> Result<ArrayRef, String> {
        chunk
            .columns()
            .get(self.index)
            .cloned()
            .ok_or_else(|| {
                format!(
                    "column {} out of range for chunk with {} columns",
                    self.index,
                    chunk.columns().len()
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, RecordBatch};
    use arrow::datatypes::Field;
    use std::sync::Arc;

    #[test]
    fn column_ref_projects_column() {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, true)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int64Array::from(vec![1, 2, 3]))],
        )
        .unwrap();
        let chunk = Chunk::new(batch);
        let expr = ColumnRef::new(0);
        assert_eq!(expr.data_type(&schema).unwrap(), DataType::Int64);
        assert_eq!(expr.evaluate(&chunk).unwrap().len(), 3);
        assert!(ColumnRef::new(5).evaluate(&chunk).is_err());
    }
}
