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
//! Runtime min-max filter: typed lower/upper bounds over the build keys.

use std::cmp::Ordering;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float64Array, Int32Array, Int64Array, StringArray,
};
use arrow::datatypes::DataType;

/// Typed bound values used by runtime min-max filters.
#[derive(Clone, Debug, PartialEq)]
pub enum MinMaxValue {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Date32(i32),
    Utf8(String),
}

impl MinMaxValue {
    fn cmp(&self, other: &MinMaxValue) -> Result<Ordering, String> {
        match (self, other) {
            (MinMaxValue::Bool(a), MinMaxValue::Bool(b)) => Ok(a.cmp(b)),
            (MinMaxValue::Int32(a), MinMaxValue::Int32(b)) => Ok(a.cmp(b)),
            (MinMaxValue::Int64(a), MinMaxValue::Int64(b)) => Ok(a.cmp(b)),
            (MinMaxValue::Float64(a), MinMaxValue::Float64(b)) => a
                .partial_cmp(b)
                .ok_or_else(|| "runtime min/max float64 compare failed".to_string()),
            (MinMaxValue::Date32(a), MinMaxValue::Date32(b)) => Ok(a.cmp(b)),
            (MinMaxValue::Utf8(a), MinMaxValue::Utf8(b)) => Ok(a.as_bytes().cmp(b.as_bytes())),
            _ => Err("runtime min/max value type mismatch".to_string()),
        }
    }
}

/// Range summary over the build keys of one filter expression.
///
/// A filter over a type it cannot summarize degrades to always-true; the
/// producer publishes the sentinel instead of a vacuous range.
#[derive(Clone, Debug, Default)]
pub struct MinMaxFilter {
    always_true: bool,
    min: Option<MinMaxValue>,
    max: Option<MinMaxValue>,
}

impl MinMaxFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always_true(&self) -> bool {
        self.always_true
    }

    pub fn has_values(&self) -> bool {
        self.min.is_some()
    }

    pub fn min(&self) -> Option<&MinMaxValue> {
        self.min.as_ref()
    }

    pub fn max(&self) -> Option<&MinMaxValue> {
        self.max.as_ref()
    }

    pub fn update_from_array(&mut self, array: &ArrayRef) -> Result<(), String> {
        if self.always_true {
            return Ok(());
        }
        let len = array.len();
        match array.data_type() {
            DataType::Boolean => {
                let arr = as_typed::<BooleanArray>(array, "Boolean")?;
                for i in 0..len {
                    if arr.is_null(i) {
                        continue;
                    }
                    self.update(MinMaxValue::Bool(arr.value(i)))?;
                }
            }
            DataType::Int32 => {
                let arr = as_typed::<Int32Array>(array, "Int32")?;
                for i in 0..len {
                    if arr.is_null(i) {
                        continue;
                    }
                    self.update(MinMaxValue::Int32(arr.value(i)))?;
                }
            }
            DataType::Int64 => {
                let arr = as_typed::<Int64Array>(array, "Int64")?;
                for i in 0..len {
                    if arr.is_null(i) {
                        continue;
                    }
                    self.update(MinMaxValue::Int64(arr.value(i)))?;
                }
            }
            DataType::Float64 => {
                let arr = as_typed::<Float64Array>(array, "Float64")?;
                for i in 0..len {
                    if arr.is_null(i) {
                        continue;
                    }
                    let v = arr.value(i);
                    if v.is_nan() {
                        continue;
                    }
                    self.update(MinMaxValue::Float64(v))?;
                }
            }
            DataType::Date32 => {
                let arr = as_typed::<Date32Array>(array, "Date32")?;
                for i in 0..len {
                    if arr.is_null(i) {
                        continue;
                    }
                    self.update(MinMaxValue::Date32(arr.value(i)))?;
                }
            }
            DataType::Utf8 => {
                let arr = as_typed::<StringArray>(array, "Utf8")?;
                for i in 0..len {
                    if arr.is_null(i) {
                        continue;
                    }
                    self.update(MinMaxValue::Utf8(arr.value(i).to_string()))?;
                }
            }
            _ => {
                // No range representation for this type; the filter cannot
                // reject anything.
                self.always_true = true;
                self.min = None;
                self.max = None;
            }
        }
        Ok(())
    }

    fn update(&mut self, value: MinMaxValue) -> Result<(), String> {
        match (&self.min, &self.max) {
            (Some(min), Some(max)) => {
                if value.cmp(min)? == Ordering::Less {
                    self.min = Some(value);
                } else if value.cmp(max)? == Ordering::Greater {
                    self.max = Some(value);
                }
            }
            _ => {
                self.min = Some(value.clone());
                self.max = Some(value);
            }
        }
        Ok(())
    }
}

fn as_typed<'a, T: 'static>(array: &'a ArrayRef, name: &str) -> Result<&'a T, String> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| format!("runtime min/max type mismatch for {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::TimestampNanosecondArray;
    use std::sync::Arc;

    #[test]
    fn int_bounds() {
        let mut f = MinMaxFilter::new();
        let a: ArrayRef = Arc::new(Int64Array::from(vec![Some(5), None, Some(-3), Some(9)]));
        f.update_from_array(&a).unwrap();
        assert_eq!(f.min(), Some(&MinMaxValue::Int64(-3)));
        assert_eq!(f.max(), Some(&MinMaxValue::Int64(9)));
        let b: ArrayRef = Arc::new(Int64Array::from(vec![100]));
        f.update_from_array(&b).unwrap();
        assert_eq!(f.max(), Some(&MinMaxValue::Int64(100)));
    }

    #[test]
    fn string_bounds() {
        let mut f = MinMaxFilter::new();
        let a: ArrayRef = Arc::new(StringArray::from(vec!["pear", "apple", "plum"]));
        f.update_from_array(&a).unwrap();
        assert_eq!(f.min(), Some(&MinMaxValue::Utf8("apple".to_string())));
        assert_eq!(f.max(), Some(&MinMaxValue::Utf8("plum".to_string())));
    }

    #[test]
    fn unsupported_type_degrades_to_always_true() {
        let mut f = MinMaxFilter::new();
        let a: ArrayRef = Arc::new(TimestampNanosecondArray::from(vec![1_i64, 2]));
        f.update_from_array(&a).unwrap();
        assert!(f.always_true());
        assert!(!f.has_values());
    }

    #[test]
    fn nan_is_ignored() {
        let mut f = MinMaxFilter::new();
        let a: ArrayRef = Arc::new(Float64Array::from(vec![1.5, f64::NAN, -0.5]));
        f.update_from_array(&a).unwrap();
        assert_eq!(f.min(), Some(&MinMaxValue::Float64(-0.5)));
        assert_eq!(f.max(), Some(&MinMaxValue::Float64(1.5)));
    }
}
