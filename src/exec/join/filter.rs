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
//! Per-filter build state: the descriptor, its source expression and the
//! local scratch summary being filled while level-0 build rows flow.

use crate::exec::chunk::Chunk;
use crate::exec::expr::ScalarEvaluator;
use crate::exec::runtime_filter::{BloomFilter, MinMaxFilter, RuntimeFilterDesc, RuntimeFilterType};
use crate::runtime::filter_bank::RuntimeFilterBank;

#[derive(Debug)]
pub struct FilterContext {
    pub(crate) desc: RuntimeFilterDesc,
    pub(crate) expr_eval: Box<dyn ScalarEvaluator>,
    pub(crate) local_bloom: Option<BloomFilter>,
    pub(crate) local_min_max: Option<MinMaxFilter>,
}

impl FilterContext {
    pub fn new(desc: RuntimeFilterDesc, expr_eval: Box<dyn ScalarEvaluator>) -> Self {
        Self {
            desc,
            expr_eval,
            local_bloom: None,
            local_min_max: None,
        }
    }

    pub fn filter_id(&self) -> i32 {
        self.desc.filter_id
    }

    /// Allocate the scratch summary from the bank. Exactly one of the local
    /// summaries is populated, per the descriptor type.
    pub(crate) fn allocate(&mut self, bank: &RuntimeFilterBank) -> Result<(), String> {
        match self.desc.filter_type {
            RuntimeFilterType::Bloom => {
                self.local_bloom = Some(bank.allocate_scratch_bloom(self.desc.filter_id)?);
            }
            RuntimeFilterType::MinMax => {
                self.local_min_max = Some(bank.allocate_scratch_min_max(self.desc.filter_id)?);
            }
        }
        Ok(())
    }

    /// Fold every row of the chunk into the local summary.
    pub(crate) fn insert(&mut self, chunk: &Chunk) -> Result<(), String> {
        let array = self.expr_eval.evaluate(chunk)?;
        if let Some(bloom) = self.local_bloom.as_mut() {
            bloom.insert_array(&array)?;
        }
        if let Some(min_max) = self.local_min_max.as_mut() {
            min_max.update_from_array(&array)?;
        }
        Ok(())
    }
}
