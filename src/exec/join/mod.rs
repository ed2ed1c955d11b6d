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
pub mod builder;
pub mod filter;
pub mod hash_context;
pub mod hash_table;
pub mod partition;
pub mod row_stream;

use crate::exec::expr::ScalarEvaluator;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
    LeftSemi,
    RightSemi,
    LeftAnti,
    RightAnti,
    NullAwareLeftAnti,
}

impl JoinType {
    pub fn as_str(self) -> &'static str {
        match self {
            JoinType::Inner => "INNER",
            JoinType::LeftOuter => "LEFT_OUTER",
            JoinType::RightOuter => "RIGHT_OUTER",
            JoinType::FullOuter => "FULL_OUTER",
            JoinType::LeftSemi => "LEFT_SEMI",
            JoinType::RightSemi => "RIGHT_SEMI",
            JoinType::LeftAnti => "LEFT_ANTI",
            JoinType::RightAnti => "RIGHT_ANTI",
            JoinType::NullAwareLeftAnti => "NULL_AWARE_LEFT_ANTI",
        }
    }

    /// Whether the join emits build rows that found no probe match, which
    /// forces build partitions to outlive the probe pass over them.
    pub(crate) fn needs_unmatched_build_rows(self) -> bool {
        matches!(
            self,
            JoinType::RightOuter | JoinType::RightAnti | JoinType::FullOuter
        )
    }

    pub(crate) fn is_left_semi(self) -> bool {
        matches!(
            self,
            JoinType::LeftSemi | JoinType::LeftAnti | JoinType::NullAwareLeftAnti
        )
    }
}

/// One equality conjunct of the join: the build-side key expression and
/// whether the comparison uses IS NOT DISTINCT FROM (NULL equals NULL)
/// semantics.
#[derive(Debug)]
pub struct EqJoinConjunct {
    pub build_expr: Box<dyn ScalarEvaluator>,
    pub is_not_distinct_from: bool,
}
