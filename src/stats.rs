//  Copyright 2025 Greenroom Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::collections::HashMap;

/// Counters describing cache behaviour since stats were enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Largest host usage observed, in bytes.
    pub high_watermark: u64,
    /// Record count at the last hit.
    pub in_cache: usize,
    /// Records evicted to make room.
    pub evictions: u64,
    /// The host byte budget at the last hit.
    pub byte_budget: u64,
    /// Largest record size seen per stats name.
    pub peak_sizes: HashMap<String, u64>,
}

impl CacheStats {
    pub(crate) fn record_peak(&mut self, name: &str, size: u64) {
        let peak = self.peak_sizes.entry(name.to_string()).or_default();
        *peak = (*peak).max(size);
    }
}
