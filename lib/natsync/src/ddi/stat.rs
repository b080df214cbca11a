// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Named counters.

pub use stat_macro::StatProvider;

/// A provider of named `u64` counters.
///
/// Rather than implementing this trait manually, the stat-macro
/// should be used.
///
/// # Example
///
/// To declare a new stat provider simply define a struct of named
/// fields with type [`StatU64`] and derive [`StatProvider`].
///
/// ```ignore
/// #[derive(StatProvider)]
/// struct SomeStats {
///     rules_added: StatU64,
///     rules_failed: StatU64,
/// }
/// ```
///
/// To update the values use the `+=` operator.
///
/// ```ignore
/// some_val.stats.rules_added += 1;
/// ```
pub trait StatProvider {
    const NUM_FIELDS: u32;
    type Snap;

    fn new() -> Self;

    fn num_fields(&self) -> u32 {
        Self::NUM_FIELDS
    }

    /// Return a snapshot of the stats. This is how you obtain a copy,
    /// as opposed to the traditional clone().
    fn snapshot(&self) -> Self::Snap;

    /// The counter names, in declaration order.
    fn names() -> &'static [&'static str];
}

/// A 64-bit unsigned counter.
#[derive(Debug, Default)]
pub struct StatU64 {
    value: u64,
}

impl StatU64 {
    pub fn new() -> Self {
        Self { value: 0 }
    }

    pub fn val(&self) -> u64 {
        self.value
    }
}

impl core::ops::AddAssign<u64> for StatU64 {
    #[inline]
    fn add_assign(&mut self, other: u64) {
        self.value = self.value.wrapping_add(other);
    }
}
