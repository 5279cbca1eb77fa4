// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The most recent guest metadata, by category.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use domain_api_types::guest::{
    CategoryReport, CategoryStatus, GuestInfo, GuestMetadataCategory,
    GuestMetadataReport,
};

#[derive(Clone, Debug)]
struct Entry {
    value: Option<GuestInfo>,
    captured_at: Option<DateTime<Utc>>,
    last_attempt: Option<DateTime<Utc>>,
    status: CategoryStatus,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            value: None,
            captured_at: None,
            last_attempt: None,
            status: CategoryStatus::NeverPolled,
        }
    }
}

/// Per-category guest metadata.
///
/// A category's value only ever moves forward in time: a failed poll keeps
/// the previous value and marks it stale, and a successful poll that was
/// issued before the value currently held is discarded.
#[derive(Clone, Debug)]
pub struct GuestMetadataSnapshot {
    entries: BTreeMap<GuestMetadataCategory, Entry>,
}

impl Default for GuestMetadataSnapshot {
    fn default() -> Self {
        Self {
            entries: GuestMetadataCategory::ALL
                .iter()
                .map(|c| (*c, Entry::default()))
                .collect(),
        }
    }
}

impl GuestMetadataSnapshot {
    fn entry(&mut self, category: GuestMetadataCategory) -> &mut Entry {
        self.entries.entry(category).or_default()
    }

    /// Records a reply to a command issued at `issued_at`. Returns false if
    /// a newer value was already held.
    pub fn record_success(
        &mut self,
        info: GuestInfo,
        issued_at: DateTime<Utc>,
    ) -> bool {
        let entry = self.entry(info.category());
        if entry.captured_at.is_some_and(|t| t > issued_at) {
            return false;
        }

        entry.last_attempt = Some(issued_at);
        entry.captured_at = Some(issued_at);
        entry.value = Some(info);
        entry.status = CategoryStatus::Fresh;
        true
    }

    pub fn record_failure(
        &mut self,
        category: GuestMetadataCategory,
        reason: String,
        at: DateTime<Utc>,
    ) {
        let entry = self.entry(category);
        entry.last_attempt = Some(at);
        entry.status = CategoryStatus::Stale(reason);
    }

    pub fn record_unsupported(
        &mut self,
        category: GuestMetadataCategory,
        at: DateTime<Utc>,
    ) {
        let entry = self.entry(category);
        entry.last_attempt = Some(at);
        entry.status = CategoryStatus::Unsupported;
    }

    /// Marks every category with a value as stale. Unsupported and
    /// never-polled categories are left alone.
    pub fn mark_all_stale(&mut self, reason: &str, at: DateTime<Utc>) {
        for entry in self.entries.values_mut() {
            if matches!(
                entry.status,
                CategoryStatus::Unsupported | CategoryStatus::NeverPolled
            ) {
                continue;
            }
            entry.last_attempt = Some(at);
            entry.status = CategoryStatus::Stale(reason.to_owned());
        }
    }

    /// Forgets everything. Used when the domain leaves this host.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn category_report(
        &self,
        category: GuestMetadataCategory,
        advisory: bool,
    ) -> CategoryReport {
        let entry = self.entries.get(&category).cloned().unwrap_or_default();
        CategoryReport {
            category,
            value: entry.value,
            captured_at: entry.captured_at,
            last_attempt: entry.last_attempt,
            status: entry.status,
            advisory,
        }
    }

    pub fn report(&self, advisory: bool) -> GuestMetadataReport {
        GuestMetadataReport {
            categories: self
                .entries
                .keys()
                .map(|c| (*c, self.category_report(*c, advisory)))
                .collect(),
        }
    }
}
