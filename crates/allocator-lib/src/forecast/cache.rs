//! Forecast cache keyed by (instance type, region, time bucket)

use crate::models::{ForecastKey, ForecastResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;

#[derive(Debug)]
pub struct ForecastCache {
    entries: DashMap<(ForecastKey, i64), ForecastResult>,
    validity_secs: u64,
}

impl ForecastCache {
    pub fn new(validity_secs: u64) -> Self {
        Self {
            entries: DashMap::new(),
            validity_secs: validity_secs.max(1),
        }
    }

    /// floor(now / validity window)
    pub fn bucket(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp().div_euclid(self.validity_secs as i64)
    }

    pub fn is_stale(&self, result: &ForecastResult, now: DateTime<Utc>) -> bool {
        result.age_secs(now) > self.validity_secs as i64
    }

    /// Fresh entry for the key in the current bucket
    pub fn get(&self, key: &ForecastKey, now: DateTime<Utc>) -> Option<ForecastResult> {
        let bucket = self.bucket(now);
        let entry = self.entries.get(&(key.clone(), bucket))?;
        if self.is_stale(&entry, now) {
            return None;
        }
        Some(entry.clone())
    }

    pub fn insert(&self, result: ForecastResult, now: DateTime<Utc>) {
        let bucket = self.bucket(now);
        self.entries.retain(|(_, b), _| *b >= bucket);
        self.entries.insert((result.key.clone(), bucket), result);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
