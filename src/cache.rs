// cache.rs

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One monitored quantity. Each variant has exactly one producer task; see
/// [`SharedCache::take_writer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    Temperature,
    Humidity,
    Pm1,
    Pm25,
    Pm10,
    Tvoc,
    Eco2,
    AqiPm25,
    AqiTvoc,
    BatteryVoltage,
    BatteryPercent,
}

pub const QUANTITY_COUNT: usize = 11;

impl Quantity {
    pub const ALL: [Quantity; QUANTITY_COUNT] = [
        Quantity::Temperature,
        Quantity::Humidity,
        Quantity::Pm1,
        Quantity::Pm25,
        Quantity::Pm10,
        Quantity::Tvoc,
        Quantity::Eco2,
        Quantity::AqiPm25,
        Quantity::AqiTvoc,
        Quantity::BatteryVoltage,
        Quantity::BatteryPercent,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Cloud datastream name, matching the Blynk dashboard setup.
    pub fn datastream(self) -> &'static str {
        match self {
            Quantity::Temperature => "Temperature",
            Quantity::Humidity => "Humidity",
            Quantity::Pm1 => "PM1",
            Quantity::Pm25 => "PM2_5",
            Quantity::Pm10 => "PM10",
            Quantity::Tvoc => "TVOC",
            Quantity::Eco2 => "eCO2",
            Quantity::AqiPm25 => "AQI",
            Quantity::AqiTvoc => "AQI_TVOC",
            Quantity::BatteryVoltage => "Battery_V",
            Quantity::BatteryPercent => "Battery_Pct",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StalenessError {
    #[error("quantity has not been sampled yet")]
    NotYetSampled,
}

/// Latest reading for one quantity. `valid` is false only until the first
/// write; readings are never invalidated afterwards, staleness is judged
/// from the timestamp instead.
#[derive(Clone, Copy, Debug)]
pub struct CacheEntry {
    pub value: f32,
    pub timestamp: Instant,
    pub valid: bool,
}

/// Consistent copy of every cache entry, captured in a single critical
/// section so readers that combine quantities never see a torn view.
#[derive(Clone, Copy, Debug)]
pub struct CacheSnapshot {
    entries: [CacheEntry; QUANTITY_COUNT],
}

impl CacheSnapshot {
    pub fn entry(&self, q: Quantity) -> CacheEntry {
        self.entries[q.index()]
    }

    /// Value if the quantity has been sampled at least once.
    pub fn value(&self, q: Quantity) -> Option<f32> {
        let e = self.entries[q.index()];
        e.valid.then_some(e.value)
    }

    pub fn age(&self, q: Quantity, now: Instant) -> Option<Duration> {
        let e = self.entries[q.index()];
        e.valid.then(|| now.duration_since(e.timestamp))
    }
}

/// Latest value + capture time for every monitored quantity.
///
/// Single-writer/multi-reader: writes go through a [`CacheWriter`] handle
/// that can be taken at most once per quantity, so write-write races are
/// ruled out by construction. The interior lock is only ever held for a
/// plain copy, never across an await point.
pub struct SharedCache {
    entries: RwLock<[CacheEntry; QUANTITY_COUNT]>,
    writers_taken: Mutex<[bool; QUANTITY_COUNT]>,
}

impl SharedCache {
    pub fn new() -> Self {
        let created = Instant::now();
        let empty = CacheEntry {
            value: 0.0,
            timestamp: created,
            valid: false,
        };
        Self {
            entries: RwLock::new([empty; QUANTITY_COUNT]),
            writers_taken: Mutex::new([false; QUANTITY_COUNT]),
        }
    }

    /// Claim the writer handle for a quantity. Returns `None` if some task
    /// already owns it.
    pub fn take_writer(self: Arc<Self>, q: Quantity) -> Option<CacheWriter> {
        let mut taken = self
            .writers_taken
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if taken[q.index()] {
            return None;
        }
        taken[q.index()] = true;
        drop(taken);
        Some(CacheWriter {
            cache: self,
            quantity: q,
        })
    }

    /// Latest snapshot of one entry. Never blocks beyond the copy, never
    /// fails; check `valid` on the result.
    pub fn read(&self, q: Quantity) -> CacheEntry {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)[q.index()]
    }

    pub fn staleness(&self, q: Quantity, now: Instant) -> Result<Duration, StalenessError> {
        let e = self.read(q);
        if !e.valid {
            return Err(StalenessError::NotYetSampled);
        }
        Ok(now.duration_since(e.timestamp))
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            entries: *self.entries.read().unwrap_or_else(PoisonError::into_inner),
        }
    }

    fn write(&self, q: Quantity, value: f32, now: Instant) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries[q.index()] = CacheEntry {
            value,
            timestamp: now,
            valid: true,
        };
    }
}

impl Default for SharedCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive write handle for one quantity, held by its producer task.
pub struct CacheWriter {
    cache: Arc<SharedCache>,
    quantity: Quantity,
}

impl CacheWriter {
    pub fn write(&self, value: f32, now: Instant) {
        self.cache.write(self.quantity, value, now);
    }

    pub fn quantity(&self) -> Quantity {
        self.quantity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_start_invalid() {
        let cache = SharedCache::new();
        for q in Quantity::ALL {
            assert!(!cache.read(q).valid);
            assert_eq!(
                cache.staleness(q, Instant::now()),
                Err(StalenessError::NotYetSampled)
            );
        }
    }

    #[test]
    fn write_then_read_returns_value() {
        let cache = Arc::new(SharedCache::new());
        let w = cache.clone().take_writer(Quantity::Temperature).unwrap();
        let t = Instant::now();
        w.write(21.5, t);

        let e = cache.read(Quantity::Temperature);
        assert!(e.valid);
        assert_eq!(e.value, 21.5);
        assert_eq!(e.timestamp, t);
    }

    #[test]
    fn writer_can_only_be_taken_once() {
        let cache = Arc::new(SharedCache::new());
        assert!(cache.clone().take_writer(Quantity::Pm25).is_some());
        assert!(cache.clone().take_writer(Quantity::Pm25).is_none());
        // other quantities are unaffected
        assert!(cache.clone().take_writer(Quantity::Pm10).is_some());
    }

    #[test]
    fn staleness_grows_with_time() {
        let cache = Arc::new(SharedCache::new());
        let w = cache.clone().take_writer(Quantity::Humidity).unwrap();
        let t = Instant::now();
        w.write(40.0, t);

        let later = t + Duration::from_secs(7);
        assert_eq!(
            cache.staleness(Quantity::Humidity, later),
            Ok(Duration::from_secs(7))
        );
    }

    #[test]
    fn snapshot_is_complete_copy() {
        let cache = Arc::new(SharedCache::new());
        let t = Instant::now();
        cache.clone().take_writer(Quantity::Pm25).unwrap().write(12.0, t);
        cache.clone().take_writer(Quantity::Pm10).unwrap().write(20.0, t);

        let snap = cache.snapshot();
        assert_eq!(snap.value(Quantity::Pm25), Some(12.0));
        assert_eq!(snap.value(Quantity::Pm10), Some(20.0));
        assert_eq!(snap.value(Quantity::Tvoc), None);
        assert_eq!(
            snap.age(Quantity::Pm25, t + Duration::from_secs(3)),
            Some(Duration::from_secs(3))
        );
    }
}

// EOF
