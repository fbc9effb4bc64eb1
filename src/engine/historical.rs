//! Historical route cache and loader.
//!
//! Collections are cached under a versioned key derived from the filter
//! query. The cache is a small bounded FIFO: inserting past capacity evicts
//! the oldest entry, regardless of how often it was read.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use log::debug;
use thiserror::Error;

use crate::api::{ApiError, TrackerApi};
use crate::model::{FeatureCollection, FilterQuery};

pub const MAX_CACHE_SIZE: usize = 10;

#[derive(Error, Debug)]
pub enum LoadError {
  #[error("a load for this range is already in flight")]
  LoadInProgress { key: String },
  #[error(transparent)]
  Api(#[from] ApiError),
}

struct CacheEntry {
  key: String,
  collection: FeatureCollection,
}

/// Insertion-ordered bounded cache. FIFO eviction, deliberately not LRU:
/// reads never change eviction order.
pub struct RouteCache {
  capacity: usize,
  entries: VecDeque<CacheEntry>,
}

impl RouteCache {
  #[must_use]
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity: capacity.max(1),
      entries: VecDeque::new(),
    }
  }

  #[must_use]
  pub fn get(&self, key: &str) -> Option<&FeatureCollection> {
    self
      .entries
      .iter()
      .find(|entry| entry.key == key)
      .map(|entry| &entry.collection)
  }

  pub fn insert(&mut self, key: String, collection: FeatureCollection) {
    if let Some(existing) = self.entries.iter_mut().find(|entry| entry.key == key) {
      existing.collection = collection;
      return;
    }
    if self.entries.len() == self.capacity {
      if let Some(evicted) = self.entries.pop_front() {
        debug!("cache_evict: {}", evicted.key);
      }
    }
    self.entries.push_back(CacheEntry { key, collection });
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Oldest-first keys, mostly for diagnostics.
  #[must_use]
  pub fn keys(&self) -> Vec<String> {
    self.entries.iter().map(|entry| entry.key.clone()).collect()
  }

  pub fn clear(&mut self) {
    self.entries.clear();
  }
}

/// Fetches and caches historical route collections.
pub struct HistoricalLoader {
  api: Arc<dyn TrackerApi>,
  cache: Mutex<RouteCache>,
  in_flight: Mutex<HashSet<String>>,
}

impl HistoricalLoader {
  #[must_use]
  pub fn new(api: Arc<dyn TrackerApi>, capacity: usize) -> Self {
    Self {
      api,
      cache: Mutex::new(RouteCache::new(capacity)),
      in_flight: Mutex::new(HashSet::new()),
    }
  }

  /// Returns the collection for `query`, from cache when possible.
  ///
  /// On a miss, a single HTTP fetch is issued; concurrent loads for the
  /// same key are refused rather than duplicated. An empty collection is a
  /// valid result ("no data for range"), not an error.
  pub async fn load(&self, query: &FilterQuery) -> Result<FeatureCollection, LoadError> {
    let key = query.cache_key();

    if let Some(hit) = self.cache.lock().unwrap().get(&key) {
      debug!("cache_hit: {key}");
      return Ok(hit.clone());
    }

    {
      let mut in_flight = self.in_flight.lock().unwrap();
      if !in_flight.insert(key.clone()) {
        return Err(LoadError::LoadInProgress { key });
      }
    }
    debug!("cache_miss: {key}");

    let result = self.api.historical_data(query).await;
    self.in_flight.lock().unwrap().remove(&key);

    let collection = result?;
    self
      .cache
      .lock()
      .unwrap()
      .insert(key, collection.clone());
    Ok(collection)
  }

  /// Drops every cached collection. Used after the backend refetches trip
  /// data, which makes all cached ranges stale.
  pub fn invalidate(&self) {
    self.cache.lock().unwrap().clear();
  }

  #[must_use]
  pub fn cached_len(&self) -> usize {
    self.cache.lock().unwrap().len()
  }

  #[must_use]
  pub fn cached_keys(&self) -> Vec<String> {
    self.cache.lock().unwrap().keys()
  }
}
