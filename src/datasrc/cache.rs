// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Per-client zone caches and the three-phase [`ZoneWriter`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use crate::class::Class;
use crate::config::Value;
use crate::name::Name;
use crate::zone::Zone;

use super::backend::{DataSource, LoadError};
use super::segment::{MappedSegment, SegmentError, SegmentMode};

/// Where a cache keeps its zone table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheType {
    /// In this process's heap; always writable and always ready.
    Local,
    /// In a shared-memory segment that must be bound with a segment
    /// reset before the cache is usable.
    Mapped,
}

impl FromStr for CacheType {
    type Err = &'static str;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text {
            "local" => Ok(Self::Local),
            "mapped" => Ok(Self::Mapped),
            _ => Err("cache-type must be \"local\" or \"mapped\""),
        }
    }
}

/// Whether a cache's backing segment is usable yet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SegmentState {
    Ready,
    Waiting,
}

/// One client's cache of zone images, keyed by origin.
///
/// Readers take the interior lock only long enough to clone an
/// [`Arc<Zone>`] out; all further reading happens on the snapshot.
/// Writes come only from the builder thread, which additionally holds
/// the client-list map mutex around them, so the interior lock is
/// never contended for long.
#[derive(Debug)]
pub struct ZoneCache {
    cache_type: CacheType,
    inner: RwLock<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    zones: HashMap<Name, Arc<Zone>>,
    segment: Option<MappedSegment>,
}

impl ZoneCache {
    /// Creates an empty cache. A [`CacheType::Mapped`] cache starts in
    /// [`SegmentState::Waiting`] and stays unusable until
    /// [`reset_segment`](Self::reset_segment) binds a segment.
    pub fn new(cache_type: CacheType) -> Self {
        Self {
            cache_type,
            inner: RwLock::new(CacheInner::default()),
        }
    }

    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    pub fn segment_state(&self) -> SegmentState {
        match self.cache_type {
            CacheType::Local => SegmentState::Ready,
            CacheType::Mapped => {
                if self.inner.read().unwrap().segment.is_some() {
                    SegmentState::Ready
                } else {
                    SegmentState::Waiting
                }
            }
        }
    }

    /// Returns whether zones can be installed into this cache.
    pub fn is_writable(&self) -> bool {
        match self.cache_type {
            CacheType::Local => true,
            CacheType::Mapped => self
                .inner
                .read()
                .unwrap()
                .segment
                .as_ref()
                .map_or(false, MappedSegment::is_writable),
        }
    }

    /// Returns the cached image of the zone at exactly `origin`.
    pub fn zone(&self, origin: &Name) -> Option<Arc<Zone>> {
        self.inner.read().unwrap().zones.get(origin).cloned()
    }

    /// Returns the cached zone with the longest origin that `name`
    /// falls under.
    pub fn best_match(&self, name: &Name) -> Option<Arc<Zone>> {
        let inner = self.inner.read().unwrap();
        inner
            .zones
            .iter()
            .filter(|(origin, _)| name.eq_or_subdomain_of(origin))
            .max_by_key(|(origin, _)| origin.num_labels())
            .map(|(_, zone)| zone.clone())
    }

    /// Fills the cache with a zone at configuration time, without
    /// touching any backing segment.
    pub(crate) fn populate(&self, zone: Zone) {
        let mut inner = self.inner.write().unwrap();
        inner.zones.insert(zone.origin().clone(), Arc::new(zone));
    }

    /// Atomically replaces (or adds) one zone image. For a mapped
    /// cache, the updated table is serialized into the segment before
    /// the in-memory table changes, so a failed write leaves the
    /// published image untouched.
    pub(crate) fn install(&self, zone: Zone) -> Result<(), CacheError> {
        let inner = &mut *self.inner.write().unwrap();
        if self.cache_type == CacheType::Mapped {
            let segment = match inner.segment.as_mut() {
                Some(s) if s.is_writable() => s,
                _ => return Err(CacheError::NotWritable),
            };
            let mut images: Vec<&Zone> = inner
                .zones
                .iter()
                .filter(|(origin, _)| *origin != zone.origin())
                .map(|(_, z)| z.as_ref())
                .collect();
            images.push(&zone);
            segment.write_zones(&images).map_err(CacheError::Segment)?;
        }
        inner.zones.insert(zone.origin().clone(), Arc::new(zone));
        Ok(())
    }

    /// Binds this cache to a shared-memory segment, replacing the zone
    /// table with the segment's image. Only meaningful for mapped
    /// caches; the client list enforces that.
    pub(crate) fn reset_segment(
        &self,
        mode: SegmentMode,
        params: &Value,
    ) -> Result<(), SegmentError> {
        let segment = MappedSegment::open(mode, params)?;
        let zones = segment.read_zones()?;
        let mut inner = self.inner.write().unwrap();
        inner.zones = zones
            .into_iter()
            .map(|zone| (zone.origin().clone(), Arc::new(zone)))
            .collect();
        inner.segment = Some(segment);
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////
// ZONE WRITERS                                                       //
////////////////////////////////////////////////////////////////////////

/// A pending load of one zone into one cache, split into three phases
/// so that the expensive part runs without any core lock held:
///
/// 1. [`load`](Self::load): read the backend and build the new image.
/// 2. [`install`](Self::install): swap the image into the cache.
/// 3. [`cleanup`](Self::cleanup): discard leftovers; always safe.
///
/// The builder calls `load` with no lock and the other two inside a
/// map-mutex critical section.
pub struct ZoneWriter {
    cache: Arc<ZoneCache>,
    source: Arc<dyn DataSource>,
    origin: Name,
    class: Class,
    catch_load_errors: bool,
    image: Option<Zone>,
    load_error: Option<LoadError>,
}

impl ZoneWriter {
    pub(crate) fn new(
        cache: Arc<ZoneCache>,
        source: Arc<dyn DataSource>,
        origin: Name,
        class: Class,
        catch_load_errors: bool,
    ) -> Self {
        Self {
            cache,
            source,
            origin,
            class,
            catch_load_errors,
            image: None,
            load_error: None,
        }
    }

    /// Builds the new zone image from the backend. When the writer was
    /// created with `catch_load_errors`, a failure is stored and
    /// reported by [`install`](Self::install) instead of here.
    pub fn load(&mut self) -> Result<(), LoadError> {
        match self.source.load(&self.origin, self.class) {
            Ok(zone) => {
                self.image = Some(zone);
                Ok(())
            }
            Err(e) if self.catch_load_errors => {
                self.load_error = Some(e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Swaps the loaded image into the cache.
    pub fn install(&mut self) -> Result<(), WriterError> {
        if let Some(e) = self.load_error.take() {
            return Err(WriterError::Load(e));
        }
        let zone = self.image.take().ok_or(WriterError::NotLoaded)?;
        self.cache.install(zone).map_err(WriterError::Cache)
    }

    /// Releases any intermediate state.
    pub fn cleanup(&mut self) {
        self.image = None;
        self.load_error = None;
    }
}

impl fmt::Debug for ZoneWriter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ZoneWriter")
            .field("origin", &self.origin)
            .field("class", &self.class)
            .field("loaded", &self.image.is_some())
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// Errors installing a zone into a cache.
#[derive(Debug)]
pub enum CacheError {
    NotWritable,
    Segment(SegmentError),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NotWritable => f.write_str("the cache is not writable"),
            Self::Segment(e) => write!(f, "segment write failed: {}", e),
        }
    }
}

impl std::error::Error for CacheError {}

/// Errors from [`ZoneWriter::install`].
#[derive(Debug)]
pub enum WriterError {
    Load(LoadError),
    NotLoaded,
    Cache(CacheError),
}

impl fmt::Display for WriterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Load(e) => write!(f, "the zone failed to load: {:#}", e),
            Self::NotLoaded => f.write_str("install called before a successful load"),
            Self::Cache(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for WriterError {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
