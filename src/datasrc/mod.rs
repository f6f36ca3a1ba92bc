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

//! Data-source clients and their zone caches.
//!
//! A data source is a backend that can produce zone images: master
//! files on disk, an SQLite database, or anything else implementing
//! [`DataSource`]. For each DNS class the server serves, a
//! [`ClientList`] holds the configured clients in consultation order,
//! each optionally fronted by a [`ZoneCache`](cache::ZoneCache) that
//! keeps its zones in memory — in this process's heap (`local`) or in
//! a shared-memory segment other processes can map too (`mapped`).
//!
//! The map from class to client list is the single value the builder
//! publishes to query threads:
//!
//! ```text
//! ClientListMap ──▶ ClientList (IN) ──▶ client "dsrc1" ──▶ cache ──▶ zones
//!                                  └──▶ client "dsrc2" ──▶ ...
//! ```
//!
//! Query threads snapshot the map handle under the map mutex and then
//! read without further coordination; the builder replaces the whole
//! map on reconfiguration and mutates only cache *contents* (via
//! [`ZoneWriter`]) in between.

use std::collections::HashMap;
use std::sync::Arc;

use crate::class::Class;

mod backend;
pub mod cache;
mod client_list;
mod master_files;
pub mod segment;
mod sqlite3;

pub use backend::{instantiate, DataSource, LoadError};
pub use cache::{CacheType, SegmentState, ZoneCache, ZoneWriter, WriterError};
pub use client_list::{ClientList, ConfigError, ResetError, WriterStatus};
pub use master_files::MasterFilesSource;
pub use segment::{MappedSegment, SegmentError, SegmentMode};
pub use sqlite3::{Sqlite3Source, SCHEMA_SQL};

/// The published mapping from DNS class to its client list.
///
/// The map object itself is immutable once published; reconfiguration
/// swaps in a whole new map. Readers hold the map mutex only long
/// enough to clone the outer [`Arc`].
pub type ClientListMap = HashMap<Class, Arc<ClientList>>;
