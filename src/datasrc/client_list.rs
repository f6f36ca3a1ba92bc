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

//! Implementation of the per-class [`ClientList`].

use std::fmt;
use std::sync::Arc;

use crate::class::Class;
use crate::config::{self, TypeError, Value};
use crate::name::{Name, NameError};
use crate::zone::ZoneFinder;

use super::backend::{self, DataSource, LoadError};
use super::cache::{CacheType, SegmentState, ZoneCache, ZoneWriter};
use super::segment::{SegmentError, SegmentMode};

/// The ordered data-source clients configured for one DNS class.
///
/// A `ClientList` is built once from its configuration and never
/// mutated afterwards, except that zone reloads replace images *inside*
/// a client's cache. Reconfiguration builds a whole new list; the old
/// one lives behind its `Arc` until the last reader lets go.
pub struct ClientList {
    class: Class,
    clients: Vec<Client>,
}

/// One configured data-source client.
struct Client {
    name: String,
    source: Arc<dyn DataSource>,
    cache: Option<Arc<ZoneCache>>,
    cache_zones: Vec<Name>,
}

/// The status part of [`ClientList::cached_zone_writer`]'s result.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriterStatus {
    /// A writer accompanies this status.
    Success,
    /// No configured cache covers the requested origin.
    ZoneNotFound,
    /// The covering client has caching disabled.
    CacheDisabled,
    /// The covering cache is mapped and its segment is absent or
    /// read-only.
    CacheNotWritable,
    /// The request itself was off (e.g. an unknown data source name).
    Other,
}

impl ClientList {
    /// Builds a client list from its configuration: a JSON list of
    /// client configurations, each a map with `type`, and optionally
    /// `name`, `params`, `cache-enable`, `cache-type`, and
    /// `cache-zones`.
    ///
    /// With `allow_cache_load` false, `local` caches are created empty
    /// instead of being filled from their backends (used by tests and
    /// fault injection). Construction is all-or-nothing: any failure
    /// discards the entire list.
    pub fn configure(
        class: Class,
        config: &Value,
        allow_cache_load: bool,
    ) -> Result<Self, ConfigError> {
        let entries = config::list_value(config)?;
        let mut clients: Vec<Client> = Vec::with_capacity(entries.len());

        for entry in entries {
            let entry = config::map_value(entry)?;

            let kind = entry
                .get("type")
                .ok_or(ConfigError::MissingField("type"))
                .and_then(|v| config::str_value(v).map_err(Into::into))?;
            let name = match entry.get("name") {
                Some(v) => config::str_value(v)?,
                None => kind,
            };
            if clients.iter().any(|c| c.name == name) {
                return Err(ConfigError::DuplicateName(name.to_owned()));
            }

            let params = entry.get("params").cloned().unwrap_or(Value::Null);
            let source = backend::instantiate(kind, &params).map_err(ConfigError::Datasource)?;

            let cache_enable = match entry.get("cache-enable") {
                Some(v) => config::bool_value(v)?,
                None => false,
            };
            let cache_type: CacheType = match entry.get("cache-type") {
                Some(v) => config::str_value(v)?.parse().map_err(ConfigError::CacheType)?,
                None => CacheType::Local,
            };

            let cache_zones = match entry.get("cache-zones") {
                Some(v) => {
                    let mut zones = Vec::new();
                    for origin in config::list_value(v)? {
                        let text = config::str_value(origin)?;
                        let origin = text
                            .parse()
                            .map_err(|e| ConfigError::BadOrigin(text.to_owned(), e))?;
                        zones.push(origin);
                    }
                    zones
                }
                None => source.origins().map_err(ConfigError::Datasource)?,
            };

            let cache = if cache_enable {
                let cache = ZoneCache::new(cache_type);
                if cache_type == CacheType::Local && allow_cache_load {
                    for origin in &cache_zones {
                        let zone = source.load(origin, class).map_err(|error| {
                            ConfigError::Load {
                                origin: origin.clone(),
                                error,
                            }
                        })?;
                        cache.populate(zone);
                    }
                }
                Some(Arc::new(cache))
            } else {
                None
            };

            clients.push(Client {
                name: name.to_owned(),
                source,
                cache,
                cache_zones,
            });
        }

        Ok(Self { class, clients })
    }

    /// Returns the class this list serves.
    pub fn class(&self) -> Class {
        self.class
    }

    /// Query-path lookup: finds the first client with a cached zone
    /// that `name` falls under and returns a finder over it. Clients
    /// are consulted in configuration order; within one cache the
    /// longest matching origin wins.
    pub fn find(&self, name: &Name) -> Option<ZoneFinder> {
        self.clients
            .iter()
            .filter_map(|client| client.cache.as_ref()?.best_match(name))
            .next()
            .map(ZoneFinder::new)
    }

    /// Produces a [`ZoneWriter`] for loading a new image of the zone at
    /// `origin`, along with a status describing the outcome. A writer
    /// accompanies [`WriterStatus::Success`] only.
    ///
    /// Without `datasource`, the first client whose configured cache
    /// zones include `origin` is used; with it, only the named client
    /// is considered.
    pub fn cached_zone_writer(
        &self,
        origin: &Name,
        catch_load_errors: bool,
        datasource: Option<&str>,
    ) -> (WriterStatus, Option<ZoneWriter>) {
        let client = match datasource {
            Some(wanted) => match self.clients.iter().find(|c| c.name == wanted) {
                Some(client) => client,
                None => return (WriterStatus::Other, None),
            },
            None => match self
                .clients
                .iter()
                .find(|c| c.cache_zones.contains(origin))
            {
                Some(client) => client,
                None => return (WriterStatus::ZoneNotFound, None),
            },
        };

        if !client.cache_zones.contains(origin) {
            return (WriterStatus::ZoneNotFound, None);
        }
        let cache = match &client.cache {
            Some(cache) => cache,
            None => return (WriterStatus::CacheDisabled, None),
        };
        if !cache.is_writable() {
            return (WriterStatus::CacheNotWritable, None);
        }
        let writer = ZoneWriter::new(
            cache.clone(),
            client.source.clone(),
            origin.clone(),
            self.class,
            catch_load_errors,
        );
        (WriterStatus::Success, Some(writer))
    }

    /// Binds the named client's mapped cache to a memory segment.
    pub fn reset_memory_segment(
        &self,
        datasource: &str,
        mode: SegmentMode,
        params: &Value,
    ) -> Result<(), ResetError> {
        let client = self
            .clients
            .iter()
            .find(|c| c.name == datasource)
            .ok_or_else(|| ResetError::UnknownClient(datasource.to_owned()))?;
        match &client.cache {
            Some(cache) if cache.cache_type() == CacheType::Mapped => cache
                .reset_segment(mode, params)
                .map_err(ResetError::Segment),
            _ => Err(ResetError::NotMapped(datasource.to_owned())),
        }
    }

    /// Returns the names of clients with mapped caches. These are the
    /// instances a new configuration waits on before it can be
    /// published.
    pub fn mapped_client_names(&self) -> Vec<String> {
        self.clients
            .iter()
            .filter(|c| {
                c.cache
                    .as_ref()
                    .map_or(false, |cache| cache.cache_type() == CacheType::Mapped)
            })
            .map(|c| c.name.clone())
            .collect()
    }

    /// Returns whether every mapped cache in the list has a bound
    /// segment.
    pub fn all_segments_ready(&self) -> bool {
        self.clients.iter().all(|c| {
            c.cache
                .as_ref()
                .map_or(true, |cache| cache.segment_state() == SegmentState::Ready)
        })
    }
}

impl fmt::Debug for ClientList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names: Vec<&str> = self.clients.iter().map(|c| c.name.as_str()).collect();
        f.debug_struct("ClientList")
            .field("class", &self.class)
            .field("clients", &names)
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// Errors from [`ClientList::configure`].
#[derive(Debug)]
pub enum ConfigError {
    Type(TypeError),
    MissingField(&'static str),
    CacheType(&'static str),
    DuplicateName(String),
    BadOrigin(String, NameError),
    Datasource(LoadError),
    Load { origin: Name, error: LoadError },
}

impl From<TypeError> for ConfigError {
    fn from(e: TypeError) -> Self {
        Self::Type(e)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Type(e) => write!(f, "bad client configuration: {}", e),
            Self::MissingField(field) => {
                write!(f, "a client configuration lacks {:?}", field)
            }
            Self::CacheType(what) => f.write_str(what),
            Self::DuplicateName(name) => {
                write!(f, "duplicate data source name {:?}", name)
            }
            Self::BadOrigin(text, e) => write!(f, "bad cache zone {:?}: {}", text, e),
            Self::Datasource(e) => write!(f, "failed to construct a data source: {:#}", e),
            Self::Load { origin, error } => {
                write!(f, "failed to load zone {} into its cache: {:#}", origin, error)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Errors from [`ClientList::reset_memory_segment`].
#[derive(Debug)]
pub enum ResetError {
    UnknownClient(String),
    NotMapped(String),
    Segment(SegmentError),
}

impl fmt::Display for ResetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnknownClient(name) => write!(f, "no data source is named {:?}", name),
            Self::NotMapped(name) => {
                write!(f, "data source {:?} does not use a mapped cache", name)
            }
            Self::Segment(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ResetError {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
