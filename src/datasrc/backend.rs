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

//! The [`DataSource`] trait and the data-source factory.

use std::sync::Arc;

use anyhow::bail;
use log::warn;

use crate::class::Class;
use crate::config::Value;
use crate::name::Name;
use crate::zone::Zone;

use super::master_files::MasterFilesSource;
use super::sqlite3::Sqlite3Source;

/// The opaque error type of loader operations.
///
/// Loaders are black boxes to the core: a failed load means the new
/// zone image is discarded and the published data stays as it was, so
/// the core only needs something it can log.
pub type LoadError = anyhow::Error;

/// One data-source backend: a way of producing zone images.
///
/// Implementations are consulted by [`ClientList`](super::ClientList)
/// both at configuration time (to fill `local` caches) and when a
/// reload command asks for a fresh image of a single zone.
pub trait DataSource: Send + Sync + std::fmt::Debug {
    /// The configured type name of this source (e.g. `MasterFiles`).
    fn kind(&self) -> &str;

    /// Enumerates the origins this source can serve. This is the
    /// default for the `cache-zones` configuration when it is omitted.
    fn origins(&self) -> Result<Vec<Name>, LoadError>;

    /// Loads a complete image of one zone.
    fn load(&self, origin: &Name, class: Class) -> Result<Zone, LoadError>;
}

/// Constructs the data source described by a client configuration's
/// `type` and `params`.
pub fn instantiate(kind: &str, params: &Value) -> Result<Arc<dyn DataSource>, LoadError> {
    match kind {
        "MasterFiles" => Ok(Arc::new(MasterFilesSource::new(params)?)),
        "sqlite3" => Ok(Arc::new(Sqlite3Source::new(params)?)),
        other => bail!("unknown data source type {:?}", other),
    }
}

/// Validates a freshly loaded zone image. Validation errors fail the
/// load; warnings are logged and tolerated.
pub(crate) fn check_zone(zone: &Zone) -> Result<(), LoadError> {
    for issue in zone.validate() {
        if issue.is_error() {
            bail!("validation of {}/{} failed: {}", zone.origin(), zone.class(), issue);
        }
        warn!(
            "Validation of {}/{} produced a warning: {}.",
            zone.origin(),
            zone.class(),
            issue,
        );
    }
    Ok(())
}
