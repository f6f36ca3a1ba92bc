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

//! The `MasterFiles` data source: zones loaded from master files.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context};

use crate::class::Class;
use crate::config::{self, Value};
use crate::name::Name;
use crate::zone::Zone;
use crate::zone_file::Reader;

use super::backend::{check_zone, DataSource, LoadError};

/// A data source whose `params` map zone origins to master-file paths:
/// `{"test1.example": "/path/to/test1.zone", ...}`.
#[derive(Debug)]
pub struct MasterFilesSource {
    zones: HashMap<Name, PathBuf>,
}

impl MasterFilesSource {
    pub fn new(params: &Value) -> Result<Self, LoadError> {
        let map = config::map_value(params)
            .map_err(|e| anyhow!("MasterFiles params: {}", e))?;
        let mut zones = HashMap::new();
        for (origin, path) in map {
            let origin: Name = origin
                .parse()
                .with_context(|| format!("bad zone origin {:?}", origin))?;
            let path = config::str_value(path)
                .map_err(|e| anyhow!("zone file path for {}: {}", origin, e))?;
            zones.insert(origin, PathBuf::from(path));
        }
        Ok(Self { zones })
    }
}

impl DataSource for MasterFilesSource {
    fn kind(&self) -> &str {
        "MasterFiles"
    }

    fn origins(&self) -> Result<Vec<Name>, LoadError> {
        Ok(self.zones.keys().cloned().collect())
    }

    fn load(&self, origin: &Name, class: Class) -> Result<Zone, LoadError> {
        let path = self
            .zones
            .get(origin)
            .ok_or_else(|| anyhow!("zone {} is not configured in this data source", origin))?;
        let reader = Reader::open(path, Some(origin.clone()))
            .with_context(|| format!("failed to open {}", path.display()))?;

        let mut zone = Zone::new(origin.clone(), class);
        for line in reader {
            let line = line.with_context(|| format!("failed to parse {}", path.display()))?;
            zone.add(
                &line.record.owner,
                line.record.rr_type,
                line.record.class,
                line.record.ttl,
                line.record.rdata,
            )
            .with_context(|| {
                format!(
                    "failed to add the record at {} line {} to the zone",
                    path.display(),
                    line.number,
                )
            })?;
        }
        check_zone(&zone)?;
        Ok(zone)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::rr::Type;

    const GOOD_ZONE: &str = "\
        $TTL 3600\n\
        @ IN SOA ns.test1.example. admin.test1.example. 1 7200 900 1209600 300\n\
        @ IN NS ns.test1.example.\n\
        ns IN A 192.0.2.1\n";

    fn source_for(dir: &TempDir, contents: &str) -> MasterFilesSource {
        let path = dir.path().join("test1.zone");
        fs::write(&path, contents).unwrap();
        MasterFilesSource::new(&json!({
            "test1.example": path.to_str().unwrap(),
        }))
        .unwrap()
    }

    #[test]
    fn loads_a_configured_zone() {
        let dir = TempDir::new().unwrap();
        let source = source_for(&dir, GOOD_ZONE);
        let origin: Name = "test1.example.".parse().unwrap();

        assert_eq!(source.origins().unwrap(), vec![origin.clone()]);
        let zone = source.load(&origin, Class::IN).unwrap();
        let ns: Name = "ns.test1.example.".parse().unwrap();
        assert!(zone.rrset(&ns, Type::A).is_some());
    }

    #[test]
    fn rejects_unconfigured_origins() {
        let dir = TempDir::new().unwrap();
        let source = source_for(&dir, GOOD_ZONE);
        let other: Name = "test2.example.".parse().unwrap();
        assert!(source.load(&other, Class::IN).is_err());
    }

    #[test]
    fn broken_zone_files_fail_to_load() {
        let dir = TempDir::new().unwrap();
        let source = source_for(&dir, "@ IN A not-an-address\n");
        let origin: Name = "test1.example.".parse().unwrap();
        assert!(source.load(&origin, Class::IN).is_err());
    }

    #[test]
    fn zones_without_soa_fail_validation() {
        let dir = TempDir::new().unwrap();
        let source = source_for(&dir, "$TTL 60\n@ IN A 192.0.2.1\n");
        let origin: Name = "test1.example.".parse().unwrap();
        let err = source.load(&origin, Class::IN).unwrap_err();
        assert!(err.to_string().contains("validation"));
    }

    #[test]
    fn bad_params_are_rejected() {
        assert!(MasterFilesSource::new(&json!(["not", "a", "map"])).is_err());
        assert!(MasterFilesSource::new(&json!({"..": "/tmp/x"})).is_err());
        assert!(MasterFilesSource::new(&json!({"ok.example": 3})).is_err());
    }
}
