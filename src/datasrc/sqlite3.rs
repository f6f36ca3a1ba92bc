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

//! The `sqlite3` data source: zones loaded from an SQLite database.

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use log::warn;
use rusqlite::{params, Connection, OptionalExtension};

use crate::class::Class;
use crate::config::{self, Value};
use crate::name::Name;
use crate::rr::{validate_rdata, Ttl, Type};
use crate::zone::Zone;

use super::backend::{check_zone, DataSource, LoadError};

/// The schema this source expects. Origins and owners are stored in
/// canonical presentation format (lowercase, trailing dot); classes and
/// types in their mnemonic forms.
pub const SCHEMA_SQL: &str = "\
    CREATE TABLE IF NOT EXISTS zones (\
        id     INTEGER PRIMARY KEY,\
        origin TEXT NOT NULL,\
        class  TEXT NOT NULL DEFAULT 'IN',\
        UNIQUE (origin, class)\
    );\
    CREATE TABLE IF NOT EXISTS records (\
        zone_id INTEGER NOT NULL REFERENCES zones (id),\
        owner   TEXT NOT NULL,\
        ttl     INTEGER NOT NULL,\
        type    TEXT NOT NULL,\
        rdata   TEXT NOT NULL\
    );";

/// A data source whose `params` name an SQLite database file:
/// `{"database_file": "/path/to/zones.sqlite3"}`.
///
/// A connection is opened per operation. Loads happen on the builder
/// thread with no lock held, so there is nothing to gain from holding a
/// connection (and its file locks) across the long idle stretches in
/// between.
#[derive(Debug)]
pub struct Sqlite3Source {
    database_file: PathBuf,
}

impl Sqlite3Source {
    pub fn new(params: &Value) -> Result<Self, LoadError> {
        let map = config::map_value(params).map_err(|e| anyhow!("sqlite3 params: {}", e))?;
        let database_file = map
            .get("database_file")
            .ok_or_else(|| anyhow!("sqlite3 params lack \"database_file\""))
            .and_then(|v| config::str_value(v).map_err(|e| anyhow!("database_file: {}", e)))?;
        Ok(Self {
            database_file: PathBuf::from(database_file),
        })
    }

    fn connect(&self) -> Result<Connection, LoadError> {
        Connection::open(&self.database_file)
            .with_context(|| format!("failed to open {}", self.database_file.display()))
    }
}

impl DataSource for Sqlite3Source {
    fn kind(&self) -> &str {
        "sqlite3"
    }

    fn origins(&self) -> Result<Vec<Name>, LoadError> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT origin FROM zones")
            .context("failed to query the zones table")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("failed to query the zones table")?;

        let mut origins = Vec::new();
        for row in rows {
            let text = row.context("failed to read a zones row")?;
            match text.parse() {
                Ok(origin) => origins.push(origin),
                Err(e) => warn!(
                    "Ignoring zone with bad origin {:?} in {}: {}.",
                    text,
                    self.database_file.display(),
                    e,
                ),
            }
        }
        Ok(origins)
    }

    fn load(&self, origin: &Name, class: Class) -> Result<Zone, LoadError> {
        let conn = self.connect()?;
        let zone_id: i64 = conn
            .query_row(
                "SELECT id FROM zones WHERE origin = ?1 AND class = ?2",
                params![origin.to_string(), class.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query the zones table")?
            .ok_or_else(|| anyhow!("zone {}/{} is not in the database", origin, class))?;

        let mut zone = Zone::new(origin.clone(), class);
        let mut stmt = conn
            .prepare("SELECT owner, ttl, type, rdata FROM records WHERE zone_id = ?1")
            .context("failed to query the records table")?;
        let rows = stmt
            .query_map(params![zone_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .context("failed to query the records table")?;

        for row in rows {
            let (owner, ttl, rr_type, rdata) = row.context("failed to read a records row")?;
            let owner: Name = owner
                .parse()
                .with_context(|| format!("bad owner {:?} in zone {}", owner, origin))?;
            let rr_type: Type = rr_type
                .parse()
                .map_err(|e| anyhow!("bad type {:?} at {}: {}", rr_type, owner, e))?;
            let rdata = validate_rdata(rr_type, &rdata)
                .map_err(|e| anyhow!("bad {} RDATA at {}: {}", rr_type, owner, e))?;
            zone.add(&owner, rr_type, class, Ttl::from(ttl), rdata)
                .with_context(|| format!("failed to add the record at {} to the zone", owner))?;
        }
        check_zone(&zone)?;
        Ok(zone)
    }
}
