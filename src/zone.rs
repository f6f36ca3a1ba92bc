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

//! In-memory zone images and the read-only [`ZoneFinder`] over them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::class::Class;
use crate::name::Name;
use crate::rr::{Rrset, Ttl, Type};

/// One version of a DNS zone, loaded into memory.
///
/// A `Zone` is an immutable-once-built image: loaders construct it with
/// [`Zone::new`] and repeated [`Zone::add`] calls, and caches then
/// publish it behind an [`Arc`] where query threads read it without
/// further synchronization. Replacing a zone means building a fresh
/// image and swapping the pointer inside the cache; the old image lives
/// on until its last reader drops it.
///
/// Owner names map to their RRsets in a flat table rather than a label
/// tree, since images must serialize into memory-mapped segments.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Zone {
    origin: Name,
    class: Class,
    rrsets: BTreeMap<Name, Vec<Rrset>>,
}

impl Zone {
    /// Creates a new, initially empty `Zone`.
    pub fn new(origin: Name, class: Class) -> Self {
        Self {
            origin,
            class,
            rrsets: BTreeMap::new(),
        }
    }

    /// Returns the zone's origin (apex) name.
    pub fn origin(&self) -> &Name {
        &self.origin
    }

    /// Returns the zone's class.
    pub fn class(&self) -> Class {
        self.class
    }

    /// Adds a record to the `Zone`.
    ///
    /// Records are added one by one, in the "zone file" manner; the
    /// implementation organizes them into RRsets. This fails if the
    /// owner is not at or below the origin, if the record's class does
    /// not match the zone's, or if the record's TTL differs from other
    /// records in its RRset.
    pub fn add(
        &mut self,
        owner: &Name,
        rr_type: Type,
        class: Class,
        ttl: Ttl,
        rdata: String,
    ) -> Result<(), AddError> {
        if !owner.eq_or_subdomain_of(&self.origin) {
            return Err(AddError::NotInZone);
        }
        if class != self.class {
            return Err(AddError::ClassMismatch);
        }
        let rrsets = self.rrsets.entry(owner.clone()).or_default();
        if let Some(rrset) = rrsets.iter_mut().find(|r| r.rr_type == rr_type) {
            if rrset.ttl != ttl {
                return Err(AddError::TtlMismatch);
            }
            rrset.rdata.push(rdata);
        } else {
            rrsets.push(Rrset::new(rr_type, ttl, rdata));
        }
        Ok(())
    }

    /// Returns the RRset of the given type at `owner`, if any.
    pub fn rrset(&self, owner: &Name, rr_type: Type) -> Option<&Rrset> {
        self.rrsets
            .get(owner)?
            .iter()
            .find(|r| r.rr_type == rr_type)
    }

    /// Checks the zone for semantic problems. Loaders treat any issue
    /// for which [`ValidationIssue::is_error`] returns true as a load
    /// failure.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        match self.rrset(&self.origin, Type::SOA) {
            None => issues.push(ValidationIssue::NoSoa),
            Some(soa) if soa.rdata.len() > 1 => issues.push(ValidationIssue::MultipleSoas),
            Some(_) => (),
        }
        if self.rrset(&self.origin, Type::NS).is_none() {
            issues.push(ValidationIssue::NoApexNs);
        }
        issues
    }
}

////////////////////////////////////////////////////////////////////////
// LOOKUPS                                                            //
////////////////////////////////////////////////////////////////////////

/// A read-only accessor over one zone image.
///
/// Query threads obtain a `ZoneFinder` through
/// [`ClientList::find`](crate::datasrc::ClientList::find); the finder
/// holds its own reference to the image, so lookups proceed without any
/// lock and are unaffected by concurrent reloads.
#[derive(Clone, Debug)]
pub struct ZoneFinder {
    zone: Arc<Zone>,
}

impl ZoneFinder {
    pub(crate) fn new(zone: Arc<Zone>) -> Self {
        Self { zone }
    }

    /// Returns the zone image this finder reads.
    pub fn zone(&self) -> &Zone {
        &self.zone
    }

    /// Looks up the RRset of the given type at `name`.
    ///
    /// Names outside the zone, and names with no records at or below
    /// them, yield [`FindCode::NxDomain`]. A name that exists (or is an
    /// empty non-terminal) but lacks the requested type yields
    /// [`FindCode::NxRrset`].
    pub fn find(&self, name: &Name, rr_type: Type) -> FindResult {
        if !name.eq_or_subdomain_of(&self.zone.origin) {
            return FindResult {
                code: FindCode::NxDomain,
                rrset: None,
            };
        }
        if let Some(rrsets) = self.zone.rrsets.get(name) {
            match rrsets.iter().find(|r| r.rr_type == rr_type) {
                Some(rrset) => FindResult {
                    code: FindCode::Success,
                    rrset: Some(rrset.clone()),
                },
                None => FindResult {
                    code: FindCode::NxRrset,
                    rrset: None,
                },
            }
        } else if self
            .zone
            .rrsets
            .keys()
            .any(|owner| owner.eq_or_subdomain_of(name))
        {
            // An empty non-terminal: records exist below this name.
            FindResult {
                code: FindCode::NxRrset,
                rrset: None,
            }
        } else {
            FindResult {
                code: FindCode::NxDomain,
                rrset: None,
            }
        }
    }
}

/// The outcome of a [`ZoneFinder::find`] lookup.
#[derive(Clone, Debug)]
pub struct FindResult {
    pub code: FindCode,
    pub rrset: Option<Rrset>,
}

/// The result code of a [`ZoneFinder::find`] lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FindCode {
    Success,
    NxRrset,
    NxDomain,
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// Errors that arise during operations on a [`Zone`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AddError {
    NotInZone,
    ClassMismatch,
    TtlMismatch,
}

impl fmt::Display for AddError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::NotInZone => f.write_str("the record's owner is not within the zone"),
            Self::ClassMismatch => {
                f.write_str("the record's class does not match the zone's class")
            }
            Self::TtlMismatch => f.write_str(
                "the record's TTL does not match the TTL of existing records in the same RRset",
            ),
        }
    }
}

impl std::error::Error for AddError {}

/// A problem found by [`Zone::validate`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidationIssue {
    NoSoa,
    MultipleSoas,
    NoApexNs,
}

impl ValidationIssue {
    /// Returns whether the issue prevents the zone from being served.
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::NoApexNs)
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::NoSoa => f.write_str("the zone has no SOA record at its apex"),
            Self::MultipleSoas => f.write_str("the zone has more than one SOA record"),
            Self::NoApexNs => f.write_str("the zone has no NS records at its apex"),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
