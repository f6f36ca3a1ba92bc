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

//! Resource-record types: [`Type`], [`Ttl`], and [`Rrset`].
//!
//! The core stores RDATA in presentation format. It never serves wire
//! format itself (the query path lives outside this crate), and both
//! provided loaders — master files and SQLite — produce text, so
//! keeping the presentation form avoids a round trip through an
//! encoding nothing here consumes. [`validate_rdata`] checks the forms
//! that are cheap to check at load time.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::name::{Name, NameError};

////////////////////////////////////////////////////////////////////////
// RR TYPES                                                           //
////////////////////////////////////////////////////////////////////////

/// Represents the RR type of a DNS record.
///
/// An RR type is represented on the wire as an unsigned 16-bit integer.
/// Hence this is basically a wrapper around `u16` with nice
/// [`Debug`](fmt::Debug), [`Display`](fmt::Display), and [`FromStr`]
/// implementations for working with the common textual representations
/// of RR types. In addition, constants for common RR types (e.g.
/// [`Type::A`]) are provided.
#[derive(Clone, Copy, Deserialize, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize)]
pub struct Type(u16);

impl Type {
    pub const A: Type = Type(1);
    pub const NS: Type = Type(2);
    pub const CNAME: Type = Type(5);
    pub const SOA: Type = Type(6);
    pub const PTR: Type = Type(12);
    pub const MX: Type = Type(15);
    pub const TXT: Type = Type(16);
    pub const AAAA: Type = Type(28);
    pub const SRV: Type = Type(33);
}

impl From<u16> for Type {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

impl From<Type> for u16 {
    fn from(rr_type: Type) -> Self {
        rr_type.0
    }
}

impl FromStr for Type {
    type Err = &'static str;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.to_ascii_uppercase().as_str() {
            "A" => Ok(Self::A),
            "NS" => Ok(Self::NS),
            "CNAME" => Ok(Self::CNAME),
            "SOA" => Ok(Self::SOA),
            "PTR" => Ok(Self::PTR),
            "MX" => Ok(Self::MX),
            "TXT" => Ok(Self::TXT),
            "AAAA" => Ok(Self::AAAA),
            "SRV" => Ok(Self::SRV),
            other => {
                // RFC 3597 § 5
                if let Some(value) = other.strip_prefix("TYPE") {
                    value
                        .parse::<u16>()
                        .map(Self::from)
                        .or(Err("type value is not a valid unsigned 16-bit integer"))
                } else {
                    Err("unknown RR type")
                }
            }
        }
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", *self)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::A => write!(f, "A"),
            Self::NS => write!(f, "NS"),
            Self::CNAME => write!(f, "CNAME"),
            Self::SOA => write!(f, "SOA"),
            Self::PTR => write!(f, "PTR"),
            Self::MX => write!(f, "MX"),
            Self::TXT => write!(f, "TXT"),
            Self::AAAA => write!(f, "AAAA"),
            Self::SRV => write!(f, "SRV"),
            Self(value) => write!(f, "TYPE{}", value), // RFC 3597 § 5
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TTLS                                                               //
////////////////////////////////////////////////////////////////////////

/// The time to live (TTL) of a DNS record.
///
/// Per RFC 2181 § 8, TTL values are unsigned integers between 0 and
/// 2³¹ - 1, inclusive; a value with the most significant bit set is
/// interpreted as zero. `Ttl::from(u32)` implements that clamping.
#[derive(Clone, Copy, Deserialize, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize)]
pub struct Ttl(u32);

impl From<u32> for Ttl {
    fn from(raw: u32) -> Self {
        if raw > i32::MAX as u32 {
            Self(0)
        } else {
            Self(raw)
        }
    }
}

impl From<Ttl> for u32 {
    fn from(ttl: Ttl) -> Self {
        ttl.0
    }
}

impl fmt::Debug for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////
// RRSETS                                                             //
////////////////////////////////////////////////////////////////////////

/// A set of records sharing an owner, type, class, and TTL.
///
/// The owner and class are implied by the containing
/// [`Zone`](crate::zone::Zone); the RRset itself carries the type, the
/// TTL, and the RDATA of each record in presentation format.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Rrset {
    pub rr_type: Type,
    pub ttl: Ttl,
    pub rdata: Vec<String>,
}

impl Rrset {
    /// Creates an `Rrset` containing a single record.
    pub fn new(rr_type: Type, ttl: Ttl, rdata: String) -> Self {
        Self {
            rr_type,
            ttl,
            rdata: vec![rdata],
        }
    }
}

////////////////////////////////////////////////////////////////////////
// RDATA VALIDATION                                                   //
////////////////////////////////////////////////////////////////////////

/// Validates RDATA in presentation format for the given type, returning
/// a normalized copy.
///
/// Address records must parse as addresses and name-valued RDATA must
/// parse as names; everything else is passed through with surrounding
/// whitespace trimmed. This is deliberately shallow: loaders are opaque
/// and the query path does not interpret RDATA, so only the forms that
/// are cheap to check here are checked.
pub fn validate_rdata(rr_type: Type, text: &str) -> Result<String, RdataError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(RdataError::Empty);
    }
    match rr_type {
        Type::A => {
            text.parse::<Ipv4Addr>().or(Err(RdataError::BadAddress))?;
        }
        Type::AAAA => {
            text.parse::<Ipv6Addr>().or(Err(RdataError::BadAddress))?;
        }
        Type::NS | Type::CNAME | Type::PTR => {
            text.parse::<Name>().map_err(RdataError::BadName)?;
        }
        Type::SOA => {
            // MNAME RNAME SERIAL REFRESH RETRY EXPIRE MINIMUM
            let fields: Vec<&str> = text.split_whitespace().collect();
            if fields.len() != 7 {
                return Err(RdataError::BadFieldCount);
            }
            fields[0].parse::<Name>().map_err(RdataError::BadName)?;
            fields[1].parse::<Name>().map_err(RdataError::BadName)?;
            for field in &fields[2..] {
                field.parse::<u32>().or(Err(RdataError::BadInteger))?;
            }
        }
        Type::MX => {
            let fields: Vec<&str> = text.split_whitespace().collect();
            if fields.len() != 2 {
                return Err(RdataError::BadFieldCount);
            }
            fields[0].parse::<u16>().or(Err(RdataError::BadInteger))?;
            fields[1].parse::<Name>().map_err(RdataError::BadName)?;
        }
        _ => {}
    }
    Ok(text.to_owned())
}

/// Errors from [`validate_rdata`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RdataError {
    Empty,
    BadAddress,
    BadName(NameError),
    BadInteger,
    BadFieldCount,
}

impl fmt::Display for RdataError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("the record has no RDATA"),
            Self::BadAddress => f.write_str("the RDATA is not a valid IP address"),
            Self::BadName(e) => write!(f, "the RDATA contains an invalid name: {}", e),
            Self::BadInteger => f.write_str("the RDATA contains an invalid integer field"),
            Self::BadFieldCount => f.write_str("the RDATA has the wrong number of fields"),
        }
    }
}

impl std::error::Error for RdataError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_text_forms_round_trip() {
        assert_eq!("aaaa".parse::<Type>().unwrap(), Type::AAAA);
        assert_eq!(Type::AAAA.to_string(), "AAAA");
        let unknown: Type = "TYPE4242".parse().unwrap();
        assert_eq!(u16::from(unknown), 4242);
        assert_eq!(unknown.to_string(), "TYPE4242");
        assert!("bogus".parse::<Type>().is_err());
    }

    #[test]
    fn ttl_clamps_high_bit_values() {
        assert_eq!(u32::from(Ttl::from(u32::MAX)), 0);
        assert_eq!(u32::from(Ttl::from(3600)), 3600);
    }

    #[test]
    fn rdata_validation_accepts_good_records() {
        assert_eq!(validate_rdata(Type::A, " 192.0.2.1 ").unwrap(), "192.0.2.1");
        validate_rdata(Type::AAAA, "2001:db8::1").unwrap();
        validate_rdata(Type::NS, "ns1.example.org.").unwrap();
        validate_rdata(Type::SOA, ". . 1 0 0 0 0").unwrap();
        validate_rdata(Type::MX, "10 mail.example.org.").unwrap();
        validate_rdata(Type::TXT, "\"anything goes\"").unwrap();
    }

    #[test]
    fn rdata_validation_rejects_bad_records() {
        assert_eq!(
            validate_rdata(Type::A, "not-an-address"),
            Err(RdataError::BadAddress)
        );
        assert_eq!(
            validate_rdata(Type::SOA, ". . 1 0 0"),
            Err(RdataError::BadFieldCount)
        );
        assert_eq!(
            validate_rdata(Type::NS, "a..b."),
            Err(RdataError::BadName(NameError::EmptyLabel))
        );
        assert_eq!(validate_rdata(Type::TXT, "   "), Err(RdataError::Empty));
    }
}
