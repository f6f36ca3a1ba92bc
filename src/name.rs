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

//! Implementation of the [`Name`] type for domain names.

use std::fmt;
use std::str::FromStr;

use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The maximum length of a label in octets (RFC 1035 § 2.3.4).
const MAX_LABEL_LEN: usize = 63;

/// The maximum length of a domain name in octets in uncompressed wire
/// format (RFC 1035 § 2.3.4).
const MAX_NAME_LEN: usize = 255;

/// An absolute domain name.
///
/// Names are parsed from presentation format and stored with their
/// labels lowercased, so that equality, ordering, and hashing are
/// case-insensitive as the DNS requires (RFC 1035 § 2.3.3). Zone
/// origins and record owners throughout the crate are `Name`s; caches
/// key their zone tables by `Name`, and segment images serialize names
/// in presentation format.
///
/// Escape sequences in presentation format are not supported; zone data
/// requiring them cannot be expressed in the provided loaders.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Name {
    /// Labels in most-significant-last order, as on the wire; the root
    /// label is implicit. The root name itself has no labels.
    labels: Vec<Box<str>>,
}

impl Name {
    /// Returns the root name.
    pub fn root() -> Self {
        Self { labels: Vec::new() }
    }

    /// Returns whether this is the root name.
    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    /// Returns the number of labels, excluding the implicit root label.
    pub fn num_labels(&self) -> usize {
        self.labels.len()
    }

    /// Returns whether `self` equals `other` or is a subdomain of it.
    /// Every name is a subdomain of the root.
    pub fn eq_or_subdomain_of(&self, other: &Name) -> bool {
        if other.labels.len() > self.labels.len() {
            return false;
        }
        let skip = self.labels.len() - other.labels.len();
        self.labels[skip..] == other.labels[..]
    }
}

impl FromStr for Name {
    type Err = NameError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if text == "." {
            return Ok(Self::root());
        }

        // A single trailing dot marks the name as (explicitly)
        // absolute; we treat names without one as absolute as well,
        // since the core has no notion of a default origin.
        let text = text.strip_suffix('.').unwrap_or(text);
        if text.is_empty() {
            return Err(NameError::EmptyLabel);
        }

        let mut labels = Vec::new();
        let mut wire_len = 1; // the root label
        for label in text.split('.') {
            if label.is_empty() {
                return Err(NameError::EmptyLabel);
            } else if label.len() > MAX_LABEL_LEN {
                return Err(NameError::LabelTooLong);
            } else if !label.bytes().all(|b| b.is_ascii_graphic()) {
                return Err(NameError::InvalidCharacter);
            }
            wire_len += label.len() + 1;
            if wire_len > MAX_NAME_LEN {
                return Err(NameError::NameTooLong);
            }
            labels.push(label.to_ascii_lowercase().into_boxed_str());
        }
        Ok(Self { labels })
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_root() {
            return f.write_str(".");
        }
        for label in &self.labels {
            write!(f, "{}.", label)?;
        }
        Ok(())
    }
}

impl Serialize for Name {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Name {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

/// Errors that arise when parsing a [`Name`] from presentation format.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NameError {
    EmptyLabel,
    LabelTooLong,
    NameTooLong,
    InvalidCharacter,
}

impl fmt::Display for NameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::EmptyLabel => f.write_str("the name contains an empty label"),
            Self::LabelTooLong => f.write_str("a label exceeds 63 octets"),
            Self::NameTooLong => f.write_str("the name exceeds 255 octets in wire format"),
            Self::InvalidCharacter => {
                f.write_str("the name contains whitespace or a non-printable character")
            }
        }
    }
}

impl std::error::Error for NameError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsing_normalizes_case_and_trailing_dot() {
        let a: Name = "Test1.Example.".parse().unwrap();
        let b: Name = "test1.example".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "test1.example.");
    }

    #[test]
    fn root_round_trips() {
        let root: Name = ".".parse().unwrap();
        assert!(root.is_root());
        assert_eq!(root.to_string(), ".");
        assert_eq!(root, Name::root());
    }

    #[test]
    fn empty_labels_are_rejected() {
        assert_eq!("...".parse::<Name>(), Err(NameError::EmptyLabel));
        assert_eq!("a..b".parse::<Name>(), Err(NameError::EmptyLabel));
        assert_eq!("".parse::<Name>(), Err(NameError::EmptyLabel));
    }

    #[test]
    fn oversized_labels_and_names_are_rejected() {
        let long_label = "x".repeat(64);
        assert_eq!(long_label.parse::<Name>(), Err(NameError::LabelTooLong));

        let long_name = vec!["y".repeat(63); 5].join(".");
        assert_eq!(long_name.parse::<Name>(), Err(NameError::NameTooLong));
    }

    #[test]
    fn subdomain_relationships() {
        let apex: Name = "test1.example.".parse().unwrap();
        let host: Name = "ns.test1.example.".parse().unwrap();
        let other: Name = "test2.example.".parse().unwrap();

        assert!(host.eq_or_subdomain_of(&apex));
        assert!(apex.eq_or_subdomain_of(&apex));
        assert!(!apex.eq_or_subdomain_of(&host));
        assert!(!other.eq_or_subdomain_of(&apex));
        assert!(host.eq_or_subdomain_of(&Name::root()));
    }

    #[test]
    fn serde_uses_presentation_format() {
        let name: Name = "ns.test1.example.".parse().unwrap();
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"ns.test1.example.\"");
        let back: Name = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);
    }
}
