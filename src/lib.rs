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

//! The data-source management core of an authoritative DNS server.
//!
//! Granary owns the server's zone data: the per-class lists of
//! data-source clients and the in-memory (or memory-mapped) zone caches
//! from which the query path answers queries. A single *builder* thread
//! performs every mutating operation — reconfiguration, zone reloads,
//! memory-segment resets — while any number of query threads read the
//! published configuration concurrently.
//!
//! The pieces fit together as follows:
//!
//! - The [`manager`] module spawns the builder thread and provides the
//!   command-submission and callback-draining API used by the server's
//!   main event loop.
//! - The [`builder`] module implements the builder thread itself: a
//!   single-consumer command queue, generation-versioned
//!   reconfiguration, and the zone reload protocol.
//! - The [`datasrc`] module provides the per-class
//!   [`ClientList`](datasrc::ClientList)s, their zone caches, and the
//!   shared-memory segments that back `mapped` caches.
//! - The remaining modules supply the supporting DNS types: classes,
//!   domain names, resource records, in-memory zones, and the
//!   master-file parser.
//!
//! The query path, network listeners, and command transport are
//! deliberately *not* part of this crate; they interact with the core
//! only through the published client-list map and the manager's command
//! API.

pub mod builder;
pub mod class;
pub mod config;
pub mod datasrc;
pub mod manager;
pub mod name;
pub mod rr;
pub mod sync;
pub mod zone;
pub mod zone_file;
