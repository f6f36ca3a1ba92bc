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

//! Shared-memory segments backing `mapped` zone caches.
//!
//! A mapped cache's zone table lives in a named shared-memory segment
//! so that several processes can serve the same image. Segments are
//! identified by a file link ("flink") path; the process that prepares
//! an image creates the segment in [`SegmentMode::Create`], and serving
//! processes attach with [`SegmentMode::ReadOnly`]. The segment's
//! creator does not unlink it on drop: preparation and consumption
//! happen in different components (often different processes), and
//! unlinking is the preparer's job.
//!
//! The image layout is an 8-byte little-endian length followed by the
//! serialized zone table. A zero length (as in a freshly created,
//! zero-filled segment) is an empty table.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::ptr;
use std::slice;

use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::config::{self, TypeError, Value};
use crate::zone::Zone;

/// The size of a created segment when the parameters don't specify one.
const DEFAULT_SEGMENT_SIZE: usize = 1 << 20;

/// The number of octets reserved for the image length prefix.
const IMAGE_HEADER_LEN: usize = 8;

/// How a segment is bound; see [`MappedSegment::open`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SegmentMode {
    /// Create a fresh segment (replacing any existing link), writable.
    Create,
    /// Attach to an existing segment, writable.
    ReadWrite,
    /// Attach to an existing segment for reading only.
    ReadOnly,
}

/// A zone-table image in a shared-memory segment.
pub struct MappedSegment {
    shmem: Shmem,
    writable: bool,
    path: PathBuf,
}

// SAFETY: Shmem holds raw pointers into the mapping, which makes it
// !Send/!Sync by default. The mapping's base address is stable for the
// lifetime of the Shmem, and every access to the mapped bytes goes
// through read_zones/write_zones, which the owning cache serializes
// behind its RwLock.
unsafe impl Send for MappedSegment {}
unsafe impl Sync for MappedSegment {}

impl MappedSegment {
    /// Binds a segment according to `mode` and the segment parameters,
    /// which must be a map containing `mapped-file` (the flink path)
    /// and, for [`SegmentMode::Create`], optionally `size` in octets.
    pub fn open(mode: SegmentMode, params: &Value) -> Result<Self, SegmentError> {
        let map = config::map_value(params)?;
        let path: PathBuf = map
            .get("mapped-file")
            .ok_or(SegmentError::MissingParam("mapped-file"))
            .and_then(|v| config::str_value(v).map_err(Into::into))?
            .into();

        let shmem = match mode {
            SegmentMode::Create => {
                let size = match map.get("size") {
                    Some(v) => usize::try_from(config::int_value(v)?)
                        .ok()
                        .filter(|&s| s > IMAGE_HEADER_LEN)
                        .ok_or(SegmentError::BadSize)?,
                    None => DEFAULT_SEGMENT_SIZE,
                };
                // A fresh segment replaces any stale link at the path.
                let _ = fs::remove_file(&path);
                let mut shmem = ShmemConf::new()
                    .size(size)
                    .flink(&path)
                    .create()
                    .map_err(SegmentError::Shmem)?;
                // The segment must outlive this handle so that other
                // handles (and other processes) can attach later.
                shmem.set_owner(false);
                shmem
            }
            SegmentMode::ReadWrite | SegmentMode::ReadOnly => ShmemConf::new()
                .flink(&path)
                .open()
                .map_err(SegmentError::Shmem)?,
        };

        Ok(Self {
            shmem,
            writable: mode != SegmentMode::ReadOnly,
            path,
        })
    }

    /// Returns whether the segment was bound with write access.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Returns the segment's flink path.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Deserializes the zone table stored in the segment.
    pub fn read_zones(&self) -> Result<Vec<Zone>, SegmentError> {
        // SAFETY: the mapping is valid for shmem.len() octets for the
        // lifetime of self, and the owning cache serializes access.
        let data = unsafe { slice::from_raw_parts(self.shmem.as_ptr(), self.shmem.len()) };
        if data.len() < IMAGE_HEADER_LEN {
            return Err(SegmentError::CorruptImage("segment too small for header"));
        }
        let len = u64::from_le_bytes(data[..IMAGE_HEADER_LEN].try_into().unwrap()) as usize;
        if len == 0 {
            // A freshly created segment is zero-filled; that's an
            // empty table.
            return Ok(Vec::new());
        }
        let image = data
            .get(IMAGE_HEADER_LEN..IMAGE_HEADER_LEN + len)
            .ok_or(SegmentError::CorruptImage("image length exceeds segment"))?;
        serde_json::from_slice(image)
            .map_err(|_| SegmentError::CorruptImage("image failed to deserialize"))
    }

    /// Serializes `zones` into the segment, replacing the stored table.
    pub fn write_zones(&mut self, zones: &[&Zone]) -> Result<(), SegmentError> {
        if !self.writable {
            return Err(SegmentError::NotWritable);
        }
        let image = serde_json::to_vec(zones).expect("zone images always serialize");
        let needed = IMAGE_HEADER_LEN + image.len();
        if needed > self.shmem.len() {
            return Err(SegmentError::Full {
                needed,
                capacity: self.shmem.len(),
            });
        }
        let header = (image.len() as u64).to_le_bytes();
        // SAFETY: needed <= shmem.len() was checked above, and the
        // owning cache serializes access to the mapping.
        unsafe {
            let base = self.shmem.as_ptr();
            ptr::copy_nonoverlapping(header.as_ptr(), base, IMAGE_HEADER_LEN);
            ptr::copy_nonoverlapping(image.as_ptr(), base.add(IMAGE_HEADER_LEN), image.len());
        }
        Ok(())
    }
}

impl fmt::Debug for MappedSegment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MappedSegment")
            .field("path", &self.path)
            .field("writable", &self.writable)
            .field("capacity", &self.shmem.len())
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// Errors that arise while binding or accessing a segment.
#[derive(Debug)]
pub enum SegmentError {
    Type(TypeError),
    MissingParam(&'static str),
    BadSize,
    Shmem(ShmemError),
    NotWritable,
    CorruptImage(&'static str),
    Full { needed: usize, capacity: usize },
}

impl From<TypeError> for SegmentError {
    fn from(e: TypeError) -> Self {
        Self::Type(e)
    }
}

impl fmt::Display for SegmentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Type(e) => write!(f, "bad segment parameters: {}", e),
            Self::MissingParam(key) => write!(f, "segment parameters lack {:?}", key),
            Self::BadSize => f.write_str("the segment size is not a usable octet count"),
            Self::Shmem(e) => write!(f, "shared memory operation failed: {:?}", e),
            Self::NotWritable => f.write_str("the segment is not writable"),
            Self::CorruptImage(what) => write!(f, "corrupt segment image: {}", what),
            Self::Full { needed, capacity } => write!(
                f,
                "the image needs {} octets but the segment holds {}",
                needed, capacity,
            ),
        }
    }
}

impl std::error::Error for SegmentError {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
