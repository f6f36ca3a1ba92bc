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

//! The wake channel between the builder and the main event loop.
//!
//! After scheduling completion callbacks, the builder writes a single
//! byte here; the readable event on the other end tells the main loop
//! to drain the callback queue. The notification is level-triggered and
//! coalescing: the main loop drains *all* callbacks and then consumes
//! whatever bytes have accumulated.

use std::os::fd::{AsRawFd, OwnedFd};
use std::process;

use log::error;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::write;

/// The write end of the wake channel, owned by the builder.
#[derive(Debug)]
pub struct WakeChannel {
    write_end: OwnedFd,
}

impl WakeChannel {
    /// Creates a connected channel, returning the builder's write end
    /// and the main loop's read end.
    pub fn pair() -> nix::Result<(Self, OwnedFd)> {
        let (write_end, read_end) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;
        Ok((Self { write_end }, read_end))
    }

    /// Writes one byte to wake the main loop.
    ///
    /// Failure here means completion callbacks the builder has already
    /// queued would silently never be delivered, so it is fatal.
    pub fn notify(&self) {
        match write(self.write_end.as_raw_fd(), &[0u8]) {
            Ok(1) => (),
            Ok(n) => {
                error!("Short write ({} bytes) on the wake channel. Aborting.", n);
                process::abort();
            }
            Err(e) => {
                error!("Failed to write to the wake channel: {}. Aborting.", e);
                process::abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn notify_writes_one_byte() {
        let (wake, read_end) = WakeChannel::pair().unwrap();
        let mut reader = UnixStream::from(read_end);
        wake.notify();
        wake.notify();

        let mut buf = [0u8; 8];
        reader.set_nonblocking(true).unwrap();
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert!(reader.read(&mut buf).is_err()); // would block: no more bytes
    }
}
