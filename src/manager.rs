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

//! The manager: the builder thread's lifecycle and the front door for
//! command submission.
//!
//! [`DataSrcManager::new`] spawns the builder thread and wires up the
//! channel and wake socket. The server's main event loop registers
//! [`wake_fd`](DataSrcManager::wake_fd) for readability and calls
//! [`drain_callbacks`](DataSrcManager::drain_callbacks) when it fires;
//! query workers call [`map_handle`](DataSrcManager::map_handle) to
//! snapshot the published configuration. Dropping the manager sends
//! `Shutdown` and joins the thread.

use std::io::{self, ErrorKind, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{error, info};

use crate::builder::{
    Command, CommandChannel, CommandKind, DataSrcBuilder, FinishedCallback, SharedClientListMap,
    WakeChannel,
};
use crate::config::Value;
use crate::datasrc::ClientListMap;
use crate::sync::TrackedMutex;

/// Owns the builder thread and the published client-list map.
pub struct DataSrcManager {
    channel: Arc<CommandChannel>,
    map: SharedClientListMap,
    /// The read end of the wake channel; nonblocking so that
    /// [`drain_callbacks`](Self::drain_callbacks) can consume exactly
    /// the bytes that have accumulated.
    wake_reader: UnixStream,
    builder_thread: Option<JoinHandle<()>>,
}

impl DataSrcManager {
    /// Creates the channel and wake socket and starts the builder
    /// thread.
    pub fn new() -> io::Result<Self> {
        let (wake, read_end) = WakeChannel::pair()?;
        let wake_reader = UnixStream::from(read_end);
        wake_reader.set_nonblocking(true)?;

        let channel = Arc::new(CommandChannel::new());
        let map: SharedClientListMap = Arc::new(TrackedMutex::new(Arc::new(ClientListMap::new())));

        let mut builder = DataSrcBuilder::new(channel.clone(), map.clone(), wake);
        let builder_thread = thread::Builder::new()
            .name("datasrc-builder".to_owned())
            .spawn(move || {
                // A panic in the builder means an assertion-class
                // failure: a broken submitter or state the builder
                // cannot reconcile. Continuing to serve (or silently
                // losing the builder) would be worse than dying.
                if catch_unwind(AssertUnwindSafe(|| builder.run())).is_err() {
                    error!("The data source builder thread panicked. Aborting.");
                    process::abort();
                }
            })?;

        info!("Data source builder thread started.");
        Ok(Self {
            channel,
            map,
            wake_reader,
            builder_thread: Some(builder_thread),
        })
    }

    /// Submits a command to the builder.
    pub fn submit(&self, command: Command) {
        self.channel.submit(command);
    }

    /// Submits a `Reconfigure` command for a full configuration (the
    /// `classes` map plus `_generation_id`).
    pub fn reconfigure(&self, config: Value, callback: Option<FinishedCallback>) {
        self.submit(Command {
            kind: CommandKind::Reconfigure,
            params: Some(config),
            callback,
        });
    }

    /// Submits a `LoadZone` command for one zone.
    pub fn load_zone(&self, params: Value, callback: Option<FinishedCallback>) {
        self.submit(Command {
            kind: CommandKind::LoadZone,
            params: Some(params),
            callback,
        });
    }

    /// Snapshots the published client-list map, the way query workers
    /// do: the map mutex is held only long enough to clone the handle.
    pub fn map_handle(&self) -> Arc<ClientListMap> {
        self.map.lock().clone()
    }

    /// The shared map slot itself, for callers that need to hand it to
    /// query workers directly.
    pub fn map(&self) -> &SharedClientListMap {
        &self.map
    }

    /// The file descriptor the main event loop should watch for
    /// readability; when it fires, call
    /// [`drain_callbacks`](Self::drain_callbacks).
    pub fn wake_fd(&self) -> RawFd {
        self.wake_reader.as_raw_fd()
    }

    /// Drains and invokes every scheduled completion callback, then
    /// consumes the accumulated wake bytes. The wake channel is
    /// level-triggered and coalescing, so one drain may cover several
    /// notifications. Returns the number of callbacks invoked.
    pub fn drain_callbacks(&mut self) -> usize {
        // Consume the wake bytes before taking the callbacks. The
        // builder writes its byte only after pushing a batch, so any
        // batch this take misses has its byte still in flight and will
        // trigger another wake-up; the reverse order could consume a
        // byte whose batch arrives after the take and strand it.
        let mut buf = [0u8; 64];
        loop {
            match self.wake_reader.read(&mut buf) {
                Ok(0) => {
                    // The builder's write end is gone; without it the
                    // callback contract is broken.
                    error!("The wake channel closed unexpectedly. Aborting.");
                    process::abort();
                }
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("Failed to read from the wake channel: {}. Aborting.", e);
                    process::abort();
                }
            }
        }

        let callbacks = self.channel.take_callbacks();
        let count = callbacks.len();
        // Invoke outside the queue lock: callbacks are arbitrary main
        // loop code and may themselves submit commands.
        for (callback, arg) in callbacks {
            callback(arg);
        }
        count
    }
}

impl Drop for DataSrcManager {
    fn drop(&mut self) {
        self.submit(Command::new(CommandKind::Shutdown, None));
        if let Some(handle) = self.builder_thread.take() {
            // A builder panic aborts the process before this join can
            // observe it, so an Err here is unreachable in practice.
            let _ = handle.join();
            info!("Data source builder thread stopped.");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use nix::sys::socket::{recv, MsgFlags};
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::class::Class;
    use crate::name::Name;
    use crate::rr::Type;
    use crate::zone::FindCode;

    fn new_manager() -> DataSrcManager {
        let _ = env_logger::builder().is_test(true).try_init();
        DataSrcManager::new().unwrap()
    }

    /// Polls until the wake fd is readable, with a generous timeout so
    /// a wedged builder fails the test instead of hanging it.
    fn await_wake(manager: &DataSrcManager) {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut probe = [0u8; 1];
        loop {
            match recv(manager.wake_reader.as_raw_fd(), &mut probe, MsgFlags::MSG_PEEK) {
                Ok(_) => return,
                Err(nix::errno::Errno::EWOULDBLOCK) => {
                    assert!(Instant::now() < deadline, "no wake-up from the builder");
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("unexpected wake-channel error: {}", e),
            }
        }
    }

    #[test]
    fn manager_runs_commands_and_delivers_callbacks() {
        let mut manager = new_manager();
        let delivered = Arc::new(AtomicUsize::new(0));

        let counter = delivered.clone();
        manager.submit(Command::with_callback(
            CommandKind::Noop,
            None,
            Box::new(move |arg| {
                assert_eq!(arg, Some(Value::Bool(true)));
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        ));

        await_wake(&manager);
        assert_eq!(manager.drain_callbacks(), 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reconfiguration_is_visible_to_map_readers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test1.zone");
        fs::write(
            &path,
            "$TTL 3600\n\
             @ IN SOA ns admin 1 7200 900 1209600 300\n\
             @ IN NS ns\n\
             ns IN A 192.0.2.1\n",
        )
        .unwrap();

        let mut manager = new_manager();
        assert!(manager.map_handle().is_empty());

        manager.reconfigure(
            json!({
                "classes": {
                    "IN": [{
                        "type": "MasterFiles",
                        "params": {"test1.example": path.to_str().unwrap()},
                        "cache-enable": true,
                    }],
                },
                "_generation_id": 1,
            }),
            Some(Box::new(|arg| {
                assert_eq!(arg, Some(Value::Bool(false)));
            })),
        );
        await_wake(&manager);
        assert_eq!(manager.drain_callbacks(), 1);

        // Read the new configuration the way a query worker would.
        let map = manager.map_handle();
        let name: Name = "ns.test1.example.".parse().unwrap();
        let finder = map.get(&Class::IN).unwrap().find(&name).unwrap();
        assert_eq!(finder.find(&name, Type::A).code, FindCode::Success);
        assert_eq!(finder.find(&name, Type::AAAA).code, FindCode::NxRrset);
    }

    #[test]
    fn callbacks_coalesce_across_multiple_commands() {
        let mut manager = new_manager();
        let delivered = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = delivered.clone();
            manager.submit(Command::with_callback(
                CommandKind::Noop,
                None,
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            ));
        }

        // However the wake bytes coalesce, repeated draining delivers
        // every callback exactly once.
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut total = 0;
        while total < 3 {
            assert!(Instant::now() < deadline, "callbacks were not delivered");
            await_wake(&manager);
            total += manager.drain_callbacks();
        }
        assert_eq!(total, 3);
        assert_eq!(delivered.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn drop_shuts_the_builder_down() {
        let manager = new_manager();
        let channel = manager.channel.clone();
        drop(manager);
        // The queue was fully consumed, shutdown included.
        assert_eq!(channel.pending_commands(), 0);
    }
}
