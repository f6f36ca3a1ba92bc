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

//! The builder: the single thread that mutates data-source state.
//!
//! [`DataSrcBuilder::run`] consumes commands from a [`CommandChannel`]
//! one at a time and dispatches them to handlers. All mutation of the
//! published client-list map happens here, under a strict lock
//! discipline: the queue mutex is held only across a pop or a callback
//! push, the map mutex only across a pointer swap, a segment reset, or
//! a zone install, and never while any loader I/O runs. A thread must
//! never take the queue mutex while holding the map mutex.
//!
//! Reconfiguration is generation-versioned. A new configuration whose
//! clients all use local caches is published immediately; one with
//! mapped caches becomes *pending* until a `SegmentInfoUpdate` has
//! bound every awaited segment, at which point the map is swapped. A
//! newer pending generation silently supersedes an older one.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::process;
use std::sync::Arc;

use log::{debug, error, info};

use crate::class::{Class, InvalidClass};
use crate::config::{self, TypeError, Value};
use crate::datasrc::{ClientList, ClientListMap, SegmentMode, WriterStatus};
use crate::name::{Name, NameError};
use crate::sync::TrackedMutex;

mod command;
mod wake;

pub use command::{CallbackPair, Command, CommandChannel, CommandKind, FinishedCallback};
pub use wake::WakeChannel;

/// The published client-list map slot shared between the builder and
/// every reader: the map mutex guards only the stored handle, never
/// the map it points to.
pub type SharedClientListMap = Arc<TrackedMutex<Arc<ClientListMap>>>;

/// A configuration generation waiting for its memory segments.
struct Pending {
    generation: i64,
    map: ClientListMap,
    /// The mapped instances, as `(class, name)`, that still need a
    /// segment reset before the map can be published.
    expected: HashSet<(Class, String)>,
}

/// The builder's state: generation tracking, the pending
/// configuration, and callbacks scheduled but not yet flushed to the
/// channel.
pub struct DataSrcBuilder {
    channel: Arc<CommandChannel>,
    map: SharedClientListMap,
    wake: WakeChannel,
    /// The generation of the published map; -1 until the first
    /// successful reconfiguration.
    current_generation: i64,
    pending: Option<Pending>,
    /// Release callbacks deferred until a later generation is
    /// published, keyed by the generation they release.
    deferred_releases: BTreeMap<i64, Vec<FinishedCallback>>,
    /// Callbacks scheduled by the command in progress; flushed to the
    /// channel (with one wake byte) after the command completes.
    scheduled: Vec<CallbackPair>,
    noop_hook: Option<Box<dyn FnMut() + Send>>,
}

impl DataSrcBuilder {
    /// Creates a builder over the given channel, published-map slot,
    /// and wake channel.
    pub fn new(
        channel: Arc<CommandChannel>,
        map: SharedClientListMap,
        wake: WakeChannel,
    ) -> Self {
        Self {
            channel,
            map,
            wake,
            current_generation: -1,
            pending: None,
            deferred_releases: BTreeMap::new(),
            scheduled: Vec::new(),
            noop_hook: None,
        }
    }

    /// Installs a hook run by every `Noop` command.
    pub fn set_noop_hook(&mut self, hook: Box<dyn FnMut() + Send>) {
        self.noop_hook = Some(hook);
    }

    /// Returns the generation of the published map, or -1 if nothing
    /// has been published yet.
    pub fn current_generation(&self) -> i64 {
        self.current_generation
    }

    /// Returns the generation of the pending configuration, if one is
    /// waiting for segments.
    pub fn pending_generation(&self) -> Option<i64> {
        self.pending.as_ref().map(|p| p.generation)
    }

    /// The callbacks scheduled by handled commands but not yet flushed
    /// to the channel.
    pub fn pending_callbacks(&self) -> &[CallbackPair] {
        &self.scheduled
    }

    /// The builder thread's main loop: pop, handle, flush, repeat,
    /// until a `Shutdown` command arrives.
    pub fn run(&mut self) {
        info!("Starting the data source builder loop.");
        loop {
            let command = self.channel.pop_blocking();
            match self.handle_command(command) {
                Ok(keep_running) => {
                    self.flush_callbacks();
                    if !keep_running {
                        break;
                    }
                }
                Err(CommandError::Internal(reason)) => {
                    // A data-plane failure: the published configuration
                    // is intact, so keep serving commands. The failed
                    // command's callback is dropped unscheduled.
                    error!("Command execution failure: {}.", reason);
                }
                Err(e) => {
                    // Input this malformed can only come from a broken
                    // submitter; state consistency is no longer
                    // assured.
                    error!("Unexpected error in command handling: {}. Aborting.", e);
                    process::abort();
                }
            }
        }
        info!("The data source builder loop has ended.");
    }

    /// Handles a single command, returning whether the loop should
    /// keep running.
    ///
    /// A command that completes successfully and still carries its
    /// completion callback has it scheduled with no argument; handlers
    /// that pass an argument consume the callback themselves. A
    /// command that fails schedules nothing.
    pub fn handle_command(&mut self, command: Command) -> Result<bool, CommandError> {
        let Command {
            kind,
            params,
            mut callback,
        } = command;
        debug!("Handling {:?} command.", kind);

        let keep_running = match kind {
            CommandKind::Shutdown => false,
            CommandKind::Noop => {
                self.do_noop(&mut callback);
                true
            }
            CommandKind::Reconfigure => {
                self.do_reconfigure(params, &mut callback);
                true
            }
            CommandKind::LoadZone => {
                self.do_load_zone(true, params)?;
                true
            }
            CommandKind::UpdateZone => {
                self.do_load_zone(false, params)?;
                true
            }
            CommandKind::SegmentInfoUpdate => {
                self.do_segment_update(params)?;
                true
            }
            CommandKind::ReleaseSegments => {
                self.do_release_segments(params, &mut callback)?;
                true
            }
        };

        if let Some(cb) = callback.take() {
            self.schedule(cb, None);
        }
        Ok(keep_running)
    }

    fn schedule(&mut self, callback: FinishedCallback, arg: Option<Value>) {
        self.scheduled.push((callback, arg));
    }

    /// Moves scheduled callbacks to the channel and wakes the main
    /// loop with one byte, if there is anything to deliver.
    fn flush_callbacks(&mut self) {
        if self.scheduled.is_empty() {
            return;
        }
        let batch = self.scheduled.drain(..).collect();
        self.channel.push_callbacks(batch);
        self.wake.notify();
    }

    ////////////////////////////////////////////////////////////////////
    // COMMAND HANDLERS                                               //
    ////////////////////////////////////////////////////////////////////

    fn do_noop(&mut self, callback: &mut Option<FinishedCallback>) {
        if let Some(hook) = self.noop_hook.as_mut() {
            hook();
        }
        if let Some(cb) = callback.take() {
            self.schedule(cb, Some(Value::Bool(true)));
        }
    }

    /// `Reconfigure` never fails the command: configuration problems
    /// are logged, the old map is kept, and the callback is scheduled
    /// with no argument. On success the callback argument is `true`
    /// iff the new configuration is pending on mapped segments.
    fn do_reconfigure(&mut self, params: Option<Value>, callback: &mut Option<FinishedCallback>) {
        match self.try_reconfigure(params) {
            Ok(waiting) => {
                if let Some(cb) = callback.take() {
                    self.schedule(cb, Some(Value::Bool(waiting)));
                }
            }
            Err(reason) => {
                error!(
                    "Data source reconfiguration failed: {}. \
                     The current configuration is kept.",
                    reason,
                );
                if let Some(cb) = callback.take() {
                    self.schedule(cb, None);
                }
            }
        }
    }

    fn try_reconfigure(&mut self, params: Option<Value>) -> Result<bool, String> {
        let params = params.ok_or_else(|| "the command has no argument".to_owned())?;
        let arg = config::map_value(&params).map_err(|e| e.to_string())?;

        let generation = arg
            .get("_generation_id")
            .ok_or_else(|| "\"_generation_id\" is missing".to_owned())
            .and_then(|v| {
                config::int_value(v).map_err(|e| format!("\"_generation_id\": {}", e))
            })?;
        if generation < 0 {
            return Err(format!("generation ID {} is negative", generation));
        }
        if generation <= self.current_generation {
            return Err(format!(
                "generation ID {} does not exceed the current generation {}",
                generation, self.current_generation,
            ));
        }
        if let Some(pending) = &self.pending {
            if generation <= pending.generation {
                return Err(format!(
                    "generation ID {} does not exceed the pending generation {}",
                    generation, pending.generation,
                ));
            }
        }

        let classes = arg
            .get("classes")
            .ok_or_else(|| "\"classes\" is missing".to_owned())
            .and_then(|v| config::map_value(v).map_err(|e| format!("\"classes\": {}", e)))?;

        // Build the whole new map off-line. Nothing below touches the
        // published map until the new one is complete, so a failure for
        // any class leaves the old configuration fully intact.
        let mut new_map = ClientListMap::new();
        for (class_text, list_config) in classes {
            let class: Class = class_text.parse().map_err(|e: InvalidClass| e.to_string())?;
            let list = ClientList::configure(class, list_config, true)
                .map_err(|e| format!("class {}: {}", class, e))?;
            new_map.insert(class, Arc::new(list));
        }

        let mut expected = HashSet::new();
        for (class, list) in &new_map {
            for name in list.mapped_client_names() {
                expected.insert((*class, name));
            }
        }

        if expected.is_empty() {
            self.promote(generation, new_map);
            Ok(false)
        } else {
            if let Some(old) = self.pending.take() {
                info!(
                    "Discarding the pending configuration of generation {}: \
                     superseded by generation {}.",
                    old.generation, generation,
                );
            }
            info!(
                "Configuration generation {} waits for {} memory segment(s).",
                generation,
                expected.len(),
            );
            self.pending = Some(Pending {
                generation,
                map: new_map,
                expected,
            });
            Ok(true)
        }
    }

    /// Publishes `new_map` as generation `generation` and completes
    /// any deferred segment releases for generations now superseded.
    fn promote(&mut self, generation: i64, new_map: ClientListMap) {
        {
            let mut published = self.map.lock();
            *published = Arc::new(new_map);
        }
        self.current_generation = generation;
        info!("Switched to data source configuration generation {}.", generation);

        let remaining = self.deferred_releases.split_off(&generation);
        let released = std::mem::replace(&mut self.deferred_releases, remaining);
        for (gen, callbacks) in released {
            debug!("Completing the release of segments for generation {}.", gen);
            for cb in callbacks {
                self.schedule(cb, None);
            }
        }
    }

    fn do_segment_update(&mut self, params: Option<Value>) -> Result<(), CommandError> {
        let params =
            params.ok_or_else(|| internal("segment info update has no argument"))?;
        let arg = config::map_value(&params)
            .map_err(|e| internal(format!("segment info update: {}", e)))?;
        let generation = arg
            .get("generation-id")
            .ok_or_else(|| internal("segment info update: \"generation-id\" is missing"))
            .and_then(|v| {
                config::int_value(v)
                    .map_err(|e| internal(format!("segment info update: \"generation-id\": {}", e)))
            })?;

        // Updates that don't match the pending generation are stale (or
        // premature) information from the segment provider; ignore
        // them.
        let pending_generation = match &self.pending {
            Some(pending) => pending.generation,
            None => {
                debug!(
                    "Ignoring a segment info update for generation {}: \
                     no configuration is pending.",
                    generation,
                );
                return Ok(());
            }
        };
        if generation != pending_generation {
            debug!(
                "Ignoring a segment info update for generation {}: \
                 generation {} is pending.",
                generation, pending_generation,
            );
            return Ok(());
        }

        let name = arg
            .get("data-source-name")
            .ok_or_else(|| internal("segment info update: \"data-source-name\" is missing"))
            .and_then(|v| {
                config::str_value(v)
                    .map_err(|e| internal(format!("segment info update: {}", e)))
            })?;
        let class_text = arg
            .get("data-source-class")
            .ok_or_else(|| internal("segment info update: \"data-source-class\" is missing"))
            .and_then(|v| {
                config::str_value(v)
                    .map_err(|e| internal(format!("segment info update: {}", e)))
            })?;
        let inuse_only = match arg.get("inuse-only") {
            Some(v) => config::bool_value(v)
                .map_err(|e| internal(format!("segment info update: \"inuse-only\": {}", e)))?,
            None => false,
        };

        if inuse_only {
            // The segment is already in use by an active configuration;
            // this carries no reset for the pending one.
            debug!(
                "Ignoring an in-use-only segment info update for {}/{}.",
                name, class_text,
            );
            return Ok(());
        }

        // From here on, an inconsistency means the builder and the
        // segment provider disagree about what the configuration looks
        // like. Serving anything in that state would be serving a
        // broken configuration, so it is fatal.
        let class: Class = class_text.parse().unwrap_or_else(|e| {
            panic!("segment info update out of sync: {}", e);
        });
        let key = (class, name.to_owned());
        let list = {
            let pending = self.pending.as_ref().unwrap();
            assert!(
                pending.expected.contains(&key),
                "segment info update out of sync: {}/{} is not awaited",
                name,
                class,
            );
            pending.map.get(&class).unwrap().clone()
        };

        let segment_params = arg.get("segment-params").cloned().unwrap_or(Value::Null);
        {
            let _published = self.map.lock();
            if let Err(e) =
                list.reset_memory_segment(name, SegmentMode::ReadOnly, &segment_params)
            {
                panic!(
                    "failed to reset the memory segment of {}/{}: {}",
                    name, class, e,
                );
            }
        }
        info!("Memory segment for {}/{} is ready.", name, class);

        let pending = self.pending.as_mut().unwrap();
        pending.expected.remove(&key);
        if pending.expected.is_empty() {
            let pending = self.pending.take().unwrap();
            self.promote(pending.generation, pending.map);
        }
        Ok(())
    }

    /// The shared implementation of `LoadZone` (strict) and
    /// `UpdateZone` (lenient about non-writable caches).
    fn do_load_zone(&mut self, strict: bool, params: Option<Value>) -> Result<(), CommandError> {
        // Missing payload pieces indicate a broken submitter; the
        // command transport is supposed to have validated this much.
        let params = params.expect("zone loading command with no argument");
        let arg = config::map_value(&params).map_err(CommandError::Type)?;
        let class_value = arg.get("class").expect("zone loading command without a class");
        let origin_value = arg
            .get("origin")
            .expect("zone loading command without an origin");

        let class: Class = config::str_value(class_value)
            .map_err(CommandError::Type)?
            .parse()
            .map_err(CommandError::Class)?;
        let origin: Name = config::str_value(origin_value)
            .map_err(CommandError::Type)?
            .parse()
            .map_err(CommandError::Name)?;
        let datasource = match arg.get("datasource") {
            Some(v) => Some(config::str_value(v).map_err(CommandError::Type)?.to_owned()),
            None => None,
        };

        // Critical section 1: snapshot the class's client list and
        // obtain the zone writer.
        let (status, writer) = {
            let published = self.map.lock();
            let list = match published.get(&class) {
                Some(list) => list.clone(),
                None => {
                    return Err(internal(format!(
                        "no data source is configured for class {}",
                        class,
                    )))
                }
            };
            list.cached_zone_writer(&origin, false, datasource.as_deref())
        };

        let mut writer = match status {
            WriterStatus::Success => writer.expect("a writer accompanies success"),
            WriterStatus::CacheDisabled => {
                debug!(
                    "Skipped reloading zone {}/{}: the in-memory cache is disabled.",
                    origin, class,
                );
                return Ok(());
            }
            WriterStatus::CacheNotWritable if !strict => {
                debug!(
                    "Skipped updating zone {}/{}: the cache is not writable.",
                    origin, class,
                );
                return Ok(());
            }
            WriterStatus::CacheNotWritable => {
                return Err(internal(format!(
                    "zone {}/{} is cached in a non-writable segment",
                    origin, class,
                )))
            }
            WriterStatus::ZoneNotFound => {
                return Err(internal(format!(
                    "zone {}/{} is not configured in any data source of its class",
                    origin, class,
                )))
            }
            WriterStatus::Other => {
                return Err(internal(format!(
                    "data source {:?} is not configured for class {}",
                    datasource.as_deref().unwrap_or(""),
                    class,
                )))
            }
        };

        // The expensive part runs with no lock held.
        writer.load().map_err(|e| {
            internal(format!("failed to load zone {}/{}: {:#}", origin, class, e))
        })?;

        // Critical section 2: install the new image and clean up.
        {
            let _published = self.map.lock();
            let result = writer.install();
            writer.cleanup();
            result.map_err(|e| {
                internal(format!("failed to install zone {}/{}: {}", origin, class, e))
            })?;
        }
        info!(
            "Zone {}/{} {}.",
            origin,
            class,
            if strict { "reloaded" } else { "updated" },
        );
        Ok(())
    }

    fn do_release_segments(
        &mut self,
        params: Option<Value>,
        callback: &mut Option<FinishedCallback>,
    ) -> Result<(), CommandError> {
        let params =
            params.ok_or_else(|| internal("release segments command has no argument"))?;
        let arg = config::map_value(&params)
            .map_err(|e| internal(format!("release segments: {}", e)))?;
        let generation = arg
            .get("generation-id")
            .ok_or_else(|| internal("release segments: \"generation-id\" is missing"))
            .and_then(|v| {
                config::int_value(v)
                    .map_err(|e| internal(format!("release segments: \"generation-id\": {}", e)))
            })?;

        if generation == self.current_generation {
            // The active generation's segments can only be released
            // once a successor takes over; park the callback until
            // then.
            info!(
                "Deferring the release of segments for generation {} \
                 until the next generation is ready.",
                generation,
            );
            if let Some(cb) = callback.take() {
                self.deferred_releases
                    .entry(generation)
                    .or_default()
                    .push(cb);
            }
        } else {
            debug!(
                "Segments for generation {} are not in use (generation {} is current); \
                 releasing immediately.",
                generation, self.current_generation,
            );
            if let Some(cb) = callback.take() {
                self.schedule(cb, None);
            }
        }
        Ok(())
    }
}

fn internal(reason: impl Into<String>) -> CommandError {
    CommandError::Internal(reason.into())
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// Errors surfaced by [`DataSrcBuilder::handle_command`].
///
/// `Internal` marks data-plane failures (a zone that won't load, a
/// missing data source, a malformed segment-update payload): the
/// published configuration is unchanged and the builder keeps running.
/// The other variants mark invalid input that the submitter should
/// have rejected; [`DataSrcBuilder::run`] treats them as fatal.
#[derive(Debug)]
pub enum CommandError {
    Type(TypeError),
    Class(InvalidClass),
    Name(NameError),
    Internal(String),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Type(e) => write!(f, "{}", e),
            Self::Class(e) => write!(f, "{}", e),
            Self::Name(e) => write!(f, "bad origin: {}", e),
            Self::Internal(reason) => f.write_str(reason),
        }
    }
}

impl std::error::Error for CommandError {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::{ErrorKind, Read};
    use std::os::unix::net::UnixStream;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::path::Path;
    use std::thread;
    use std::time::Duration;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::rr::Type;
    use crate::zone::FindCode;

    struct Harness {
        channel: Arc<CommandChannel>,
        map: SharedClientListMap,
        reader: UnixStream,
        builder: DataSrcBuilder,
    }

    impl Harness {
        fn new() -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let (wake, read_end) = WakeChannel::pair().unwrap();
            let reader = UnixStream::from(read_end);
            reader.set_nonblocking(true).unwrap();
            let channel = Arc::new(CommandChannel::new());
            let map: SharedClientListMap =
                Arc::new(TrackedMutex::new(Arc::new(ClientListMap::new())));
            let builder = DataSrcBuilder::new(channel.clone(), map.clone(), wake);
            Self {
                channel,
                map,
                reader,
                builder,
            }
        }

        fn snapshot(&self) -> Arc<ClientListMap> {
            self.map.lock().clone()
        }

        fn wake_bytes(&mut self) -> usize {
            let mut buf = [0u8; 16];
            let mut total = 0;
            loop {
                match self.reader.read(&mut buf) {
                    Ok(0) => return total,
                    Ok(n) => total += n,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return total,
                    Err(e) => panic!("unexpected wake-channel error: {}", e),
                }
            }
        }
    }

    fn shutdown_cmd() -> Command {
        Command::new(CommandKind::Shutdown, None)
    }

    /// Finds `name`/`rr_type` through the published map, the way the
    /// query path would.
    fn find_code(map: &ClientListMap, name: &str, rr_type: Type) -> FindCode {
        let name: Name = name.parse().unwrap();
        let finder = map
            .get(&Class::IN)
            .expect("class IN is configured")
            .find(&name)
            .expect("a zone covers the name");
        finder.find(&name, rr_type).code
    }

    #[test]
    fn run_single_command() {
        let mut h = Harness::new();
        h.channel.submit(shutdown_cmd());
        h.builder.run();

        assert_eq!(h.channel.pending_commands(), 0);
        // No wait, because the queue was non-empty from the start; one
        // lock for the submission, one for the pop, none for callbacks.
        assert_eq!(h.channel.wait_count(), 0);
        assert_eq!(h.channel.lock_count(), 2);
        assert_eq!(h.channel.unlock_count(), 2);
        assert!(h.channel.take_callbacks().is_empty());
        assert_eq!(h.wake_bytes(), 0);
    }

    #[test]
    fn command_finished_callback_is_delivered() {
        let mut h = Harness::new();
        h.channel.submit(Command::with_callback(
            CommandKind::Shutdown,
            None,
            Box::new(|_| ()),
        ));
        h.builder.run();

        assert_eq!(h.channel.wait_count(), 0);
        // One lock for the submission, one for picking up the command,
        // one for putting the callback there.
        assert_eq!(h.channel.lock_count(), 3);
        assert_eq!(h.channel.unlock_count(), 3);
        let callbacks = h.channel.take_callbacks();
        assert_eq!(callbacks.len(), 1);
        assert_eq!(callbacks[0].1, None); // no argument by default
        assert_eq!(h.wake_bytes(), 1);
    }

    #[test]
    fn run_multiple_commands() {
        let mut h = Harness::new();
        h.channel.submit(Command::new(CommandKind::Noop, None));
        h.channel.submit(Command::with_callback(
            CommandKind::Noop,
            None,
            Box::new(|_| ()),
        ));
        h.channel.submit(shutdown_cmd());

        let noop_calls = Arc::new(TrackedMutex::new(0usize));
        {
            let noop_calls = noop_calls.clone();
            h.builder.set_noop_hook(Box::new(move || {
                *noop_calls.lock() += 1;
            }));
        }
        h.builder.run();

        assert_eq!(*noop_calls.lock(), 2);
        let callbacks = h.channel.take_callbacks();
        assert_eq!(callbacks.len(), 1);
        assert_eq!(callbacks[0].1, Some(Value::Bool(true)));
        assert_eq!(h.channel.pending_commands(), 0);
        assert_eq!(h.wake_bytes(), 1);
    }

    #[test]
    fn builder_waits_for_commands() {
        let mut h = Harness::new();
        let channel = h.channel.clone();
        let submitter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            channel.submit(shutdown_cmd());
        });
        h.builder.run();
        submitter.join().unwrap();
        assert!(h.channel.wait_count() >= 1);
    }

    #[test]
    fn shutdown_stops_the_loop() {
        let mut h = Harness::new();
        assert!(!h.builder.handle_command(shutdown_cmd()).unwrap());
    }

    #[test]
    fn reconfigure_accepts_and_rejects() {
        let mut h = Harness::new();
        assert!(h.snapshot().is_empty());
        let locks_at = |h: &Harness| h.map.lock_count();

        // A config that doesn't do much except be accepted.
        let good_config = |generation: i64| {
            json!({
                "classes": {
                    "IN": [{
                        "type": "MasterFiles",
                        "params": {},
                        "cache-enable": true,
                    }],
                },
                "_generation_id": generation,
            })
        };

        let base = locks_at(&h);
        let cmd = Command::with_callback(
            CommandKind::Reconfigure,
            Some(good_config(1)),
            Box::new(|_| ()),
        );
        assert!(h.builder.handle_command(cmd).unwrap());
        // The callback argument is false unless mapped segments are
        // involved.
        assert_eq!(
            h.builder.pending_callbacks().last().unwrap().1,
            Some(Value::Bool(false)),
        );
        assert_eq!(locks_at(&h) - base, 1); // one swap
        let working = h.snapshot();
        assert_eq!(working.len(), 1);
        assert_eq!(h.builder.current_generation(), 1);

        // Each of the following is invalid; the handler still reports
        // success, the map is unchanged, and the map mutex is not
        // touched again.
        let rejected = [
            json!({"classes": {"foo": "bar"}, "_generation_id": 2}),
            json!({
                "classes": {
                    "IN": [{
                        "type": "MasterFiles",
                        "params": {"foo": [1, 2, 3, 4]},
                        "cache-enable": true,
                    }],
                },
                "_generation_id": 2,
            }),
            json!({"_generation_id": 2}),
            json!({"classes": {}, "_generation_id": -10}),
            json!({"classes": {}, "_generation_id": 1}),
        ];
        let base = locks_at(&h);
        for params in rejected {
            let cmd = Command::with_callback(
                CommandKind::Reconfigure,
                Some(params),
                Box::new(|_| ()),
            );
            assert!(h.builder.handle_command(cmd).unwrap());
            assert_eq!(h.builder.pending_callbacks().last().unwrap().1, None);
        }
        // A missing payload is rejected the same way.
        let cmd =
            Command::with_callback(CommandKind::Reconfigure, None, Box::new(|_| ()));
        assert!(h.builder.handle_command(cmd).unwrap());
        assert!(Arc::ptr_eq(&working, &h.snapshot()));
        assert_eq!(locks_at(&h) - base, 1); // only our own snapshot above

        // The same clients under a higher generation produce a
        // different map object with the same inventory.
        let cmd = Command::new(CommandKind::Reconfigure, Some(good_config(2)));
        assert!(h.builder.handle_command(cmd).unwrap());
        let reconfigured = h.snapshot();
        assert!(!Arc::ptr_eq(&working, &reconfigured));
        assert_eq!(reconfigured.len(), 1);
        assert_eq!(h.builder.current_generation(), 2);

        // And an empty config disables all data source clients.
        let cmd = Command::new(
            CommandKind::Reconfigure,
            Some(json!({"classes": {}, "_generation_id": 3})),
        );
        assert!(h.builder.handle_command(cmd).unwrap());
        assert!(h.snapshot().is_empty());
        assert_eq!(h.map.lock_count(), h.map.unlock_count());
    }

    ////////////////////////////////////////////////////////////////////
    // ZONE LOADING                                                   //
    ////////////////////////////////////////////////////////////////////

    const ZONE_V1: &str = "\
        $TTL 3600\n\
        @ IN SOA ns admin 1 7200 900 1209600 300\n\
        @ IN NS ns\n\
        ns IN A 192.0.2.1\n";

    const ZONE_V2: &str = "\
        $TTL 3600\n\
        @ IN SOA ns admin 2 7200 900 1209600 300\n\
        @ IN NS ns\n\
        ns IN A 192.0.2.1\n\
        ns IN AAAA 2001:db8::1\n";

    /// Writes both test zone files and reconfigures the builder to
    /// serve them from local caches, checking the expected initial
    /// state.
    fn configure_zones(h: &mut Harness, dir: &Path) {
        fs::write(dir.join("test1.zone"), ZONE_V1).unwrap();
        fs::write(dir.join("test2.zone"), ZONE_V1).unwrap();
        let config = json!({
            "classes": {
                "IN": [{
                    "type": "MasterFiles",
                    "params": {
                        "test1.example": dir.join("test1.zone").to_str().unwrap(),
                        "test2.example": dir.join("test2.zone").to_str().unwrap(),
                    },
                    "cache-enable": true,
                }],
            },
            "_generation_id": 1,
        });
        let cmd = Command::new(CommandKind::Reconfigure, Some(config));
        assert!(h.builder.handle_command(cmd).unwrap());

        let map = h.snapshot();
        for zone in ["test1", "test2"] {
            let ns = format!("ns.{}.example", zone);
            assert_eq!(find_code(&map, &ns, Type::A), FindCode::Success);
            assert_eq!(find_code(&map, &ns, Type::AAAA), FindCode::NxRrset);
        }
    }

    fn load_zone_cmd(origin: &str) -> Command {
        Command::new(
            CommandKind::LoadZone,
            Some(json!({"class": "IN", "origin": origin})),
        )
    }

    #[test]
    fn load_zone_swaps_in_the_new_image() {
        let dir = TempDir::new().unwrap();
        let mut h = Harness::new();
        configure_zones(&mut h, dir.path());

        // Both zone files change on disk, but only test1.example is
        // reloaded.
        fs::write(dir.path().join("test1.zone"), ZONE_V2).unwrap();
        fs::write(dir.path().join("test2.zone"), ZONE_V2).unwrap();

        let locks = h.map.lock_count();
        let unlocks = h.map.unlock_count();
        assert!(h.builder.handle_command(load_zone_cmd("test1.example")).unwrap());
        // Reloading involves two critical sections: one to get the
        // writer, one to install the new image.
        assert_eq!(h.map.lock_count() - locks, 2);
        assert_eq!(h.map.unlock_count() - unlocks, 2);

        let map = h.snapshot();
        assert_eq!(
            find_code(&map, "ns.test1.example", Type::AAAA),
            FindCode::Success,
        );
        assert_eq!(
            find_code(&map, "ns.test2.example", Type::AAAA),
            FindCode::NxRrset,
        );
    }

    #[test]
    fn load_zone_and_update_zone_work_against_sqlite() {
        for kind in [CommandKind::LoadZone, CommandKind::UpdateZone] {
            check_load_or_update_sqlite(kind);
        }
    }

    fn check_load_or_update_sqlite(kind: CommandKind) {
        use rusqlite::{params, Connection};

        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("auth_test.sqlite3");
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch(crate::datasrc::SCHEMA_SQL).unwrap();
        conn.execute(
            "INSERT INTO zones (id, origin, class) VALUES (1, 'example.org.', 'IN')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO records (zone_id, owner, ttl, type, rdata) \
             VALUES (1, 'example.org.', 3600, 'SOA', '. . 0 0 0 0 0'), \
                    (1, 'example.org.', 3600, 'NS', 'ns1.example.org.')",
            [],
        )
        .unwrap();

        let mut h = Harness::new();
        let config = json!({
            "classes": {
                "IN": [{
                    "type": "sqlite3",
                    "params": {"database_file": db_path.to_str().unwrap()},
                    "cache-enable": true,
                    "cache-zones": ["example.org"],
                }],
            },
            "_generation_id": 1,
        });
        let cmd = Command::new(CommandKind::Reconfigure, Some(config));
        assert!(h.builder.handle_command(cmd).unwrap());
        assert_eq!(
            find_code(&h.snapshot(), "www.example.org", Type::A),
            FindCode::NxDomain,
        );

        // Add the record to the underlying database and bump the SOA
        // serial, then ask the builder to pick it up.
        conn.execute(
            "INSERT INTO records (zone_id, owner, ttl, type, rdata) \
             VALUES (1, 'www.example.org.', 60, 'A', '192.0.2.1')",
            [],
        )
        .unwrap();
        conn.execute(
            "UPDATE records SET rdata = '. . 1 0 0 0 0' WHERE type = 'SOA'",
            params![],
        )
        .unwrap();

        let reload = Command::new(
            kind,
            Some(json!({"class": "IN", "origin": "example.org"})),
        );
        assert!(h.builder.handle_command(reload).unwrap());
        assert_eq!(
            find_code(&h.snapshot(), "www.example.org", Type::A),
            FindCode::Success,
        );

        // A zone with no configuration at all.
        let nozone = Command::new(
            kind,
            Some(json!({"class": "IN", "origin": "example.com"})),
        );
        assert!(matches!(
            h.builder.handle_command(nozone),
            Err(CommandError::Internal(_))
        ));
        // The previous zone is not hurt in any way.
        assert_eq!(
            find_code(&h.snapshot(), "example.org", Type::SOA),
            FindCode::Success,
        );

        // Reloading with the in-memory cache disabled is simply
        // ignored, with a single critical section.
        let config = json!({
            "classes": {
                "IN": [{
                    "type": "sqlite3",
                    "params": {"database_file": db_path.to_str().unwrap()},
                    "cache-enable": false,
                    "cache-zones": ["example.org"],
                }],
            },
            "_generation_id": 2,
        });
        let cmd = Command::new(CommandKind::Reconfigure, Some(config));
        assert!(h.builder.handle_command(cmd).unwrap());
        let locks = h.map.lock_count();
        let reload = Command::new(
            kind,
            Some(json!({"class": "IN", "origin": "example.org"})),
        );
        assert!(h.builder.handle_command(reload).unwrap());
        assert_eq!(h.map.lock_count() - locks, 1);

        // A zone that is configured for caching but missing from the
        // data source fails the load.
        let config = json!({
            "classes": {
                "IN": [{
                    "type": "sqlite3",
                    "params": {"database_file": db_path.to_str().unwrap()},
                    "cache-enable": true,
                    "cache-zones": ["nosuchzone.example"],
                }],
            },
            "_generation_id": 3,
        });
        let cmd = Command::new(CommandKind::Reconfigure, Some(config));
        assert!(matches!(
            h.builder.handle_command(cmd),
            Ok(true)
        ));
        // (The reconfigure itself fails to load the cache and is
        // swallowed, keeping generation 2's map; point the command at
        // the old configuration instead.)
        let reload = Command::new(
            kind,
            Some(json!({"class": "IN", "origin": "nosuchzone.example"})),
        );
        assert!(matches!(
            h.builder.handle_command(reload),
            Err(CommandError::Internal(_))
        ));
    }

    #[test]
    fn broken_zone_files_leave_the_published_zone_alone() {
        let dir = TempDir::new().unwrap();
        let mut h = Harness::new();
        configure_zones(&mut h, dir.path());

        fs::write(dir.path().join("test1.zone"), "@ IN A not-an-address\n").unwrap();
        assert!(matches!(
            h.builder.handle_command(load_zone_cmd("test1.example")),
            Err(CommandError::Internal(_))
        ));
        // The zone was not replaced.
        let map = h.snapshot();
        assert_eq!(find_code(&map, "ns.test1.example", Type::A), FindCode::Success);
        assert_eq!(
            find_code(&map, "ns.test1.example", Type::AAAA),
            FindCode::NxRrset,
        );
    }

    #[test]
    fn unreadable_zone_files_leave_the_published_zone_alone() {
        use std::os::unix::fs::PermissionsExt;

        // Insufficient permissions do not stop the root user.
        if nix::unistd::getuid().is_root() {
            return;
        }

        let dir = TempDir::new().unwrap();
        let mut h = Harness::new();
        configure_zones(&mut h, dir.path());

        let path = dir.path().join("test1.zone");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o000)).unwrap();
        assert!(matches!(
            h.builder.handle_command(load_zone_cmd("test1.example")),
            Err(CommandError::Internal(_))
        ));
        assert_eq!(
            find_code(&h.snapshot(), "ns.test1.example", Type::A),
            FindCode::Success,
        );
    }

    #[test]
    fn load_zone_without_any_data_source_fails() {
        let mut h = Harness::new();
        assert!(matches!(
            h.builder.handle_command(load_zone_cmd("test1.example")),
            Err(CommandError::Internal(_))
        ));
    }

    #[test]
    fn load_zone_rejects_invalid_params() {
        let dir = TempDir::new().unwrap();
        let mut h = Harness::new();
        configure_zones(&mut h, dir.path());

        // A missing payload, class, or origin indicates a broken
        // submitter.
        for params in [
            None,
            Some(json!({"class": "IN"})),
            Some(json!({"origin": "test1.example"})),
        ] {
            let result = catch_unwind(AssertUnwindSafe(|| {
                h.builder
                    .handle_command(Command::new(CommandKind::LoadZone, params.clone()))
            }));
            assert!(result.is_err());
        }

        // A bogus class string.
        let cmd = Command::new(
            CommandKind::LoadZone,
            Some(json!({"origin": "test1.example", "class": "no_such_class"})),
        );
        assert!(matches!(
            h.builder.handle_command(cmd),
            Err(CommandError::Class(_))
        ));

        // A class of the wrong JSON kind; it is checked before the
        // origin.
        let cmd = Command::new(
            CommandKind::LoadZone,
            Some(json!({"origin": 10, "class": 1})),
        );
        assert!(matches!(
            h.builder.handle_command(cmd),
            Err(CommandError::Type(_))
        ));

        // A bogus origin.
        let cmd = Command::new(
            CommandKind::LoadZone,
            Some(json!({"class": "IN", "origin": "..."})),
        );
        assert!(matches!(
            h.builder.handle_command(cmd),
            Err(CommandError::Name(crate::name::NameError::EmptyLabel))
        ));
    }

    ////////////////////////////////////////////////////////////////////
    // MAPPED SEGMENTS                                                //
    ////////////////////////////////////////////////////////////////////

    /// Prepares a segment image holding test1.example, the way an
    /// external segment provider would, and returns the segment
    /// parameters to attach to it.
    fn create_segment(dir: &Path) -> Value {
        fs::write(dir.join("test1.zone"), ZONE_V1).unwrap();
        let config = json!([{
            "type": "MasterFiles",
            "params": {"test1.example": dir.join("test1.zone").to_str().unwrap()},
            "cache-enable": true,
            "cache-type": "mapped",
        }]);
        let list = ClientList::configure(Class::IN, &config, true).unwrap();
        let params = json!({
            "mapped-file": dir.join("test1.zone.image").to_str().unwrap(),
        });
        list.reset_memory_segment("MasterFiles", SegmentMode::Create, &params)
            .unwrap();

        let origin: Name = "test1.example.".parse().unwrap();
        let (status, writer) = list.cached_zone_writer(&origin, false, Some("MasterFiles"));
        assert_eq!(status, WriterStatus::Success);
        let mut writer = writer.unwrap();
        writer.load().unwrap();
        writer.install().unwrap();
        writer.cleanup();
        // Dropping the list releases its mapping; the image remains
        // for read-only attachment.
        params
    }

    fn mapped_config(dir: &Path, generation: i64) -> Value {
        json!({
            "classes": {
                "IN": [{
                    "type": "MasterFiles",
                    "params": {"test1.example": dir.join("test1.zone").to_str().unwrap()},
                    "cache-enable": true,
                    "cache-type": "mapped",
                }],
            },
            "_generation_id": generation,
        })
    }

    fn segment_update_cmd(name: &str, generation: i64, segment_params: &Value) -> Command {
        Command::new(
            CommandKind::SegmentInfoUpdate,
            Some(json!({
                "data-source-name": name,
                "data-source-class": "IN",
                "generation-id": generation,
                "segment-params": segment_params,
            })),
        )
    }

    #[test]
    fn load_into_a_non_writable_cache_is_strict_for_loads_only() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("test1.zone"), ZONE_V1).unwrap();
        let h = &mut Harness::new();

        // Install a mapped configuration directly: its segment is
        // unbound, so the cache is not writable.
        let config = json!([{
            "type": "MasterFiles",
            "params": {"test1.example": dir.path().join("test1.zone").to_str().unwrap()},
            "cache-enable": true,
            "cache-type": "mapped",
        }]);
        let list = ClientList::configure(Class::IN, &config, true).unwrap();
        let mut map = ClientListMap::new();
        map.insert(Class::IN, Arc::new(list));
        *h.map.lock() = Arc::new(map);

        assert!(matches!(
            h.builder.handle_command(load_zone_cmd("test1.example")),
            Err(CommandError::Internal(_))
        ));

        let update = Command::new(
            CommandKind::UpdateZone,
            Some(json!({
                "class": "IN",
                "origin": "test1.example",
                "datasource": "MasterFiles",
            })),
        );
        assert!(h.builder.handle_command(update).unwrap());
    }

    #[test]
    fn segment_info_update_completes_a_pending_generation() {
        let dir = TempDir::new().unwrap();
        let mut h = Harness::new();
        let segment_params = create_segment(dir.path());

        let cmd = Command::with_callback(
            CommandKind::Reconfigure,
            Some(mapped_config(dir.path(), 42)),
            Box::new(|_| ()),
        );
        assert!(h.builder.handle_command(cmd).unwrap());
        // Mapped segments make the new configuration wait.
        assert_eq!(
            h.builder.pending_callbacks().last().unwrap().1,
            Some(Value::Bool(true)),
        );
        assert_eq!(h.builder.pending_generation(), Some(42));
        assert!(h.snapshot().is_empty());

        // An in-use-only update carries no reset for the pending
        // configuration and is ignored.
        let mut params = segment_update_cmd("MasterFiles", 42, &segment_params);
        params.params.as_mut().unwrap()["inuse-only"] = json!(true);
        assert!(h.builder.handle_command(params).unwrap());
        assert!(h.snapshot().is_empty());

        // The real update makes the pending map active.
        let cmd = segment_update_cmd("MasterFiles", 42, &segment_params);
        assert!(h.builder.handle_command(cmd).unwrap());
        assert_eq!(h.builder.current_generation(), 42);
        assert_eq!(h.builder.pending_generation(), None);
        let map = h.snapshot();
        assert_eq!(map.len(), 1);
        assert_eq!(find_code(&map, "ns.test1.example", Type::A), FindCode::Success);

        // Updates on an older generation are just ignored.
        let locks = h.map.lock_count();
        let cmd = segment_update_cmd("MasterFiles", 41, &segment_params);
        assert!(h.builder.handle_command(cmd).unwrap());
        assert_eq!(h.map.lock_count(), locks);
    }

    #[test]
    fn pending_reconfiguration_waits_for_every_segment() {
        let dir = TempDir::new().unwrap();
        let mut h = Harness::new();
        let segment_params = create_segment(dir.path());

        // Two mapped instances (and one local CH list) in the same
        // configuration: both must reset before the swap.
        let two_mapped = |generation: i64| {
            json!({
                "classes": {
                    "CH": [{
                        "type": "MasterFiles",
                        "params": {},
                        "cache-enable": true,
                    }],
                    "IN": [
                        {
                            "type": "MasterFiles",
                            "name": "dsrc1",
                            "params": {
                                "test1.example":
                                    dir.path().join("test1.zone").to_str().unwrap(),
                            },
                            "cache-enable": true,
                            "cache-type": "mapped",
                        },
                        {
                            "type": "MasterFiles",
                            "name": "dsrc2",
                            "params": {
                                "test1.example":
                                    dir.path().join("test1.zone").to_str().unwrap(),
                            },
                            "cache-enable": true,
                            "cache-type": "mapped",
                        },
                    ],
                },
                "_generation_id": generation,
            })
        };

        let cmd = Command::new(CommandKind::Reconfigure, Some(two_mapped(42)));
        assert!(h.builder.handle_command(cmd).unwrap());
        assert!(h.snapshot().is_empty());
        assert_eq!(h.map.lock_count(), 1); // only our own snapshot

        // The first segment resets; the map stays unpublished.
        let locks = h.map.lock_count();
        let cmd = segment_update_cmd("dsrc1", 42, &segment_params);
        assert!(h.builder.handle_command(cmd).unwrap());
        assert!(h.snapshot().is_empty());
        assert_eq!(h.map.lock_count() - locks, 2); // reset + our snapshot

        // The second segment completes the configuration: one lock for
        // the reset and one for the swap.
        let locks = h.map.lock_count();
        let cmd = segment_update_cmd("dsrc2", 42, &segment_params);
        assert!(h.builder.handle_command(cmd).unwrap());
        assert_eq!(h.map.lock_count() - locks, 2);
        assert_eq!(h.snapshot().len(), 2);
        assert_eq!(h.builder.current_generation(), 42);

        // Updates for older or newer generations are ignored.
        let locks = h.map.lock_count();
        for stale in [41, 43] {
            let cmd = segment_update_cmd("dsrc2", stale, &segment_params);
            assert!(h.builder.handle_command(cmd).unwrap());
        }
        assert_eq!(h.map.lock_count(), locks);

        // Two generations arrive in rapid succession; the first is
        // superseded before it completes.
        let cmd = Command::new(CommandKind::Reconfigure, Some(two_mapped(43)));
        assert!(h.builder.handle_command(cmd).unwrap());
        let cmd = Command::new(CommandKind::Reconfigure, Some(two_mapped(44)));
        assert!(h.builder.handle_command(cmd).unwrap());
        assert_eq!(h.builder.pending_generation(), Some(44));
        assert_eq!(h.map.lock_count(), locks); // nothing swapped yet

        // An update for the superseded generation is ignored.
        let cmd = segment_update_cmd("dsrc2", 43, &segment_params);
        assert!(h.builder.handle_command(cmd).unwrap());
        assert_eq!(h.map.lock_count(), locks);

        // Updates for the latest pending generation complete it.
        let cmd = segment_update_cmd("dsrc2", 44, &segment_params);
        assert!(h.builder.handle_command(cmd).unwrap());
        assert_eq!(h.map.lock_count() - locks, 1); // reset only
        let cmd = segment_update_cmd("dsrc1", 44, &segment_params);
        assert!(h.builder.handle_command(cmd).unwrap());
        assert_eq!(h.map.lock_count() - locks, 3); // another reset + swap
        assert_eq!(h.builder.current_generation(), 44);
    }

    #[test]
    fn out_of_sync_segment_updates_are_fatal() {
        let dir = TempDir::new().unwrap();
        let mut h = Harness::new();
        let segment_params = create_segment(dir.path());

        let cmd = Command::new(CommandKind::Reconfigure, Some(mapped_config(dir.path(), 42)));
        assert!(h.builder.handle_command(cmd).unwrap());

        // A data source name the pending configuration doesn't know.
        let cmd = segment_update_cmd("bad", 42, &segment_params);
        assert!(catch_unwind(AssertUnwindSafe(|| h.builder.handle_command(cmd))).is_err());

        // A class that is valid but not awaited.
        let mut cmd = segment_update_cmd("MasterFiles", 42, &segment_params);
        cmd.params.as_mut().unwrap()["data-source-class"] = json!("CH");
        assert!(catch_unwind(AssertUnwindSafe(|| h.builder.handle_command(cmd))).is_err());

        // A class string that isn't a class at all.
        let mut cmd = segment_update_cmd("MasterFiles", 42, &segment_params);
        cmd.params.as_mut().unwrap()["data-source-class"] = json!("bad");
        assert!(catch_unwind(AssertUnwindSafe(|| h.builder.handle_command(cmd))).is_err());
    }

    #[test]
    fn malformed_segment_update_payloads_are_internal_errors() {
        let mut h = Harness::new();
        for params in [
            None,
            Some(json!("not a map")),
            Some(json!({})),
            Some(json!({"generation-id": "not an integer"})),
        ] {
            let cmd = Command::new(CommandKind::SegmentInfoUpdate, params);
            assert!(matches!(
                h.builder.handle_command(cmd),
                Err(CommandError::Internal(_))
            ));
        }
    }

    #[test]
    fn failing_segment_resets_are_fatal() {
        let dir = TempDir::new().unwrap();
        let mut h = Harness::new();
        create_segment(dir.path());

        let cmd = Command::new(CommandKind::Reconfigure, Some(mapped_config(dir.path(), 42)));
        assert!(h.builder.handle_command(cmd).unwrap());

        let bad_params = json!({"mapped-file": "/nonexistent/segment.image"});
        let cmd = segment_update_cmd("MasterFiles", 42, &bad_params);
        assert!(catch_unwind(AssertUnwindSafe(|| h.builder.handle_command(cmd))).is_err());
    }

    ////////////////////////////////////////////////////////////////////
    // SEGMENT RELEASE                                                //
    ////////////////////////////////////////////////////////////////////

    #[test]
    fn release_segments_defers_for_the_current_generation() {
        let mut h = Harness::new();
        let config = |generation: i64| {
            json!({
                "classes": {
                    "IN": [{"type": "MasterFiles", "params": {}, "cache-enable": true}],
                },
                "_generation_id": generation,
            })
        };
        let cmd = Command::new(CommandKind::Reconfigure, Some(config(42)));
        assert!(h.builder.handle_command(cmd).unwrap());

        // Releasing the active generation parks the callback until the
        // next generation takes over.
        let cmd = Command::with_callback(
            CommandKind::ReleaseSegments,
            Some(json!({"generation-id": 42})),
            Box::new(|_| ()),
        );
        assert!(h.builder.handle_command(cmd).unwrap());
        assert!(h.builder.pending_callbacks().is_empty());

        let cmd = Command::new(CommandKind::Reconfigure, Some(config(43)));
        assert!(h.builder.handle_command(cmd).unwrap());
        assert_eq!(h.builder.pending_callbacks().len(), 1);
        assert_eq!(h.builder.pending_callbacks()[0].1, None);

        // Older or newer generations are no-ops with an immediate
        // callback.
        for generation in [41, 44] {
            let cmd = Command::with_callback(
                CommandKind::ReleaseSegments,
                Some(json!({"generation-id": generation})),
                Box::new(|_| ()),
            );
            assert!(h.builder.handle_command(cmd).unwrap());
        }
        assert_eq!(h.builder.pending_callbacks().len(), 3);

        // Bogus arguments produce an error and schedule nothing.
        for params in [
            None,
            Some(json!({"_generation-id": 44})),
            Some(json!({"generation-id": true})),
        ] {
            let cmd = Command::with_callback(
                CommandKind::ReleaseSegments,
                params,
                Box::new(|_| ()),
            );
            assert!(matches!(
                h.builder.handle_command(cmd),
                Err(CommandError::Internal(_))
            ));
        }
        assert_eq!(h.builder.pending_callbacks().len(), 3);
    }

    #[test]
    fn deferred_releases_fire_in_order_on_one_promotion() {
        let mut h = Harness::new();
        let order = Arc::new(TrackedMutex::new(Vec::new()));
        let config = |generation: i64| {
            json!({
                "classes": {},
                "_generation_id": generation,
            })
        };

        let cmd = Command::new(CommandKind::Reconfigure, Some(config(1)));
        assert!(h.builder.handle_command(cmd).unwrap());
        for tag in ["first", "second"] {
            let order = order.clone();
            let cmd = Command::with_callback(
                CommandKind::ReleaseSegments,
                Some(json!({"generation-id": 1})),
                Box::new(move |_| order.lock().push(tag)),
            );
            assert!(h.builder.handle_command(cmd).unwrap());
        }
        assert!(h.builder.pending_callbacks().is_empty());

        let cmd = Command::new(CommandKind::Reconfigure, Some(config(2)));
        assert!(h.builder.handle_command(cmd).unwrap());
        assert_eq!(h.builder.pending_callbacks().len(), 2);

        // Deliver them the way the main loop would and check the
        // enqueue order survived.
        h.builder.flush_callbacks();
        for (cb, arg) in h.channel.take_callbacks() {
            cb(arg);
        }
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }
}
