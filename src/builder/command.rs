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

//! Commands, completion callbacks, and the queue between submitters
//! and the builder thread.

use std::collections::VecDeque;
use std::fmt;

use crate::config::Value;
use crate::sync::{TrackedCondvar, TrackedMutex};

/// The kinds of command the builder handles.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CommandKind {
    Shutdown,
    Noop,
    Reconfigure,
    LoadZone,
    UpdateZone,
    SegmentInfoUpdate,
    ReleaseSegments,
}

/// A completion callback, invoked on the main thread once the command
/// it accompanied has been handled. The argument convention is
/// per-command; see the builder's handlers.
pub type FinishedCallback = Box<dyn FnOnce(Option<Value>) + Send>;

/// A scheduled callback together with the argument it will be invoked
/// with.
pub type CallbackPair = (FinishedCallback, Option<Value>);

/// One command for the builder: a kind, an optional JSON parameter
/// tree, and an optional completion callback.
pub struct Command {
    pub kind: CommandKind,
    pub params: Option<Value>,
    pub callback: Option<FinishedCallback>,
}

impl Command {
    /// Creates a command without a completion callback.
    pub fn new(kind: CommandKind, params: Option<Value>) -> Self {
        Self {
            kind,
            params,
            callback: None,
        }
    }

    /// Creates a command with a completion callback.
    pub fn with_callback(
        kind: CommandKind,
        params: Option<Value>,
        callback: FinishedCallback,
    ) -> Self {
        Self {
            kind,
            params,
            callback: Some(callback),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Command")
            .field("kind", &self.kind)
            .field("params", &self.params)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// The queue pair connecting submitters, the builder, and the main
/// loop.
///
/// One mutex guards both FIFOs: commands flowing toward the builder
/// and completion callbacks flowing back. The builder holds the lock
/// only across a single pop or across appending a batch of callbacks;
/// it executes commands with the lock released.
#[derive(Default)]
pub struct CommandChannel {
    queues: TrackedMutex<Queues>,
    wakeup: TrackedCondvar,
}

#[derive(Default)]
struct Queues {
    commands: VecDeque<Command>,
    callbacks: VecDeque<CallbackPair>,
}

impl CommandChannel {
    /// Creates an empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a command and wakes the builder if it is waiting.
    pub fn submit(&self, command: Command) {
        let mut queues = self.queues.lock();
        queues.commands.push_back(command);
        self.wakeup.notify_one();
    }

    /// Pops the next command, waiting on the condition variable while
    /// the queue is empty. Called only by the builder.
    pub(crate) fn pop_blocking(&self) -> Command {
        let mut queues = self.queues.lock();
        loop {
            if let Some(command) = queues.commands.pop_front() {
                return command;
            }
            queues = self.wakeup.wait(queues);
        }
    }

    /// Appends a batch of scheduled callbacks. Called only by the
    /// builder.
    pub(crate) fn push_callbacks(&self, batch: Vec<CallbackPair>) {
        self.queues.lock().callbacks.extend(batch);
    }

    /// Drains every scheduled callback. Called by the main loop after a
    /// wake-channel notification.
    pub fn take_callbacks(&self) -> Vec<CallbackPair> {
        self.queues.lock().callbacks.drain(..).collect()
    }

    /// Returns how many commands are waiting to be handled.
    pub fn pending_commands(&self) -> usize {
        self.queues.lock().commands.len()
    }

    /// Returns how many times the queue mutex has been acquired.
    pub fn lock_count(&self) -> usize {
        self.queues.lock_count()
    }

    /// Returns how many times the queue mutex has been released.
    pub fn unlock_count(&self) -> usize {
        self.queues.unlock_count()
    }

    /// Returns how many times the builder has waited for a command.
    pub fn wait_count(&self) -> usize {
        self.wakeup.wait_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_pass_through_in_order() {
        let channel = CommandChannel::new();
        channel.submit(Command::new(CommandKind::Noop, None));
        channel.submit(Command::new(CommandKind::Shutdown, None));
        assert_eq!(channel.pending_commands(), 2);
        assert_eq!(channel.pop_blocking().kind, CommandKind::Noop);
        assert_eq!(channel.pop_blocking().kind, CommandKind::Shutdown);
        assert_eq!(channel.pending_commands(), 0);
    }

    #[test]
    fn callbacks_drain_in_scheduling_order() {
        let channel = CommandChannel::new();
        channel.push_callbacks(vec![
            (Box::new(|_| ()), None),
            (Box::new(|_| ()), Some(Value::Bool(true))),
        ]);
        let drained = channel.take_callbacks();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].1, None);
        assert_eq!(drained[1].1, Some(Value::Bool(true)));
        assert!(channel.take_callbacks().is_empty());
    }
}
