//! Typed adapter over the `multipass` command-line tool.
//!
//! The engine is the source of truth for VM state: nimbus never caches
//! descriptors, and every operation shells out and re-parses. The adapter is
//! intentionally narrow — it speaks the CLI's stable surface (`--format
//! json` where available) and nothing else.
//!
//! Numeric-looking fields (`cpu_count`, `snapshot_count`, disk sizes) arrive
//! from the engine as JSON *strings*; they stay strings here and are coerced
//! only at display sites.

mod client;
mod types;

pub use client::{Client, CommandExecutor, ShellCommandExecutor};
pub use types::{
    Disk, LaunchOptions, ListInstance, Memory, Snapshot, VmInfo, VmMount, VmState,
};

#[cfg(test)]
pub mod testing {
    //! Shared mock executor for adapter-boundary tests.
    //!
    //! Outcomes are keyed by the full command line, so tests assert both
    //! the exact argv the client builds and the order commands ran in.

    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::{Error, Result};

    /// stdout on success, stderr on failure.
    type Outcome = std::result::Result<Vec<u8>, String>;

    /// Canned-outcome executor recording every invocation.
    ///
    /// Each command line maps to a queue of outcomes: all but the last are
    /// consumed once, the last repeats. One entry behaves like a plain
    /// canned response; several model engine state changing between calls
    /// (a VM that reports Stopped until it is started, a checkpoint file
    /// that exists only after the first write).
    #[derive(Default)]
    pub struct MockExecutor {
        outcomes: Mutex<HashMap<String, VecDeque<Outcome>>>,
        prefix_responses: Mutex<Vec<(String, Vec<u8>)>>,
        calls: Mutex<Vec<String>>,
    }

    impl MockExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        /// Set stdout for an exact command line, replacing prior outcomes.
        pub fn set_response(&self, command: &str, stdout: impl Into<Vec<u8>>) {
            self.outcomes
                .lock()
                .unwrap()
                .insert(command.to_string(), VecDeque::from([Ok(stdout.into())]));
        }

        /// Queue a success after the outcomes already set.
        pub fn push_response(&self, command: &str, stdout: impl Into<Vec<u8>>) {
            self.outcomes
                .lock()
                .unwrap()
                .entry(command.to_string())
                .or_default()
                .push_back(Ok(stdout.into()));
        }

        /// Make an exact command line fail, replacing prior outcomes.
        pub fn set_error(&self, command: &str, stderr: &str) {
            self.outcomes
                .lock()
                .unwrap()
                .insert(
                    command.to_string(),
                    VecDeque::from([Err(stderr.to_string())]),
                );
        }

        /// Queue a failure after the outcomes already set.
        pub fn push_error(&self, command: &str, stderr: &str) {
            self.outcomes
                .lock()
                .unwrap()
                .entry(command.to_string())
                .or_default()
                .push_back(Err(stderr.to_string()));
        }

        /// Set stdout for any command line starting with `prefix`.
        ///
        /// Needed where argv embeds a path nimbus generates at run time
        /// (temp staging dirs, checkpoint timestamps).
        pub fn set_response_prefix(&self, prefix: &str, stdout: impl Into<Vec<u8>>) {
            self.prefix_responses
                .lock()
                .unwrap()
                .push((prefix.to_string(), stdout.into()));
        }

        /// Every command line executed, in order.
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        /// Number of executed commands whose line starts with `prefix`.
        pub fn count_calls_with_prefix(&self, prefix: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.starts_with(prefix))
                .count()
        }
    }

    #[async_trait]
    impl super::CommandExecutor for MockExecutor {
        async fn execute(&self, program: &str, args: &[&str]) -> Result<Vec<u8>> {
            let mut key = program.to_string();
            for arg in args {
                key.push(' ');
                key.push_str(arg);
            }
            self.calls.lock().unwrap().push(key.clone());

            let outcome = {
                let mut outcomes = self.outcomes.lock().unwrap();
                outcomes.get_mut(&key).and_then(|queue| {
                    if queue.len() > 1 {
                        queue.pop_front()
                    } else {
                        queue.front().cloned()
                    }
                })
            };
            match outcome {
                Some(Ok(stdout)) => return Ok(stdout),
                Some(Err(stderr)) => return Err(Error::engine(key, stderr)),
                None => {}
            }

            if let Some((_, stdout)) = self
                .prefix_responses
                .lock()
                .unwrap()
                .iter()
                .find(|(p, _)| key.starts_with(p.as_str()))
            {
                return Ok(stdout.clone());
            }
            Err(Error::engine(key, "unexpected command"))
        }
    }
}
