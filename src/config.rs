// Copyright 2026 Daniel Smith
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Engine configuration.

use regex::Regex;

/// Which descriptor the engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceSource {
    /// Standard input (fd 0). Fails when stdin is not a terminal.
    #[default]
    Stdin,
    /// Open `/dev/tty`, which still works when stdin is redirected.
    ControllingTty,
}

/// How the original attributes are put back on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestoreAction {
    /// `TCSANOW`: unread input stays queued for the shell.
    #[default]
    Now,
    /// `TCSAFLUSH`: discard any input the engine did not consume.
    Flush,
}

impl RestoreAction {
    pub(crate) fn flushes(self) -> bool {
        matches!(self, RestoreAction::Flush)
    }
}

/// What happens to a mode change requested while a read is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModeChangePolicy {
    /// Accept it and apply it to the device once the read completes.
    #[default]
    Defer,
    /// Reject it with `ModeChangeWhileReadPending`.
    FailFast,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub source: DeviceSource,
    pub restore_action: RestoreAction,
    pub mode_change_policy: ModeChangePolicy,
    /// Install signal handlers and a panic hook that restore the terminal.
    pub install_teardown_hooks: bool,
    /// Keys that do not match are dropped and the key read keeps waiting.
    pub key_filter: Option<Regex>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            source: DeviceSource::Stdin,
            restore_action: RestoreAction::Now,
            mode_change_policy: ModeChangePolicy::Defer,
            install_teardown_hooks: true,
            key_filter: None,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_source(mut self, source: DeviceSource) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn with_restore_action(mut self, action: RestoreAction) -> Self {
        self.restore_action = action;
        self
    }

    #[must_use]
    pub fn with_mode_change_policy(mut self, policy: ModeChangePolicy) -> Self {
        self.mode_change_policy = policy;
        self
    }

    #[must_use]
    pub fn with_teardown_hooks(mut self, install: bool) -> Self {
        self.install_teardown_hooks = install;
        self
    }

    /// Restrict key reads to characters matching `valid`.
    ///
    /// A bare character list such as `aeiou` is wrapped as `^[aeiou]$`;
    /// a bracketed class like `[0-9]` is anchored as given.
    pub fn with_valid_keys(mut self, valid: &str) -> Result<Self, regex::Error> {
        let pattern = if valid.starts_with('[') && valid.ends_with(']') {
            format!("^{}$", valid)
        } else {
            format!("^[{}]$", regex::escape(valid))
        };
        self.key_filter = Some(Regex::new(&pattern)?);
        Ok(self)
    }
}
