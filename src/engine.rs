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

//! The input engine: mode control plus sync and async reads over one
//! terminal.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, warn};

use crate::config::{EngineConfig, ModeChangePolicy};
use crate::error::{KbdError, KbdResult};
use crate::handle::{Restorer, TerminalHandle};
use crate::input::SyncReader;
use crate::mode::ModeController;
use crate::scheduler::{AsyncReadScheduler, Completion, PendingRead, ReadKind, ReadTask};
use crate::signals;
use crate::term::{Mode, TerminalDevice, TtyDevice};

#[derive(Default)]
struct EngineState {
    pending: Option<PendingRead>,
    /// Mode requested while a read was in flight, applied when it finishes.
    deferred: Option<Mode>,
    /// A deferred change that could not be applied, reported by the next
    /// mode change or read.
    deferred_failure: Option<KbdError>,
    shut_down: bool,
}

/// How a mode change gets to the terminal.
enum ModeAccess<'a, D: TerminalDevice> {
    /// No read in flight: apply now.
    Direct(MutexGuard<'a, TerminalHandle<D>>),
    /// A read holds the device: record the change for later.
    Deferred(MutexGuard<'a, EngineState>),
}

// Lock order is always `state` then `handle`. A read holds `handle` for as
// long as it blocks, so nothing that must not block may wait on it while
// `state.pending` is set.
struct Core<D: TerminalDevice> {
    state: Mutex<EngineState>,
    handle: Mutex<TerminalHandle<D>>,
    restorer: Restorer<D>,
    modes: ModeController,
    scheduler: AsyncReadScheduler,
    config: EngineConfig,
}

impl<D: TerminalDevice> Core<D> {
    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_handle(&self) -> MutexGuard<'_, TerminalHandle<D>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A panic hook or signal handler may have put the original attributes
    /// back without the engine seeing it. Adopt that as the current mode.
    fn resync(&self, handle: &mut TerminalHandle<D>) {
        if self.restorer.take_external_restore() {
            warn!(
                "terminal was restored by a teardown hook; now in {} mode",
                self.restorer.mode()
            );
            handle.mark_restored();
            self.modes.publish(handle.current_mode());
        }
    }

    fn mode_access(&self) -> KbdResult<ModeAccess<'_, D>> {
        let mut state = self.lock_state();
        if state.shut_down {
            return Err(KbdError::ShutDown);
        }
        if let Some(err) = state.deferred_failure.take() {
            return Err(err);
        }
        let pending = state.pending;
        match pending {
            None => {
                let mut handle = self.lock_handle();
                drop(state);
                self.resync(&mut handle);
                Ok(ModeAccess::Direct(handle))
            }
            Some(read) => match self.config.mode_change_policy {
                ModeChangePolicy::FailFast => Err(KbdError::ModeChangeWhileReadPending(read.kind)),
                ModeChangePolicy::Defer => Ok(ModeAccess::Deferred(state)),
            },
        }
    }

    /// Record a change against the latest requested mode. Returns the mode
    /// it replaces.
    fn defer(&self, state: &mut EngineState, change: impl FnOnce(Mode) -> Mode) -> Mode {
        let base = state.deferred.unwrap_or_else(|| self.modes.mode());
        let target = change(base);
        state.deferred = Some(target);
        debug!("mode change to {} deferred until the pending read completes", target);
        base
    }

    /// Claim the single read slot.
    fn begin(&self, kind: ReadKind) -> KbdResult<()> {
        let mut state = self.lock_state();
        if state.shut_down {
            return Err(KbdError::ShutDown);
        }
        if let Some(read) = state.pending {
            return Err(KbdError::RequestAlreadyPending(read.kind));
        }
        if let Some(err) = state.deferred_failure.take() {
            return Err(err);
        }
        if self.restorer.external_restore_pending() {
            self.resync(&mut self.lock_handle());
        }
        if kind == ReadKind::Key && self.modes.mode().canonical {
            return Err(KbdError::KeyReadInCanonicalMode);
        }
        state.pending = Some(PendingRead::new(kind));
        Ok(())
    }

    /// Run a read that `begin` admitted, then release the slot.
    fn read<T>(&self, read: impl FnOnce(&SyncReader<'_, D>) -> KbdResult<T>) -> KbdResult<T> {
        let result = {
            let handle = self.lock_handle();
            read(&SyncReader::new(&*handle, self.config.key_filter.as_ref()))
        };
        self.finish(result.as_ref().err());
        result
    }

    fn finish(&self, error: Option<&KbdError>) {
        let mut state = self.lock_state();
        if let Some(read) = state.pending.take() {
            debug!("{} read finished after {:?}", read.kind, read.age());
        }
        let deferred = state.deferred.take();
        let mut handle = self.lock_handle();

        if state.shut_down {
            // Shutdown already put the terminal back while we were reading.
            handle.mark_restored();
            return;
        }
        self.resync(&mut handle);
        if let Some(err) = error.filter(|e| e.is_fatal()) {
            if err.is_expected() {
                warn!("terminal read failed, restoring original mode: {}", err);
            } else {
                error!("terminal read failed, restoring original mode: {}", err);
            }
            if handle.restore().is_ok() {
                self.modes.publish(handle.current_mode());
            }
            if let Some(target) = deferred {
                debug!("dropping deferred mode change to {}", target);
            }
        } else if let Some(target) = deferred {
            if let Err(e) = self.modes.set_mode(&mut *handle, target) {
                error!("deferred mode change to {} failed: {}", target, e);
                state.deferred_failure = Some(KbdError::DeferredModeChangeFailed {
                    target,
                    source: Box::new(e),
                });
            }
        }
    }

    fn execute(&self, job: Completion) {
        match job {
            Completion::Key(done) => {
                let result = self.read(|reader| reader.read_key());
                done(result);
            }
            Completion::Line(done) => {
                let result = self.read(|reader| reader.read_line());
                done(result);
            }
        }
    }

    fn shutdown(&self) -> KbdResult<()> {
        let mut state = self.lock_state();
        if state.shut_down {
            return Ok(());
        }
        state.shut_down = true;
        if let Some(target) = state.deferred.take() {
            debug!("dropping deferred mode change to {} on shutdown", target);
        }
        let read_in_flight = state.pending.is_some();
        let restored = if read_in_flight {
            // The reader owns the handle lock; `finish` resyncs it later.
            self.restorer.restore()
        } else {
            self.lock_handle().restore()
        };
        drop(state);

        self.scheduler.stop(read_in_flight);
        restored?;
        self.modes.publish(self.restorer.mode());
        self.restorer.disarm();
        debug!("input engine shut down");
        Ok(())
    }
}

/// Keyboard input over one terminal.
///
/// Mode setters take effect before they return. Reads come in a blocking
/// form (`*_sync`) and an asynchronous form that runs on a dedicated worker
/// thread. Only one read, of either kind and either form, is ever in
/// flight; a second one fails with `RequestAlreadyPending`.
///
/// Dropping the engine (or calling [`shutdown`](Self::shutdown)) puts the
/// terminal back in the mode it was found in.
pub struct InputEngine<D: TerminalDevice = TtyDevice> {
    core: Arc<Core<D>>,
}

impl InputEngine {
    /// Take over the terminal on stdin with the default configuration.
    pub fn open() -> KbdResult<Self> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> KbdResult<Self> {
        let device = TtyDevice::open(config.source)?;
        Self::from_device(device, config)
    }
}

impl<D: TerminalDevice> InputEngine<D> {
    /// Build an engine over any [`TerminalDevice`]. The device's current
    /// attributes become the ones restored on shutdown.
    pub fn from_device(device: D, config: EngineConfig) -> KbdResult<Self> {
        let handle = TerminalHandle::acquire(device, config.restore_action)?;
        if config.install_teardown_hooks {
            signals::install();
        }
        let core = Core {
            modes: ModeController::new(handle.current_mode()),
            restorer: handle.restorer(),
            handle: Mutex::new(handle),
            state: Mutex::new(EngineState::default()),
            scheduler: AsyncReadScheduler::new(),
            config,
        };
        Ok(InputEngine {
            core: Arc::new(core),
        })
    }

    /// The mode currently applied to the terminal. Never blocks.
    pub fn mode(&self) -> Mode {
        if self.core.restorer.external_restore_pending() {
            return self.core.restorer.mode();
        }
        self.core.modes.mode()
    }

    /// The mode the terminal was in when the engine took it over.
    pub fn original_mode(&self) -> Mode {
        self.core.restorer.mode()
    }

    /// The mode that will be applied once any pending read completes.
    pub fn requested_mode(&self) -> Mode {
        self.core.lock_state().deferred.unwrap_or_else(|| self.mode())
    }

    /// The read currently in flight, if any.
    pub fn pending(&self) -> Option<PendingRead> {
        self.core.lock_state().pending
    }

    /// Switch line buffering on or off. Returns the previous setting.
    ///
    /// While a read is pending under the `Defer` policy the change is only
    /// recorded. If applying it later fails, the next mode change or read
    /// returns `DeferredModeChangeFailed`.
    pub fn set_canonical(&self, enabled: bool) -> KbdResult<bool> {
        match self.core.mode_access()? {
            ModeAccess::Direct(mut handle) => self.core.modes.set_canonical(&mut *handle, enabled),
            ModeAccess::Deferred(mut state) => Ok(self
                .core
                .defer(&mut state, |m| m.with_canonical(enabled))
                .canonical),
        }
    }

    /// Switch echo on or off. Returns the previous setting.
    pub fn set_echo(&self, enabled: bool) -> KbdResult<bool> {
        match self.core.mode_access()? {
            ModeAccess::Direct(mut handle) => self.core.modes.set_echo(&mut *handle, enabled),
            ModeAccess::Deferred(mut state) => {
                Ok(self.core.defer(&mut state, |m| m.with_echo(enabled)).echo)
            }
        }
    }

    /// Set both flags with at most one device call. Returns the previous mode.
    pub fn set_mode(&self, mode: Mode) -> KbdResult<Mode> {
        match self.core.mode_access()? {
            ModeAccess::Direct(mut handle) => self.core.modes.set_mode(&mut *handle, mode),
            ModeAccess::Deferred(mut state) => Ok(self.core.defer(&mut state, |_| mode)),
        }
    }

    /// Block until one key is pressed.
    ///
    /// Canonical mode must be off (`set_canonical(false)`); otherwise this
    /// fails with `KeyReadInCanonicalMode` without touching the terminal.
    pub fn get_key_sync(&self) -> KbdResult<char> {
        self.core.begin(ReadKind::Key)?;
        self.core.read(|reader| reader.read_key())
    }

    /// Block until Enter and return the line without its terminator.
    pub fn get_line_sync(&self) -> KbdResult<String> {
        self.core.begin(ReadKind::Line)?;
        self.core.read(|reader| reader.read_line())
    }

    /// Start a key read on the worker and return at once.
    ///
    /// Admission errors (`RequestAlreadyPending`, `KeyReadInCanonicalMode`,
    /// `ShutDown`) are returned here; read errors arrive through the task.
    pub fn get_key(&self) -> KbdResult<ReadTask<char>> {
        let (task, done) = ReadTask::channel();
        self.schedule(Completion::Key(done))?;
        Ok(task)
    }

    /// Start a line read on the worker and return at once.
    pub fn get_line(&self) -> KbdResult<ReadTask<String>> {
        let (task, done) = ReadTask::channel();
        self.schedule(Completion::Line(done))?;
        Ok(task)
    }

    /// Callback form of [`get_key`](Self::get_key). `on_complete` runs
    /// exactly once, on the worker thread, after the read slot is free again.
    pub fn get_key_then<F>(&self, on_complete: F) -> KbdResult<()>
    where
        F: FnOnce(KbdResult<char>) + Send + 'static,
    {
        self.schedule(Completion::Key(Box::new(on_complete)))
    }

    /// Callback form of [`get_line`](Self::get_line).
    pub fn get_line_then<F>(&self, on_complete: F) -> KbdResult<()>
    where
        F: FnOnce(KbdResult<String>) + Send + 'static,
    {
        self.schedule(Completion::Line(Box::new(on_complete)))
    }

    fn schedule(&self, job: Completion) -> KbdResult<()> {
        self.core.begin(job.kind())?;
        let core = Arc::downgrade(&self.core);
        let run = move |job: Completion| match core.upgrade() {
            Some(core) => core.execute(job),
            None => job.fail(KbdError::ShutDown),
        };
        if let Err((_job, err)) = self.core.scheduler.submit(job, run) {
            self.core.lock_state().pending = None;
            return Err(err);
        }
        Ok(())
    }

    /// Restore the original terminal mode and stop the worker.
    ///
    /// Idempotent. A read already in flight still completes and is
    /// delivered; everything else fails with `ShutDown` afterwards.
    pub fn shutdown(&self) -> KbdResult<()> {
        self.core.shutdown()
    }
}

impl<D: TerminalDevice> Drop for InputEngine<D> {
    fn drop(&mut self) {
        if let Err(e) = self.core.shutdown() {
            error!("terminal not restored on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedDevice;
    use pretty_assertions::assert_eq;
    use std::thread;

    fn engine(initial: Mode) -> (ScriptedDevice, InputEngine<ScriptedDevice>) {
        engine_with(initial, EngineConfig::default())
    }

    fn engine_with(
        initial: Mode,
        config: EngineConfig,
    ) -> (ScriptedDevice, InputEngine<ScriptedDevice>) {
        let device = ScriptedDevice::new(initial);
        let tty = device.clone();
        let engine = InputEngine::from_device(device, config.with_teardown_hooks(false)).unwrap();
        (tty, engine)
    }

    fn wait_for_reader(tty: &ScriptedDevice) {
        while tty.blocked_readers() == 0 {
            thread::yield_now();
        }
    }

    #[test]
    fn initial_mode_is_the_ambient_one() {
        let (_tty, engine) = engine(Mode { canonical: true, echo: false });
        assert_eq!(engine.mode(), Mode { canonical: true, echo: false });
        assert_eq!(engine.original_mode(), engine.mode());
        assert_eq!(engine.requested_mode(), engine.mode());
    }

    #[test]
    fn setters_return_previous_values() {
        let (_tty, engine) = engine(Mode::COOKED);
        assert!(engine.set_canonical(false).unwrap());
        assert!(!engine.set_canonical(false).unwrap());
        assert!(engine.set_echo(false).unwrap());
        assert_eq!(engine.set_mode(Mode::COOKED).unwrap(), Mode::RAW);
    }

    #[test]
    fn sync_read_rejected_while_async_pending() {
        let (tty, engine) = engine(Mode::RAW);
        let task = engine.get_key().unwrap();
        assert!(matches!(
            engine.get_line_sync(),
            Err(KbdError::RequestAlreadyPending(ReadKind::Key))
        ));
        tty.feed(b"k");
        assert_eq!(task.wait().unwrap(), 'k');
    }

    #[test]
    fn deferred_mode_applies_after_read() {
        let (tty, engine) = engine(Mode::RAW);
        let task = engine.get_key().unwrap();
        wait_for_reader(&tty);

        assert!(!engine.set_canonical(true).unwrap());
        assert!(!engine.set_echo(true).unwrap());
        assert_eq!(engine.mode(), Mode::RAW);
        assert_eq!(engine.requested_mode(), Mode::COOKED);
        assert_eq!(tty.apply_count(), 0);

        tty.feed(b"z");
        assert_eq!(task.wait().unwrap(), 'z');
        assert_eq!(engine.mode(), Mode::COOKED);
        assert_eq!(tty.applied(), vec![Mode::COOKED]);
    }

    #[test]
    fn failed_deferred_change_is_reported_once() {
        let (tty, engine) = engine(Mode::RAW);
        let task = engine.get_key().unwrap();
        wait_for_reader(&tty);
        assert!(!engine.set_canonical(true).unwrap());

        tty.reject_applies(true);
        tty.feed(b"k");
        assert_eq!(task.wait().unwrap(), 'k');
        assert_eq!(engine.mode(), Mode::RAW);
        tty.reject_applies(false);

        match engine.get_key() {
            Err(KbdError::DeferredModeChangeFailed { target, source }) => {
                assert_eq!(target, Mode::RAW.with_canonical(true));
                assert!(matches!(*source, KbdError::AttributeApplyError(_)));
            }
            other => panic!("expected the deferred failure, got {:?}", other.map(|_| ())),
        }
        assert!(!engine.set_canonical(true).unwrap());
        assert_eq!(tty.attributes_now(), Mode::RAW.with_canonical(true));
    }

    #[test]
    fn failed_deferred_change_surfaces_on_next_mode_change() {
        let (tty, engine) = engine(Mode::RAW);
        let task = engine.get_key().unwrap();
        wait_for_reader(&tty);
        engine.set_echo(true).unwrap();

        tty.reject_applies(true);
        tty.feed(b"k");
        task.wait().unwrap();
        tty.reject_applies(false);

        assert!(matches!(
            engine.set_echo(true),
            Err(KbdError::DeferredModeChangeFailed { .. })
        ));
        assert!(!engine.set_echo(true).unwrap());
        assert_eq!(engine.mode(), Mode::RAW.with_echo(true));
    }

    #[test]
    fn restore_by_a_teardown_hook_is_picked_up() {
        let (tty, engine) = engine(Mode::COOKED);
        engine.set_mode(Mode::RAW).unwrap();

        tty.restore_externally();
        assert_eq!(engine.mode(), Mode::COOKED);

        // The engine knows canonical mode is back on and applies the change.
        assert!(engine.set_canonical(false).unwrap());
        assert_eq!(tty.attributes_now(), Mode::COOKED.with_canonical(false));
        assert_eq!(engine.mode(), Mode::COOKED.with_canonical(false));
    }

    #[test]
    fn key_read_after_a_hook_restore_sees_canonical_mode() {
        let (tty, engine) = engine(Mode::COOKED);
        engine.set_mode(Mode::RAW).unwrap();
        tty.restore_externally();
        assert!(matches!(engine.get_key(), Err(KbdError::KeyReadInCanonicalMode)));
        assert_eq!(engine.mode(), Mode::COOKED);
    }

    #[test]
    fn panicking_callback_does_not_stop_later_reads() {
        let (tty, engine) = engine(Mode::RAW);
        engine
            .get_key_then(|_| panic!("callback failure"))
            .unwrap();
        tty.feed(b"ab");
        while engine.pending().is_some() {
            thread::yield_now();
        }
        let task = engine.get_key().unwrap();
        assert_eq!(task.wait().unwrap(), 'b');
    }

    #[test]
    fn fail_fast_policy_rejects_mode_change_during_read() {
        let config = EngineConfig::default().with_mode_change_policy(ModeChangePolicy::FailFast);
        let (tty, engine) = engine_with(Mode::COOKED, config);
        let task = engine.get_line().unwrap();
        assert!(matches!(
            engine.set_echo(false),
            Err(KbdError::ModeChangeWhileReadPending(ReadKind::Line))
        ));
        tty.feed(b"ok\n");
        assert_eq!(task.wait().unwrap(), "ok");
        assert!(engine.set_echo(false).unwrap());
    }

    #[test]
    fn async_key_in_canonical_mode_is_refused_up_front() {
        let (_tty, engine) = engine(Mode::COOKED);
        assert!(matches!(engine.get_key(), Err(KbdError::KeyReadInCanonicalMode)));
        assert!(engine.pending().is_none());
    }

    #[test]
    fn closed_device_restores_original_mode() {
        let (tty, engine) = engine(Mode::COOKED);
        engine.set_mode(Mode::RAW).unwrap();
        tty.close();
        assert!(matches!(engine.get_key_sync(), Err(KbdError::DeviceClosed)));
        assert_eq!(tty.attributes_now(), Mode::COOKED);
        assert_eq!(engine.mode(), Mode::COOKED);
    }

    #[test]
    fn interrupted_read_keeps_mode() {
        let (tty, engine) = engine(Mode::RAW);
        tty.interrupt();
        assert!(matches!(engine.get_key_sync(), Err(KbdError::Interrupted)));
        assert_eq!(engine.mode(), Mode::RAW);
        assert!(engine.pending().is_none());
    }

    #[test]
    fn shutdown_is_idempotent_and_final() {
        let (tty, engine) = engine(Mode::COOKED);
        engine.set_mode(Mode::RAW).unwrap();
        engine.shutdown().unwrap();
        engine.shutdown().unwrap();
        assert_eq!(tty.attributes_now(), Mode::COOKED);
        // One apply for RAW, one for the restore.
        assert_eq!(tty.apply_count(), 2);
        assert!(matches!(engine.set_echo(false), Err(KbdError::ShutDown)));
        assert!(matches!(engine.get_line(), Err(KbdError::ShutDown)));
    }

    #[test]
    fn shutdown_during_read_restores_and_still_delivers() {
        let (tty, engine) = engine(Mode::COOKED);
        engine.set_mode(Mode::RAW).unwrap();
        let task = engine.get_key().unwrap();
        wait_for_reader(&tty);

        engine.shutdown().unwrap();
        assert_eq!(tty.attributes_now(), Mode::COOKED);

        tty.feed(b"q");
        assert_eq!(task.wait().unwrap(), 'q');
        assert_eq!(engine.mode(), Mode::COOKED);
        assert_eq!(tty.apply_count(), 2);
    }

    #[test]
    fn drop_restores_the_terminal() {
        let (tty, engine) = engine(Mode::COOKED);
        engine.set_mode(Mode::RAW).unwrap();
        drop(engine);
        assert_eq!(tty.attributes_now(), Mode::COOKED);
    }
}
