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

//! Property-based invariants for mode changes (public API only).
//!
//! 1. Any sequence of flag changes ends in the last value set per flag.
//! 2. The device always matches the reported mode.
//! 3. Only real transitions reach the device.
//! 4. Shutdown always restores the original mode.

use kbd::scripted::ScriptedDevice;
use kbd::{EngineConfig, InputEngine, Mode};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Change {
    Canonical(bool),
    Echo(bool),
}

fn arb_mode() -> impl Strategy<Value = Mode> {
    (any::<bool>(), any::<bool>()).prop_map(|(canonical, echo)| Mode { canonical, echo })
}

fn arb_change() -> impl Strategy<Value = Change> {
    prop_oneof![
        any::<bool>().prop_map(Change::Canonical),
        any::<bool>().prop_map(Change::Echo),
    ]
}

fn engine(initial: Mode) -> (ScriptedDevice, InputEngine<ScriptedDevice>) {
    let device = ScriptedDevice::new(initial);
    let tty = device.clone();
    let config = EngineConfig::default().with_teardown_hooks(false);
    (tty, InputEngine::from_device(device, config).unwrap())
}

proptest! {
    #[test]
    fn last_write_wins_per_flag(
        initial in arb_mode(),
        changes in prop::collection::vec(arb_change(), 0..32),
    ) {
        let (tty, engine) = engine(initial);
        let mut expected = initial;
        for change in &changes {
            match *change {
                Change::Canonical(on) => {
                    engine.set_canonical(on).unwrap();
                    expected.canonical = on;
                }
                Change::Echo(on) => {
                    engine.set_echo(on).unwrap();
                    expected.echo = on;
                }
            }
            prop_assert_eq!(engine.mode(), tty.attributes_now());
        }
        prop_assert_eq!(engine.mode(), expected);
    }

    #[test]
    fn only_transitions_reach_the_device(
        initial in arb_mode(),
        changes in prop::collection::vec(arb_change(), 0..32),
    ) {
        let (tty, engine) = engine(initial);
        let mut transitions = 0;
        for change in changes {
            let before = engine.mode();
            match change {
                Change::Canonical(on) => { engine.set_canonical(on).unwrap(); }
                Change::Echo(on) => { engine.set_echo(on).unwrap(); }
            }
            if engine.mode() != before {
                transitions += 1;
            }
        }
        prop_assert_eq!(tty.apply_count(), transitions);
    }

    #[test]
    fn shutdown_restores_original(
        initial in arb_mode(),
        modes in prop::collection::vec(arb_mode(), 0..8),
    ) {
        let (tty, engine) = engine(initial);
        for mode in modes {
            engine.set_mode(mode).unwrap();
        }
        engine.shutdown().unwrap();
        prop_assert_eq!(tty.attributes_now(), initial);
        prop_assert_eq!(engine.mode(), initial);
    }
}
