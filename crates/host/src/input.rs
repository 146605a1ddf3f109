//! Live keyboard input
//!
//! Reads key events from evdev nodes and folds presses into the controller's
//! [`ButtonState`] register.

use crate::config::KeyBindings;
use common::{Error, Result};
use evdevil::Evdev;
use evdevil::event::{EventType, InputEvent, Key};
use protocol::{Button, ButtonState};
use std::fmt;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Events read from one device per wakeup
const EVENTS_PER_READ: usize = 64;

/// Key to button lookup
#[derive(Debug, Clone)]
pub struct KeyMap {
    bindings: Vec<(Key, Button)>,
}

impl KeyMap {
    pub fn lookup(&self, key: Key) -> Option<Button> {
        self.bindings
            .iter()
            .find(|(bound, _)| *bound == key)
            .map(|&(_, button)| button)
    }
}

impl From<&KeyBindings> for KeyMap {
    fn from(bindings: &KeyBindings) -> Self {
        let bindings = bindings
            .codes()
            .into_iter()
            .map(Key::from_raw)
            .zip(Button::ALL)
            .collect();
        Self { bindings }
    }
}

impl Default for KeyMap {
    fn default() -> Self {
        Self::from(&KeyBindings::default())
    }
}

/// Owns the live button register
#[derive(Debug, Clone, Default)]
pub struct InputAggregator {
    keymap: KeyMap,
    state: ButtonState,
}

impl InputAggregator {
    pub fn new(keymap: KeyMap) -> Self {
        Self {
            keymap,
            state: ButtonState::IDLE,
        }
    }

    pub fn state(&self) -> ButtonState {
        self.state
    }

    /// Fold one event into the register, returning whether it changed
    ///
    /// Only key presses (1) and releases (0) count; auto-repeat and
    /// unmapped keys are ignored.
    pub fn apply(&mut self, event: &InputEvent) -> bool {
        if event.event_type() != EventType::KEY {
            return false;
        }
        let pressed = match event.raw_value() {
            0 => false,
            1 => true,
            _ => return false,
        };
        let Some(button) = self.keymap.lookup(Key::from_raw(event.raw_code())) else {
            return false;
        };

        let changed = self.state.set(button, pressed);
        if changed {
            debug!(
                "{:?} {}",
                button,
                if pressed { "pressed" } else { "released" }
            );
        }
        changed
    }
}

/// An open evdev node
pub struct EvdevDevice {
    evdev: Evdev,
    path: PathBuf,
}

impl EvdevDevice {
    /// Open `path` and check that it reports key events
    pub fn open(path: &Path) -> Result<Self> {
        let input_error = |e: io::Error| Error::Input(format!("{}: {}", path.display(), e));

        let evdev = Evdev::open(path).map_err(input_error)?;
        if !evdev.supported_events().map_err(input_error)?.contains(EventType::KEY) {
            return Err(Error::Input(format!(
                "{}: not a keyboard (no key events)",
                path.display()
            )));
        }
        evdev.set_nonblocking(true).map_err(input_error)?;

        debug!("Opened input device {}", path.display());
        Ok(Self {
            evdev,
            path: path.to_path_buf(),
        })
    }

    /// Open up to `max_devices` of `paths`, skipping unusable ones
    pub fn open_all(paths: &[PathBuf], max_devices: usize) -> Vec<Self> {
        open_capped(paths, max_devices, Self::open)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read whatever events are queued
    ///
    /// A device that went away reports an error here.
    pub fn read_events(&mut self) -> io::Result<Vec<InputEvent>> {
        let mut events = Vec::new();
        for event in self.evdev.raw_events().take(EVENTS_PER_READ) {
            match event {
                Ok(event) => events.push(event),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(events)
    }
}

impl fmt::Debug for EvdevDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvdevDevice")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl AsFd for EvdevDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.evdev.as_fd()
    }
}

/// Only devices that actually opened count towards the cap
fn open_capped<T>(
    paths: &[PathBuf],
    max_devices: usize,
    mut open: impl FnMut(&Path) -> Result<T>,
) -> Vec<T> {
    let mut devices = Vec::new();
    for path in paths {
        if devices.len() >= max_devices {
            warn!(
                "Too many input devices, ignoring {} and all after it",
                path.display()
            );
            break;
        }
        match open(path) {
            Ok(device) => {
                info!("Reading input from {}", path.display());
                devices.push(device);
            }
            Err(e) => warn!("Skipping input: {}", e),
        }
    }
    devices
}

/// A key event as the kernel reports it
#[cfg(test)]
pub fn key_event(key: Key, value: i32) -> InputEvent {
    InputEvent::new(EventType::KEY, key.raw(), value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_up_press_and_release() {
        let mut aggregator = InputAggregator::default();
        assert!(aggregator.apply(&key_event(Key::KEY_UP, 1)));
        assert_eq!(aggregator.state().to_bytes(), [0x32, 0x3e]);

        // held key does not change the register again
        assert!(!aggregator.apply(&key_event(Key::KEY_UP, 1)));

        assert!(aggregator.apply(&key_event(Key::KEY_UP, 0)));
        assert_eq!(aggregator.state(), ButtonState::IDLE);
    }

    #[test]
    fn test_default_bindings() {
        let map = KeyMap::default();
        assert_eq!(map.lookup(Key::KEY_HOME), Some(Button::A));
        assert_eq!(map.lookup(Key::KEY_PAGEDOWN), Some(Button::B));
        assert_eq!(map.lookup(Key::KEY_END), Some(Button::C));
        assert_eq!(map.lookup(Key::KEY_LEFTALT), Some(Button::Start));
        assert_eq!(map.lookup(Key::KEY_A), None);
    }

    #[test]
    fn test_custom_bindings() {
        let bindings = KeyBindings {
            a: Key::KEY_A.raw(),
            ..KeyBindings::default()
        };
        let mut aggregator = InputAggregator::new(KeyMap::from(&bindings));
        assert!(!aggregator.apply(&key_event(Key::KEY_HOME, 1)));
        assert!(aggregator.apply(&key_event(Key::KEY_A, 1)));
        assert!(aggregator.state().is_pressed(Button::A));
    }

    #[test]
    fn test_ignored_events() {
        let mut aggregator = InputAggregator::default();
        assert!(!aggregator.apply(&key_event(Key::KEY_UP, 2)));
        assert!(!aggregator.apply(&key_event(Key::KEY_A, 1)));
        assert!(!aggregator.apply(&InputEvent::new(
            EventType::MSC,
            Key::KEY_UP.raw(),
            1
        )));
        assert_eq!(aggregator.state(), ButtonState::IDLE);
    }

    #[test]
    fn test_open_rejects_non_evdev() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            EvdevDevice::open(file.path()),
            Err(Error::Input(_))
        ));
        assert!(EvdevDevice::open(Path::new("/nonexistent/event0")).is_err());
    }

    #[test]
    fn test_cap_counts_only_opened_devices() {
        let paths: Vec<PathBuf> = ["bad0", "ok1", "bad2", "ok3", "ok4"]
            .iter()
            .map(PathBuf::from)
            .collect();
        let mut tried = Vec::new();
        let opened = open_capped(&paths, 2, |path| {
            tried.push(path.to_path_buf());
            let name = path.to_string_lossy();
            if name.starts_with("ok") {
                Ok(name.into_owned())
            } else {
                Err(Error::Input(format!("{}: not a keyboard", name)))
            }
        });

        assert_eq!(opened, ["ok1", "ok3"]);
        assert_eq!(tried, paths[..4]);
    }

    #[test]
    fn test_zero_cap_opens_nothing() {
        let paths = [PathBuf::from("ok0")];
        let opened = open_capped(&paths, 0, |_| -> Result<()> { panic!("opened past the cap") });
        assert!(opened.is_empty());
    }

    proptest! {
        /// Once every key is released the register is idle again
        #[test]
        fn prop_release_all_returns_to_idle(
            events in proptest::collection::vec((0usize..8, 0i32..3), 0..64),
        ) {
            let keys = KeyBindings::default().codes().map(Key::from_raw);
            let mut aggregator = InputAggregator::default();
            for (key, value) in events {
                aggregator.apply(&key_event(keys[key], value));
            }
            for key in keys {
                aggregator.apply(&key_event(key, 0));
            }
            prop_assert_eq!(aggregator.state(), ButtonState::IDLE);
        }
    }
}
