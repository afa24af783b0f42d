//! Process-global hotkey capture.
//!
//! Safety actions must fire even when the window is unfocused, so capture
//! runs on a dedicated OS-hook thread (rdev) that pushes actions into an
//! unbounded channel for the coordinator. EStop additionally sets a shared
//! latch the consumers check ahead of the queue, so it can never be stuck
//! behind other actions or dropped.
//!
//! Bindings: Space -> EStop, Enter -> Disable, `[` + `]` + `\` chord ->
//! Enable, Backspace -> A-Stop, F1 -> rescan input devices. All actions are
//! debounced at 50 ms.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

const DEBOUNCE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HotkeyAction {
    EStop,
    Disable,
    Enable,
    AStop,
    RescanJoysticks,
}

/// Pure key-event decoder: pressed-key set, chord detection, debouncing.
///
/// Kept free of the OS hook so the bindings are testable.
#[derive(Debug, Default)]
pub struct KeyTracker {
    pressed: HashSet<rdev::Key>,
    last_fired: HashMap<HotkeyAction, Instant>,
}

impl KeyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a key-down event, returning the action to dispatch, if any.
    pub fn key_down(&mut self, key: rdev::Key, now: Instant) -> Option<HotkeyAction> {
        self.pressed.insert(key);

        let action = match key {
            rdev::Key::Space => HotkeyAction::EStop,
            rdev::Key::Return => HotkeyAction::Disable,
            rdev::Key::Backspace => HotkeyAction::AStop,
            rdev::Key::F1 => HotkeyAction::RescanJoysticks,
            rdev::Key::LeftBracket | rdev::Key::RightBracket | rdev::Key::BackSlash => {
                if self.enable_chord_held() {
                    HotkeyAction::Enable
                } else {
                    return None;
                }
            }
            _ => return None,
        };

        self.debounced(action, now)
    }

    pub fn key_up(&mut self, key: rdev::Key) {
        self.pressed.remove(&key);
    }

    fn enable_chord_held(&self) -> bool {
        self.pressed.contains(&rdev::Key::LeftBracket)
            && self.pressed.contains(&rdev::Key::RightBracket)
            && self.pressed.contains(&rdev::Key::BackSlash)
    }

    fn debounced(&mut self, action: HotkeyAction, now: Instant) -> Option<HotkeyAction> {
        if let Some(&last) = self.last_fired.get(&action) {
            if now.duration_since(last) < DEBOUNCE {
                return None;
            }
        }
        self.last_fired.insert(action, now);
        Some(action)
    }
}

/// Owns the OS-hook thread and the action channel.
pub struct HotkeyManager {
    tx: mpsc::UnboundedSender<HotkeyAction>,
    estop_latch: Arc<AtomicBool>,
}

impl HotkeyManager {
    /// Spawn the capture thread. Returns the manager, the action receiver,
    /// and the EStop latch consumers poll ahead of the queue.
    pub fn start() -> (
        Self,
        mpsc::UnboundedReceiver<HotkeyAction>,
        Arc<AtomicBool>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let estop_latch = Arc::new(AtomicBool::new(false));

        let manager = Self {
            tx: tx.clone(),
            estop_latch: estop_latch.clone(),
        };
        manager.spawn_listener();

        (manager, rx, estop_latch)
    }

    fn spawn_listener(&self) {
        let tx = self.tx.clone();
        let latch = self.estop_latch.clone();

        thread::spawn(move || {
            info!("Global hotkey listener starting");
            let mut tracker = KeyTracker::new();

            let callback = move |event: rdev::Event| match event.event_type {
                rdev::EventType::KeyPress(key) => {
                    if let Some(action) = tracker.key_down(key, Instant::now()) {
                        debug!("Hotkey action: {action:?}");
                        if action == HotkeyAction::EStop {
                            latch.store(true, Ordering::SeqCst);
                        }
                        let _ = tx.send(action);
                    }
                }
                rdev::EventType::KeyRelease(key) => tracker.key_up(key),
                _ => {}
            };

            // rdev::listen blocks this thread for the process lifetime.
            if let Err(e) = rdev::listen(callback) {
                error!("Global hotkey listener failed: {e:?}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn later(t0: Instant, ms: u64) -> Instant {
        t0 + Duration::from_millis(ms)
    }

    #[test]
    fn space_fires_estop() {
        let mut tracker = KeyTracker::new();
        let now = Instant::now();
        assert_eq!(
            tracker.key_down(rdev::Key::Space, now),
            Some(HotkeyAction::EStop)
        );
    }

    #[test]
    fn enter_disables_and_f1_rescans() {
        let mut tracker = KeyTracker::new();
        let now = Instant::now();
        assert_eq!(
            tracker.key_down(rdev::Key::Return, now),
            Some(HotkeyAction::Disable)
        );
        assert_eq!(
            tracker.key_down(rdev::Key::F1, now),
            Some(HotkeyAction::RescanJoysticks)
        );
        assert_eq!(
            tracker.key_down(rdev::Key::Backspace, now),
            Some(HotkeyAction::AStop)
        );
    }

    #[test]
    fn unbound_keys_are_ignored() {
        let mut tracker = KeyTracker::new();
        assert_eq!(tracker.key_down(rdev::Key::KeyA, Instant::now()), None);
    }

    #[test]
    fn enable_requires_full_chord() {
        let mut tracker = KeyTracker::new();
        let t0 = Instant::now();

        assert_eq!(tracker.key_down(rdev::Key::LeftBracket, t0), None);
        assert_eq!(tracker.key_down(rdev::Key::RightBracket, later(t0, 1)), None);
        assert_eq!(
            tracker.key_down(rdev::Key::BackSlash, later(t0, 2)),
            Some(HotkeyAction::Enable)
        );
    }

    #[test]
    fn chord_breaks_when_a_key_releases() {
        let mut tracker = KeyTracker::new();
        let t0 = Instant::now();

        tracker.key_down(rdev::Key::LeftBracket, t0);
        tracker.key_down(rdev::Key::RightBracket, t0);
        tracker.key_up(rdev::Key::LeftBracket);
        assert_eq!(tracker.key_down(rdev::Key::BackSlash, later(t0, 60)), None);
    }

    #[test]
    fn repeats_are_debounced() {
        let mut tracker = KeyTracker::new();
        let t0 = Instant::now();

        assert_eq!(
            tracker.key_down(rdev::Key::Space, t0),
            Some(HotkeyAction::EStop)
        );
        // OS auto-repeat inside the window stays quiet.
        assert_eq!(tracker.key_down(rdev::Key::Space, later(t0, 20)), None);
        assert_eq!(tracker.key_down(rdev::Key::Space, later(t0, 49)), None);
        assert_eq!(
            tracker.key_down(rdev::Key::Space, later(t0, 51)),
            Some(HotkeyAction::EStop)
        );
    }

    #[test]
    fn debounce_is_per_action() {
        let mut tracker = KeyTracker::new();
        let t0 = Instant::now();

        assert_eq!(
            tracker.key_down(rdev::Key::Space, t0),
            Some(HotkeyAction::EStop)
        );
        // A different action fires immediately.
        assert_eq!(
            tracker.key_down(rdev::Key::Return, later(t0, 5)),
            Some(HotkeyAction::Disable)
        );
    }
}
