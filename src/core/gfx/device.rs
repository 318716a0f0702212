//! Device lifecycle and the context events raised on its transitions.

use crate::core::gfx::Gfx;
use log::warn;
use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

/// Lifecycle of the native device.
///
/// `Uninitialized -> Created -> (Lost <-> Restored) -> Freed`. A device whose
/// creation hit a recoverable failure starts out `Lost` and is created by the
/// first successful restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Uninitialized,
    Created,
    Lost,
    Restored,
    Freed,
}

impl DeviceState {
    /// Native calls may be issued.
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Created | Self::Restored)
    }
}

#[derive(Debug)]
pub struct DeviceLifecycle {
    state: DeviceState,
    losses: u32,
}

impl Default for DeviceLifecycle {
    fn default() -> Self {
        Self {
            state: DeviceState::Uninitialized,
            losses: 0,
        }
    }
}

impl DeviceLifecycle {
    pub const fn state(&self) -> DeviceState {
        self.state
    }

    pub const fn losses(&self) -> u32 {
        self.losses
    }

    pub fn mark_created(&mut self) -> bool {
        self.transition(DeviceState::Uninitialized, DeviceState::Created)
    }

    /// Returns false when already lost, so each loss is reported once.
    pub fn mark_lost(&mut self) -> bool {
        match self.state {
            DeviceState::Uninitialized | DeviceState::Created | DeviceState::Restored => {
                self.state = DeviceState::Lost;
                self.losses += 1;
                true
            }
            DeviceState::Lost => false,
            DeviceState::Freed => {
                warn!("Ignoring device loss after the device was freed.");
                false
            }
        }
    }

    pub fn mark_restored(&mut self) -> bool {
        self.transition(DeviceState::Lost, DeviceState::Restored)
    }

    pub fn mark_freed(&mut self) {
        self.state = DeviceState::Freed;
    }

    fn transition(&mut self, from: DeviceState, to: DeviceState) -> bool {
        if self.state != from {
            warn!("Invalid device transition {:?} -> {to:?}", self.state);
            return false;
        }
        self.state = to;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextEvent {
    /// Native handles are gone; free yours but keep the CPU-side data.
    Lost,
    /// The device is back; re-create and re-upload.
    Recreated,
    /// An allocation failed for lack of memory. Raised before `Lost`.
    LowVramDetected,
}

/// A subsystem that owns GPU resources.
///
/// Callbacks receive the context so handlers can delete and re-create their
/// handles on the spot.
pub trait ContextListener {
    fn on_context_lost(&mut self, gfx: &mut Gfx);
    fn on_context_recreated(&mut self, gfx: &mut Gfx);
    fn on_low_vram_detected(&mut self, _gfx: &mut Gfx) {}
}

pub type ListenerRef = Rc<RefCell<dyn ContextListener>>;

/// Weakly held listeners; owners unsubscribe by dropping their `Rc`.
#[derive(Default)]
pub struct Listeners {
    entries: Vec<Weak<RefCell<dyn ContextListener>>>,
}

impl Listeners {
    pub fn register(&mut self, listener: &ListenerRef) {
        self.entries.push(Rc::downgrade(listener));
    }

    pub fn unregister(&mut self, listener: &ListenerRef) {
        let target = Rc::downgrade(listener);
        self.entries.retain(|l| !Weak::ptr_eq(l, &target));
    }

    /// Live listeners in registration order, with dead ones pruned.
    pub fn snapshot(&mut self) -> Vec<ListenerRef> {
        self.entries.retain(|l| l.strong_count() > 0);
        self.entries.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|l| l.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Delivers `event` to every listener. A listener already inside one of its
/// callbacks (a loss raised while it was re-creating) is skipped.
pub fn dispatch(gfx: &mut Gfx, listeners: Vec<ListenerRef>, event: ContextEvent) {
    for listener in listeners {
        let Ok(mut l) = listener.try_borrow_mut() else {
            warn!("Skipping {event:?} for a listener that is already handling an event.");
            continue;
        };
        match event {
            ContextEvent::Lost => l.on_context_lost(gfx),
            ContextEvent::Recreated => l.on_context_recreated(gfx),
            ContextEvent::LowVramDetected => l.on_low_vram_detected(gfx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_lifecycle() {
        let mut life = DeviceLifecycle::default();
        assert_eq!(life.state(), DeviceState::Uninitialized);
        assert!(life.mark_created());
        assert!(life.state().is_usable());

        assert!(life.mark_lost());
        assert!(!life.mark_lost(), "a second loss is not a new transition");
        assert!(!life.state().is_usable());

        assert!(life.mark_restored());
        assert_eq!(life.state(), DeviceState::Restored);
        assert!(life.state().is_usable());

        life.mark_freed();
        assert!(!life.mark_lost());
        assert_eq!(life.state(), DeviceState::Freed);
        assert_eq!(life.losses(), 1);
    }

    #[test]
    fn failed_creation_starts_lost() {
        let mut life = DeviceLifecycle::default();
        assert!(life.mark_lost());
        assert!(!life.mark_created(), "creation happens through restore once lost");
        assert!(life.mark_restored());
    }

    #[test]
    fn restore_requires_loss() {
        let mut life = DeviceLifecycle::default();
        life.mark_created();
        assert!(!life.mark_restored());
        assert_eq!(life.state(), DeviceState::Created);
    }

    struct Nop;
    impl ContextListener for Nop {
        fn on_context_lost(&mut self, _gfx: &mut Gfx) {}
        fn on_context_recreated(&mut self, _gfx: &mut Gfx) {}
    }

    #[test]
    fn dropped_listeners_are_pruned() {
        let mut listeners = Listeners::default();
        let kept: ListenerRef = Rc::new(RefCell::new(Nop));
        {
            let temp: ListenerRef = Rc::new(RefCell::new(Nop));
            listeners.register(&kept);
            listeners.register(&temp);
            assert_eq!(listeners.len(), 2);
        }
        assert_eq!(listeners.snapshot().len(), 1);
        listeners.unregister(&kept);
        assert!(listeners.is_empty());
    }
}
