//! Deferred callbacks driven by an explicit logical clock.
//!
//! A [`TimerManager`] never looks at wall-clock time: its owner advances it
//! with [`TimerManager::advance`]. Managers and timers are deliberately
//! `!Send`; a manager belongs to the single control thread that drives it.

mod manager;

pub use manager::TimerManager;

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::{Result, RuntimeError};

use manager::ManagerCore;

/// Logical time as understood by a timer manager.
pub type Time = u64;

/// Opaque handle a container hands out for one of its entries. The timer
/// machinery passes it back to the container untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryCookie(pub u64);

/// Callbacks into the containers whose entries expire through timers.
pub trait ExpiryHooks {
    fn on_map_entry_expired(&self, cookie: EntryCookie);
    fn on_set_entry_expired(&self, cookie: EntryCookie);
}

/// Hooks installed by [`TimerManager::new`]; expiring entries are ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExpiryHooks;

impl ExpiryHooks for NoExpiryHooks {
    fn on_map_entry_expired(&self, _cookie: EntryCookie) {}

    fn on_set_entry_expired(&self, _cookie: EntryCookie) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Function,
    MapEntry,
    SetEntry,
}

enum TimerPayload {
    Function(Rc<dyn Fn()>),
    MapEntry(EntryCookie),
    SetEntry(EntryCookie),
}

/// Position of a scheduled timer in its manager's queue. The sequence number
/// keeps timers with equal expiration in scheduling order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
    pub(crate) time: Time,
    pub(crate) seq: u64,
}

#[derive(Default)]
struct TimerSlot {
    owner: Option<Weak<RefCell<ManagerCore>>>,
    key: Option<TimerKey>,
}

struct TimerInner {
    payload: TimerPayload,
    slot: RefCell<TimerSlot>,
}

/// A deferred callback. Cloning yields another handle to the same timer.
///
/// A timer is either unscheduled or owned by exactly one manager; it has to
/// be cancelled (or fire) before it can be scheduled again.
#[derive(Clone)]
pub struct Timer {
    inner: Rc<TimerInner>,
}

impl Timer {
    fn with_payload(payload: TimerPayload) -> Self {
        Self {
            inner: Rc::new(TimerInner {
                payload,
                slot: RefCell::new(TimerSlot::default()),
            }),
        }
    }

    /// A timer that calls `func` when it fires.
    ///
    /// A scheduled timer is owned by its manager's queue. A `func` that holds
    /// a strong `Rc` to that same manager forms a cycle that is only broken
    /// when the timer fires, is cancelled, or is expired; capture a
    /// `Weak<TimerManager>` to reschedule from inside the callback instead.
    pub fn function<F>(func: F) -> Self
    where
        F: Fn() + 'static,
    {
        Self::with_payload(TimerPayload::Function(Rc::new(func)))
    }

    /// Expires map entry `cookie` through [`ExpiryHooks::on_map_entry_expired`].
    pub fn map_entry(cookie: EntryCookie) -> Self {
        Self::with_payload(TimerPayload::MapEntry(cookie))
    }

    /// Expires set entry `cookie` through [`ExpiryHooks::on_set_entry_expired`].
    pub fn set_entry(cookie: EntryCookie) -> Self {
        Self::with_payload(TimerPayload::SetEntry(cookie))
    }

    pub fn kind(&self) -> TimerKind {
        match self.inner.payload {
            TimerPayload::Function(_) => TimerKind::Function,
            TimerPayload::MapEntry(_) => TimerKind::MapEntry,
            TimerPayload::SetEntry(_) => TimerKind::SetEntry,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.slot.borrow().owner.is_some()
    }

    /// Expiration time while scheduled.
    pub fn time(&self) -> Option<Time> {
        self.inner.slot.borrow().key.map(|key| key.time)
    }

    pub fn ptr_eq(&self, other: &Timer) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Removes the timer from whichever manager owns it.
    ///
    /// Cancelling an unscheduled timer does nothing. A timer whose manager
    /// has already been dropped is detached and `NoTimerManager` is returned.
    pub fn cancel(&self) -> Result<()> {
        let Some((owner, key)) = self.placement() else {
            return Ok(());
        };
        self.clear();
        let core = owner.upgrade().ok_or(RuntimeError::NoTimerManager)?;
        core.borrow_mut().remove(key);
        Ok(())
    }

    /// Moves the timer to expire at `time`, firing it right away if `time`
    /// is not in the future of its manager.
    pub fn update(&self, time: Time) -> Result<()> {
        let (owner, key) = self.placement().ok_or(RuntimeError::NotScheduled)?;
        let core = owner.upgrade().ok_or(RuntimeError::NoTimerManager)?;

        let hooks = {
            let mut core = core.borrow_mut();
            if time > core.time() {
                let new_key = core.reinsert(key, time, self.clone());
                self.inner.slot.borrow_mut().key = Some(new_key);
                return Ok(());
            }
            core.remove(key);
            core.hooks()
        };

        self.clear();
        self.fire(&*hooks);
        Ok(())
    }

    fn placement(&self) -> Option<(Weak<RefCell<ManagerCore>>, TimerKey)> {
        let slot = self.inner.slot.borrow();
        match (&slot.owner, slot.key) {
            (Some(owner), Some(key)) => Some((owner.clone(), key)),
            _ => None,
        }
    }

    pub(crate) fn attach(&self, owner: Weak<RefCell<ManagerCore>>, key: TimerKey) {
        let mut slot = self.inner.slot.borrow_mut();
        slot.owner = Some(owner);
        slot.key = Some(key);
    }

    pub(crate) fn clear(&self) {
        let mut slot = self.inner.slot.borrow_mut();
        slot.owner = None;
        slot.key = None;
    }

    /// Runs the timer's action. The timer must already be detached.
    pub(crate) fn fire(&self, hooks: &dyn ExpiryHooks) {
        match &self.inner.payload {
            TimerPayload::Function(func) => func(),
            TimerPayload::MapEntry(cookie) => hooks.on_map_entry_expired(*cookie),
            TimerPayload::SetEntry(cookie) => hooks.on_set_entry_expired(*cookie),
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("kind", &self.kind())
            .field("time", &self.time())
            .finish()
    }
}
