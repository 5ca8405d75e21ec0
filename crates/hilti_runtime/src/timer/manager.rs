use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::error::{Result, RuntimeError};

use super::{ExpiryHooks, NoExpiryHooks, Time, Timer, TimerKey};

pub(crate) struct ManagerCore {
    time: Time,
    next_seq: u64,
    queue: BTreeMap<TimerKey, Timer>,
    hooks: Rc<dyn ExpiryHooks>,
}

impl ManagerCore {
    pub(crate) fn time(&self) -> Time {
        self.time
    }

    pub(crate) fn hooks(&self) -> Rc<dyn ExpiryHooks> {
        Rc::clone(&self.hooks)
    }

    fn next_key(&mut self, time: Time) -> TimerKey {
        let seq = self.next_seq;
        self.next_seq += 1;
        TimerKey { time, seq }
    }

    fn insert(&mut self, time: Time, timer: Timer) -> TimerKey {
        let key = self.next_key(time);
        self.queue.insert(key, timer);
        key
    }

    pub(crate) fn remove(&mut self, key: TimerKey) -> Option<Timer> {
        self.queue.remove(&key)
    }

    pub(crate) fn reinsert(&mut self, old: TimerKey, time: Time, timer: Timer) -> TimerKey {
        self.queue.remove(&old);
        self.insert(time, timer)
    }

    /// Detaches and returns the earliest timer due at or before `limit`.
    fn pop_due(&mut self, limit: Time) -> Option<Timer> {
        let (key, _) = self.queue.first_key_value()?;
        if key.time > limit {
            return None;
        }
        self.queue.pop_first().map(|(_, timer)| timer)
    }
}

/// Priority queue of timers ordered by expiration time.
///
/// All methods take `&self`: timer actions run while no borrow of the
/// manager is held, so they may schedule, update or cancel timers on the
/// same manager.
pub struct TimerManager {
    core: Rc<RefCell<ManagerCore>>,
}

impl TimerManager {
    /// An empty manager at time 0 that ignores container expirations.
    pub fn new() -> Self {
        Self::with_hooks(Rc::new(NoExpiryHooks))
    }

    pub fn with_hooks(hooks: Rc<dyn ExpiryHooks>) -> Self {
        Self {
            core: Rc::new(RefCell::new(ManagerCore {
                time: 0,
                next_seq: 0,
                queue: BTreeMap::new(),
                hooks,
            })),
        }
    }

    pub fn current_time(&self) -> Time {
        self.core.borrow().time
    }

    pub fn len(&self) -> usize {
        self.core.borrow().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.borrow().queue.is_empty()
    }

    /// Expiration time of the earliest pending timer.
    pub fn next_expiration(&self) -> Option<Time> {
        self.core
            .borrow()
            .queue
            .first_key_value()
            .map(|(key, _)| key.time)
    }

    /// Schedules `timer` to expire at `time`.
    ///
    /// A `time` that is not in the future fires the timer immediately, inside
    /// this call.
    pub fn schedule(&self, time: Time, timer: &Timer) -> Result<()> {
        if timer.is_scheduled() {
            return Err(RuntimeError::AlreadyScheduled);
        }

        let hooks = {
            let mut core = self.core.borrow_mut();
            if time > core.time {
                let key = core.insert(time, timer.clone());
                timer.attach(Rc::downgrade(&self.core), key);
                return Ok(());
            }
            core.hooks()
        };

        trace!(time, "timer due on schedule, firing inline");
        timer.fire(&*hooks);
        Ok(())
    }

    /// Reschedules a pending timer; see [`Timer::update`].
    pub fn update(&self, timer: &Timer, time: Time) -> Result<()> {
        timer.update(time)
    }

    /// Removes a pending timer; a no-op for unscheduled timers.
    pub fn cancel(&self, timer: &Timer) -> Result<()> {
        timer.cancel()
    }

    /// Fires every timer due at or before `time`, then sets the clock to
    /// `time`. Returns the number of timers fired.
    pub fn advance(&self, time: Time) -> usize {
        let hooks = self.core.borrow().hooks();
        let mut fired = 0;

        loop {
            let due = self.core.borrow_mut().pop_due(time);
            let Some(timer) = due else {
                break;
            };
            timer.clear();
            timer.fire(&*hooks);
            fired += 1;
        }

        let mut core = self.core.borrow_mut();
        if time < core.time {
            debug!(from = core.time, to = time, "timer clock moved backwards");
        }
        core.time = time;
        trace!(time, fired, "timer manager advanced");
        fired
    }

    /// Empties the manager. With `fire` set every pending timer runs
    /// regardless of its expiration; otherwise they are dropped silently.
    ///
    /// Timers scheduled by the fired actions themselves stay pending.
    pub fn expire_all(&self, fire: bool) -> usize {
        let (pending, hooks) = {
            let mut core = self.core.borrow_mut();
            (std::mem::take(&mut core.queue), core.hooks())
        };

        let count = pending.len();
        for timer in pending.into_values() {
            timer.clear();
            if fire {
                timer.fire(&*hooks);
            }
        }
        debug!(count, fire, "expired all timers");
        count
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.borrow();
        f.debug_struct("TimerManager")
            .field("time", &core.time)
            .field("pending", &core.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::timer::{EntryCookie, TimerKind};

    fn counting_timer(counter: &Rc<Cell<u32>>) -> Timer {
        let counter = Rc::clone(counter);
        Timer::function(move || counter.set(counter.get() + 1))
    }

    #[derive(Default)]
    struct RecordingHooks {
        maps: RefCell<Vec<u64>>,
        sets: RefCell<Vec<u64>>,
    }

    impl ExpiryHooks for RecordingHooks {
        fn on_map_entry_expired(&self, cookie: EntryCookie) {
            self.maps.borrow_mut().push(cookie.0);
        }

        fn on_set_entry_expired(&self, cookie: EntryCookie) {
            self.sets.borrow_mut().push(cookie.0);
        }
    }

    #[test]
    fn advance_fires_only_due_timers() {
        let mgr = TimerManager::new();
        let fired = Rc::new(Cell::new(0));
        let late = counting_timer(&fired);
        let early = counting_timer(&fired);

        mgr.schedule(10, &late).unwrap();
        mgr.schedule(5, &early).unwrap();
        assert_eq!(mgr.next_expiration(), Some(5));

        assert_eq!(mgr.advance(7), 1);
        assert!(!early.is_scheduled());
        assert!(late.is_scheduled());
        assert_eq!(mgr.current_time(), 7);

        assert_eq!(mgr.advance(10), 1);
        assert_eq!(mgr.advance(100), 0);
        assert_eq!(fired.get(), 2);
        assert!(mgr.is_empty());
    }

    #[test]
    fn equal_expirations_fire_together_in_schedule_order() {
        let mgr = TimerManager::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let timers: Vec<Timer> = (0..3)
            .map(|n| {
                let order = Rc::clone(&order);
                Timer::function(move || order.borrow_mut().push(n))
            })
            .collect();
        for timer in &timers {
            mgr.schedule(4, timer).unwrap();
        }
        assert_eq!(mgr.advance(4), 3);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn past_schedule_fires_inline() {
        let mgr = TimerManager::new();
        mgr.advance(50);
        let fired = Rc::new(Cell::new(0));
        let timer = counting_timer(&fired);
        mgr.schedule(50, &timer).unwrap();
        assert_eq!(fired.get(), 1);
        assert!(!timer.is_scheduled());
        assert!(mgr.is_empty());
    }

    #[test]
    fn double_schedule_is_rejected() {
        let mgr = TimerManager::new();
        let timer = Timer::function(|| {});
        mgr.schedule(3, &timer).unwrap();
        assert_eq!(mgr.schedule(4, &timer), Err(RuntimeError::AlreadyScheduled));
        assert_eq!(timer.time(), Some(3));
    }

    #[test]
    fn update_moves_future_timers_and_fires_past_ones() {
        let mgr = TimerManager::new();
        let fired = Rc::new(Cell::new(0));
        let timer = counting_timer(&fired);
        mgr.schedule(10, &timer).unwrap();

        mgr.update(&timer, 20).unwrap();
        assert_eq!(timer.time(), Some(20));
        assert_eq!(mgr.advance(15), 0);

        mgr.update(&timer, 15).unwrap();
        assert_eq!(fired.get(), 1);
        assert!(!timer.is_scheduled());
        assert_eq!(mgr.advance(30), 0);
    }

    #[test]
    fn update_of_unscheduled_timer_fails() {
        let mgr = TimerManager::new();
        let timer = Timer::function(|| {});
        assert_eq!(mgr.update(&timer, 5), Err(RuntimeError::NotScheduled));
    }

    #[test]
    fn cancel_is_idempotent() {
        let mgr = TimerManager::new();
        let timer = Timer::function(|| panic!("cancelled timer fired"));
        mgr.schedule(8, &timer).unwrap();
        mgr.cancel(&timer).unwrap();
        mgr.cancel(&timer).unwrap();
        assert!(mgr.is_empty());
        assert_eq!(mgr.advance(10), 0);
    }

    #[test]
    fn entry_timers_dispatch_to_hooks() {
        let hooks = Rc::new(RecordingHooks::default());
        let mgr = TimerManager::with_hooks(hooks.clone());
        let map_timer = Timer::map_entry(EntryCookie(11));
        let set_timer = Timer::set_entry(EntryCookie(22));
        assert_eq!(map_timer.kind(), TimerKind::MapEntry);
        assert_eq!(set_timer.kind(), TimerKind::SetEntry);

        mgr.schedule(1, &map_timer).unwrap();
        mgr.schedule(2, &set_timer).unwrap();
        assert_eq!(mgr.advance(2), 2);
        assert_eq!(*hooks.maps.borrow(), vec![11]);
        assert_eq!(*hooks.sets.borrow(), vec![22]);
    }

    #[test]
    fn expire_all_fires_or_drops() {
        let fired = Rc::new(Cell::new(0));
        let mgr = TimerManager::new();
        let a = counting_timer(&fired);
        let b = counting_timer(&fired);
        mgr.schedule(100, &a).unwrap();
        mgr.schedule(200, &b).unwrap();
        assert_eq!(mgr.expire_all(true), 2);
        assert_eq!(fired.get(), 2);

        mgr.schedule(100, &a).unwrap();
        assert_eq!(mgr.expire_all(false), 1);
        assert_eq!(fired.get(), 2);
        assert!(!a.is_scheduled());
        assert_eq!(mgr.current_time(), 0);
    }

    #[test]
    fn actions_may_reschedule_on_the_same_manager() {
        let mgr = Rc::new(TimerManager::new());
        let fired = Rc::new(Cell::new(0));
        let follow_up = counting_timer(&fired);

        let trigger = {
            let mgr = Rc::downgrade(&mgr);
            let follow_up = follow_up.clone();
            Timer::function(move || {
                if let Some(mgr) = mgr.upgrade() {
                    mgr.schedule(6, &follow_up).unwrap();
                }
            })
        };
        mgr.schedule(5, &trigger).unwrap();

        assert_eq!(mgr.advance(10), 2);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn weakly_captured_manager_is_released_with_pending_timers() {
        let mgr = Rc::new(TimerManager::new());
        let weak = Rc::downgrade(&mgr);
        let timer = {
            let mgr = Rc::downgrade(&mgr);
            Timer::function(move || {
                if let Some(mgr) = mgr.upgrade() {
                    mgr.advance(0);
                }
            })
        };
        mgr.schedule(50, &timer).unwrap();

        drop(mgr);
        assert!(weak.upgrade().is_none());
        assert_eq!(timer.cancel(), Err(RuntimeError::NoTimerManager));
        assert_eq!(Rc::strong_count(&timer.inner), 1);
    }

    #[test]
    fn orphaned_timers_report_missing_manager() {
        let timer = Timer::function(|| {});
        {
            let mgr = TimerManager::new();
            mgr.schedule(5, &timer).unwrap();
        }
        assert_eq!(timer.update(9), Err(RuntimeError::NoTimerManager));
        assert_eq!(timer.cancel(), Err(RuntimeError::NoTimerManager));
        assert!(!timer.is_scheduled());

        let other = TimerManager::new();
        other.schedule(5, &timer).unwrap();
        assert_eq!(other.len(), 1);
    }
}
