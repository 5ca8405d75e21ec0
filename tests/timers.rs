use std::cell::{Cell, RefCell};
use std::rc::Rc;

use hilti::runtime::{EntryCookie, ExpiryHooks, RuntimeError, Timer, TimerManager};

fn recording_timer(log: &Rc<RefCell<Vec<&'static str>>>, name: &'static str) -> Timer {
    let log = Rc::clone(log);
    Timer::function(move || log.borrow_mut().push(name))
}

#[test]
fn timers_fire_in_expiration_order() {
    let mgr = TimerManager::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let t10 = recording_timer(&log, "t10");
    let t5 = recording_timer(&log, "t5");

    mgr.schedule(10, &t10).unwrap();
    mgr.schedule(5, &t5).unwrap();

    assert_eq!(mgr.advance(7), 1);
    assert_eq!(*log.borrow(), vec!["t5"]);
    assert_eq!(mgr.advance(10), 1);
    assert_eq!(*log.borrow(), vec!["t5", "t10"]);
    assert_eq!(mgr.advance(100), 0);
    assert_eq!(mgr.current_time(), 100);
}

#[test]
fn cancelled_timer_can_be_scheduled_again() {
    let mgr = TimerManager::new();
    let fired = Rc::new(Cell::new(0));
    let timer = {
        let fired = Rc::clone(&fired);
        Timer::function(move || fired.set(fired.get() + 1))
    };

    mgr.schedule(20, &timer).unwrap();
    timer.cancel().unwrap();
    assert!(!timer.is_scheduled());
    assert_eq!(mgr.advance(25), 0);

    mgr.schedule(30, &timer).unwrap();
    assert_eq!(mgr.next_expiration(), Some(30));
    assert_eq!(mgr.advance(30), 1);
    assert_eq!(fired.get(), 1);
}

#[test]
fn updating_into_the_past_fires_immediately() {
    let mgr = TimerManager::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let timer = recording_timer(&log, "moved");

    mgr.schedule(50, &timer).unwrap();
    mgr.advance(20);
    timer.update(10).unwrap();

    assert_eq!(*log.borrow(), vec!["moved"]);
    assert!(mgr.is_empty());
    assert_eq!(timer.update(60), Err(RuntimeError::NotScheduled));
}

#[test]
fn a_timer_belongs_to_one_manager_at_a_time() {
    let first = TimerManager::new();
    let second = TimerManager::new();
    let timer = Timer::function(|| {});

    first.schedule(5, &timer).unwrap();
    assert_eq!(second.schedule(5, &timer), Err(RuntimeError::AlreadyScheduled));

    second.cancel(&timer).unwrap();
    assert!(first.is_empty());
    second.schedule(5, &timer).unwrap();
    assert_eq!(second.len(), 1);
}

struct Expirations {
    expired: RefCell<Vec<(char, u64)>>,
}

impl ExpiryHooks for Expirations {
    fn on_map_entry_expired(&self, cookie: EntryCookie) {
        self.expired.borrow_mut().push(('m', cookie.0));
    }

    fn on_set_entry_expired(&self, cookie: EntryCookie) {
        self.expired.borrow_mut().push(('s', cookie.0));
    }
}

#[test]
fn container_entries_expire_through_hooks() {
    let hooks = Rc::new(Expirations {
        expired: RefCell::new(Vec::new()),
    });
    let mgr = TimerManager::with_hooks(hooks.clone());
    let entries = [
        Timer::set_entry(EntryCookie(2)),
        Timer::map_entry(EntryCookie(1)),
    ];

    mgr.schedule(3, &entries[0]).unwrap();
    mgr.schedule(1, &entries[1]).unwrap();
    assert_eq!(mgr.expire_all(true), 2);
    assert_eq!(*hooks.expired.borrow(), vec![('m', 1), ('s', 2)]);
}

#[test]
fn periodic_callback_reschedules_itself() {
    let mgr = Rc::new(TimerManager::new());
    let ticks = Rc::new(Cell::new(0_u64));
    let slot: Rc<RefCell<Option<Timer>>> = Rc::default();

    let timer = {
        let mgr = Rc::clone(&mgr);
        let ticks = Rc::clone(&ticks);
        let slot = Rc::clone(&slot);
        Timer::function(move || {
            // The clock only moves once `advance` has drained what is due.
            ticks.set(ticks.get() + 1);
            if let Some(me) = slot.borrow().as_ref() {
                mgr.schedule((ticks.get() + 1) * 10, me).unwrap();
            }
        })
    };
    *slot.borrow_mut() = Some(timer.clone());

    mgr.schedule(10, &timer).unwrap();
    for now in [10, 20, 30] {
        mgr.advance(now);
    }
    assert_eq!(ticks.get(), 3);
    assert_eq!(timer.time(), Some(40));
    slot.borrow_mut().take();
    timer.cancel().unwrap();
}
