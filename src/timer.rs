//! Deadline-based readiness.
//!
//! Timers present future readiness as ordinary conveyor events: the loop
//! bounds its reactor block by the nearest deadline and feeds the due
//! one-shot feeders after each dispatch.

use std::time::{Duration, Instant};

use crate::conveyor::{one_time_conveyor_and_feeder, with_current, Conveyor, ConveyorFeeder};

pub(crate) struct TimerQueue {
    deadlines: Vec<(Instant, Box<dyn ConveyorFeeder<()>>)>,
}

impl TimerQueue {
    pub(crate) fn new() -> TimerQueue {
        TimerQueue {
            deadlines: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, deadline: Instant, feeder: Box<dyn ConveyorFeeder<()>>) {
        self.deadlines.push((deadline, feeder));
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().map(|(deadline, _)| *deadline).min()
    }

    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<Box<dyn ConveyorFeeder<()>>> {
        let mut due = Vec::new();
        let mut index = 0;
        while index < self.deadlines.len() {
            if self.deadlines[index].0 <= now {
                due.push(self.deadlines.swap_remove(index).1);
            } else {
                index += 1;
            }
        }
        due
    }
}

/// A conveyor firing once when the loop's clock crosses `duration` from
/// now. The deadline bounds the reactor's next block, not any conveyor
/// operation.
pub fn timeout_after(duration: Duration) -> Conveyor<()> {
    let pair = one_time_conveyor_and_feeder::<()>();
    with_current(|lp| {
        lp.timers
            .borrow_mut()
            .add(Instant::now() + duration, pair.feeder)
    });
    pair.conveyor
}
