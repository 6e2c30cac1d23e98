use std::cell::Cell;
use std::rc::Rc;

use conveyor::{new_conveyor_and_feeder, one_time_conveyor_and_feeder, Code, Conveyor, WaitScope};

mod util;
use util::init_with_loop;

#[test]
fn immediate_then_conversion() {
    let event_loop = init_with_loop();
    let wait_scope = WaitScope::new(&event_loop);

    let mut is_five = Conveyor::immediate(5usize).then(|value| value == 5);

    wait_scope.poll().unwrap();

    assert_eq!(is_five.take().unwrap(), true);
}

#[test]
fn immediate_take_twice_is_exhausted() {
    let event_loop = init_with_loop();
    let wait_scope = WaitScope::new(&event_loop);

    let mut value = Conveyor::immediate(42u32);
    wait_scope.poll().unwrap();

    assert_eq!(value.take().unwrap(), 42);
    let error = value.take().unwrap_err();
    assert_eq!(error.code(), Code::Exhausted);
    assert!(error.is_critical());
}

#[test]
fn immediate_error_propagates() {
    let event_loop = init_with_loop();
    let _wait_scope = WaitScope::new(&event_loop);

    let mut chain = Conveyor::<u32>::failed(conveyor::Error::critical("boom")).then(|v| v + 1);
    let error = chain.take().unwrap_err();
    assert!(error.is_critical());
    assert_eq!(error.message(), "boom");
}

#[test]
fn adapt_single_value() {
    let event_loop = init_with_loop();
    let _wait_scope = WaitScope::new(&event_loop);

    let mut pair = new_conveyor_and_feeder::<usize>();
    pair.feeder.feed(5);

    assert_eq!(pair.conveyor.take().unwrap(), 5);
}

#[test]
fn adapt_many_values_fifo() {
    let event_loop = init_with_loop();
    let _wait_scope = WaitScope::new(&event_loop);

    let mut pair = new_conveyor_and_feeder::<usize>();
    for value in [5, 10, 2, 4234] {
        pair.feeder.feed(value);
    }

    assert_eq!(pair.conveyor.take().unwrap(), 5);
    assert_eq!(pair.conveyor.take().unwrap(), 10);
    assert_eq!(pair.conveyor.take().unwrap(), 2);
    assert_eq!(pair.conveyor.take().unwrap(), 4234);

    let error = pair.conveyor.take().unwrap_err();
    assert_eq!(error.code(), Code::NotAvailable);
    assert!(error.is_recoverable());
}

#[test]
fn multistep_transform() {
    let event_loop = init_with_loop();
    let _wait_scope = WaitScope::new(&event_loop);

    let pair = new_conveyor_and_feeder::<usize>();
    let mut feeder = pair.feeder;
    let mut chain = pair
        .conveyor
        .then(|value| value.to_string())
        .then(|text| text != "10")
        .then(|flag| !flag);

    feeder.feed(10);

    assert_eq!(chain.take().unwrap(), true);
}

#[test]
fn error_routed_through_then_else() {
    let event_loop = init_with_loop();
    let _wait_scope = WaitScope::new(&event_loop);

    let pair = new_conveyor_and_feeder::<usize>();
    let mut feeder = pair.feeder;
    let mut chain = pair
        .conveyor
        .then_else(|value| value * 2, |_error| Ok(99));

    feeder.feed(4);
    feeder.fail(conveyor::Error::recoverable("transient"));
    feeder.feed(5);

    assert_eq!(chain.take().unwrap(), 8);
    assert_eq!(chain.take().unwrap(), 99);
    assert_eq!(chain.take().unwrap(), 10);
}

#[test]
fn attach_buffer_pipeline() {
    let event_loop = init_with_loop();
    let wait_scope = WaitScope::new(&event_loop);

    let counter = Rc::new(Cell::new(0usize));
    let counted = counter.clone();

    let pair = new_conveyor_and_feeder::<usize>();
    let mut feeder = pair.feeder;
    let mut chain = pair
        .conveyor
        .then(move |value| {
            counted.set(counted.get() + 1);
            (value + counted.get()).to_string()
        })
        .attach(counter)
        .buffer(10)
        .then(|text| text + "post")
        .buffer(10)
        .then(|text| String::from("pre") + &text)
        .buffer(10);

    feeder.feed(10);
    feeder.feed(20);
    feeder.feed(30);

    wait_scope.poll().unwrap();

    assert_eq!(chain.take().unwrap(), "pre11post");
    assert_eq!(chain.take().unwrap(), "pre22post");
    assert_eq!(chain.take().unwrap(), "pre33post");
}

#[test]
fn buffer_backpressure_holds_values_back() {
    let event_loop = init_with_loop();
    let wait_scope = WaitScope::new(&event_loop);

    let pair = new_conveyor_and_feeder::<usize>();
    let mut feeder = pair.feeder;
    let mut chain = pair.conveyor.buffer(3);

    for value in 0..5 {
        feeder.feed(value);
    }
    wait_scope.poll().unwrap();

    // The buffer admitted its limit; the rest wait at the leaf.
    assert_eq!(feeder.queued(), 2);

    // Draining one element releases one unit of space.
    assert_eq!(chain.take().unwrap(), 0);
    wait_scope.poll().unwrap();
    assert_eq!(feeder.queued(), 1);

    for expected in 1..5 {
        let value = loop {
            match chain.take() {
                Ok(value) => break value,
                Err(error) => {
                    assert!(error.is_recoverable());
                    wait_scope.poll().unwrap();
                }
            }
        };
        assert_eq!(value, expected);
    }
}

#[test]
fn detach_runs_side_effect_and_daemon_collects() {
    let event_loop = init_with_loop();
    let wait_scope = WaitScope::new(&event_loop);

    let seen = Rc::new(Cell::new(0));
    let sink_seen = seen.clone();

    Conveyor::immediate(10)
        .then(move |value| sink_seen.set(value))
        .detach();

    assert_eq!(event_loop.daemon_chains(), 1);

    wait_scope.poll().unwrap();

    assert_eq!(seen.get(), 10);
    // The one-shot chain exhausted itself and was scavenged.
    assert_eq!(event_loop.daemon_chains(), 0);
}

#[test]
fn sink_critical_error_dissolves_chain() {
    let event_loop = init_with_loop();
    let wait_scope = WaitScope::new(&event_loop);

    let failures = Rc::new(Cell::new(0));
    let counted = failures.clone();
    event_loop.set_daemon_error_handler(move |_error| {
        counted.set(counted.get() + 1);
    });

    let pair = new_conveyor_and_feeder::<usize>();
    let mut feeder = pair.feeder;
    pair.conveyor.then(|_| ()).detach();
    assert_eq!(event_loop.daemon_chains(), 1);

    feeder.fail(conveyor::Error::critical("wire broke"));
    wait_scope.poll().unwrap();

    assert_eq!(failures.get(), 1);
    assert_eq!(event_loop.daemon_chains(), 0);
}

#[test]
fn merge_is_fair_and_complete() {
    let event_loop = init_with_loop();
    let wait_scope = WaitScope::new(&event_loop);

    let (merged, mut merger) = Conveyor::immediate(10).merge();
    merger.attach(Conveyor::immediate(11));
    merger.attach(Conveyor::immediate(14));

    let seen = Rc::new(Cell::new(Vec::new()));
    let sink_seen = seen.clone();
    let _sink = merged
        .then(move |value| {
            let mut values = sink_seen.take();
            values.push(value);
            sink_seen.set(values);
        })
        .sink();

    wait_scope.poll().unwrap();

    let mut values = seen.take();
    values.sort_unstable();
    assert_eq!(values, vec![10, 11, 14]);
}

#[test]
fn one_time_feeder_feeds_once() {
    let event_loop = init_with_loop();
    let _wait_scope = WaitScope::new(&event_loop);

    let mut pair = one_time_conveyor_and_feeder::<&'static str>();
    assert_eq!(pair.feeder.space(), 1);

    pair.feeder.feed("first");
    assert_eq!(pair.feeder.space(), 0);

    // The slot is spent; later feeds are ignored.
    pair.feeder.feed("second");

    assert_eq!(pair.conveyor.take().unwrap(), "first");
    let error = pair.conveyor.take().unwrap_err();
    assert_eq!(error.code(), Code::Exhausted);
}

#[test]
fn feeder_survives_conveyor_drop() {
    let event_loop = init_with_loop();
    let _wait_scope = WaitScope::new(&event_loop);

    let pair = new_conveyor_and_feeder::<usize>();
    let mut feeder = pair.feeder;
    drop(pair.conveyor);

    // The node is gone; feeding becomes a no-op instead of unwinding.
    feeder.feed(1);
    assert_eq!(feeder.space(), 0);
    assert_eq!(feeder.queued(), 0);
}

#[test]
fn conveyor_survives_feeder_drop() {
    let event_loop = init_with_loop();
    let _wait_scope = WaitScope::new(&event_loop);

    let pair = new_conveyor_and_feeder::<usize>();
    let mut feeder = pair.feeder;
    let mut chain = pair.conveyor;

    feeder.feed(7);
    drop(feeder);

    assert_eq!(chain.take().unwrap(), 7);
    assert_eq!(chain.take().unwrap_err().code(), Code::NotAvailable);
}

#[test]
fn exec_later_runs_on_poll() {
    let event_loop = init_with_loop();
    let wait_scope = WaitScope::new(&event_loop);

    let ran = Rc::new(Cell::new(false));
    let flag = ran.clone();
    let mut done = conveyor::exec_later(move || {
        flag.set(true);
        3
    });

    wait_scope.poll().unwrap();
    assert_eq!(done.take().unwrap(), 3);
    assert!(ran.get());
}

#[test]
fn fifo_preserved_across_long_feed() {
    let event_loop = init_with_loop();
    let wait_scope = WaitScope::new(&event_loop);

    let pair = new_conveyor_and_feeder::<usize>();
    let mut feeder = pair.feeder;
    let mut chain = pair.conveyor.buffer(16);

    let total = 100usize;
    let mut received = Vec::new();
    let mut next = 0;
    while received.len() < total {
        while next < total && feeder.space() > 0 && next < received.len() + 32 {
            feeder.feed(next);
            next += 1;
        }
        wait_scope.poll().unwrap();
        while let Ok(value) = chain.take() {
            received.push(value);
        }
    }

    let expected: Vec<usize> = (0..total).collect();
    assert_eq!(received, expected);
}
