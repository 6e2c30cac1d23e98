use std::cell::Cell;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use conveyor::{timeout_after, Signal, WaitScope};

mod util;
use util::{init_with_io, wait_until};

#[test]
fn waker_wakes_blocking_wait_from_another_thread() {
    let context = init_with_io();
    let wait_scope = WaitScope::new(&context.event_loop);

    let waker = context.port.waker();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        waker.wake().expect("unable to wake");
    });

    let start = Instant::now();
    // Blocks indefinitely; only the wake can end it.
    wait_scope.wait().unwrap();

    assert!(start.elapsed() < Duration::from_secs(5));
    handle.join().unwrap();
}

#[test]
fn wake_before_wait_returns_promptly() {
    let context = init_with_io();
    let wait_scope = WaitScope::new(&context.event_loop);

    context.port.waker().wake().unwrap();
    let start = Instant::now();
    wait_scope.wait().unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn signal_delivery_feeds_subscribers() {
    let context = init_with_io();
    let wait_scope = WaitScope::new(&context.event_loop);

    let observed = Rc::new(Cell::new(0u32));
    let count = observed.clone();
    let _sink = context
        .port
        .on_signal(Signal::User1)
        .unwrap()
        .then(move |()| {
            count.set(count.get() + 1);
        })
        .sink();

    // Delivered through the signalfd, not a handler.
    unsafe {
        libc::raise(libc::SIGUSR1);
    }

    wait_until(&wait_scope, || observed.get() > 0, "signal delivery");
    assert_eq!(observed.get(), 1);
}

#[test]
fn timeout_fires_after_deadline() {
    let context = init_with_io();
    let wait_scope = WaitScope::new(&context.event_loop);

    let mut timeout = timeout_after(Duration::from_millis(50));

    let start = Instant::now();
    loop {
        match timeout.take() {
            Ok(()) => break,
            Err(error) => {
                assert!(error.is_recoverable());
                wait_scope.wait_for(Duration::from_millis(20)).unwrap();
            }
        }
        assert!(start.elapsed() < Duration::from_secs(5), "timer never fired");
    }
    assert!(start.elapsed() >= Duration::from_millis(50));
}
