// Not all functions are used by all tests.
#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use conveyor::{setup_async_io, AsyncIoContext, EventLoop};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    });
}

pub fn init_with_loop() -> EventLoop {
    init();
    EventLoop::new()
}

pub fn init_with_io() -> AsyncIoContext {
    init();
    setup_async_io().expect("unable to set up async io")
}

/// Runs `cond` against repeated short waits until it holds, panicking after
/// a few seconds. Used where readiness depends on the kernel's timing.
pub fn wait_until(scope: &conveyor::WaitScope<'_>, mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        scope
            .wait_for(Duration::from_millis(10))
            .expect("wait failed");
    }
    panic!("timed out waiting for {}", what);
}
