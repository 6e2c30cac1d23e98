//! Platform-specific details.

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) mod unix;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("conveyor requires an epoll/signalfd platform (linux or android)");
