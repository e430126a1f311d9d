//! `SIGUSR1` flush request.
//!
//! The handler does exactly one thing — raise the shared flush flag —
//! and nothing else, to stay async-signal-safe.

use nix::sys::signal::{self, SigHandler, Signal};

extern "C" fn handle_sigusr1(_: i32) {
    gmetrics_runtime::request_flush();
}

/// Installs the flush-request handler for `SIGUSR1`.
///
/// Must be called only after the runtime context has already been
/// initialized (e.g. after [`crate::tick::TickDriver::new`]), since the
/// handler itself must never be the first caller to touch the context.
///
/// # Safety
/// Installs a process-wide signal handler; must not be called
/// concurrently with code that also installs a `SIGUSR1` handler.
pub unsafe fn install() -> nix::Result<()> {
    unsafe { signal::signal(Signal::SIGUSR1, SigHandler::Handler(handle_sigusr1)) }?;
    Ok(())
}
