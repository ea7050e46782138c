//! Redirected stdio for the duration of an evaluation.
//!
//! The worker installs task-scoped sinks before invoking the engine;
//! submitted code and extensions write through [`write_stdout`] /
//! [`write_stderr`]. The streams are thread-local: redirection on the
//! worker thread never affects the session's own logging. The guard
//! restores the previous streams on drop, on every exit path including
//! unwinding.

use std::{
    cell::RefCell,
    io::{self, Write},
    marker::PhantomData,
};

/// The sinks installed for one evaluation.
pub struct EvalStreams {
    pub stdout: Box<dyn Write + Send>,
    pub stderr: Box<dyn Write + Send>,
}

thread_local! {
    static ACTIVE: RefCell<Option<EvalStreams>> = const { RefCell::new(None) };
}

/// Restores the previously installed streams when dropped.
pub struct RedirectGuard {
    previous: Option<EvalStreams>,
    // Restoration must happen on the installing thread.
    _not_send: PhantomData<*const ()>,
}

impl Drop for RedirectGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        ACTIVE.with(|active| *active.borrow_mut() = previous);
    }
}

/// Install evaluation streams for the current thread.
#[must_use]
pub fn redirect(streams: EvalStreams) -> RedirectGuard {
    let previous = ACTIVE.with(|active| active.borrow_mut().replace(streams));
    RedirectGuard {
        previous,
        _not_send: PhantomData,
    }
}

/// Write to the evaluation stdout, or the process stdout when no
/// redirection is active.
///
/// # Errors
/// Returns an error if the underlying write fails.
pub fn write_stdout(text: &str) -> io::Result<()> {
    ACTIVE.with(|active| match active.borrow_mut().as_mut() {
        Some(streams) => streams.stdout.write_all(text.as_bytes()),
        None => io::stdout().write_all(text.as_bytes()),
    })
}

/// Write to the evaluation stderr, or the process stderr when no
/// redirection is active.
///
/// # Errors
/// Returns an error if the underlying write fails.
pub fn write_stderr(text: &str) -> io::Result<()> {
    ACTIVE.with(|active| match active.borrow_mut().as_mut() {
        Some(streams) => streams.stderr.write_all(text.as_bytes()),
        None => io::stderr().write_all(text.as_bytes()),
    })
}

/// Flush both evaluation streams, sending out any pending data.
pub fn flush() {
    ACTIVE.with(|active| {
        if let Some(streams) = active.borrow_mut().as_mut() {
            let _ = streams.stdout.flush();
            let _ = streams.stderr.flush();
        }
    });
}

/// Interactive input is unsupported; every read fails.
///
/// # Errors
/// Always.
pub fn read_line() -> io::Result<String> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Reading from standard input is not supported. \
         All input should be specified at the time of execution.",
    ))
}
