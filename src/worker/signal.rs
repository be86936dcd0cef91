//! Worker signal handling.
//!
//! One dedicated thread owns the signal iterator. Hangup and user
//! signals are logged and ignored; termination signals flip the shared
//! shutdown flag so the dispatch loop winds down at its next poll.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGPIPE, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::{Handle, Signals};

use crate::error::WorkerError;

const WATCHED: &[i32] = &[SIGHUP, SIGUSR1, SIGUSR2, SIGINT, SIGTERM, SIGQUIT, SIGPIPE];

fn is_termination(signal: i32) -> bool {
    matches!(signal, SIGINT | SIGTERM | SIGQUIT)
}

/// Spawn the signal thread.
///
/// The thread waits on `ready` once its mask is installed, then consumes
/// signals until the returned [`Handle`] is closed.
pub fn spawn(
    ready: Arc<Barrier>,
    shutdown: Arc<AtomicBool>,
) -> Result<(JoinHandle<()>, Handle), WorkerError> {
    let mut signals = Signals::new(WATCHED).map_err(|source| WorkerError::Initialization {
        call: "sigaction",
        source,
    })?;
    let handle = signals.handle();

    let thread = std::thread::Builder::new()
        .name("signal".into())
        .spawn(move || {
            ready.wait();
            for signal in signals.forever() {
                if is_termination(signal) {
                    tracing::info!(signal, "termination signal, shutting down");
                    shutdown.store(true, Ordering::SeqCst);
                } else {
                    tracing::debug!(signal, "signal ignored");
                }
            }
        })
        .map_err(|source| WorkerError::Initialization {
            call: "thread spawn",
            source,
        })?;

    Ok((thread, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termination_set() {
        assert!(is_termination(SIGTERM));
        assert!(is_termination(SIGINT));
        assert!(is_termination(SIGQUIT));
        assert!(!is_termination(SIGHUP));
        assert!(!is_termination(SIGUSR1));
        assert!(!is_termination(SIGPIPE));
    }

    #[test]
    fn spawn_and_close() {
        let ready = Arc::new(Barrier::new(2));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (thread, handle) = spawn(Arc::clone(&ready), Arc::clone(&shutdown)).unwrap();
        ready.wait();

        handle.close();
        thread.join().unwrap();
        assert!(!shutdown.load(Ordering::SeqCst));
    }
}
