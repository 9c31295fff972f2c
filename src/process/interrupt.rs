//! SIGINT propagation to live children.
//!
//! A single process-wide handler records the interrupt and forwards
//! SIGINT to every registered child pid. Components poll [`interrupted`]
//! at their suspension points; no component holds a lock across a child
//! wait, so a cancel is observable within one scheduler tick.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

fn live_children() -> &'static Mutex<HashSet<i32>> {
    static CHILDREN: OnceLock<Mutex<HashSet<i32>>> = OnceLock::new();
    CHILDREN.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Whether SIGINT has been received.
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Registers the process-wide SIGINT handler. Call once at startup.
///
/// On Ctrl-C the handler marks the run interrupted and forwards SIGINT to
/// every live child so external builders stop promptly. The main loop is
/// responsible for exiting with code 130 once the pipeline unwinds.
pub fn install_sigint_handler() {
    tokio::spawn(async {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            INTERRUPTED.store(true, Ordering::SeqCst);
            let pids: Vec<i32> = {
                let children = live_children().lock().expect("child registry poisoned");
                children.iter().copied().collect()
            };
            tracing::warn!(children = pids.len(), "SIGINT received, stopping children");
            for pid in pids {
                // SAFETY: forwarding the signal to pids we spawned.
                unsafe {
                    libc::kill(pid, libc::SIGINT);
                }
            }
        }
    });
}

/// Keeps a child pid in the propagation set for its lifetime.
pub struct InterruptGuard {
    pid: i32,
}

impl InterruptGuard {
    pub fn register(pid: i32) -> Self {
        live_children()
            .lock()
            .expect("child registry poisoned")
            .insert(pid);
        InterruptGuard { pid }
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        live_children()
            .lock()
            .expect("child registry poisoned")
            .remove(&self.pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_registers_and_deregisters() {
        let before = live_children().lock().unwrap().len();
        {
            let _guard = InterruptGuard::register(999_999);
            assert!(live_children().lock().unwrap().contains(&999_999));
        }
        assert_eq!(live_children().lock().unwrap().len(), before);
    }
}
