//! Last-resort worker teardown at control-plane exit.
//!
//! Normal async shutdown may never run when the process exits abruptly, so
//! every spawned worker pid is parked here and an `atexit` hook force-kills
//! whatever is still registered. `kill_on_drop` on the child handle covers
//! ordinary drops; this covers everything else.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;

#[cfg(unix)]
use std::sync::atomic::AtomicBool;
#[cfg(unix)]
use std::sync::atomic::Ordering;

static KILL_LIST: OnceLock<Mutex<HashSet<u32>>> = OnceLock::new();

#[cfg(unix)]
static HOOK_ARMED: AtomicBool = AtomicBool::new(false);

fn kill_list() -> &'static Mutex<HashSet<u32>> {
    KILL_LIST.get_or_init(|| Mutex::new(HashSet::new()))
}

pub(crate) fn register(pid: u32) {
    kill_list()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(pid);
    #[cfg(unix)]
    if !HOOK_ARMED.swap(true, Ordering::SeqCst) {
        unsafe {
            libc::atexit(kill_remaining_workers);
        }
    }
}

pub(crate) fn unregister(pid: u32) {
    kill_list()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&pid);
}

#[cfg(unix)]
extern "C" fn kill_remaining_workers() {
    let Some(list) = KILL_LIST.get() else {
        return;
    };
    let pids: Vec<u32> = {
        let guard = list.lock().unwrap_or_else(PoisonError::into_inner);
        guard.iter().copied().collect()
    };
    for pid in pids {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
            // Brief non-blocking reap; anything left becomes the kernel's
            // problem once this process is gone.
            let mut status: libc::c_int = 0;
            libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister_track_pids() {
        register(987_654);
        assert!(kill_list()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&987_654));
        unregister(987_654);
        assert!(!kill_list()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&987_654));
    }
}
