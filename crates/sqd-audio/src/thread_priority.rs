//! Real-Time Thread Priority
//!
//! Elevates the transport worker thread to realtime scheduling so the
//! per-cycle deadline is met under load. On Linux this is SCHED_FIFO,
//! which needs CAP_SYS_NICE or root; failure is non-fatal and the
//! worker falls back to the default scheduler.

use std::sync::Once;

/// Result of a priority elevation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityResult {
    /// Elevated to real-time priority.
    Success,
    /// Could not set priority (non-fatal, default scheduling is used).
    Failed,
    /// Platform not supported.
    Unsupported,
}

static WARN_ONCE: Once = Once::new();

/// Set SCHED_FIFO priority for the current thread.
///
/// Safe to call on every worker spawn; the failure warning is only
/// logged once per process.
pub fn set_realtime_priority(priority: i32) -> PriorityResult {
    let result = platform_set_priority(priority);

    match result {
        PriorityResult::Success => {
            log::info!("Worker thread set to SCHED_FIFO priority {priority}");
        }
        PriorityResult::Failed => {
            WARN_ONCE.call_once(|| {
                log::warn!(
                    "Could not set SCHED_FIFO priority {priority} \
                     (needs CAP_SYS_NICE or root); continuing without realtime scheduling"
                );
            });
        }
        PriorityResult::Unsupported => {
            log::debug!("Realtime priority not supported on this platform");
        }
    }

    result
}

#[cfg(target_os = "linux")]
fn platform_set_priority(priority: i32) -> PriorityResult {
    let param = libc::sched_param {
        sched_priority: priority,
    };

    // SAFETY: plain FFI call with a valid sched_param for this thread.
    let ret = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };

    if ret == 0 {
        PriorityResult::Success
    } else {
        PriorityResult::Failed
    }
}

#[cfg(not(target_os = "linux"))]
fn platform_set_priority(_priority: i32) -> PriorityResult {
    PriorityResult::Unsupported
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_attempt_does_not_panic() {
        // Either outcome is valid depending on privileges; the call
        // itself must always be safe.
        let result = set_realtime_priority(50);
        assert!(matches!(
            result,
            PriorityResult::Success | PriorityResult::Failed | PriorityResult::Unsupported
        ));
    }
}
