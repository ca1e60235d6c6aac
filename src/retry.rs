//! Error classification and retry scheduling.
//!
//! The remote driver is treated as a string oracle: errors are classified by
//! substring matching against the category tables below. Anything that fails
//! to match widens into `Other`, which is safe but slow.

use rand::Rng;

/// Category of a failed remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient connectivity problem. Retried forever with capped backoff
    /// so the daemon polls the network rather than giving up.
    Network,
    /// Remote state diverged from ours (stale draft, name collision, node
    /// gone). Retried a couple of times, then healed by delete-then-recreate.
    ReuploadNeeded,
    /// Session is unusable. Never retried; the operator must intervene.
    Auth,
    /// The local file vanished between classification and execution.
    LocalNotFound,
    /// Everything else. Geometric backoff up to about a week, then blocked.
    Other,
}

const AUTH_PATTERNS: &[&str] = &[
    "parent session expired",
    "re-authentication required",
    "invalid refresh token",
    "10013",
];

const REUPLOAD_PATTERNS: &[&str] = &[
    "draft revision already exists",
    "file or folder with that name already exists",
    "file or folder not found",
];

const LOCAL_NOT_FOUND_PATTERNS: &[&str] = &["local path not found"];

const NETWORK_PATTERNS: &[&str] = &[
    "econnrefused",
    "econnreset",
    "etimedout",
    "enotfound",
    "eai_again",
    "enetunreach",
    "ehostunreach",
    "socket hang up",
    "network",
    "timeout",
    "connection",
    "fetch failed",
];

/// Backoff bases in seconds for the network category. The retry counter is
/// capped at the last index, so steady-state delay oscillates around 256 s.
pub const NETWORK_DELAYS_S: [u64; 5] = [1, 4, 16, 64, 256];

/// Full geometric schedule for the general category; the last step is a week.
pub const OTHER_DELAYS_S: [u64; 11] = [
    1, 4, 16, 64, 256, 1024, 4096, 16384, 65536, 262144, 604800,
];

/// Fixed spacing between reupload attempts.
pub const REUPLOAD_DELAY_S: u64 = 256;

const REUPLOAD_RETRY_CAP: i64 = 2;
const LOCAL_NOT_FOUND_RETRY_CAP: i64 = 5;

/// Symmetric jitter fraction applied to every jittered delay.
pub const JITTER: f64 = 0.25;

/// Classify a driver error message.
///
/// Specific categories are tested before `Network`, whose patterns include
/// generic words like "timeout" and "connection".
pub fn classify(error: &str) -> ErrorCategory {
    let lower = error.to_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if matches(AUTH_PATTERNS) {
        ErrorCategory::Auth
    } else if matches(REUPLOAD_PATTERNS) {
        ErrorCategory::ReuploadNeeded
    } else if matches(LOCAL_NOT_FOUND_PATTERNS) {
        ErrorCategory::LocalNotFound
    } else if matches(NETWORK_PATTERNS) {
        ErrorCategory::Network
    } else {
        ErrorCategory::Other
    }
}

impl ErrorCategory {
    /// Whether a job with `n_retries` completed attempts has exhausted its
    /// retry budget. `Network` never exhausts.
    pub fn is_exhausted(self, n_retries: i64) -> bool {
        match self {
            ErrorCategory::Network => false,
            ErrorCategory::ReuploadNeeded => n_retries >= REUPLOAD_RETRY_CAP,
            ErrorCategory::Auth => true,
            ErrorCategory::LocalNotFound => n_retries >= LOCAL_NOT_FOUND_RETRY_CAP,
            ErrorCategory::Other => n_retries >= OTHER_DELAYS_S.len() as i64,
        }
    }

    /// The retry counter value to persist after one more failed attempt.
    ///
    /// `Network` caps the stored counter at the last schedule index so
    /// `retry_at` never grows past ~4 minutes.
    pub fn next_retry_count(self, n_retries: i64) -> i64 {
        let next = n_retries.saturating_add(1);
        match self {
            ErrorCategory::Network => next.min(NETWORK_DELAYS_S.len() as i64 - 1),
            _ => next,
        }
    }

    /// Unjittered base delay in seconds before the next attempt.
    pub fn base_delay_s(self, n_retries: i64) -> u64 {
        let idx = |table: &[u64]| table[(n_retries.max(0) as usize).min(table.len() - 1)];
        match self {
            ErrorCategory::Network => idx(&NETWORK_DELAYS_S),
            ErrorCategory::ReuploadNeeded => REUPLOAD_DELAY_S,
            ErrorCategory::Auth => 0,
            ErrorCategory::LocalNotFound | ErrorCategory::Other => idx(&OTHER_DELAYS_S),
        }
    }

    /// Delay in milliseconds before the next attempt, jitter applied.
    ///
    /// Jitter is uniform on `[base*(1-J), base*(1+J)]` with a 1 s floor.
    /// The reupload spacing is fixed, not jittered.
    pub fn retry_delay_ms(self, n_retries: i64) -> i64 {
        let base_ms = self.base_delay_s(n_retries) as f64 * 1000.0;
        let jittered = match self {
            ErrorCategory::ReuploadNeeded | ErrorCategory::Auth => base_ms,
            _ => {
                let mut rng = rand::rng();
                let factor = rng.random_range(1.0 - JITTER..=1.0 + JITTER);
                base_ms * factor
            }
        };
        (jittered as i64).max(1000)
    }
}
