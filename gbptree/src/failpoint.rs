//! Named fail points for crash simulation.
//!
//! A fail point is enabled per thread with [`enable`], or process-wide through
//! the comma-separated `GBPTREE_FAILPOINTS` environment variable. Code under
//! test calls [`maybe_fail`] at the point where a crash should be simulated.

use std::cell::RefCell;
use std::collections::HashSet;
use std::io;

/// Fires between flushing checkpoint data pages and writing the new tree state.
pub const CHECKPOINT_BEFORE_STATE_WRITE: &str = "checkpoint::before_state_write";
/// Fires after the new tree state has been written but before it is synced.
pub const CHECKPOINT_BEFORE_STATE_SYNC: &str = "checkpoint::before_state_sync";
/// Fires between two page writes of one tree change.
pub const COMMIT_BETWEEN_PAGE_WRITES: &str = "commit::between_page_writes";

const ENV_VAR: &str = "GBPTREE_FAILPOINTS";

thread_local! {
    static FAILPOINTS: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

pub fn enable(name: &str) {
    FAILPOINTS.with(|set| {
        set.borrow_mut().insert(name.to_string());
    });
}

pub fn disable(name: &str) {
    FAILPOINTS.with(|set| {
        set.borrow_mut().remove(name);
    });
}

pub fn clear() {
    FAILPOINTS.with(|set| set.borrow_mut().clear());
}

#[must_use]
pub fn is_enabled(name: &str) -> bool {
    if FAILPOINTS.with(|set| set.borrow().contains(name)) {
        return true;
    }

    std::env::var(ENV_VAR)
        .ok()
        .is_some_and(|raw| raw.split(',').any(|v| v.trim() == name))
}

/// Returns an error if the named fail point is enabled.
pub fn maybe_fail(name: &str) -> io::Result<()> {
    if is_enabled(name) {
        tracing::debug!(failpoint = name, "fail point triggered");
        Err(io::Error::other(format!("failpoint triggered: {name}")))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_fail_point_returns_error() {
        clear();
        assert!(maybe_fail("test::point").is_ok());

        enable("test::point");
        assert!(is_enabled("test::point"));
        let err = maybe_fail("test::point").expect_err("fail point should fire");
        assert!(err.to_string().contains("test::point"));

        disable("test::point");
        assert!(maybe_fail("test::point").is_ok());
    }

    #[test]
    fn test_fail_points_are_thread_local() {
        clear();
        enable("test::local");
        let other = std::thread::spawn(|| is_enabled("test::local"))
            .join()
            .expect("join thread");
        assert!(!other);
        clear();
        assert!(!is_enabled("test::local"));
    }
}
