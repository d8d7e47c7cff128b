//! End-to-end tests over whole files.
//!
//! Each test file covers one scenario: trees and logs written through the
//! public API onto an in-memory file system, crashed, reopened and checked.

#![cfg(test)]

mod helpers;

mod test_bootstrap_failures;
mod test_checkpoint_atomicity;
mod test_checksum_chain;
mod test_concurrent_seek;
mod test_crash_cleanup;
mod test_end_of_log;
mod test_log_replay;
mod test_sampling;
mod test_state_selection;
