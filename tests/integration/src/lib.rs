//! Integration tests for nebucloud-fanout.
//!
//! Run with: `cargo test --package integration-tests`

#[cfg(test)]
mod cache_tests;
#[cfg(test)]
mod load_tests;
#[cfg(test)]
mod session_tests;
