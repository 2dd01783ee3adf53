//! Integration tests for examguard-core.
//!
//! A single test binary keeps link time down and lets the fixtures in
//! `support` be shared.

mod driver;
mod monitor;
mod support;
