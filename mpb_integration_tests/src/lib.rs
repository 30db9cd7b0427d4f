//! Shared fixtures for the multipath integration tests.

pub mod common;
