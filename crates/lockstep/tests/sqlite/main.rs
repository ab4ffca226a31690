//! SQLite-backed integration tests.

mod processor;
mod support;
