//! Shared helpers for database-backed tests.

pub mod db;
