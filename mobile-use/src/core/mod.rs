//! Deterministic, pure logic shared by the agent loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod controller;
pub mod memory;
pub mod normalize;
pub mod rules;
pub mod types;
