//! `deferq-taskmaster` — periodic driver of the delay queue dispatch loop.

pub mod app;
pub mod signal;
