// src/core/tasks/mod.rs

//! Long-running background tasks driving the controller.

pub mod queue_filler;
