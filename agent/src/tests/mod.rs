//! Test modules for the agent crate

mod scheduler_tests;
