//! Integration test suite for warden.
//!
//! These tests drive the scheduler end to end against a temp directory and
//! a manual clock. Worker instructions go to a recording channel; nothing
//! here talks to tmux or any real worker.
//!
//! # Test Categories
//!
//! - `capture_pipeline`: capture -> parse -> dedup -> route
//! - `escalation_scenarios`: stall, recovery and onboarding grace
//! - `task_lifecycle`: evidence-driven task transitions
//! - `scheduler_cadence`: phase rotation, onboarding and isolation

mod fixtures;

mod capture_pipeline;
mod escalation_scenarios;
mod scheduler_cadence;
mod task_lifecycle;
