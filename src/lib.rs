pub mod clock;
pub mod config;
pub mod driver;
pub mod error;
pub mod log;
pub mod notice;
pub mod prompts;
pub mod tmux;
pub mod util;
pub mod worker;

// Capture -> inbox -> tasks pipeline, plus the loop that drives workers
pub mod capture;
pub mod inbox;
pub mod monitor;
pub mod scheduler;
pub mod tasks;

pub use error::{Error, Result};
pub use scheduler::{Scheduler, TickReport, WorkflowPhase};
pub use worker::{ActivityLevel, Worker, WorkerId};
