//! # vdm-sim
//!
//! Scenario runner for the vdmrt scheduler: TOML scenarios declare CPUs,
//! buses, deployed objects and scripted operations, and the runner drives
//! them through a [`vdm_scheduler::ResourceScheduler`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cli;
pub mod config;
pub mod runner;
pub mod script;

pub use cli::Cli;
pub use config::Scenario;
pub use runner::{OutcomeSummary, Report, Simulation, TestReport};
pub use script::{Instr, Library, Operand, ScriptDef, ScriptOperation};
