//! # vdm-primitives
//!
//! Primitive types for the vdmrt real-time scheduler.
//!
//! This crate provides the identifiers and values shared by the scheduler core
//! and its front ends.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod id;
mod value;

pub use error::ValueError;
pub use id::{MessageId, ObjectId, ResourceId, ThreadId};
pub use value::Value;

/// Virtual time, in scheduler ticks
pub type Time = u64;

/// Thread priority (higher is preferred)
pub type Priority = u32;
