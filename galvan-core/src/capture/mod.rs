//! Collection-rule evaluation: detects when a work event begins and ends on
//! a device and captures a bounded segment of samples around it.

pub mod condition;
pub mod engine;
pub mod ring;

pub use engine::CaptureEngine;
