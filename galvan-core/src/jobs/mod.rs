//! Periodic background jobs.

pub mod aggregation;

pub use aggregation::AggregationJob;
