//! Metrics pipeline
//!
//! [`DailyAggregator`] turns a day of analytics reports into daily metric
//! points; [`MetricsReconciler`] folds those points back into the counters
//! cached on catalog entities.

pub mod aggregator;
pub mod reconciler;

pub use aggregator::{AggregateError, AggregationReport, DailyAggregator, PointKey};
pub use reconciler::{MetricsReconciler, ReconcileError, ReconcileReport};
