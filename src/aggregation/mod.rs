//! Task log aggregation into monthly and ISO-weekly staff summaries.

pub mod dates;
pub mod model;
pub mod rollup;
pub mod routes;
pub mod service;

pub use model::{Granularity, RollupReport, StaffKind, SummaryRow, TaskLogEntry};
pub use routes::aggregation_routes;
pub use service::TaskAggregator;
