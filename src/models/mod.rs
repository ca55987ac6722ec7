pub mod entity;
pub mod metric;
pub mod report;

pub use entity::{
    Author, AuthorKind, CommunityResource, Dataset, EntityRecord, EntityRef, EntityType,
    MetricField, Resource, SaveOptions,
};
pub use metric::{day_key, parse_day, DailyMetricPoint, EntityTotals, Tags, DAY_FORMAT};
pub use report::{Counts, RawReportRow};
