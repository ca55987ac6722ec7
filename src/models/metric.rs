use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::entity::{Author, AuthorKind, EntityType};
use super::report::Counts;

/// Format used to persist days.
pub const DAY_FORMAT: &str = "%Y-%m-%d";

pub fn day_key(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

pub fn parse_day(value: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(value, DAY_FORMAT)
}

/// Attribution tags stored alongside a daily point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tags {
    pub author_type: Option<AuthorKind>,
    pub author_id: Option<String>,
    pub dataset_id: Option<String>,
}

impl Tags {
    pub fn new(author: Option<&Author>, dataset_id: Option<&str>) -> Self {
        Self {
            author_type: author.map(|a| a.kind),
            author_id: author.map(|a| a.id.clone()),
            dataset_id: dataset_id.map(str::to_string),
        }
    }
}

/// Persisted per-entity, per-day counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyMetricPoint {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub day: NaiveDate,
    pub counts: Counts,
    pub tags: Tags,
    /// Set once any contribution to this point came through a permalink.
    pub latest_url_alias: bool,
}

impl DailyMetricPoint {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>, day: NaiveDate, counts: Counts) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            day,
            counts,
            tags: Tags::default(),
            latest_url_alias: false,
        }
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }
}

/// Lifetime totals of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTotals {
    pub entity_id: String,
    pub counts: Counts,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_day_key_is_iso_date() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(day_key(day), "2024-03-07");
        assert_eq!(parse_day("2024-03-07").unwrap(), day);
        assert!(parse_day("2024-03-07T00:00:00").is_err());
    }
}
