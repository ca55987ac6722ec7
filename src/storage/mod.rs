pub mod postgres;
pub mod sqlite;
pub mod trait_def;

pub use postgres::PostgresMetricsStore;
pub use sqlite::SqliteMetricsStore;
pub use trait_def::{MetricsStore, StoreError, StoreResult};

use crate::models::{parse_day, AuthorKind, Counts, DailyMetricPoint, EntityTotals, EntityType, Tags};

/// Row shape shared by the SQL backends.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PointRow {
    pub entity_type: String,
    pub entity_id: String,
    pub day: String,
    pub nb_hits: i64,
    pub nb_visits: i64,
    pub nb_uniq_visitors: i64,
    pub author_type: Option<String>,
    pub author_id: Option<String>,
    pub dataset_id: Option<String>,
    pub latest_url_alias: bool,
}

pub(crate) const POINT_COLUMNS: &str = "entity_type, entity_id, day, nb_hits, nb_visits, \
     nb_uniq_visitors, author_type, author_id, dataset_id, latest_url_alias";

pub(crate) fn to_counts(nb_hits: i64, nb_visits: i64, nb_uniq_visitors: i64) -> StoreResult<Counts> {
    let convert = |value: i64| {
        u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative counter {value}")))
    };
    Ok(Counts::new(
        convert(nb_hits)?,
        convert(nb_visits)?,
        convert(nb_uniq_visitors)?,
    ))
}

pub(crate) fn to_db_count(value: u64) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("counter {value} overflows")))
}

pub(crate) fn to_totals(rows: Vec<(String, i64, i64, i64)>) -> StoreResult<Vec<EntityTotals>> {
    rows.into_iter()
        .map(|(entity_id, hits, visits, visitors)| {
            Ok(EntityTotals {
                entity_id,
                counts: to_counts(hits, visits, visitors)?,
            })
        })
        .collect()
}

pub(crate) fn to_entity_keys(rows: Vec<(String, String)>) -> StoreResult<Vec<(EntityType, String)>> {
    rows.into_iter()
        .map(|(entity_type, entity_id)| {
            let entity_type = entity_type.parse::<EntityType>().map_err(StoreError::Corrupt)?;
            Ok((entity_type, entity_id))
        })
        .collect()
}

impl TryFrom<PointRow> for DailyMetricPoint {
    type Error = StoreError;

    fn try_from(row: PointRow) -> Result<Self, Self::Error> {
        let entity_type = row
            .entity_type
            .parse::<EntityType>()
            .map_err(StoreError::Corrupt)?;
        let day = parse_day(&row.day)
            .map_err(|e| StoreError::Corrupt(format!("bad day '{}': {e}", row.day)))?;
        let author_type = row
            .author_type
            .as_deref()
            .map(str::parse::<AuthorKind>)
            .transpose()
            .map_err(StoreError::Corrupt)?;

        Ok(DailyMetricPoint {
            entity_type,
            entity_id: row.entity_id,
            day,
            counts: to_counts(row.nb_hits, row.nb_visits, row.nb_uniq_visitors)?,
            tags: Tags {
                author_type,
                author_id: row.author_id,
                dataset_id: row.dataset_id,
            },
            latest_url_alias: row.latest_url_alias,
        })
    }
}
