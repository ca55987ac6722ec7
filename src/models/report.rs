use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// One entry of an analytics report.
///
/// Rows form a tree: aggregate rows (a domain, a path prefix) carry their
/// children in `subtable` and usually have no `url` of their own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawReportRow {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub nb_hits: u64,
    #[serde(default)]
    pub nb_visits: u64,
    #[serde(default)]
    pub nb_uniq_visitors: u64,
    #[serde(default)]
    pub subtable: Option<Vec<RawReportRow>>,
}

impl RawReportRow {
    /// Leaf row carrying a URL, mostly useful to build fixtures.
    pub fn leaf(url: impl Into<String>, hits: u64, visits: u64, visitors: u64) -> Self {
        Self {
            label: None,
            url: Some(url.into()),
            nb_hits: hits,
            nb_visits: visits,
            nb_uniq_visitors: visitors,
            subtable: None,
        }
    }

    /// Structural row grouping `children` under `label`.
    pub fn group(label: impl Into<String>, children: Vec<RawReportRow>) -> Self {
        Self {
            label: Some(label.into()),
            subtable: Some(children),
            ..Default::default()
        }
    }

    pub fn counts(&self) -> Counts {
        Counts {
            nb_hits: self.nb_hits,
            nb_visits: self.nb_visits,
            nb_uniq_visitors: self.nb_uniq_visitors,
        }
    }

    /// Depth-first, pre-order walk over `rows` and all their descendants,
    /// keeping only the rows that carry a URL.
    pub fn flatten(rows: &[RawReportRow]) -> Vec<&RawReportRow> {
        let mut flat = Vec::new();
        let mut stack: Vec<&RawReportRow> = rows.iter().rev().collect();

        while let Some(row) = stack.pop() {
            if row.url.is_some() {
                flat.push(row);
            }
            if let Some(children) = &row.subtable {
                stack.extend(children.iter().rev());
            }
        }

        flat
    }
}

/// Hit, visit and unique visitor counters.
///
/// Unique visitors are summed as-is across days, so lifetime totals
/// overcount visitors active on several days.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub nb_hits: u64,
    pub nb_visits: u64,
    pub nb_uniq_visitors: u64,
}

impl Counts {
    pub const fn new(nb_hits: u64, nb_visits: u64, nb_uniq_visitors: u64) -> Self {
        Self {
            nb_hits,
            nb_visits,
            nb_uniq_visitors,
        }
    }

    /// Value cached in an entity's `views` field.
    pub const fn views(&self) -> u64 {
        self.nb_visits
    }
}

impl Add for Counts {
    type Output = Counts;

    // Counters saturate rather than wrap.
    fn add(self, rhs: Counts) -> Counts {
        Counts {
            nb_hits: self.nb_hits.saturating_add(rhs.nb_hits),
            nb_visits: self.nb_visits.saturating_add(rhs.nb_visits),
            nb_uniq_visitors: self.nb_uniq_visitors.saturating_add(rhs.nb_uniq_visitors),
        }
    }
}

impl AddAssign for Counts {
    fn add_assign(&mut self, rhs: Counts) {
        *self = *self + rhs;
    }
}
