//! Read-only aggregate counts over the well table.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::StoreError;
use crate::store::{EntityStore, SamplingStatus, Well, WellCounts};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statistics {
  pub total: u64,
  pub sampled: u64,
  pub unsampled: u64,
  /// Percentage with one decimal, "0.0" for an empty store
  pub completion: String,
  /// Wells with changes the server has not confirmed
  pub pending_sync: u64,
}

impl Statistics {
  pub async fn compute(store: &EntityStore) -> Result<Self, StoreError> {
    Ok(Self::from_counts(store.well_counts().await?))
  }

  pub fn from_counts(counts: WellCounts) -> Self {
    let completion = if counts.total == 0 {
      0.0
    } else {
      counts.sampled as f64 / counts.total as f64 * 100.0
    };

    Self {
      total: counts.total,
      sampled: counts.sampled,
      unsampled: counts.total - counts.sampled,
      completion: format!("{:.1}", completion),
      pending_sync: counts.dirty,
    }
  }
}

/// Wells sampled on one UTC day, with the running total up to that day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayProgress {
  pub date: NaiveDate,
  pub sampled: u64,
  pub cumulative: u64,
}

impl DayProgress {
  /// Per-day history of the wells currently marked sampled, oldest first.
  /// A well that was reset no longer counts toward any day.
  pub async fn history(store: &EntityStore) -> Result<Vec<Self>, StoreError> {
    let sampled: Vec<Well> = store
      .get_by_index("status", SamplingStatus::Sampled)
      .await?;
    Ok(Self::from_times(sampled.iter().filter_map(|w| w.sampled_at)))
  }

  pub fn from_times(times: impl IntoIterator<Item = DateTime<Utc>>) -> Vec<Self> {
    let mut per_day: BTreeMap<NaiveDate, u64> = BTreeMap::new();
    for at in times {
      *per_day.entry(at.date_naive()).or_default() += 1;
    }

    let mut cumulative = 0;
    per_day
      .into_iter()
      .map(|(date, sampled)| {
        cumulative += sampled;
        Self {
          date,
          sampled,
          cumulative,
        }
      })
      .collect()
  }
}

impl fmt::Display for DayProgress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}  sampled: {}  total: {}",
      self.date.format("%Y-%m-%d"),
      self.sampled,
      self.cumulative
    )
  }
}

impl fmt::Display for Statistics {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "wells: {}  sampled: {}  remaining: {}  complete: {}%  pending sync: {}",
      self.total, self.sampled, self.unsampled, self.completion, self.pending_sync
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::WellImport;
  use chrono::TimeZone;
  use serde_json::json;

  #[test]
  fn test_empty_store_is_zero_percent() {
    let stats = Statistics::from_counts(WellCounts::default());
    assert_eq!(stats.completion, "0.0");
    assert_eq!(stats.unsampled, 0);
  }

  #[test]
  fn test_one_decimal_rounding() {
    let stats = Statistics::from_counts(WellCounts {
      total: 3,
      sampled: 1,
      dirty: 0,
    });
    assert_eq!(stats.completion, "33.3");
  }

  #[tokio::test]
  async fn test_compute_from_store() {
    let store = EntityStore::open_in_memory().unwrap();
    let rows: Vec<WellImport> = (1..=4)
      .map(|i| serde_json::from_value(json!({"well_id": format!("W{}", i), "x": 0, "y": 0, "z": 0})).unwrap())
      .collect();
    store.add_wells(rows).await.unwrap();
    store.update_status("W3", SamplingStatus::Sampled, "op").await.unwrap();

    let stats = Statistics::compute(&store).await.unwrap();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.sampled, 1);
    assert_eq!(stats.unsampled, 3);
    assert_eq!(stats.completion, "25.0");
  }

  #[test]
  fn test_daily_progress_groups_by_utc_day() {
    let at = |d: u32, h: u32| Utc.with_ymd_and_hms(2026, 5, d, h, 0, 0).unwrap();
    let days = DayProgress::from_times([at(2, 9), at(1, 23), at(2, 14), at(4, 0)]);

    let summary: Vec<(String, u64, u64)> = days
      .iter()
      .map(|d| (d.date.to_string(), d.sampled, d.cumulative))
      .collect();
    assert_eq!(
      summary,
      vec![
        ("2026-05-01".to_string(), 1, 1),
        ("2026-05-02".to_string(), 2, 3),
        ("2026-05-04".to_string(), 1, 4),
      ]
    );
    assert_eq!(days[1].to_string(), "2026-05-02  sampled: 2  total: 3");
  }

  #[tokio::test]
  async fn test_daily_history_ignores_reset_wells() {
    let store = EntityStore::open_in_memory().unwrap();
    let rows: Vec<WellImport> = (1..=3)
      .map(|i| serde_json::from_value(json!({"well_id": format!("W{}", i), "x": 0, "y": 0, "z": 0})).unwrap())
      .collect();
    store.add_wells(rows).await.unwrap();
    store.update_status("W1", SamplingStatus::Sampled, "op").await.unwrap();
    store.update_status("W2", SamplingStatus::Sampled, "op").await.unwrap();
    store.update_status("W2", SamplingStatus::NotSampled, "op").await.unwrap();

    let history = DayProgress::history(&store).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].date, Utc::now().date_naive());
    assert_eq!(history[0].cumulative, 1);
  }
}
