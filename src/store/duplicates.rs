//! Duplicate sample generation for QA/QC.

use std::fmt;
use std::str::FromStr;

use super::{Duplicate, EntityStore, ImportSummary, Provenance, SamplingStatus, Well, WriteMode};
use crate::error::StoreError;

/// "N:D" ratio: one duplicate for every `denominator` sampled wells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateRatio {
  pub numerator: u32,
  pub denominator: u32,
}

impl Default for DuplicateRatio {
  fn default() -> Self {
    Self {
      numerator: 1,
      denominator: 10,
    }
  }
}

impl FromStr for DuplicateRatio {
  type Err = StoreError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let invalid = || StoreError::Validation(format!("invalid duplicate ratio '{}', expected N:D", s));

    let (n, d) = s.split_once(':').ok_or_else(invalid)?;
    let numerator: u32 = n.trim().parse().map_err(|_| invalid())?;
    let denominator: u32 = d.trim().parse().map_err(|_| invalid())?;
    if denominator == 0 {
      return Err(invalid());
    }

    Ok(Self {
      numerator,
      denominator,
    })
  }
}

impl fmt::Display for DuplicateRatio {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.numerator, self.denominator)
  }
}

/// Create a duplicate for every `denominator`-th sampled well, in key order.
///
/// Duplicates are strict inserts: running generation twice skips the ones
/// that already exist and counts them as conflicts.
pub async fn generate_duplicates(
  store: &EntityStore,
  ratio: DuplicateRatio,
) -> Result<ImportSummary, StoreError> {
  let sampled: Vec<Well> = store
    .get_by_index("status", SamplingStatus::Sampled)
    .await?;

  let label = ratio.to_string();
  let step = ratio.denominator as usize;
  let mut summary = ImportSummary::default();

  for (i, well) in sampled.iter().enumerate() {
    if (i + 1) % step != 0 {
      continue;
    }
    summary.attempted += 1;

    let duplicate = Duplicate::new(&well.well_id, i / step + 1, &label);
    match store.put(duplicate, WriteMode::Insert, Provenance::Local).await {
      Ok(_) => summary.added += 1,
      Err(StoreError::Constraint { key, .. }) => {
        tracing::debug!(duplicate_id = %key, "duplicate already exists");
        summary.conflicts += 1;
      }
      Err(e) => return Err(e),
    }
  }

  tracing::info!(created = summary.added, ratio = %label, "generated duplicates");
  Ok(summary)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::WellImport;
  use serde_json::json;

  async fn sampled_store(count: usize) -> EntityStore {
    let store = EntityStore::open_in_memory().unwrap();
    let rows: Vec<WellImport> = (0..count)
      .map(|i| {
        serde_json::from_value(json!({"well_id": format!("W{:02}", i), "x": 0, "y": 0, "z": 0}))
          .unwrap()
      })
      .collect();
    store.add_wells(rows).await.unwrap();
    for i in 0..count {
      store
        .update_status(&format!("W{:02}", i), SamplingStatus::Sampled, "op")
        .await
        .unwrap();
    }
    store
  }

  #[test]
  fn test_parse_ratio() {
    assert_eq!(
      "1:5".parse::<DuplicateRatio>().unwrap(),
      DuplicateRatio {
        numerator: 1,
        denominator: 5
      }
    );
    assert!("1:0".parse::<DuplicateRatio>().is_err());
    assert!("ten".parse::<DuplicateRatio>().is_err());
  }

  #[tokio::test]
  async fn test_generates_every_nth_sampled_well() {
    let store = sampled_store(7).await;
    let ratio = "1:3".parse().unwrap();

    let summary = generate_duplicates(&store, ratio).await.unwrap();
    assert_eq!(summary.added, 2);

    let duplicates = store.get_all::<Duplicate>().await.unwrap();
    let ids: Vec<_> = duplicates.iter().map(|d| d.duplicate_id.as_str()).collect();
    assert_eq!(ids, vec!["W02_DUP_1", "W05_DUP_2"]);
    assert!(duplicates.iter().all(|d| d.dirty && d.duplicate_ratio == "1:3"));
  }

  #[tokio::test]
  async fn test_regeneration_skips_existing() {
    let store = sampled_store(4).await;
    let ratio = "1:2".parse().unwrap();
    generate_duplicates(&store, ratio).await.unwrap();

    let again = generate_duplicates(&store, ratio).await.unwrap();
    assert_eq!(again.added, 0);
    assert_eq!(again.conflicts, 2);
  }

  #[tokio::test]
  async fn test_no_sampled_wells() {
    let store = EntityStore::open_in_memory().unwrap();
    let summary = generate_duplicates(&store, DuplicateRatio::default()).await.unwrap();
    assert_eq!(summary.added, 0);
  }
}
