use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Logical tables of the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
  Well,
  Duplicate,
  LogEntry,
  Settings,
}

impl EntityKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      EntityKind::Well => "well",
      EntityKind::Duplicate => "duplicate",
      EntityKind::LogEntry => "log entry",
      EntityKind::Settings => "setting",
    }
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStatus {
  #[default]
  NotSampled,
  Sampled,
}

impl SamplingStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      SamplingStatus::NotSampled => "not_sampled",
      SamplingStatus::Sampled => "sampled",
    }
  }
}

impl FromStr for SamplingStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "not_sampled" => Ok(SamplingStatus::NotSampled),
      "sampled" => Ok(SamplingStatus::Sampled),
      other => Err(format!("unknown sampling status '{}'", other)),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
  #[default]
  NotAnalyzed,
  Analyzed,
}

impl AnalysisStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      AnalysisStatus::NotAnalyzed => "not_analyzed",
      AnalysisStatus::Analyzed => "analyzed",
    }
  }
}

impl FromStr for AnalysisStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "not_analyzed" => Ok(AnalysisStatus::NotAnalyzed),
      "analyzed" => Ok(AnalysisStatus::Analyzed),
      other => Err(format!("unknown analysis status '{}'", other)),
    }
  }
}

// Statuses are stored as their snake_case names.
macro_rules! text_enum_sql {
  ($ty:ty) => {
    impl ToSql for $ty {
      fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
      }
    }

    impl FromSql for $ty {
      fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
          .as_str()?
          .parse()
          .map_err(|e: String| FromSqlError::Other(e.into()))
      }
    }

    impl From<$ty> for Value {
      fn from(status: $ty) -> Self {
        Value::Text(status.as_str().to_string())
      }
    }
  };
}

text_enum_sql!(SamplingStatus);
text_enum_sql!(AnalysisStatus);

/// A sampling well.
///
/// `sampled_at` and `sampled_by` are set exactly when the status is
/// `Sampled`; [`Well::apply_status`] is the only place that changes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Well {
  pub well_id: String,
  pub well_name: String,
  pub x_coord: f64,
  pub y_coord: f64,
  pub z_coord: f64,
  #[serde(default)]
  pub total_depth: f64,
  #[serde(default)]
  pub sampling_status: SamplingStatus,
  #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
  pub sampled_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub sampled_by: Option<String>,
  /// Local changes not yet accepted by the remote
  #[serde(default = "default_dirty")]
  pub dirty: bool,
  /// Bumped on every local write
  #[serde(default)]
  pub revision: i64,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub created_at: DateTime<Utc>,
}

impl Well {
  pub fn new(well_id: impl Into<String>, well_name: impl Into<String>, coords: (f64, f64, f64)) -> Self {
    Self {
      well_id: well_id.into(),
      well_name: well_name.into(),
      x_coord: coords.0,
      y_coord: coords.1,
      z_coord: coords.2,
      total_depth: 0.0,
      sampling_status: SamplingStatus::NotSampled,
      sampled_at: None,
      sampled_by: None,
      dirty: true,
      revision: 0,
      created_at: Utc::now(),
    }
  }

  pub fn is_sampled(&self) -> bool {
    self.sampling_status == SamplingStatus::Sampled
  }

  /// Set the sampling status together with the fields that depend on it.
  pub fn apply_status(&mut self, status: SamplingStatus, operator: &str, at: DateTime<Utc>) {
    self.sampling_status = status;
    match status {
      SamplingStatus::Sampled => {
        self.sampled_at = Some(at);
        self.sampled_by = Some(operator.to_string());
      }
      SamplingStatus::NotSampled => {
        self.sampled_at = None;
        self.sampled_by = None;
      }
    }
  }
}

/// A duplicate sample drawn from an already sampled well
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Duplicate {
  pub duplicate_id: String,
  pub original_sample_id: String,
  pub duplicate_ratio: String,
  #[serde(default)]
  pub analysis_status: AnalysisStatus,
  #[serde(default = "default_dirty")]
  pub dirty: bool,
  #[serde(default)]
  pub revision: i64,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub created_at: DateTime<Utc>,
}

impl Duplicate {
  pub fn new(original: &str, ordinal: usize, ratio: &str) -> Self {
    Self {
      duplicate_id: format!("{}_DUP_{}", original, ordinal),
      original_sample_id: original.to_string(),
      duplicate_ratio: ratio.to_string(),
      analysis_status: AnalysisStatus::NotAnalyzed,
      dirty: true,
      revision: 0,
      created_at: Utc::now(),
    }
  }
}

fn default_dirty() -> bool {
  true
}

/// Append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
  #[serde(default)]
  pub id: i64,
  pub well_id: String,
  pub well_name: String,
  pub operator: String,
  pub action: String,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub timestamp: DateTime<Utc>,
}

/// Raw well row as it arrives from an import file.
///
/// Spreadsheet exports carry ids as numbers and coordinates as strings, so
/// fields stay untyped until [`WellImport::validate`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WellImport {
  #[serde(default)]
  pub well_id: Option<serde_json::Value>,
  #[serde(default)]
  pub well_name: Option<String>,
  #[serde(default, alias = "x")]
  pub x_coord: Option<serde_json::Value>,
  #[serde(default, alias = "y")]
  pub y_coord: Option<serde_json::Value>,
  #[serde(default, alias = "z")]
  pub z_coord: Option<serde_json::Value>,
  #[serde(default, alias = "depth")]
  pub total_depth: Option<serde_json::Value>,
}

impl WellImport {
  /// Turn the row into a fresh, unsampled well or explain why it is unusable.
  pub fn validate(&self) -> Result<Well, String> {
    let well_id = match &self.well_id {
      Some(serde_json::Value::String(s)) => s.trim().to_string(),
      Some(serde_json::Value::Number(n)) => n.to_string(),
      _ => String::new(),
    };
    if well_id.is_empty() {
      return Err("missing well_id".to_string());
    }

    let coord = |name: &str, value: &Option<serde_json::Value>| {
      lenient_f64(value).ok_or_else(|| format!("well {}: missing or invalid {}", well_id, name))
    };
    let x = coord("x_coord", &self.x_coord)?;
    let y = coord("y_coord", &self.y_coord)?;
    let z = coord("z_coord", &self.z_coord)?;

    let total_depth = lenient_f64(&self.total_depth).unwrap_or(0.0);
    if total_depth < 0.0 {
      return Err(format!("well {}: negative total_depth", well_id));
    }

    let well_name = self
      .well_name
      .as_deref()
      .map(str::trim)
      .filter(|n| !n.is_empty())
      .map(String::from)
      .unwrap_or_else(|| format!("Well {}", well_id));

    let mut well = Well::new(well_id, well_name, (x, y, z));
    well.total_depth = total_depth;
    Ok(well)
  }
}

fn lenient_f64(value: &Option<serde_json::Value>) -> Option<f64> {
  let v = match value.as_ref()? {
    serde_json::Value::Number(n) => n.as_f64()?,
    serde_json::Value::String(s) => s.trim().replace(',', ".").parse().ok()?,
    _ => return None,
  };
  v.is_finite().then_some(v)
}

/// Outcome of a batch import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
  pub attempted: usize,
  /// Records actually persisted
  pub added: usize,
  /// Skipped by validation
  pub invalid: usize,
  /// Skipped because the key already existed
  pub conflicts: usize,
}

impl ImportSummary {
  pub fn failed(&self) -> usize {
    self.attempted - self.added
  }
}

/// Full local export, also accepted back by `import_snapshot`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
  pub version: u32,
  pub exported_at: DateTime<Utc>,
  #[serde(default)]
  pub wells: Vec<Well>,
  #[serde(default)]
  pub duplicates: Vec<Duplicate>,
  #[serde(default)]
  pub logs: Vec<LogEntry>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn row(v: serde_json::Value) -> WellImport {
    serde_json::from_value(v).unwrap()
  }

  #[test]
  fn test_validate_accepts_numeric_id_and_string_coords() {
    let well = row(json!({"well_id": 17, "x": "1,5", "y": 2.0, "z": "3"}))
      .validate()
      .unwrap();
    assert_eq!(well.well_id, "17");
    assert_eq!(well.well_name, "Well 17");
    assert_eq!(well.x_coord, 1.5);
    assert_eq!(well.total_depth, 0.0);
    assert!(well.dirty);
  }

  #[test]
  fn test_validate_rejects_missing_coordinate() {
    let err = row(json!({"well_id": "W1", "x_coord": 1.0, "y_coord": 2.0}))
      .validate()
      .unwrap_err();
    assert!(err.contains("z_coord"));
  }

  #[test]
  fn test_validate_rejects_blank_id() {
    assert!(row(json!({"well_id": "  ", "x": 1, "y": 1, "z": 1})).validate().is_err());
  }

  #[test]
  fn test_apply_status_keeps_fields_consistent() {
    let mut well = Well::new("W1", "Well 1", (0.0, 0.0, 0.0));
    well.apply_status(SamplingStatus::Sampled, "ivanov", Utc::now());
    assert!(well.sampled_at.is_some() && well.sampled_by.as_deref() == Some("ivanov"));

    well.apply_status(SamplingStatus::NotSampled, "ivanov", Utc::now());
    assert!(well.sampled_at.is_none() && well.sampled_by.is_none());
  }
}
