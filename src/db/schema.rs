//! SQL schema for the local entity tables.

/// Wells, duplicates, the audit log and settings. Each table is independently
/// indexed; `dirty` indexes back the sync scans.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS wells (
    well_id TEXT PRIMARY KEY,
    well_name TEXT NOT NULL,
    x_coord REAL NOT NULL,
    y_coord REAL NOT NULL,
    z_coord REAL NOT NULL,
    total_depth REAL NOT NULL DEFAULT 0,
    sampling_status TEXT NOT NULL DEFAULT 'not_sampled',
    sampled_at INTEGER,
    sampled_by TEXT,
    dirty INTEGER NOT NULL DEFAULT 1,
    revision INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_wells_status ON wells(sampling_status);
CREATE INDEX IF NOT EXISTS idx_wells_dirty ON wells(dirty);
CREATE INDEX IF NOT EXISTS idx_wells_name ON wells(well_name);

CREATE TABLE IF NOT EXISTS duplicates (
    duplicate_id TEXT PRIMARY KEY,
    original_sample_id TEXT NOT NULL,
    duplicate_ratio TEXT NOT NULL,
    analysis_status TEXT NOT NULL DEFAULT 'not_analyzed',
    dirty INTEGER NOT NULL DEFAULT 1,
    revision INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_duplicates_original ON duplicates(original_sample_id);
CREATE INDEX IF NOT EXISTS idx_duplicates_dirty ON duplicates(dirty);

CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    well_id TEXT NOT NULL,
    well_name TEXT NOT NULL,
    operator TEXT NOT NULL,
    action TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp DESC);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
