//! Database schema. Timestamps are RFC 3339 TEXT in UTC, dates are
//! ISO 8601 TEXT, booleans are INTEGER 0/1.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS vehicles (
    id TEXT PRIMARY KEY,
    registration TEXT NOT NULL,
    fleet TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS drivers (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS driver_aliases (
    driver_id TEXT NOT NULL REFERENCES drivers(id),
    source TEXT NOT NULL,
    alias TEXT NOT NULL,
    PRIMARY KEY (driver_id, source, alias)
);

CREATE TABLE IF NOT EXISTS vehicle_assignments (
    id TEXT PRIMARY KEY,
    vehicle_id TEXT NOT NULL REFERENCES vehicles(id),
    driver_id TEXT NOT NULL REFERENCES drivers(id),
    valid_from TEXT NOT NULL,
    valid_until TEXT,                     -- NULL = open ended
    kind TEXT NOT NULL DEFAULT 'roster',
    confidence REAL                       -- [0,1], NULL when unstated
);

CREATE TABLE IF NOT EXISTS telemetry_events (
    id TEXT PRIMARY KEY,
    vehicle_id TEXT NOT NULL REFERENCES vehicles(id),
    occurred_at TEXT NOT NULL,
    lat REAL,
    lon REAL,
    driver_ref TEXT,                      -- free text from the source
    source TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trips (
    id TEXT PRIMARY KEY,
    vehicle_id TEXT NOT NULL REFERENCES vehicles(id),
    started_at TEXT NOT NULL,
    ended_at TEXT NOT NULL,
    end_lat REAL,
    end_lon REAL,
    driver_ref TEXT
);

CREATE TABLE IF NOT EXISTS deliveries (
    id TEXT PRIMARY KEY,
    vehicle_text TEXT,                    -- as entered on the docket
    site_name TEXT NOT NULL,
    delivery_date TEXT NOT NULL,
    lat REAL,
    lon REAL,
    service_radius_km REAL
);

CREATE TABLE IF NOT EXISTS correlations (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,                   -- 'driver' | 'delivery'
    subject_id TEXT NOT NULL,
    matched_entity_id TEXT,
    confidence REAL NOT NULL,
    breakdown TEXT NOT NULL DEFAULT '{}', -- JSON method -> score
    methods TEXT NOT NULL DEFAULT '[]',   -- JSON list of method tags
    tier TEXT NOT NULL,
    requires_review INTEGER NOT NULL DEFAULT 0,
    flags TEXT NOT NULL DEFAULT '[]',     -- JSON list of review flags
    verified INTEGER NOT NULL DEFAULT 0,
    verified_by TEXT,
    verified_at TEXT,
    run_id TEXT,
    updated_at TEXT NOT NULL
);

-- Upsert identity. A driver subject carries at most one attribution;
-- a trip may correlate with several deliveries, one row per pair.
CREATE UNIQUE INDEX IF NOT EXISTS idx_correlations_driver_subject
    ON correlations(subject_id) WHERE kind = 'driver';
CREATE UNIQUE INDEX IF NOT EXISTS idx_correlations_delivery_pair
    ON correlations(subject_id, matched_entity_id) WHERE kind = 'delivery';

CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,                   -- 'driver' | 'delivery' | 'full'
    status TEXT NOT NULL,                 -- 'created' | 'running' | 'completed' | 'failed'
    scope TEXT NOT NULL DEFAULT '{}',     -- JSON run scope
    started_at TEXT NOT NULL,
    finished_at TEXT,
    processed INTEGER NOT NULL DEFAULT 0,
    matched INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    high_confidence INTEGER NOT NULL DEFAULT 0,
    needs_review INTEGER NOT NULL DEFAULT 0,
    avg_confidence REAL NOT NULL DEFAULT 0,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_vehicle_time
    ON telemetry_events(vehicle_id, occurred_at);
CREATE INDEX IF NOT EXISTS idx_trips_vehicle_time
    ON trips(vehicle_id, started_at, ended_at);
CREATE INDEX IF NOT EXISTS idx_assignments_vehicle
    ON vehicle_assignments(vehicle_id, valid_from);
CREATE INDEX IF NOT EXISTS idx_deliveries_date
    ON deliveries(delivery_date);
CREATE INDEX IF NOT EXISTS idx_correlations_kind_review
    ON correlations(kind, requires_review, confidence);
CREATE INDEX IF NOT EXISTS idx_correlations_run
    ON correlations(run_id);
"#;
