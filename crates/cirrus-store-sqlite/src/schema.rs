//! SQL schema for the Cirrus SQLite store.
//!
//! Executed once at connection startup; idempotent thanks to
//! `CREATE ... IF NOT EXISTS`. Future migrations are gated on
//! `PRAGMA user_version`.

/// Current schema version; bump together with a migration step in
/// `store.rs`.
pub const SCHEMA_VERSION: i64 = 1;

/// Full schema DDL.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
-- Contending writers back off inside SQLite before a busy error surfaces.
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS provider (
    id      INTEGER PRIMARY KEY,
    slug    TEXT NOT NULL UNIQUE,
    version TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS diagnostic (
    id          INTEGER PRIMARY KEY,
    provider_id INTEGER NOT NULL REFERENCES provider(id),
    slug        TEXT NOT NULL,
    UNIQUE (provider_id, slug)
);

-- Dataset rows are never mutated; a new version is a new row and the old
-- one is retained for audit. Retraction is a soft delete.
CREATE TABLE IF NOT EXISTS dataset (
    id          INTEGER PRIMARY KEY,
    source_type TEXT NOT NULL,
    instance_id TEXT NOT NULL,
    version     TEXT NOT NULL,
    retracted   INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL,
    UNIQUE (source_type, instance_id, version)
);

-- Facets live in a side table keyed by (dataset, facet) so a new source
-- type never changes the schema.
CREATE TABLE IF NOT EXISTS dataset_facet (
    dataset_id INTEGER NOT NULL REFERENCES dataset(id) ON DELETE CASCADE,
    facet      TEXT NOT NULL,
    value      TEXT NOT NULL,
    UNIQUE (dataset_id, facet)
);

CREATE TABLE IF NOT EXISTS dataset_file (
    id          INTEGER PRIMARY KEY,
    dataset_id  INTEGER NOT NULL REFERENCES dataset(id) ON DELETE CASCADE,
    path        TEXT NOT NULL UNIQUE,
    size        INTEGER NOT NULL,
    checksum    TEXT NOT NULL,
    variable_id TEXT,
    start_time  TEXT,           -- RFC 3339; half-open range with end_time
    end_time    TEXT
);

CREATE TABLE IF NOT EXISTS execution_group (
    id            INTEGER PRIMARY KEY,
    diagnostic_id INTEGER NOT NULL REFERENCES diagnostic(id),
    group_key     TEXT NOT NULL,   -- canonical 'facet=value,...' form
    selectors     TEXT NOT NULL,   -- JSON array of [facet, value] pairs
    dirty         INTEGER NOT NULL DEFAULT 1,
    stale         INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    UNIQUE (diagnostic_id, group_key)
);

CREATE TABLE IF NOT EXISTS execution (
    id              INTEGER PRIMARY KEY,
    group_id        INTEGER NOT NULL REFERENCES execution_group(id),
    dataset_hash    TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'pending',
    reason          TEXT,
    output_fragment TEXT NOT NULL,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    worker          TEXT,
    started_at      TEXT,
    finished_at     TEXT,
    created_at      TEXT NOT NULL,
    UNIQUE (group_id, dataset_hash)
);

-- At most one running execution per group.
CREATE UNIQUE INDEX IF NOT EXISTS execution_one_running_idx
    ON execution(group_id) WHERE status = 'running';

CREATE TABLE IF NOT EXISTS execution_input (
    execution_id INTEGER NOT NULL REFERENCES execution(id),
    dataset_id   INTEGER NOT NULL REFERENCES dataset(id),
    source_type  TEXT NOT NULL,
    instance_id  TEXT NOT NULL,
    version      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS execution_output (
    id           INTEGER PRIMARY KEY,
    execution_id INTEGER NOT NULL REFERENCES execution(id),
    output_type  TEXT NOT NULL,
    filename     TEXT NOT NULL CHECK (substr(filename, 1, 1) != '/'),
    mime_type    TEXT NOT NULL,
    short_name   TEXT NOT NULL,
    long_name    TEXT,
    description  TEXT
);

CREATE TABLE IF NOT EXISTS scalar_metric_value (
    id           INTEGER PRIMARY KEY,
    execution_id INTEGER NOT NULL REFERENCES execution(id),
    value        REAL NOT NULL,
    dimensions   TEXT NOT NULL,   -- JSON object, facet -> value
    attributes   TEXT
);

CREATE TABLE IF NOT EXISTS series_metric_value (
    id           INTEGER PRIMARY KEY,
    execution_id INTEGER NOT NULL REFERENCES execution(id),
    vals         TEXT NOT NULL,   -- JSON array of numbers
    idx          TEXT NOT NULL,   -- JSON array, same length as vals
    index_name   TEXT NOT NULL,
    dimensions   TEXT NOT NULL,
    attributes   TEXT
);

-- Store-backed work queue for the distributed executor.
CREATE TABLE IF NOT EXISTS queue_message (
    id             INTEGER PRIMARY KEY,
    topic          TEXT NOT NULL,   -- '<provider>/<diagnostic>'
    execution_id   INTEGER NOT NULL REFERENCES execution(id),
    payload        TEXT NOT NULL,   -- serialized planned execution
    state          TEXT NOT NULL DEFAULT 'ready',
    delivery_count INTEGER NOT NULL DEFAULT 0,
    claimed_by     TEXT,
    claimed_at     TEXT,
    created_at     TEXT NOT NULL
);

-- Named advisory locks; serialize solver passes.
CREATE TABLE IF NOT EXISTS advisory_lock (
    name        TEXT PRIMARY KEY,
    holder      TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at  TEXT NOT NULL
);

-- One flat facet view per source type for ad-hoc querying; the engine
-- itself reads through load_catalog.
CREATE VIEW IF NOT EXISTS cmip6_datasets AS
    SELECT d.id, d.instance_id, d.version, d.retracted, f.facet, f.value
    FROM dataset d JOIN dataset_facet f ON f.dataset_id = d.id
    WHERE d.source_type = 'cmip6';
CREATE VIEW IF NOT EXISTS obs4mips_datasets AS
    SELECT d.id, d.instance_id, d.version, d.retracted, f.facet, f.value
    FROM dataset d JOIN dataset_facet f ON f.dataset_id = d.id
    WHERE d.source_type = 'obs4mips';
CREATE VIEW IF NOT EXISTS pmp_climatology_datasets AS
    SELECT d.id, d.instance_id, d.version, d.retracted, f.facet, f.value
    FROM dataset d JOIN dataset_facet f ON f.dataset_id = d.id
    WHERE d.source_type = 'pmp-climatology';

CREATE INDEX IF NOT EXISTS dataset_instance_idx
    ON dataset(source_type, instance_id);
CREATE INDEX IF NOT EXISTS dataset_facet_idx
    ON dataset_facet(facet, value);
CREATE INDEX IF NOT EXISTS execution_group_idx
    ON execution(group_id);
CREATE INDEX IF NOT EXISTS execution_status_idx
    ON execution(status);
CREATE INDEX IF NOT EXISTS queue_state_idx
    ON queue_message(state, id);

PRAGMA user_version = 1;
";
