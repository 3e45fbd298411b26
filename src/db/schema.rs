/// Schema for the durable store.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dashboards (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_dashboards_user ON dashboards(user_id, updated_at);

CREATE TABLE IF NOT EXISTS widgets (
    id TEXT PRIMARY KEY,
    dashboard_id TEXT NOT NULL,
    -- Temporary id the client created the widget under
    client_ref TEXT UNIQUE,
    title TEXT NOT NULL,
    kind TEXT NOT NULL,
    config TEXT NOT NULL,
    data TEXT,
    position TEXT NOT NULL,
    is_configured INTEGER NOT NULL,
    cache_key_ref TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (dashboard_id) REFERENCES dashboards(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_widgets_dashboard ON widgets(dashboard_id, created_at);
"#;
