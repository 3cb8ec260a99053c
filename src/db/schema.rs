pub const SCHEMA: &str = r#"
-- Items table: one record per media item
CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    state INTEGER NOT NULL,            -- FileState ordinal 0..5
    label TEXT NOT NULL DEFAULT '',    -- empty until the item is labeled
    filetype INTEGER NOT NULL,         -- 0 = image, 1 = video
    width INTEGER NOT NULL,
    height INTEGER NOT NULL,
    embedding TEXT,                    -- base64 of little-endian f32 dump, NULL until clipped
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_items_state ON items(state);
CREATE INDEX IF NOT EXISTS idx_items_label ON items(label);
CREATE INDEX IF NOT EXISTS idx_items_label_filetype ON items(label, filetype);

-- Tags: many-to-many key/value annotations per item
CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    value TEXT NOT NULL,
    FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_tags_item ON tags(item_id);
CREATE INDEX IF NOT EXISTS idx_tags_name ON tags(name);

-- Rules: tags auto-applied to every item carrying a label
CREATE TABLE IF NOT EXISTS rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    label TEXT NOT NULL,
    tag_name TEXT NOT NULL,
    tag_value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rules_label ON rules(label);
"#;

/// Idempotent schema amendments; failures are ignored so re-running against
/// an already-migrated database is harmless.
pub const MIGRATIONS: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_tags_name_value ON tags(name, value)",
];
