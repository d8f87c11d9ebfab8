#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_registry_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS packages (
    package_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at_unix INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS functions (
    function_id TEXT PRIMARY KEY,
    package_id TEXT NOT NULL REFERENCES packages (package_id) ON DELETE CASCADE,
    name TEXT NOT NULL CHECK (length(trim(name)) > 0),
    version INTEGER NOT NULL,
    display_name TEXT,
    description TEXT,
    schema_json TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    created_at_unix INTEGER NOT NULL,
    UNIQUE (package_id, name, version)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_functions_single_active
    ON functions (package_id, name)
    WHERE active = 1;
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_functions_single_active;
DROP TABLE IF EXISTS functions;
DROP TABLE IF EXISTS packages;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "freeze_function_identity_columns",
    up_sql: r#"
CREATE TRIGGER IF NOT EXISTS trg_functions_identity_immutable
BEFORE UPDATE OF function_id, package_id, name, version ON functions
WHEN OLD.function_id IS NOT NEW.function_id
  OR OLD.package_id IS NOT NEW.package_id
  OR OLD.name IS NOT NEW.name
  OR OLD.version IS NOT NEW.version
BEGIN
    SELECT RAISE(ABORT, 'function identity columns are immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_packages_identity_immutable
BEFORE UPDATE OF package_id ON packages
WHEN OLD.package_id IS NOT NEW.package_id
BEGIN
    SELECT RAISE(ABORT, 'package id is immutable');
END;
"#,
    down_sql: r#"
DROP TRIGGER IF EXISTS trg_packages_identity_immutable;
DROP TRIGGER IF EXISTS trg_functions_identity_immutable;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
