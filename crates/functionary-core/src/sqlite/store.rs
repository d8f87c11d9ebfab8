use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{
    Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, ffi, params,
};
use thiserror::Error;

use crate::config::RegistryConfig;
use crate::models::{
    Function, FunctionId, FunctionMetadata, FunctionScope, NewFunction, Package, PackageId,
    RegistryError, RegistryErrorKind,
};
use crate::persistence::{FunctionStore, MigrationStore, PackageStore, PersistenceResult};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "functionary_schema_migrations";

const FUNCTION_COLUMNS: &str = "function_id, package_id, name, version, display_name, \
     description, schema_json, active, created_at_unix";

/// Failures raised inside a connection closure. Registry errors pass through
/// untouched; raw SQLite errors are classified once the closure returns.
#[derive(Debug, Error)]
enum StoreFailure {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

type StoreResult<T> = Result<T, StoreFailure>;

pub struct SqliteStore {
    database_path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            busy_timeout: RegistryConfig::DEFAULT_BUSY_TIMEOUT,
        }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new(config.database_path.clone()).with_busy_timeout(config.busy_timeout)
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> StoreResult<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path, self.busy_timeout)
            .map_err(|error| classify_sqlite_error(operation_name, error))?;
        operation(&mut connection).map_err(|failure| match failure {
            StoreFailure::Sqlite(error) => classify_sqlite_error(operation_name, error),
            StoreFailure::Registry(error) => error,
        })
    }
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            Ok(read_current_version(connection)?)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        if target_version > 0 && migration(target_version).is_none() {
            return Err(storage_error_text(
                "apply_migration",
                format!("migration version '{target_version}' is not defined"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // All DDL is IF NOT EXISTS, so replaying repairs a database whose
                // version row survived while its objects did not.
                for version in 1..=target_version {
                    connection.execute_batch(defined_migration(version)?.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            tracing::info!(
                from_version = current_version,
                to_version = target_version,
                database = %self.database_path.display(),
                "applied sqlite schema migrations"
            );
            Ok(())
        })
    }
}

impl PackageStore for SqliteStore {
    fn insert_package(&self, package: &Package) -> PersistenceResult<()> {
        self.with_connection("insert_package", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO packages (package_id, name, created_at_unix)
VALUES (?1, ?2, ?3)
",
                params![
                    package.id.to_string(),
                    package.name.as_str(),
                    to_unix_seconds(package.created_at)?,
                ],
            )?;
            Ok(())
        })
    }

    fn package(&self, package_id: PackageId) -> PersistenceResult<Option<Package>> {
        self.with_connection("package", |connection| {
            ensure_schema_ready(connection)?;
            let package = connection
                .query_row(
                    "
SELECT package_id, name, created_at_unix
FROM packages
WHERE package_id = ?1
",
                    [package_id.to_string()],
                    |row| {
                        let package_raw: String = row.get(0)?;
                        let name: String = row.get(1)?;
                        let created_at_unix: i64 = row.get(2)?;

                        Ok(Package {
                            id: parse_package_id(&package_raw)?,
                            name,
                            created_at: from_unix_seconds(created_at_unix)?,
                        })
                    },
                )
                .optional()?;
            Ok(package)
        })
    }

    fn delete_package(&self, package_id: PackageId) -> PersistenceResult<Option<usize>> {
        self.with_connection("delete_package", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let package_key = package_id.to_string();

            if !package_exists(&transaction, &package_key)? {
                return Ok(None);
            }

            let function_count: i64 = transaction.query_row(
                "SELECT COUNT(*) FROM functions WHERE package_id = ?1",
                [package_key.as_str()],
                |row| row.get(0),
            )?;
            transaction.execute(
                "DELETE FROM packages WHERE package_id = ?1",
                [package_key.as_str()],
            )?;

            transaction.commit()?;
            Ok(Some(i64_to_usize(function_count)?))
        })
    }
}

impl FunctionStore for SqliteStore {
    fn publish_function(
        &self,
        function_id: FunctionId,
        request: &NewFunction,
        published_at: SystemTime,
    ) -> PersistenceResult<Function> {
        let schema_json = serde_json::to_string(&request.schema).map_err(|error| {
            RegistryError::validation(format!("schema could not be serialized: {error}"))
        })?;

        self.with_connection("publish_function", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let package_key = request.package_id.to_string();

            if !package_exists(&transaction, &package_key)? {
                return Err(RegistryError::package_not_found(request.package_id).into());
            }

            let next_version: i64 = transaction.query_row(
                "
SELECT COALESCE(MAX(version), 0) + 1
FROM functions
WHERE package_id = ?1 AND name = ?2
",
                params![package_key.as_str(), request.name.as_str()],
                |row| row.get(0),
            )?;

            transaction.execute(
                "
UPDATE functions
SET active = 0
WHERE package_id = ?1 AND name = ?2 AND active = 1
",
                params![package_key.as_str(), request.name.as_str()],
            )?;

            transaction.execute(
                "
INSERT INTO functions (
    function_id, package_id, name, version, display_name, description, schema_json, active,
    created_at_unix
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)
",
                params![
                    function_id.to_string(),
                    package_key.as_str(),
                    request.name.as_str(),
                    next_version,
                    request.display_name.as_deref(),
                    request.description.as_deref(),
                    schema_json.as_str(),
                    to_unix_seconds(published_at)?,
                ],
            )?;

            let function = select_function(&transaction, function_id)?.ok_or_else(|| {
                RegistryError::internal(format!(
                    "function '{function_id}' was not readable inside its own transaction"
                ))
            })?;

            transaction.commit()?;
            Ok(function)
        })
    }

    fn function(&self, function_id: FunctionId) -> PersistenceResult<Option<Function>> {
        self.with_connection("function", |connection| {
            ensure_schema_ready(connection)?;
            Ok(select_function(connection, function_id)?)
        })
    }

    fn deactivate_function(&self, function_id: FunctionId) -> PersistenceResult<Option<Function>> {
        self.with_connection("deactivate_function", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

            transaction.execute(
                "UPDATE functions SET active = 0 WHERE function_id = ?1 AND active = 1",
                [function_id.to_string()],
            )?;
            let function = select_function(&transaction, function_id)?;

            transaction.commit()?;
            Ok(function)
        })
    }

    fn update_function_metadata(
        &self,
        function_id: FunctionId,
        metadata: &FunctionMetadata,
    ) -> PersistenceResult<Option<Function>> {
        self.with_connection("update_function_metadata", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

            transaction.execute(
                "
UPDATE functions
SET display_name = ?2, description = ?3
WHERE function_id = ?1
",
                params![
                    function_id.to_string(),
                    metadata.display_name.as_deref(),
                    metadata.description.as_deref(),
                ],
            )?;
            let function = select_function(&transaction, function_id)?;

            transaction.commit()?;
            Ok(function)
        })
    }

    fn active_functions(&self, scope: &FunctionScope) -> PersistenceResult<Vec<Function>> {
        self.with_connection("active_functions", |connection| {
            ensure_schema_ready(connection)?;
            Ok(select_scope(connection, scope, true)?)
        })
    }

    fn list_versions(&self, scope: &FunctionScope) -> PersistenceResult<Vec<Function>> {
        self.with_connection("list_versions", |connection| {
            ensure_schema_ready(connection)?;
            Ok(select_scope(connection, scope, false)?)
        })
    }
}

fn open_connection(database_path: &Path, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(busy_timeout)?;
    // Cascade deletes depend on this; SQLite defaults it to off per connection.
    connection.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(connection)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(&format!(
        "
CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
"
    ))
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(storage_error_sqlite(
            "database schema is not initialized; apply migrations before registry operations",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn defined_migration(version: i64) -> StoreResult<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        RegistryError::internal(format!("migration version '{version}' is not defined")).into()
    })
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()
}

fn package_exists(connection: &Connection, package_key: &str) -> rusqlite::Result<bool> {
    connection.query_row(
        "SELECT EXISTS (SELECT 1 FROM packages WHERE package_id = ?1)",
        [package_key],
        |row| row.get(0),
    )
}

fn select_function(
    connection: &Connection,
    function_id: FunctionId,
) -> rusqlite::Result<Option<Function>> {
    connection
        .query_row(
            &format!("SELECT {FUNCTION_COLUMNS} FROM functions WHERE function_id = ?1"),
            [function_id.to_string()],
            function_from_row,
        )
        .optional()
}

fn select_scope(
    connection: &Connection,
    scope: &FunctionScope,
    active_only: bool,
) -> rusqlite::Result<Vec<Function>> {
    let mut statement = connection.prepare(&format!(
        "
SELECT {FUNCTION_COLUMNS}
FROM functions
WHERE package_id = ?1 AND name = ?2 AND (?3 = 0 OR active = 1)
ORDER BY version DESC
"
    ))?;
    let rows = statement.query_map(
        params![
            scope.package_id.to_string(),
            scope.name.as_str(),
            bool_to_sqlite(active_only),
        ],
        function_from_row,
    )?;

    rows.collect()
}

fn function_from_row(row: &Row<'_>) -> rusqlite::Result<Function> {
    let function_raw: String = row.get(0)?;
    let package_raw: String = row.get(1)?;
    let name: String = row.get(2)?;
    let version: i64 = row.get(3)?;
    let display_name: Option<String> = row.get(4)?;
    let description: Option<String> = row.get(5)?;
    let schema_raw: String = row.get(6)?;
    let active_int: i64 = row.get(7)?;
    let created_at_unix: i64 = row.get(8)?;

    let schema = serde_json::from_str(&schema_raw).map_err(|error| {
        storage_error_sqlite(&format!(
            "schema for function '{function_raw}' is not valid json: {error}"
        ))
    })?;

    Ok(Function {
        id: parse_function_id(&function_raw)?,
        package_id: parse_package_id(&package_raw)?,
        name,
        version: u64::try_from(version)
            .map_err(|_| storage_error_sqlite("negative function version in sqlite record"))?,
        display_name,
        description,
        schema,
        active: sqlite_to_bool(active_int),
        created_at: from_unix_seconds(created_at_unix)?,
    })
}

fn classify_sqlite_error(operation: &str, error: rusqlite::Error) -> RegistryError {
    let kind = match &error {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => RegistryErrorKind::Conflict,
            ErrorCode::ConstraintViolation => match failure.extended_code {
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    RegistryErrorKind::Conflict
                }
                ffi::SQLITE_CONSTRAINT_FOREIGNKEY => RegistryErrorKind::NotFound,
                _ => RegistryErrorKind::StorageFailure,
            },
            _ => RegistryErrorKind::StorageFailure,
        },
        _ => RegistryErrorKind::StorageFailure,
    };

    RegistryError::new(kind, format!("sqlite store '{operation}' failed: {error}"))
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn parse_function_id(raw: &str) -> rusqlite::Result<FunctionId> {
    raw.parse::<FunctionId>().map_err(|_| {
        storage_error_sqlite(&format!(
            "malformed function id '{raw}' found in persisted sqlite record"
        ))
    })
}

fn parse_package_id(raw: &str) -> rusqlite::Result<PackageId> {
    raw.parse::<PackageId>().map_err(|_| {
        storage_error_sqlite(&format!(
            "malformed package id '{raw}' found in persisted sqlite record"
        ))
    })
}

fn bool_to_sqlite(value: bool) -> i64 {
    if value { 1 } else { 0 }
}

fn sqlite_to_bool(value: i64) -> bool {
    value != 0
}

fn to_unix_seconds(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    let seconds = i64::try_from(duration.as_secs())
        .map_err(|_| storage_error_sqlite("unix timestamp seconds exceed i64 range"))?;
    Ok(seconds)
}

fn from_unix_seconds(value: i64) -> rusqlite::Result<SystemTime> {
    if value < 0 {
        return Err(storage_error_sqlite(
            "negative unix timestamps are not supported",
        ));
    }
    let seconds = u64::try_from(value)
        .map_err(|_| storage_error_sqlite("failed to convert unix timestamp to u64"))?;
    Ok(UNIX_EPOCH + Duration::from_secs(seconds))
}

fn i64_to_usize(value: i64) -> rusqlite::Result<usize> {
    usize::try_from(value).map_err(|_| storage_error_sqlite("row count out of usize range"))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> RegistryError {
    RegistryError::new(
        RegistryErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}
