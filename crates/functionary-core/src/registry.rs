use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::RegistryConfig;
use crate::models::{
    Function, FunctionId, FunctionMetadata, FunctionScope, NewFunction, Package, PackageId,
    RegistryError, RegistryErrorKind, RegistryResult, validate_package_name,
};
use crate::persistence::{FunctionStore, InMemoryStore, PackageStore};
use crate::scope_lock::ScopeLocks;
use crate::sqlite::SqliteStore;

/// Owns the lifecycle of published functions.
///
/// Each `(package, name)` scope keeps its full publish history, and at most
/// one row per scope is active. Publishing and deactivating run under the
/// scope's lock and inside a single storage transaction.
pub struct VersionedFunctionRegistry {
    packages: Arc<dyn PackageStore>,
    functions: Arc<dyn FunctionStore>,
    scope_locks: ScopeLocks,
}

impl VersionedFunctionRegistry {
    pub fn new(packages: Arc<dyn PackageStore>, functions: Arc<dyn FunctionStore>) -> Self {
        Self {
            packages,
            functions,
            scope_locks: ScopeLocks::new(),
        }
    }

    pub fn with_store<S>(store: Arc<S>) -> Self
    where
        S: PackageStore + FunctionStore + 'static,
    {
        Self::new(store.clone(), store)
    }

    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(InMemoryStore::new()))
    }

    /// Opens the SQLite store described by `config` and brings its schema up to date.
    pub fn open(config: &RegistryConfig) -> RegistryResult<Self> {
        let store = Arc::new(SqliteStore::from_config(config));
        store.migrate_to_latest()?;
        Ok(Self::with_store(store))
    }

    pub fn create_package(&self, name: &str) -> RegistryResult<Package> {
        validate_package_name(name)?;
        let package = Package {
            id: PackageId::generate(),
            name: name.to_string(),
            created_at: now_whole_seconds(),
        };
        self.packages.insert_package(&package)?;

        tracing::info!(package_id = %package.id, name = %package.name, "created package");
        Ok(package)
    }

    pub fn package(&self, package_id: PackageId) -> RegistryResult<Package> {
        self.packages
            .package(package_id)?
            .ok_or_else(|| RegistryError::package_not_found(package_id))
    }

    /// Publishes a new version of `request.name` under its package.
    ///
    /// The new row is active; whichever row was active before is deactivated
    /// in the same transaction.
    pub fn create(&self, request: NewFunction) -> RegistryResult<Function> {
        request.validate()?;
        let scope = request.scope();

        let published = self.scope_locks.with_scope(&scope, || {
            self.functions
                .publish_function(FunctionId::generate(), &request, now_whole_seconds())
        })?;

        match published {
            Ok(function) => {
                tracing::info!(
                    package_id = %function.package_id,
                    name = %function.name,
                    function_id = %function.id,
                    version = function.version,
                    "published function version"
                );
                Ok(function)
            }
            Err(error) if error.kind == RegistryErrorKind::Conflict => {
                tracing::warn!(
                    package_id = %scope.package_id,
                    name = %scope.name,
                    detail = %error.message,
                    "function publish lost an activation race"
                );
                Err(RegistryError::conflict(&scope, error.message))
            }
            Err(error) => Err(error),
        }
    }

    /// Marks the function inactive. Already inactive functions are returned as-is.
    pub fn deactivate(&self, function_id: FunctionId) -> RegistryResult<Function> {
        let current = self.function(function_id)?;
        if !current.active {
            return Ok(current);
        }

        let scope = current.scope();
        let deactivated = self
            .scope_locks
            .with_scope(&scope, || self.functions.deactivate_function(function_id))??
            .ok_or_else(|| RegistryError::function_not_found(function_id))?;

        tracing::info!(
            package_id = %scope.package_id,
            name = %scope.name,
            function_id = %function_id,
            version = deactivated.version,
            "deactivated function"
        );
        Ok(deactivated)
    }

    /// The function currently eligible for invocation in the scope, if any.
    ///
    /// More than one active row is reported as `InvariantViolation` instead of
    /// being resolved.
    pub fn get_active(&self, package_id: PackageId, name: &str) -> RegistryResult<Option<Function>> {
        let scope = FunctionScope::new(package_id, name);
        let mut active = self.functions.active_functions(&scope)?;

        match active.len() {
            0 => Ok(None),
            1 => Ok(active.pop()),
            count => {
                let function_ids: Vec<FunctionId> =
                    active.iter().map(|function| function.id).collect();
                tracing::error!(
                    package_id = %scope.package_id,
                    name = %scope.name,
                    active_count = count,
                    function_ids = ?function_ids,
                    "multiple active functions found for one scope"
                );
                Err(RegistryError::multiple_active(&scope, count))
            }
        }
    }

    /// Every version published for the scope, newest first.
    pub fn list_versions(&self, package_id: PackageId, name: &str) -> RegistryResult<Vec<Function>> {
        self.functions
            .list_versions(&FunctionScope::new(package_id, name))
    }

    /// Deletes the package and every function it owns, returning how many
    /// functions were removed.
    pub fn delete(&self, package_id: PackageId) -> RegistryResult<usize> {
        let removed = self
            .packages
            .delete_package(package_id)?
            .ok_or_else(|| RegistryError::package_not_found(package_id))?;

        tracing::info!(
            package_id = %package_id,
            removed_functions = removed,
            "deleted package"
        );
        Ok(removed)
    }

    pub fn function(&self, function_id: FunctionId) -> RegistryResult<Function> {
        self.functions
            .function(function_id)?
            .ok_or_else(|| RegistryError::function_not_found(function_id))
    }

    /// Replaces the descriptive fields of a function. Identity, schema and the
    /// active flag are not reachable through this path.
    pub fn update_metadata(
        &self,
        function_id: FunctionId,
        metadata: FunctionMetadata,
    ) -> RegistryResult<Function> {
        metadata.validate()?;
        let updated = self
            .functions
            .update_function_metadata(function_id, &metadata)?
            .ok_or_else(|| RegistryError::function_not_found(function_id))?;

        tracing::debug!(function_id = %function_id, "updated function metadata");
        Ok(updated)
    }
}

// Stored timestamps have one-second resolution; both stores see the same value.
fn now_whole_seconds() -> SystemTime {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    UNIX_EPOCH + Duration::from_secs(seconds)
}
