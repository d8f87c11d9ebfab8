pub mod in_memory;

pub use in_memory::InMemoryStore;

use std::time::SystemTime;

use crate::models::{
    Function, FunctionId, FunctionMetadata, FunctionScope, NewFunction, Package, PackageId,
    RegistryError,
};

pub type PersistenceResult<T> = Result<T, RegistryError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

pub trait PackageStore: Send + Sync {
    fn insert_package(&self, package: &Package) -> PersistenceResult<()>;

    fn package(&self, package_id: PackageId) -> PersistenceResult<Option<Package>>;

    /// Removes the package together with every function it owns.
    ///
    /// Returns the number of functions removed, or `None` when the package
    /// does not exist.
    fn delete_package(&self, package_id: PackageId) -> PersistenceResult<Option<usize>>;
}

pub trait FunctionStore: Send + Sync {
    /// Stores `request` as the newest, active version of its scope.
    ///
    /// Any previously active function in the same scope is deactivated in the
    /// same unit of work. Fails with `NotFound` when the package is unknown.
    fn publish_function(
        &self,
        function_id: FunctionId,
        request: &NewFunction,
        published_at: SystemTime,
    ) -> PersistenceResult<Function>;

    fn function(&self, function_id: FunctionId) -> PersistenceResult<Option<Function>>;

    fn deactivate_function(&self, function_id: FunctionId) -> PersistenceResult<Option<Function>>;

    fn update_function_metadata(
        &self,
        function_id: FunctionId,
        metadata: &FunctionMetadata,
    ) -> PersistenceResult<Option<Function>>;

    /// Every row flagged active for the scope. More than one row means the
    /// store is corrupted; callers must not pick one.
    fn active_functions(&self, scope: &FunctionScope) -> PersistenceResult<Vec<Function>>;

    /// All versions for the scope, newest first.
    fn list_versions(&self, scope: &FunctionScope) -> PersistenceResult<Vec<Function>>;
}
