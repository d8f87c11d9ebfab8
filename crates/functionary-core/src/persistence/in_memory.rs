use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use crate::models::{
    Function, FunctionId, FunctionMetadata, FunctionScope, NewFunction, Package, PackageId,
    RegistryError, RegistryErrorKind,
};
use crate::persistence::{FunctionStore, PackageStore, PersistenceResult};

/// Process-local store that keeps the same guarantees as the SQLite store:
/// every write happens under one lock, so publish and deactivate are atomic.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    packages: HashMap<PackageId, Package>,
    functions: HashMap<FunctionId, Function>,
    // oldest first
    versions: HashMap<FunctionScope, Vec<FunctionId>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> PersistenceResult<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| RegistryError::internal("in-memory store mutex poisoned"))
    }

    /// Flips the active flag without any scope bookkeeping, simulating a
    /// corrupted backing store.
    #[cfg(test)]
    pub(crate) fn force_active(&self, function_id: FunctionId) {
        let mut state = self.state.lock().unwrap();
        if let Some(function) = state.functions.get_mut(&function_id) {
            function.active = true;
        }
    }
}

impl StoreState {
    fn scope_functions(&self, scope: &FunctionScope) -> impl Iterator<Item = &Function> {
        self.versions
            .get(scope)
            .into_iter()
            .flat_map(|ids| ids.iter().rev())
            .filter_map(|id| self.functions.get(id))
    }
}

impl PackageStore for InMemoryStore {
    fn insert_package(&self, package: &Package) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        if state.packages.contains_key(&package.id) {
            return Err(RegistryError::new(
                RegistryErrorKind::Conflict,
                format!("package '{}' already exists", package.id),
            ));
        }
        state.packages.insert(package.id, package.clone());
        Ok(())
    }

    fn package(&self, package_id: PackageId) -> PersistenceResult<Option<Package>> {
        Ok(self.lock_state()?.packages.get(&package_id).cloned())
    }

    fn delete_package(&self, package_id: PackageId) -> PersistenceResult<Option<usize>> {
        let mut state = self.lock_state()?;
        if state.packages.remove(&package_id).is_none() {
            return Ok(None);
        }

        let scopes: Vec<FunctionScope> = state
            .versions
            .keys()
            .filter(|scope| scope.package_id == package_id)
            .cloned()
            .collect();

        let mut removed = 0;
        for scope in scopes {
            let function_ids = state.versions.remove(&scope).unwrap_or_default();
            for function_id in function_ids {
                if state.functions.remove(&function_id).is_some() {
                    removed += 1;
                }
            }
        }

        Ok(Some(removed))
    }
}

impl FunctionStore for InMemoryStore {
    fn publish_function(
        &self,
        function_id: FunctionId,
        request: &NewFunction,
        published_at: SystemTime,
    ) -> PersistenceResult<Function> {
        let mut state = self.lock_state()?;
        if !state.packages.contains_key(&request.package_id) {
            return Err(RegistryError::package_not_found(request.package_id));
        }
        if state.functions.contains_key(&function_id) {
            return Err(RegistryError::new(
                RegistryErrorKind::Conflict,
                format!("function '{function_id}' already exists"),
            ));
        }

        let scope = request.scope();
        let previous: Vec<FunctionId> = state.versions.get(&scope).cloned().unwrap_or_default();
        let mut next_version = 1;
        for id in &previous {
            if let Some(function) = state.functions.get_mut(id) {
                function.active = false;
                next_version = next_version.max(function.version + 1);
            }
        }

        let function = Function {
            id: function_id,
            package_id: request.package_id,
            name: request.name.clone(),
            version: next_version,
            display_name: request.display_name.clone(),
            description: request.description.clone(),
            schema: request.schema.clone(),
            active: true,
            created_at: published_at,
        };
        state.functions.insert(function_id, function.clone());
        state.versions.entry(scope).or_default().push(function_id);

        Ok(function)
    }

    fn function(&self, function_id: FunctionId) -> PersistenceResult<Option<Function>> {
        Ok(self.lock_state()?.functions.get(&function_id).cloned())
    }

    fn deactivate_function(&self, function_id: FunctionId) -> PersistenceResult<Option<Function>> {
        let mut state = self.lock_state()?;
        Ok(state.functions.get_mut(&function_id).map(|function| {
            function.active = false;
            function.clone()
        }))
    }

    fn update_function_metadata(
        &self,
        function_id: FunctionId,
        metadata: &FunctionMetadata,
    ) -> PersistenceResult<Option<Function>> {
        let mut state = self.lock_state()?;
        Ok(state.functions.get_mut(&function_id).map(|function| {
            function.display_name = metadata.display_name.clone();
            function.description = metadata.description.clone();
            function.clone()
        }))
    }

    fn active_functions(&self, scope: &FunctionScope) -> PersistenceResult<Vec<Function>> {
        let state = self.lock_state()?;
        Ok(state
            .scope_functions(scope)
            .filter(|function| function.active)
            .cloned()
            .collect())
    }

    fn list_versions(&self, scope: &FunctionScope) -> PersistenceResult<Vec<Function>> {
        let state = self.lock_state()?;
        Ok(state.scope_functions(scope).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn store_with_package() -> (InMemoryStore, PackageId) {
        let store = InMemoryStore::new();
        let package = Package {
            id: PackageId::generate(),
            name: "imaging".to_string(),
            created_at: SystemTime::UNIX_EPOCH,
        };
        store.insert_package(&package).unwrap();
        (store, package.id)
    }

    #[test]
    fn publish_assigns_sequential_versions_and_single_active_row() {
        let (store, package_id) = store_with_package();
        let request = NewFunction::new(package_id, "resize", json!({"openapi": "3.0.0"}));

        let first = store
            .publish_function(FunctionId::generate(), &request, SystemTime::UNIX_EPOCH)
            .unwrap();
        let second = store
            .publish_function(FunctionId::generate(), &request, SystemTime::UNIX_EPOCH)
            .unwrap();

        assert_eq!((first.version, second.version), (1, 2));
        let active = store.active_functions(&request.scope()).unwrap();
        assert_eq!(active, vec![second]);
    }

    #[test]
    fn publish_rejects_unknown_package() {
        let store = InMemoryStore::new();
        let request = NewFunction::new(PackageId::generate(), "resize", json!({"a": 1}));
        let error = store
            .publish_function(FunctionId::generate(), &request, SystemTime::UNIX_EPOCH)
            .unwrap_err();
        assert_eq!(error.kind, RegistryErrorKind::NotFound);
    }

    #[test]
    fn delete_package_reports_removed_function_count() {
        let (store, package_id) = store_with_package();
        for name in ["resize", "resize", "crop"] {
            let request = NewFunction::new(package_id, name, json!({"a": 1}));
            store
                .publish_function(FunctionId::generate(), &request, SystemTime::UNIX_EPOCH)
                .unwrap();
        }

        assert_eq!(store.delete_package(package_id).unwrap(), Some(3));
        assert_eq!(store.delete_package(package_id).unwrap(), None);
        assert!(
            store
                .list_versions(&FunctionScope::new(package_id, "resize"))
                .unwrap()
                .is_empty()
        );
    }
}
