use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use functionary_core::models::{Function, NewFunction, PackageId};
use functionary_core::{RegistryConfig, VersionedFunctionRegistry};
use serde_json::json;

fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("functionary-{test_name}-{nanos}.sqlite3"))
}

fn request(package_id: PackageId, worker: usize) -> NewFunction {
    NewFunction::new(
        package_id,
        "resize",
        json!({"openapi": "3.0.0", "x-worker": worker}),
    )
}

fn assert_single_active_history(versions: &[Function], expected_rows: usize) {
    assert_eq!(versions.len(), expected_rows);
    assert_eq!(
        versions.iter().filter(|function| function.active).count(),
        1,
        "exactly one version must remain active"
    );

    let mut numbers: Vec<u64> = versions.iter().map(|function| function.version).collect();
    numbers.sort_unstable();
    let expected: Vec<u64> = (1..=expected_rows as u64).collect();
    assert_eq!(numbers, expected, "versions must be gapless and unique");
    assert!(versions[0].active, "the newest version must be the active one");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_on_one_scope_leave_one_active_row() {
    let path = test_db_path("concurrent-sqlite");
    let registry = Arc::new(
        VersionedFunctionRegistry::open(&RegistryConfig::new(&path)).expect("registry should open"),
    );
    let package_id = registry.create_package("pkgA").unwrap().id;

    let mut handles = Vec::new();
    for worker in 0..2 {
        let registry = registry.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            registry.create(request(package_id, worker))
        }));
    }
    for handle in handles {
        handle.await.expect("worker panicked").expect("create should succeed");
    }

    let versions = registry.list_versions(package_id, "resize").unwrap();
    assert_single_active_history(&versions, 2);
    assert_eq!(
        registry.get_active(package_id, "resize").unwrap().map(|f| f.id),
        Some(versions[0].id)
    );

    let _ = std::fs::remove_file(path);
}

#[test]
fn separate_registries_on_one_database_stay_consistent() {
    // Each registry has its own lock arena, as separate processes would;
    // only the database transaction serializes them.
    let path = test_db_path("concurrent-processes");
    let config = RegistryConfig::new(&path);
    let seed = VersionedFunctionRegistry::open(&config).unwrap();
    let package_id = seed.create_package("pkgA").unwrap().id;

    let registries: Vec<VersionedFunctionRegistry> = (0..4)
        .map(|_| VersionedFunctionRegistry::open(&config).unwrap())
        .collect();

    thread::scope(|threads| {
        for (worker, registry) in registries.iter().enumerate() {
            threads.spawn(move || {
                for round in 0..3 {
                    registry
                        .create(request(package_id, worker * 10 + round))
                        .expect("create should succeed");
                }
            });
        }
    });

    let versions = seed.list_versions(package_id, "resize").unwrap();
    assert_single_active_history(&versions, 12);

    let _ = std::fs::remove_file(path);
}

#[test]
fn in_memory_registry_serializes_parallel_publishers() {
    let registry = VersionedFunctionRegistry::in_memory();
    let first = registry.create_package("pkgA").unwrap().id;
    let second = registry.create_package("pkgB").unwrap().id;

    thread::scope(|threads| {
        for worker in 0..8 {
            let registry = &registry;
            threads.spawn(move || {
                let package_id = if worker % 2 == 0 { first } else { second };
                for round in 0..5 {
                    registry
                        .create(request(package_id, worker * 10 + round))
                        .expect("create should succeed");
                }
            });
        }
    });

    assert_single_active_history(&registry.list_versions(first, "resize").unwrap(), 20);
    assert_single_active_history(&registry.list_versions(second, "resize").unwrap(), 20);
}
