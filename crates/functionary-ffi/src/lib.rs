use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use functionary_core::models::{
    Function, FunctionId, FunctionMetadata, NewFunction, Package, PackageId, RegistryError,
    RegistryErrorKind, RegistryResult,
};
use functionary_core::{RegistryConfig, VersionedFunctionRegistry};
use lazy_static::lazy_static;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const LOG_FILTER_ENV: &str = "FUNCTIONARY_LOG";

struct FunctionaryState {
    registry: Arc<VersionedFunctionRegistry>,
}

lazy_static! {
    static ref STATE: Mutex<Option<FunctionaryState>> = Mutex::new(None);
}

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

#[derive(Serialize)]
struct ErrorBody {
    kind: RegistryErrorKind,
    message: String,
}

#[derive(Serialize)]
struct Deleted {
    removed_functions: usize,
}

/// Initialize the registry once per process.
///
/// Pass a null `db_path` to take the database location from
/// `FUNCTIONARY_DATABASE_PATH` (or the built-in default).
///
/// # Safety
///
/// `db_path` must be null or a valid pointer to a NUL-terminated UTF-8 C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn functionary_init(db_path: *const c_char) -> bool {
    let mut state = STATE.lock().unwrap_or_else(PoisonError::into_inner);
    if state.is_some() {
        return true;
    }

    let mut config = RegistryConfig::from_env();
    if !db_path.is_null() {
        let c_str = unsafe { CStr::from_ptr(db_path) };
        match c_str.to_str() {
            Ok(path) => config.database_path = PathBuf::from(path),
            Err(_) => return false,
        }
    }

    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let registry = match VersionedFunctionRegistry::open(&config) {
        Ok(registry) => Arc::new(registry),
        Err(error) => {
            tracing::error!(
                database = %config.database_path.display(),
                kind = ?error.kind,
                detail = %error.message,
                "failed to open function registry"
            );
            return false;
        }
    };

    tracing::info!(database = %config.database_path.display(), "function registry ready");
    *state = Some(FunctionaryState { registry });
    true
}

/// # Safety
///
/// `name` must be a valid pointer to a NUL-terminated UTF-8 C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn functionary_create_package(name: *const c_char) -> *mut c_char {
    let name = unsafe { read_c_str(name, "name") };
    respond(with_registry(|registry| create_package(registry, name?)))
}

/// # Safety
///
/// `package_id` must be a valid pointer to a NUL-terminated UTF-8 C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn functionary_delete_package(package_id: *const c_char) -> *mut c_char {
    let package_id = unsafe { read_c_str(package_id, "package_id") };
    respond(with_registry(|registry| delete_package(registry, package_id?)))
}

/// Publish a function version from a JSON request
/// (`{"package_id", "name", "schema", "display_name"?, "description"?}`).
///
/// # Safety
///
/// `request_json` must be a valid pointer to a NUL-terminated UTF-8 C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn functionary_create_function(request_json: *const c_char) -> *mut c_char {
    let request_json = unsafe { read_c_str(request_json, "request_json") };
    respond(with_registry(|registry| {
        create_function(registry, request_json?)
    }))
}

/// # Safety
///
/// `function_id` must be a valid pointer to a NUL-terminated UTF-8 C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn functionary_deactivate_function(function_id: *const c_char) -> *mut c_char {
    let function_id = unsafe { read_c_str(function_id, "function_id") };
    respond(with_registry(|registry| {
        deactivate_function(registry, function_id?)
    }))
}

/// # Safety
///
/// Both arguments must be valid pointers to NUL-terminated UTF-8 C strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn functionary_update_function_metadata(
    function_id: *const c_char,
    metadata_json: *const c_char,
) -> *mut c_char {
    let function_id = unsafe { read_c_str(function_id, "function_id") };
    let metadata_json = unsafe { read_c_str(metadata_json, "metadata_json") };
    respond(with_registry(|registry| {
        update_function_metadata(registry, function_id?, metadata_json?)
    }))
}

/// # Safety
///
/// Both arguments must be valid pointers to NUL-terminated UTF-8 C strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn functionary_get_active_function(
    package_id: *const c_char,
    name: *const c_char,
) -> *mut c_char {
    let package_id = unsafe { read_c_str(package_id, "package_id") };
    let name = unsafe { read_c_str(name, "name") };
    respond(with_registry(|registry| {
        get_active_function(registry, package_id?, name?)
    }))
}

/// # Safety
///
/// Both arguments must be valid pointers to NUL-terminated UTF-8 C strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn functionary_list_function_versions(
    package_id: *const c_char,
    name: *const c_char,
) -> *mut c_char {
    let package_id = unsafe { read_c_str(package_id, "package_id") };
    let name = unsafe { read_c_str(name, "name") };
    respond(with_registry(|registry| {
        list_function_versions(registry, package_id?, name?)
    }))
}

/// Free a string previously returned by a `functionary_*` function.
///
/// # Safety
///
/// `s` must be a pointer previously returned by a `functionary_*` function, or null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn functionary_free_string(s: *mut c_char) {
    if s.is_null() {
        return;
    }
    unsafe {
        let _ = CString::from_raw(s);
    }
}

fn create_package(registry: &VersionedFunctionRegistry, name: &str) -> RegistryResult<Package> {
    registry.create_package(name)
}

fn delete_package(registry: &VersionedFunctionRegistry, package_id: &str) -> RegistryResult<Deleted> {
    let removed_functions = registry.delete(package_id.parse::<PackageId>()?)?;
    Ok(Deleted { removed_functions })
}

fn create_function(
    registry: &VersionedFunctionRegistry,
    request_json: &str,
) -> RegistryResult<Function> {
    let request: NewFunction = serde_json::from_str(request_json).map_err(|error| {
        RegistryError::validation(format!("function request is not valid json: {error}"))
    })?;
    registry.create(request)
}

fn deactivate_function(
    registry: &VersionedFunctionRegistry,
    function_id: &str,
) -> RegistryResult<Function> {
    registry.deactivate(function_id.parse::<FunctionId>()?)
}

fn update_function_metadata(
    registry: &VersionedFunctionRegistry,
    function_id: &str,
    metadata_json: &str,
) -> RegistryResult<Function> {
    let metadata: FunctionMetadata = serde_json::from_str(metadata_json).map_err(|error| {
        RegistryError::validation(format!("function metadata is not valid json: {error}"))
    })?;
    registry.update_metadata(function_id.parse::<FunctionId>()?, metadata)
}

fn get_active_function(
    registry: &VersionedFunctionRegistry,
    package_id: &str,
    name: &str,
) -> RegistryResult<Option<Function>> {
    registry.get_active(package_id.parse::<PackageId>()?, name)
}

fn list_function_versions(
    registry: &VersionedFunctionRegistry,
    package_id: &str,
    name: &str,
) -> RegistryResult<Vec<Function>> {
    registry.list_versions(package_id.parse::<PackageId>()?, name)
}

fn with_registry<T>(
    operation: impl FnOnce(&VersionedFunctionRegistry) -> RegistryResult<T>,
) -> RegistryResult<T> {
    // Clone out of the lock so one slow call does not block every other entry point.
    let registry = {
        let guard = STATE.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(state) => state.registry.clone(),
            None => {
                return Err(RegistryError::internal(
                    "functionary_init must be called before any other function",
                ));
            }
        }
    };
    operation(&registry)
}

unsafe fn read_c_str<'a>(ptr: *const c_char, field: &str) -> RegistryResult<&'a str> {
    if ptr.is_null() {
        return Err(RegistryError::validation(format!("'{field}' must not be null")));
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| RegistryError::validation(format!("'{field}' must be valid UTF-8")))
}

fn encode<T: Serialize>(result: RegistryResult<T>) -> String {
    let envelope = match result {
        Ok(data) => Envelope {
            ok: true,
            data: Some(data),
            error: None,
        },
        Err(error) => Envelope {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                kind: error.kind,
                message: error.message,
            }),
        },
    };

    serde_json::to_string(&envelope).unwrap_or_else(|error| {
        format!(
            r#"{{"ok":false,"error":{{"kind":"internal","message":"failed to encode response: {}"}}}}"#,
            error.to_string().replace('"', "'")
        )
    })
}

fn respond<T: Serialize>(result: RegistryResult<T>) -> *mut c_char {
    match CString::new(encode(result)) {
        Ok(c) => c.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}
