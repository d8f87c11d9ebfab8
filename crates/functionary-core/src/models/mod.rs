pub mod error;
pub mod function;
pub mod package;

pub use error::{RegistryError, RegistryErrorKind, RegistryResult};
pub use function::{
    Function, FunctionId, FunctionMetadata, FunctionScope, NewFunction, validate_function_name,
};
pub use package::{Package, PackageId, validate_package_name};

/// Upper bound, in characters, for package names, function names and display names.
pub const NAME_MAX_CHARS: usize = 64;
