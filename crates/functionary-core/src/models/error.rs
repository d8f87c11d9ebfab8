use serde::Serialize;
use thiserror::Error;

use crate::models::{FunctionId, FunctionScope, PackageId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryErrorKind {
    NotFound,
    Validation,
    Conflict,
    InvariantViolation,
    StorageFailure,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct RegistryError {
    pub kind: RegistryErrorKind,
    pub message: String,
}

impl RegistryError {
    pub fn new(kind: RegistryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(RegistryErrorKind::Validation, message)
    }

    pub fn package_not_found(package_id: PackageId) -> Self {
        Self::new(
            RegistryErrorKind::NotFound,
            format!("package '{package_id}' does not exist"),
        )
    }

    pub fn function_not_found(function_id: FunctionId) -> Self {
        Self::new(
            RegistryErrorKind::NotFound,
            format!("function '{function_id}' does not exist"),
        )
    }

    pub fn conflict(scope: &FunctionScope, detail: impl AsRef<str>) -> Self {
        Self::new(
            RegistryErrorKind::Conflict,
            format!("concurrent activation for {scope}: {}", detail.as_ref()),
        )
    }

    pub fn multiple_active(scope: &FunctionScope, active_count: usize) -> Self {
        Self::new(
            RegistryErrorKind::InvariantViolation,
            format!("{active_count} active functions found for {scope}; expected at most one"),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RegistryErrorKind::Internal, message)
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;
