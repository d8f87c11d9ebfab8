use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{NAME_MAX_CHARS, RegistryError, RegistryResult};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageId(pub Uuid);

impl PackageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for PackageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PackageId {
    type Err = RegistryError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(raw.trim())
            .map(Self)
            .map_err(|_| RegistryError::validation(format!("'{raw}' is not a valid package id")))
    }
}

/// Scoping container that owns a set of named functions.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub id: PackageId,
    pub name: String,
    pub created_at: SystemTime,
}

pub fn validate_package_name(name: &str) -> RegistryResult<()> {
    if name.trim().is_empty() {
        return Err(RegistryError::validation("package name must not be empty"));
    }
    if name.chars().count() > NAME_MAX_CHARS {
        return Err(RegistryError::validation(format!(
            "package name must be at most {NAME_MAX_CHARS} characters"
        )));
    }
    Ok(())
}
