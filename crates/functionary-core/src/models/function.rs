use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{NAME_MAX_CHARS, PackageId, RegistryError, RegistryResult};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionId(pub Uuid);

impl FunctionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for FunctionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FunctionId {
    type Err = RegistryError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(raw.trim())
            .map(Self)
            .map_err(|_| RegistryError::validation(format!("'{raw}' is not a valid function id")))
    }
}

/// The `(package, name)` pair that the single-active rule is keyed on.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct FunctionScope {
    pub package_id: PackageId,
    pub name: String,
}

impl FunctionScope {
    pub fn new(package_id: PackageId, name: impl Into<String>) -> Self {
        Self {
            package_id,
            name: name.into(),
        }
    }
}

impl Display for FunctionScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}/{}'", self.package_id, self.name)
    }
}

/// A published, invocable unit of work.
///
/// Every publish of a scope creates a new row with the next `version`.
/// Older rows are kept as inactive history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub id: FunctionId,
    pub package_id: PackageId,
    pub name: String,
    pub version: u64,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub schema: Value,
    pub active: bool,
    pub created_at: SystemTime,
}

impl Function {
    pub fn scope(&self) -> FunctionScope {
        FunctionScope::new(self.package_id, self.name.clone())
    }
}

impl Display for Function {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Input for publishing a new function version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewFunction {
    pub package_id: PackageId,
    pub name: String,
    pub schema: Value,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl NewFunction {
    pub fn new(package_id: PackageId, name: impl Into<String>, schema: Value) -> Self {
        Self {
            package_id,
            name: name.into(),
            schema,
            display_name: None,
            description: None,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn scope(&self) -> FunctionScope {
        FunctionScope::new(self.package_id, self.name.clone())
    }

    pub fn validate(&self) -> RegistryResult<()> {
        validate_function_name(&self.name)?;
        validate_display_name(self.display_name.as_deref())?;
        validate_schema(&self.schema)
    }
}

/// Descriptive fields that may change after a function is published.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct FunctionMetadata {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl FunctionMetadata {
    pub fn validate(&self) -> RegistryResult<()> {
        validate_display_name(self.display_name.as_deref())
    }
}

pub fn validate_function_name(name: &str) -> RegistryResult<()> {
    if name.trim().is_empty() {
        return Err(RegistryError::validation("function name must not be empty"));
    }
    if name.chars().count() > NAME_MAX_CHARS {
        return Err(RegistryError::validation(format!(
            "function name must be at most {NAME_MAX_CHARS} characters"
        )));
    }
    Ok(())
}

fn validate_display_name(display_name: Option<&str>) -> RegistryResult<()> {
    match display_name {
        Some(value) if value.chars().count() > NAME_MAX_CHARS => {
            Err(RegistryError::validation(format!(
                "display name must be at most {NAME_MAX_CHARS} characters"
            )))
        }
        _ => Ok(()),
    }
}

// Only the outer shape is checked here; the document itself is opaque.
fn validate_schema(schema: &Value) -> RegistryResult<()> {
    match schema {
        Value::Object(fields) if !fields.is_empty() => Ok(()),
        Value::Object(_) => Err(RegistryError::validation("schema must not be empty")),
        Value::Null => Err(RegistryError::validation("schema is required")),
        _ => Err(RegistryError::validation("schema must be a JSON object")),
    }
}
