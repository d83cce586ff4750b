use serde::Serialize;

/// Crate-wide error type. Every fallible function returns `Result<T, AppError>`.
///
/// The pipeline matches on the variant to decide between retrying next cycle,
/// skipping the current event, and aborting a plan.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Log store, persistent store or control plane could not be reached.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// The plan generator returned invalid or incomplete data.
    #[error("Plan generation error: {0}")]
    Generation(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Process spawn error: {0}")]
    ProcessSpawn(String),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Stable snake_case tag, used in structured logs and persisted failure reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database",
            AppError::Pool(_) => "pool",
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Serde(_) => "serde",
            AppError::Yaml(_) => "yaml",
            AppError::Connectivity(_) => "connectivity",
            AppError::Generation(_) => "generation",
            AppError::Execution(_) => "execution",
            AppError::ProcessSpawn(_) => "process_spawn",
            AppError::Internal(_) => "internal",
        }
    }

    /// Errors that should end the current cycle's work and be retried on the
    /// next poll rather than within the current one.
    pub fn is_retryable_next_cycle(&self) -> bool {
        matches!(
            self,
            AppError::Connectivity(_) | AppError::Pool(_) | AppError::Database(_)
        )
    }
}

/// Serialized as `{ error: "...", kind: "..." }` when embedded in execution traces.
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("error", &self.to_string())?;
        s.serialize_field("kind", self.kind())?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_is_retryable() {
        assert!(AppError::Connectivity("es down".into()).is_retryable_next_cycle());
        assert!(!AppError::Generation("bad json".into()).is_retryable_next_cycle());
        assert!(!AppError::Validation("x".into()).is_retryable_next_cycle());
    }

    #[test]
    fn test_serialize_shape() {
        let err = AppError::Generation("missing commands".into());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "generation");
        assert_eq!(json["error"], "Plan generation error: missing commands");
    }
}
