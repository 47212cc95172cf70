use crate::config::ClusterConfig;
use shared::{Schema, SchemaError};
use std::path::Path;
use std::sync::Arc;

/// Everything a service needs that is decided once at startup.
///
/// Built in `main` and cloned into each service instead of reaching for
/// process-wide globals.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub schema: Arc<Schema>,
    pub config: ClusterConfig,
}

impl AppContext {
    pub fn new(schema: Schema, config: ClusterConfig) -> Self {
        Self {
            schema: Arc::new(schema),
            config,
        }
    }

    /// Context with the built-in schema and default configuration.
    pub fn builtin() -> Result<Self, SchemaError> {
        Ok(Self::new(Schema::builtin()?, ClusterConfig::default()))
    }

    /// Loads a schema from a JSON file.
    pub fn load_schema(path: &Path) -> Result<Schema, Box<dyn std::error::Error>> {
        let json = std::fs::read_to_string(path)?;
        Ok(Schema::from_json_str(&json)?)
    }
}
