//! Work-type registry
//!
//! An explicit, startup-populated map from `work_type` string to a loader
//! that reconstructs the typed payload from its stored fields. Any node
//! can rebuild the correct type from the `work_type` column alone.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::work_item::{AnyWorkItem, WorkItem, WorkItemWrapper};

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No loader registered for this work type
    #[error("unknown work type: {0}")]
    UnknownWorkType(String),

    /// Stored fields did not deserialize into the registered type
    #[error("work item fields for {work_type} failed to deserialize: {message}")]
    Deserialize { work_type: String, message: String },
}

type Loader = Arc<dyn Fn(Value) -> Result<Box<dyn AnyWorkItem>, RegistryError> + Send + Sync>;

/// Map from work-type key to payload loader.
#[derive(Clone, Default)]
pub struct WorkItemRegistry {
    loaders: HashMap<String, Loader>,
}

impl WorkItemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed work item.
    pub fn register<W: WorkItem>(&mut self) {
        self.loaders.insert(
            W::WORK_TYPE.to_string(),
            Arc::new(|fields| {
                let item: W =
                    serde_json::from_value(fields).map_err(|e| RegistryError::Deserialize {
                        work_type: W::WORK_TYPE.to_string(),
                        message: e.to_string(),
                    })?;
                Ok(Box::new(WorkItemWrapper { inner: item }))
            }),
        );
    }

    /// Register a custom loader for a work type.
    ///
    /// Useful when reconstructing the item needs more than its stored
    /// fields, e.g. handles captured at startup.
    pub fn register_loader<F>(&mut self, work_type: impl Into<String>, loader: F)
    where
        F: Fn(Value) -> Result<Box<dyn AnyWorkItem>, RegistryError> + Send + Sync + 'static,
    {
        self.loaders.insert(work_type.into(), Arc::new(loader));
    }

    /// Reconstruct a typed payload from its stored fields.
    pub fn load(&self, work_type: &str, fields: Value) -> Result<Box<dyn AnyWorkItem>, RegistryError> {
        let loader = self
            .loaders
            .get(work_type)
            .ok_or_else(|| RegistryError::UnknownWorkType(work_type.to_string()))?;
        loader(fields)
    }

    pub fn contains(&self, work_type: &str) -> bool {
        self.loaders.contains_key(work_type)
    }

    /// Registered work types, in no particular order.
    pub fn work_types(&self) -> Vec<&str> {
        self.loaders.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_item::{WorkContext, WorkError};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct RenameLabel {
        label: String,
    }

    #[async_trait]
    impl WorkItem for RenameLabel {
        const WORK_TYPE: &'static str = "rename_label";

        async fn do_work(&self, _ctx: &WorkContext) -> Result<(), WorkError> {
            Ok(())
        }
    }

    #[test]
    fn load_reconstructs_registered_type() {
        let mut registry = WorkItemRegistry::new();
        registry.register::<RenameLabel>();

        let item = registry
            .load("rename_label", serde_json::json!({"label": "x"}))
            .unwrap();
        assert_eq!(item.work_type(), "rename_label");
    }

    #[test]
    fn unknown_work_type_is_an_error() {
        // `.err()` rather than `.unwrap_err()`: the success value is a
        // type-erased box with no Debug impl.
        let registry = WorkItemRegistry::new();
        let err = registry.load("missing", serde_json::json!({})).err().unwrap();
        assert!(matches!(err, RegistryError::UnknownWorkType(_)));
    }

    #[test]
    fn bad_fields_are_a_deserialize_error() {
        let mut registry = WorkItemRegistry::new();
        registry.register::<RenameLabel>();
        let err = registry
            .load("rename_label", serde_json::json!({"wrong": 1}))
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::Deserialize { .. }));
    }
}
