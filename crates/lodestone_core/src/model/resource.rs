//! Model resource resolution.
//!
//! # Responsibility
//! - Load a named model definition from a resource directory, the way the
//!   store facade resolves its schema at construction time.
//!
//! # Invariants
//! - Resolution failures surface as `None`; the cause is logged, never
//!   silently dropped and never returned as an error value.

use super::{EntityDef, Model};
use log::{error, info};
use serde::Deserialize;
use std::path::Path;

/// File name suffix for model resources: `<name>.model.json`.
pub const MODEL_RESOURCE_EXT: &str = "model.json";

#[derive(Debug, Deserialize)]
struct ModelResource {
    entities: Vec<EntityDef>,
}

impl Model {
    /// Resolves the model definition named `name` from `resource_dir`.
    ///
    /// Looks for `<resource_dir>/<name>.model.json` and validates the
    /// parsed definition. Returns `None` when the file is missing,
    /// unreadable, unparsable or invalid as a model.
    pub fn from_resource(name: &str, resource_dir: &Path) -> Option<Self> {
        let path = resource_dir.join(format!("{name}.{MODEL_RESOURCE_EXT}"));
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) => {
                error!(
                    "event=model_resource module=model status=error path={} error={err}",
                    path.display()
                );
                return None;
            }
        };
        let resource: ModelResource = match serde_json::from_str(&raw) {
            Ok(resource) => resource,
            Err(err) => {
                error!(
                    "event=model_resource module=model status=error path={} error={err}",
                    path.display()
                );
                return None;
            }
        };
        let model = Model::new(resource.entities)?;
        info!(
            "event=model_resource module=model status=ok path={} entities={}",
            path.display(),
            model.entities().len()
        );
        Some(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttrKind;

    #[test]
    fn loads_and_validates_a_model_resource() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("Library.model.json"),
            r#"{
                "entities": [
                    {
                        "name": "Book",
                        "attributes": [
                            { "name": "title", "kind": "text" },
                            { "name": "pages", "kind": "int", "optional": true }
                        ]
                    }
                ]
            }"#,
        )
        .unwrap();

        let model = Model::from_resource("Library", dir.path()).unwrap();
        let book = model.entity("Book").unwrap();
        assert_eq!(book.attributes.len(), 2);
        assert_eq!(book.attribute("title").unwrap().kind, AttrKind::Text);
        assert!(book.attribute("pages").unwrap().optional);
    }

    #[test]
    fn missing_or_malformed_resources_resolve_to_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Model::from_resource("Absent", dir.path()).is_none());

        std::fs::write(dir.path().join("Broken.model.json"), "not json").unwrap();
        assert!(Model::from_resource("Broken", dir.path()).is_none());
    }
}
