//! Shared fixture: a two-entity library model with typed records.

#![allow(dead_code)]

use lodestone_core::{
    AttrKind, AttrMap, AttributeDef, EntityDef, Model, Record, RecordError, Storage,
    StorageConfig, Value,
};
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct Book {
    pub title: String,
    pub pages: i64,
    pub rating: Option<f64>,
}

impl Record for Book {
    fn entity_name() -> &'static str {
        "Book"
    }

    fn to_attrs(&self) -> AttrMap {
        let mut attrs = AttrMap::from([
            ("title".to_string(), Value::from(self.title.clone())),
            ("pages".to_string(), Value::from(self.pages)),
        ]);
        if let Some(rating) = self.rating {
            attrs.insert("rating".to_string(), Value::from(rating));
        }
        attrs
    }

    fn from_attrs(attrs: &AttrMap) -> Result<Self, RecordError> {
        let title = attrs
            .get("title")
            .and_then(|value| value.as_text())
            .ok_or(RecordError::Missing("title"))?
            .to_string();
        let pages = attrs
            .get("pages")
            .and_then(|value| value.as_int())
            .ok_or(RecordError::Missing("pages"))?;
        let rating = attrs.get("rating").and_then(|value| value.as_real());
        Ok(Self {
            title,
            pages,
            rating,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub label: String,
}

impl Record for Tag {
    fn entity_name() -> &'static str {
        "Tag"
    }

    fn to_attrs(&self) -> AttrMap {
        AttrMap::from([("label".to_string(), Value::from(self.label.clone()))])
    }

    fn from_attrs(attrs: &AttrMap) -> Result<Self, RecordError> {
        let label = attrs
            .get("label")
            .and_then(|value| value.as_text())
            .ok_or(RecordError::Missing("label"))?
            .to_string();
        Ok(Self { label })
    }
}

pub fn library_model() -> Model {
    Model::new(vec![
        EntityDef::new(
            "Book",
            vec![
                AttributeDef::required("title", AttrKind::Text),
                AttributeDef::required("pages", AttrKind::Int),
                AttributeDef::optional("rating", AttrKind::Real),
            ],
        ),
        EntityDef::new("Tag", vec![AttributeDef::required("label", AttrKind::Text)]),
    ])
    .unwrap()
}

pub fn library_config(data_dir: &Path) -> StorageConfig {
    let mut config = StorageConfig::new("Library", data_dir, data_dir);
    config.attach_async = false;
    config
}

/// A storage over `data_dir`, loaded synchronously and ready to use.
pub fn loaded_storage(data_dir: &Path) -> Storage {
    let storage = Storage::with_model(&library_config(data_dir), library_model()).unwrap();
    storage.load().wait().unwrap();
    storage
}

pub fn book(title: &str, pages: i64) -> Book {
    Book {
        title: title.to_string(),
        pages,
        rating: None,
    }
}
