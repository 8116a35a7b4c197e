//! CLI smoke entry point.
//!
//! # Responsibility
//! - Provide a minimal executable to verify `lodestone_core` linkage:
//!   load a throwaway store, write a few records, read them back.
//! - Keep output deterministic for quick local sanity checks.

use lodestone_core::{
    AttrKind, AttrMap, AttributeDef, EntityDef, FetchRequest, Model, Predicate, Record,
    RecordError, SortSpec, Storage, StorageConfig, Value,
};

#[derive(Debug, Clone)]
struct Note {
    text: String,
}

impl Record for Note {
    fn entity_name() -> &'static str {
        "Note"
    }

    fn to_attrs(&self) -> AttrMap {
        AttrMap::from([("text".to_string(), Value::from(self.text.clone()))])
    }

    fn from_attrs(attrs: &AttrMap) -> Result<Self, RecordError> {
        let text = attrs
            .get("text")
            .and_then(|value| value.as_text())
            .ok_or(RecordError::Missing("text"))?;
        Ok(Self {
            text: text.to_string(),
        })
    }
}

fn note_model() -> Model {
    Model::new(vec![EntityDef::new(
        "Note",
        vec![AttributeDef::required("text", AttrKind::Text)],
    )])
    .unwrap_or_else(|| unreachable!("static model definition is valid"))
}

fn main() {
    println!("lodestone_core version={}", lodestone_core::core_version());

    let data_dir = std::env::temp_dir().join(format!("lodestone-cli-{}", std::process::id()));
    let mut config = StorageConfig::new("Smoke", &data_dir, &data_dir);
    config.blank = true;
    config.attach_async = false;

    let Some(storage) = Storage::with_model(&config, note_model()) else {
        eprintln!("error: could not configure storage at {}", data_dir.display());
        std::process::exit(1);
    };
    if let Err(err) = storage.load().wait() {
        eprintln!("error: load failed: {err}");
        std::process::exit(1);
    }

    let context = match storage.main_context() {
        Ok(context) => context,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    };

    for index in 1..=3 {
        context.create(&Note {
            text: format!("note {index}"),
        });
    }
    if let Err(err) = context.async_save().wait() {
        eprintln!("error: save failed: {err}");
        std::process::exit(1);
    }

    let request = FetchRequest::matching(Predicate::contains("text", "note"))
        .sorted_by(vec![SortSpec::asc("text")]);
    match context.fetch::<Note>(&request) {
        Ok(found) => {
            println!("notes={}", found.len());
            for item in found {
                println!("note id={:?} text={}", item.id, item.record.text);
            }
        }
        Err(err) => {
            eprintln!("error: fetch failed: {err}");
            std::process::exit(1);
        }
    }

    match storage.clear().map(|task| task.wait()) {
        Ok(Ok(())) => println!("cleared=true"),
        Ok(Err(err)) => eprintln!("error: clear failed: {err}"),
        Err(err) => eprintln!("error: {err}"),
    }

    let _ = std::fs::remove_dir_all(&data_dir);
}
