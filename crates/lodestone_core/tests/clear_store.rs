mod common;

use common::{book, library_config, library_model, loaded_storage, Book, Tag};
use lodestone_core::{LoadError, Storage};

#[test]
fn clear_empties_every_entity_type_durably() {
    let dir = tempfile::tempdir().unwrap();
    let storage = loaded_storage(dir.path());
    let context = storage.main_context().unwrap();

    for index in 0..3 {
        context.create(&book(&format!("b{index}"), index));
    }
    context.create(&Tag {
        label: "keep".to_string(),
    });
    context.save_chain().unwrap();

    storage.clear().unwrap().wait().unwrap();
    assert_eq!(context.count::<Book>(None).unwrap(), 0);
    assert_eq!(context.count::<Tag>(None).unwrap(), 0);

    drop(storage);
    let storage = loaded_storage(dir.path());
    let context = storage.main_context().unwrap();
    assert_eq!(context.count::<Book>(None).unwrap(), 0);
    assert_eq!(context.count::<Tag>(None).unwrap(), 0);
}

#[test]
fn clear_also_discards_unsaved_changes() {
    let dir = tempfile::tempdir().unwrap();
    let storage = loaded_storage(dir.path());
    let context = storage.main_context().unwrap();

    context.create(&book("Unsaved", 1));
    storage.clear().unwrap().wait().unwrap();
    assert_eq!(context.count::<Book>(None).unwrap(), 0);
}

#[test]
fn clear_before_load_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::with_model(&library_config(dir.path()), library_model()).unwrap();
    assert!(matches!(storage.clear(), Err(LoadError::NotLoaded)));
}
