mod common;

use common::{book, loaded_storage, Book};
use lodestone_core::SaveError;
use rusqlite::Connection;

#[test]
fn child_save_propagates_to_the_root_and_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let storage = loaded_storage(dir.path());
    let main = storage.main_context().unwrap();

    assert!(main.is_store_backed());
    let child = main.derive_child();
    assert!(!child.is_store_backed());
    assert!(child.parent().is_some());

    let id = child.create(&book("From child", 42));
    assert!(child.has_changes());
    assert!(!main.has_changes());

    child.save_chain().unwrap();
    assert!(!child.has_changes());
    assert!(!main.has_changes());

    // Permanent from both ends of the chain.
    let permanent = child.permanent_id(id).unwrap();
    assert_eq!(main.permanent_id(id), Some(permanent));
    assert_eq!(main.count::<Book>(None).unwrap(), 1);

    drop(storage);
    let storage = loaded_storage(dir.path());
    let context = storage.main_context().unwrap();
    let loaded = context.get::<Book>(permanent).unwrap().unwrap();
    assert_eq!(loaded.record.title, "From child");
}

#[test]
fn a_grandchild_chain_saves_through_every_level() {
    let dir = tempfile::tempdir().unwrap();
    let storage = loaded_storage(dir.path());
    let main = storage.main_context().unwrap();

    let child = main.derive_child();
    let grandchild = child.derive_child();
    grandchild.create(&book("Deep", 7));

    grandchild.save_chain().unwrap();
    assert!(!grandchild.has_changes());
    assert!(!child.has_changes());
    assert_eq!(main.count::<Book>(None).unwrap(), 1);
}

#[test]
fn a_parent_sees_child_changes_only_after_the_child_saves() {
    let dir = tempfile::tempdir().unwrap();
    let storage = loaded_storage(dir.path());
    let main = storage.main_context().unwrap();

    let child = main.derive_child();
    child.create(&book("Hidden", 1));
    assert_eq!(main.count::<Book>(None).unwrap(), 0);
    assert_eq!(child.count::<Book>(None).unwrap(), 1);

    child.save_chain().unwrap();
    assert_eq!(main.count::<Book>(None).unwrap(), 1);
}

#[test]
fn deletes_recorded_in_a_child_reach_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let storage = loaded_storage(dir.path());
    let main = storage.main_context().unwrap();

    let id = main.create(&book("Doomed", 13));
    main.save_chain().unwrap();

    let child = main.derive_child();
    child.delete(id);
    child.save_chain().unwrap();

    assert!(main.get::<Book>(id).unwrap().is_none());
}

#[test]
fn a_failing_root_save_leaves_earlier_links_saved_but_nothing_durable() {
    let dir = tempfile::tempdir().unwrap();
    let storage = loaded_storage(dir.path());
    let main = storage.main_context().unwrap();

    let child = main.derive_child();
    child.create(&book("Lost", 99));

    // Sabotage the durable layer underneath the open store.
    let saboteur = Connection::open(storage.descriptor().path()).unwrap();
    saboteur.execute_batch("DROP TABLE \"Book\";").unwrap();
    drop(saboteur);

    let err = child.save_chain().unwrap_err();
    assert!(matches!(err, SaveError::Db(_)));

    // The child already pushed its log to the parent; the failure stopped
    // at the root, whose changes stay pending.
    assert!(!child.has_changes());
    assert!(main.has_changes());
}
