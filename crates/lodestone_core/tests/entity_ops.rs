mod common;

use common::{book, loaded_storage, Book};
use lodestone_core::{
    AttrMap, FetchRequest, ModelViolation, Predicate, QueryError, Record, RecordError, SaveError,
    SortSpec, Value,
};

#[test]
fn create_save_and_reopen_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let mut rated = book("Dune", 412);
    rated.rating = Some(4.5);

    let permanent = {
        let storage = loaded_storage(dir.path());
        let context = storage.main_context().unwrap();
        let id = context.create(&rated);
        assert!(!id.is_permanent());
        context.save_chain().unwrap();
        context.permanent_id(id).unwrap()
    };
    assert!(permanent.is_permanent());

    let storage = loaded_storage(dir.path());
    let context = storage.main_context().unwrap();
    let loaded = context.get::<Book>(permanent).unwrap().unwrap();
    assert_eq!(loaded.record, rated);
    assert_eq!(loaded.id, permanent);
}

#[test]
fn unsaved_rows_are_visible_to_reads() {
    let dir = tempfile::tempdir().unwrap();
    let storage = loaded_storage(dir.path());
    let context = storage.main_context().unwrap();

    let id = context.create(&book("Draft", 10));
    assert!(context.has_changes());
    assert_eq!(context.count::<Book>(None).unwrap(), 1);
    let loaded = context.get::<Book>(id).unwrap().unwrap();
    assert_eq!(loaded.record.title, "Draft");
}

#[test]
fn count_and_exists_agree() {
    let dir = tempfile::tempdir().unwrap();
    let storage = loaded_storage(dir.path());
    let context = storage.main_context().unwrap();

    for (title, pages) in [("a", 100), ("b", 200), ("c", 300)] {
        context.create(&book(title, pages));
    }

    let long = Predicate::gt("pages", 150_i64);
    assert_eq!(context.count::<Book>(Some(&long)).unwrap(), 2);
    assert!(context.exists::<Book>(Some(&long)).unwrap());

    let epic = Predicate::gt("pages", 500_i64);
    assert_eq!(context.count::<Book>(Some(&epic)).unwrap(), 0);
    assert!(!context.exists::<Book>(Some(&epic)).unwrap());
}

#[test]
fn fetch_sorts_limits_and_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let storage = loaded_storage(dir.path());
    let context = storage.main_context().unwrap();

    for (title, pages) in [("c", 3), ("a", 1), ("b", 2)] {
        context.create(&book(title, pages));
    }
    context.save_chain().unwrap();

    let mut request = FetchRequest::all().sorted_by(vec![SortSpec::asc("pages")]);
    request.limit = Some(2);
    request.offset = 1;
    let page = context.fetch::<Book>(&request).unwrap();
    let pages: Vec<i64> = page.iter().map(|item| item.record.pages).collect();
    assert_eq!(pages, vec![2, 3]);
}

#[test]
fn fetch_first_returns_the_top_of_the_order() {
    let dir = tempfile::tempdir().unwrap();
    let storage = loaded_storage(dir.path());
    let context = storage.main_context().unwrap();

    for (title, pages) in [("short", 90), ("long", 900)] {
        context.create(&book(title, pages));
    }

    let request = FetchRequest::all().sorted_by(vec![SortSpec::desc("pages")]);
    let first = context.fetch_first::<Book>(&request).unwrap().unwrap();
    assert_eq!(first.record.title, "long");

    let none = context
        .fetch_first::<Book>(&FetchRequest::matching(Predicate::eq("title", "absent")))
        .unwrap();
    assert!(none.is_none());
}

#[test]
fn fetch_or_create_reports_whether_it_created() {
    let dir = tempfile::tempdir().unwrap();
    let storage = loaded_storage(dir.path());
    let context = storage.main_context().unwrap();

    let by_title = Predicate::eq("title", "Dune");
    let (first, created) = context
        .fetch_or_create(&by_title, || book("Dune", 412))
        .unwrap();
    assert!(created);

    let (second, created) = context
        .fetch_or_create::<Book, _>(&by_title, || panic!("should not be called"))
        .unwrap();
    assert!(!created);
    assert_eq!(second.id, first.id);
    assert_eq!(context.count::<Book>(None).unwrap(), 1);
}

#[test]
fn update_replaces_the_stored_row() {
    let dir = tempfile::tempdir().unwrap();
    let storage = loaded_storage(dir.path());
    let context = storage.main_context().unwrap();

    let id = context.create(&book("Draft", 10));
    context.save_chain().unwrap();

    let mut revised = book("Final", 250);
    revised.rating = Some(5.0);
    context.update(id, &revised);
    context.save_chain().unwrap();

    let loaded = context.get::<Book>(id).unwrap().unwrap();
    assert_eq!(loaded.record, revised);
}

#[test]
fn delete_removes_the_row_and_tolerates_absence() {
    let dir = tempfile::tempdir().unwrap();
    let storage = loaded_storage(dir.path());
    let context = storage.main_context().unwrap();

    let id = context.create(&book("Gone", 1));
    context.save_chain().unwrap();

    context.delete(id);
    context.save_chain().unwrap();
    assert!(context.get::<Book>(id).unwrap().is_none());
    assert_eq!(context.count::<Book>(None).unwrap(), 0);

    // A second delete of the same row saves cleanly.
    context.delete(id);
    context.save_chain().unwrap();
}

#[test]
fn predicates_over_unknown_attributes_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let storage = loaded_storage(dir.path());
    let context = storage.main_context().unwrap();

    let bogus = Predicate::eq("missing", 1_i64);
    let err = context.count::<Book>(Some(&bogus)).unwrap_err();
    assert!(matches!(
        err,
        QueryError::Model(ModelViolation::UnknownAttribute { .. })
    ));

    let err = context
        .fetch::<Book>(&FetchRequest::all().sorted_by(vec![SortSpec::asc("missing")]))
        .unwrap_err();
    assert!(matches!(err, QueryError::Model(_)));
}

#[test]
fn updating_a_row_deleted_underneath_reports_missing_row() {
    let dir = tempfile::tempdir().unwrap();
    let storage = loaded_storage(dir.path());
    let context = storage.main_context().unwrap();

    let id = context.create(&book("Ephemeral", 50));
    context.save_chain().unwrap();

    // Another part of the tree deletes the row durably.
    let child = context.derive_child();
    child.delete(id);
    child.save_chain().unwrap();

    context.update(id, &book("Too late", 51));
    let err = context.save_chain().unwrap_err();
    assert!(matches!(err, SaveError::MissingRow { id: _, entity } if entity == "Book"));
    assert!(context.has_changes());
}

#[test]
fn a_foreign_pending_id_reaching_the_store_is_unresolved() {
    let dir = tempfile::tempdir().unwrap();
    let storage = loaded_storage(dir.path());
    let context = storage.main_context().unwrap();

    // The sibling never saves, so its pending id never becomes permanent.
    let sibling = context.derive_child();
    let id = sibling.create(&book("Elsewhere", 5));

    context.delete(id);
    let err = context.save_chain().unwrap_err();
    assert!(matches!(err, SaveError::UnresolvedId { entity } if entity == "Book"));
    assert!(context.has_changes());
}

#[derive(Debug, Clone)]
struct BrokenBook;

impl Record for BrokenBook {
    fn entity_name() -> &'static str {
        "Book"
    }

    fn to_attrs(&self) -> AttrMap {
        AttrMap::from([
            ("title".to_string(), Value::from("broken")),
            ("pages".to_string(), Value::from(1_i64)),
            ("bogus".to_string(), Value::from(true)),
        ])
    }

    fn from_attrs(_attrs: &AttrMap) -> Result<Self, RecordError> {
        Ok(Self)
    }
}

#[test]
fn saving_a_record_that_violates_the_model_fails_and_keeps_changes() {
    let dir = tempfile::tempdir().unwrap();
    let storage = loaded_storage(dir.path());
    let context = storage.main_context().unwrap();

    context.create(&BrokenBook);
    let err = context.save_chain().unwrap_err();
    assert!(matches!(
        err,
        SaveError::Model(ModelViolation::UnknownAttribute { .. })
    ));
    assert!(context.has_changes());
}
