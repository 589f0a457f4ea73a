use notesync_core::db::open_db_in_memory;
use notesync_core::document::backup_path;
use notesync_core::service::reconcile_service::CHECKPOINT_KEY;
use notesync_core::{EngineError, ManualClock, ReconcileService, SqliteUnitStore, UnitStore};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

type TestEngine = ReconcileService<SqliteUnitStore, ManualClock>;

struct Fixture {
    _dir: TempDir,
    doc: PathBuf,
    clock: ManualClock,
    engine: TestEngine,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let doc = dir.path().join("notes.md");
    let clock = ManualClock::new(1_000);
    let engine = ReconcileService::new(
        SqliteUnitStore::new(open_db_in_memory().unwrap()),
        clock.clone(),
        &doc,
    );
    Fixture {
        _dir: dir,
        doc,
        clock,
        engine,
    }
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

fn stored(engine: &TestEngine) -> Vec<String> {
    engine
        .list_units()
        .unwrap()
        .into_iter()
        .map(|unit| unit.content)
        .collect()
}

#[test]
fn first_pass_imports_blocks_in_reading_order() {
    let f = fixture();
    fs::write(&f.doc, "hello\n\nworld").unwrap();

    let report = f.engine.reconcile().unwrap();

    assert_eq!(report.created, 2);
    assert_eq!(report.deleted, 0);
    assert_eq!(stored(&f.engine), vec!["hello", "world"]);
    assert_eq!(read(&f.doc), "hello\n\nworld");
    assert!(!report.render.written);
    assert_eq!(f.engine.checkpoint().unwrap(), 1_001);
}

#[test]
fn removing_a_block_deletes_units_older_than_checkpoint() {
    let f = fixture();
    fs::write(&f.doc, "keep\n\ndrop").unwrap();
    f.engine.reconcile().unwrap();

    // Both units now predate the checkpoint.
    f.clock.set(11_000);
    fs::write(&f.doc, "keep").unwrap();
    let report = f.engine.reconcile().unwrap();

    assert_eq!(report.deleted, 1);
    assert_eq!(report.preserved, 0);
    assert_eq!(stored(&f.engine), vec!["keep"]);
    assert_eq!(read(&f.doc), "keep");
}

#[test]
fn units_added_after_checkpoint_survive_a_stale_save() {
    let f = fixture();
    fs::write(&f.doc, "first").unwrap();
    f.engine.reconcile().unwrap();

    f.clock.set(2_000);
    f.engine.add_unit("note").unwrap();
    assert_eq!(read(&f.doc), "note\n\nfirst");

    // Editor saves a buffer that never saw "note".
    f.clock.set(2_500);
    fs::write(&f.doc, "first").unwrap();
    let report = f.engine.reconcile().unwrap();

    assert_eq!(report.preserved, 1);
    assert_eq!(report.deleted, 0);
    assert_eq!(read(&f.doc), "note\n\nfirst");

    // The window closes once a pass has seen the unit.
    f.clock.set(3_000);
    fs::write(&f.doc, "first").unwrap();
    let report = f.engine.reconcile().unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(stored(&f.engine), vec!["first"]);
}

#[test]
fn reconcile_never_promotes_existing_units() {
    let f = fixture();
    f.engine.add_unit("a").unwrap();
    f.clock.set(2_000);
    f.engine.add_unit("b").unwrap();
    assert_eq!(read(&f.doc), "b\n\na");

    f.clock.set(3_000);
    fs::write(&f.doc, "a\n\nb").unwrap();
    let report = f.engine.reconcile().unwrap();

    assert_eq!(report.created, 0);
    assert_eq!(report.promoted, 0);
    assert!(report.render.written);
    assert_eq!(read(&f.doc), "b\n\na");
    assert_eq!(read(&backup_path(&f.doc)), "a\n\nb");
}

#[test]
fn second_pass_over_unchanged_document_is_a_no_op() {
    let f = fixture();
    fs::write(&f.doc, "one\n\n\n\n  two  \n").unwrap();
    let first = f.engine.reconcile().unwrap();
    assert!(first.render.written);

    f.clock.set(5_000);
    let second = f.engine.reconcile().unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(second.deleted, 0);
    assert!(!second.render.written);
    assert_eq!(first.render.document_fingerprint, second.render.document_fingerprint);
}

#[test]
fn missing_document_reads_as_empty() {
    let f = fixture();
    let report = f.engine.reconcile().unwrap();

    assert_eq!(report.parsed, 0);
    assert_eq!(read(&f.doc), "");
}

#[test]
fn checkpoint_never_moves_backwards() {
    let f = fixture();
    f.clock.set(5_000);
    f.engine.reconcile().unwrap();
    f.clock.set(100);
    f.engine.reconcile().unwrap();

    assert_eq!(f.engine.checkpoint().unwrap(), 5_001);
}

#[test]
fn corrupt_checkpoint_is_reported() {
    let f = fixture();
    f.engine
        .store()
        .set_metadata(CHECKPOINT_KEY, "yesterday")
        .unwrap();

    assert!(matches!(
        f.engine.reconcile(),
        Err(EngineError::InvalidCheckpoint(value)) if value == "yesterday"
    ));
}

#[test]
fn re_adding_content_promotes_it() {
    let f = fixture();
    f.engine.add_unit("a").unwrap();
    f.clock.set(2_000);
    f.engine.add_unit("b").unwrap();
    f.clock.set(3_000);

    let outcomes = f.engine.add_unit("  a\n").unwrap();

    assert_eq!(outcomes.len(), 1);
    assert!(!outcomes[0].created);
    assert_eq!(outcomes[0].unit.updated_at, 3_000);
    assert_eq!(outcomes[0].unit.created_at, 1_000);
    assert_eq!(read(&f.doc), "a\n\nb");
    assert_eq!(f.engine.store().count().unwrap(), 2);
}

#[test]
fn adding_blank_content_fails_without_changes() {
    let f = fixture();
    assert!(matches!(
        f.engine.add_unit(" \n\t\n"),
        Err(EngineError::EmptyContent)
    ));
    assert!(!f.doc.exists());
}

#[test]
fn multi_block_add_keeps_reading_order() {
    let f = fixture();
    let outcomes = f.engine.add_unit("x\n\ny\n\nx").unwrap();

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|outcome| outcome.created));
    assert_eq!(read(&f.doc), "x\n\ny");
}

#[test]
fn duplicate_blocks_collapse_to_one_unit() {
    let f = fixture();
    fs::write(&f.doc, "x\n\nx  \n\ny").unwrap();
    let report = f.engine.reconcile().unwrap();

    assert_eq!(report.parsed, 2);
    assert_eq!(report.created, 2);
    f.engine.add_unit("x").unwrap();
    assert_eq!(f.engine.store().count().unwrap(), 2);
    assert_eq!(read(&f.doc), "x\n\ny");
}

#[test]
fn search_args_split_include_and_exclude() {
    let f = fixture();
    f.engine.add_unit("foo one").unwrap();
    f.clock.advance(10);
    f.engine.add_unit("foo bar").unwrap();
    f.clock.advance(10);
    f.engine.add_unit("foo two").unwrap();

    let found: Vec<String> = f
        .engine
        .search_args(["foo", "-bar"])
        .unwrap()
        .into_iter()
        .map(|unit| unit.content)
        .collect();
    assert_eq!(found, vec!["foo two", "foo one"]);

    let err = f.engine.search_args(["", "-"]).unwrap_err();
    assert!(err.is_input_error());
}

#[test]
fn purge_deletes_matches_and_rewrites_document() {
    let f = fixture();
    f.engine.add_unit("draft intro").unwrap();
    f.clock.advance(10);
    f.engine.add_unit("keep").unwrap();

    assert_eq!(f.engine.purge("DRAFT").unwrap(), 1);
    assert_eq!(read(&f.doc), "keep");
}

#[test]
fn unreconciled_units_are_those_after_checkpoint() {
    let f = fixture();
    fs::write(&f.doc, "seen").unwrap();
    f.engine.reconcile().unwrap();

    f.clock.set(2_000);
    f.engine.add_unit("fresh").unwrap();

    let pending: Vec<String> = f
        .engine
        .unreconciled_units()
        .unwrap()
        .into_iter()
        .map(|unit| unit.content)
        .collect();
    assert_eq!(pending, vec!["fresh"]);
}

#[test]
fn regenerate_writes_the_whole_store() {
    let f = fixture();
    f.engine.add_unit("one").unwrap();
    fs::write(&f.doc, "scribbles").unwrap();

    let report = f.engine.regenerate().unwrap();
    assert!(report.written);
    assert_eq!(report.units, 1);
    assert_eq!(read(&f.doc), "one");
}
