//! Integration tests for subscriber management, checkpoints and retention

use seglog::{ErrorKind, Journal, Position, Whence};
use std::path::PathBuf;
use tempfile::{tempdir, TempDir};

struct TestContext {
    _temp_dir: TempDir,
    journal_path: PathBuf,
}

impl TestContext {
    fn new() -> Self {
        let temp_dir = tempdir().unwrap();
        let journal_path = temp_dir.path().join("journal");
        let mut journal = Journal::new(&journal_path);
        journal.init().unwrap();
        Self {
            _temp_dir: temp_dir,
            journal_path,
        }
    }

    fn writer(&self) -> Journal {
        let mut journal = Journal::new(&self.journal_path);
        journal.open_writer().unwrap();
        journal
    }

    fn reader(&self, subscriber: &str) -> Journal {
        let mut journal = Journal::new(&self.journal_path);
        journal.open_reader(subscriber).unwrap();
        journal
    }

    fn subscribe(&self, subscriber: &str, whence: Whence) {
        let mut journal = Journal::new(&self.journal_path);
        journal.add_subscriber(subscriber, whence).unwrap();
    }

    fn segment_exists(&self, log: u32) -> bool {
        self.journal_path.join(format!("{:08x}", log)).exists()
    }

    fn index_exists(&self, log: u32) -> bool {
        self.journal_path.join(format!("{:08x}.idx", log)).exists()
    }
}

/// Consume and checkpoint everything currently readable.
fn drain(reader: &mut Journal) -> usize {
    let mut consumed = 0;
    while let Some(interval) = reader.read_interval().unwrap() {
        consumed += interval.count() as usize;
        reader.read_checkpoint(interval.finish).unwrap();
    }
    consumed
}

#[test]
fn test_read_interval_on_empty_journal() {
    let ctx = TestContext::new();
    ctx.subscribe("s", Whence::Begin);

    // no segment has ever been written
    let mut reader = ctx.reader("s");
    assert!(reader.read_interval().unwrap().is_none());
}

#[test]
fn test_add_subscriber_twice_fails() {
    let ctx = TestContext::new();
    ctx.subscribe("a", Whence::Begin);

    let mut journal = Journal::new(&ctx.journal_path);
    let err = journal.add_subscriber("a", Whence::Begin).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SubscriberExists);
}

#[test]
fn test_begin_subscriber_sees_existing_records() {
    let ctx = TestContext::new();
    let mut writer = ctx.writer();
    writer.write(b"before").unwrap();

    ctx.subscribe("late", Whence::Begin);
    let mut reader = ctx.reader("late");
    assert_eq!(drain(&mut reader), 1);
}

#[test]
fn test_end_subscriber_skips_existing_records() {
    let ctx = TestContext::new();
    let mut writer = ctx.writer();
    writer.write(b"old-1").unwrap();
    writer.write(b"old-2").unwrap();

    ctx.subscribe("tail", Whence::End);

    // scenario: subscribing at the end returns immediately and the first
    // read finds nothing
    let mut reader = ctx.reader("tail");
    assert!(reader.read_interval().unwrap().is_none());

    // only records written after the subscription are delivered
    writer.write(b"new-1").unwrap();
    let interval = reader.read_interval().unwrap().unwrap();
    assert_eq!(interval.count(), 1);
    assert_eq!(reader.read_message(interval.start).unwrap().data, b"new-1");
}

#[test]
fn test_retention_waits_for_slowest_subscriber() {
    let ctx = TestContext::new();
    ctx.subscribe("a", Whence::Begin);
    ctx.subscribe("b", Whence::Begin);

    let mut writer = ctx.writer();
    writer.alter_journal_size(20).unwrap();
    writer.write(b"first").unwrap(); // segment 0, then rotate
    writer.write(b"second").unwrap(); // segment 1, then rotate
    drop(writer);

    // "a" consumes everything; "b" has not moved, so segment 0 stays
    let mut reader_a = ctx.reader("a");
    assert_eq!(drain(&mut reader_a), 2);
    assert!(ctx.segment_exists(0), "segment 0 pinned by subscriber b");

    // once "b" passes segment 0 too, the checkpoint write reclaims it
    let mut reader_b = ctx.reader("b");
    assert_eq!(drain(&mut reader_b), 2);
    assert!(!ctx.segment_exists(0));
    assert!(!ctx.index_exists(0));
}

#[test]
fn test_pending_readers_counts() {
    let ctx = TestContext::new();
    ctx.subscribe("a", Whence::Begin);
    ctx.subscribe("b", Whence::Begin);

    let mut writer = ctx.writer();
    writer.alter_journal_size(20).unwrap();
    writer.write(b"first").unwrap();
    writer.write(b"second").unwrap();

    let (pending, earliest) = writer.pending_readers(0).unwrap();
    assert_eq!(pending, 2);
    assert_eq!(earliest, 0);

    let mut reader_a = ctx.reader("a");
    drain(&mut reader_a);

    // "a" is past segment 0 now; only "b" still needs it
    let (pending, earliest) = writer.pending_readers(0).unwrap();
    assert_eq!(pending, 1);
    assert_eq!(earliest, 0);

    let mut reader_b = ctx.reader("b");
    drain(&mut reader_b);

    let (pending, earliest) = writer.pending_readers(0).unwrap();
    assert_eq!(pending, 0);
    assert!(earliest > 0);
}

#[test]
fn test_first_log_id_monotonic_across_checkpoints() {
    let ctx = TestContext::new();
    ctx.subscribe("s", Whence::Begin);

    let mut writer = ctx.writer();
    writer.alter_journal_size(20).unwrap();
    for _ in 0..5 {
        writer.write(b"payload").unwrap();
    }
    drop(writer);

    let mut reader = ctx.reader("s");
    let mut previous = reader.first_log_id().unwrap().log;
    while let Some(interval) = reader.read_interval().unwrap() {
        reader.read_checkpoint(interval.finish).unwrap();
        let first = reader.first_log_id().unwrap().log;
        assert!(first >= previous, "first_log_id moved backwards");
        previous = first;
    }
    assert!(previous > 0);
}

#[test]
fn test_list_and_remove_subscribers() {
    let ctx = TestContext::new();
    ctx.subscribe("alpha", Whence::Begin);
    ctx.subscribe("beta two", Whence::Begin);

    let mut journal = Journal::new(&ctx.journal_path);
    let mut subs = journal.list_subscribers().unwrap();
    subs.sort();
    assert_eq!(subs, vec!["alpha".to_string(), "beta two".to_string()]);

    journal.remove_subscriber("alpha").unwrap();
    let subs = journal.list_subscribers().unwrap();
    assert_eq!(subs, vec!["beta two".to_string()]);

    let err = journal.remove_subscriber("alpha").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSubscriber);
}

#[test]
fn test_get_checkpoint_tracks_reads() {
    let ctx = TestContext::new();
    ctx.subscribe("s", Whence::Begin);

    let mut writer = ctx.writer();
    writer.write(b"one").unwrap();
    writer.write(b"two").unwrap();

    let mut reader = ctx.reader("s");
    assert_eq!(
        reader.get_checkpoint("s").unwrap(),
        Position::new(0, 0)
    );
    drain(&mut reader);
    assert_eq!(
        reader.get_checkpoint("s").unwrap(),
        Position::new(0, 2)
    );
}

#[test]
fn test_copy_checkpoint_clones_position() {
    let ctx = TestContext::new();
    ctx.subscribe("original", Whence::Begin);

    let mut writer = ctx.writer();
    writer.write(b"one").unwrap();
    writer.write(b"two").unwrap();
    writer.write(b"three").unwrap();

    // move "original" forward one record
    let mut reader = ctx.reader("original");
    let interval = reader.read_interval().unwrap().unwrap();
    reader.read_checkpoint(interval.start).unwrap();
    let original = reader.get_checkpoint("original").unwrap();
    assert_eq!(original, Position::new(0, 1));
    drop(reader);

    let mut journal = Journal::new(&ctx.journal_path);
    journal
        .add_subscriber_copy_checkpoint("clone", "original")
        .unwrap();
    assert_eq!(journal.get_checkpoint("clone").unwrap(), original);

    // the clone picks up where the original stood
    let mut reader = ctx.reader("clone");
    let interval = reader.read_interval().unwrap().unwrap();
    assert_eq!(interval.start, Position::new(0, 2));
    assert_eq!(interval.count(), 2);
}

#[test]
fn test_copy_checkpoint_requires_source() {
    let ctx = TestContext::new();
    let mut journal = Journal::new(&ctx.journal_path);
    let err = journal
        .add_subscriber_copy_checkpoint("clone", "missing")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSubscriber);
}

#[test]
fn test_duplicate_delivery_without_checkpoint() {
    let ctx = TestContext::new();
    ctx.subscribe("s", Whence::Begin);

    let mut writer = ctx.writer();
    writer.write(b"once").unwrap();

    // a reader that never checkpoints sees the record again
    let mut reader = ctx.reader("s");
    let first = reader.read_interval().unwrap().unwrap();
    assert_eq!(reader.read_message(first.start).unwrap().data, b"once");
    drop(reader);

    let mut reader = ctx.reader("s");
    let again = reader.read_interval().unwrap().unwrap();
    assert_eq!(again, first);
    assert_eq!(reader.read_message(again.start).unwrap().data, b"once");
}
