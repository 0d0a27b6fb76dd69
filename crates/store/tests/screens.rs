//! Screens kept current from the change log agree with freshly built ones.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]

use tunerdb_store::{
    Database, DatabaseSchema, ReadAccess, Record, RecordCursor, Screen, ScreenOptions, ScreenUpdate, SortOrder,
    WriteAccess,
    config::{DatabaseConfig, ScreenConfig},
};
use tunerdb_test_utils::TestDir;

tunerdb_store::define_record! {
    struct Station {
        type_id: 5,
        name: "station",
        primary_key: [1],
        indexes: [(1, "by_lcn", [2])],
        fields: {
            1 => id: u32,
            2 => lcn: u16,
            3 => name: String,
        }
    }
}

tunerdb_store::define_record! {
    struct GuideV1 {
        type_id: 7,
        name: "guide",
        primary_key: [1],
        indexes: [],
        fields: {
            1 => event_id: u32,
            2 => start: u32,
        }
    }
}

tunerdb_store::define_record! {
    struct GuideV2 {
        type_id: 7,
        name: "guide",
        primary_key: [1],
        indexes: [],
        fields: {
            1 => event_id: u32,
            2 => start: u32,
            3 => rating: u8 = 12,
        }
    }
}

fn station(id: u32, lcn: u16) -> Station {
    Station { id, lcn, name: format!("st{id}") }
}

fn by_name() -> ScreenOptions<Station> {
    ScreenOptions::builder().sort(SortOrder::Fields(vec![3, 1])).build().unwrap()
}

fn by_lcn() -> ScreenOptions<Station> {
    ScreenOptions::builder().sort(SortOrder::Index(1)).build().unwrap()
}

fn open() -> Database {
    let db = Database::open_in_memory(DatabaseSchema::new("chdb").with::<Station>(), DatabaseConfig::default())
        .unwrap();
    let txn = db.write().unwrap();
    for id in 0..20 {
        txn.put(&station(id, (id as u16 * 7) % 13)).unwrap();
    }
    txn.commit().unwrap();
    db
}

fn ids(screen: &mut Screen<Station>) -> Vec<u32> {
    let size = screen.list_size();
    screen.window(0, size).unwrap().iter().map(|s| s.id).collect()
}

fn churn(db: &Database, round: u32) {
    let txn = db.write().unwrap();
    txn.put(&station(100 + round, (round as u16) % 5)).unwrap();
    txn.put(&station(round, 99)).unwrap();
    txn.delete(&station(19 - round, 0)).unwrap();
    txn.commit().unwrap();
}

#[test]
fn test_incremental_and_batched_replay_agree() {
    let db = open();
    let mut eager = Screen::new(&db.read().unwrap(), by_lcn(), ScreenConfig::default()).unwrap();
    let mut lazy = Screen::new(&db.read().unwrap(), by_lcn(), ScreenConfig::default()).unwrap();
    // Park a reference mid-list so replay has to shift it
    eager.set_reference(10).unwrap();

    for round in 0..5 {
        churn(&db, round);
        let update = eager.update(&db.read().unwrap()).unwrap();
        assert!(matches!(update, ScreenUpdate::Incremental { .. }), "round {round}: {update:?}");
    }
    lazy.update(&db.read().unwrap()).unwrap();

    let mut fresh = Screen::new(&db.read().unwrap(), by_lcn(), ScreenConfig::default()).unwrap();
    assert_eq!(eager.list_size(), 20);
    assert_eq!(ids(&mut eager), ids(&mut fresh));
    assert_eq!(ids(&mut lazy), ids(&mut fresh));
    assert_eq!(eager.last_txn_id(), lazy.last_txn_id());

    // Replaying nothing new changes nothing
    assert_eq!(eager.update(&db.read().unwrap()).unwrap(), ScreenUpdate::Unchanged);
}

#[test]
fn test_dynamic_sort_key_follows_updates() {
    let db = open();
    let mut screen = Screen::new(&db.read().unwrap(), by_name(), ScreenConfig::default()).unwrap();
    churn(&db, 0);
    churn(&db, 1);
    screen.update(&db.read().unwrap()).unwrap();

    let read = db.read().unwrap();
    let mut cursor = read.cursor::<Station>();
    cursor.first().unwrap();
    let mut expected: Vec<Station> = cursor.range().map(Result::unwrap).collect();
    expected.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
    let expected: Vec<u32> = expected.iter().map(|s| s.id).collect();
    assert_eq!(ids(&mut screen), expected);
}

#[test]
fn test_screen_behind_cleaned_log_rescans() {
    let db = open();
    let mut screen = Screen::new(&db.read().unwrap(), by_lcn(), ScreenConfig::default()).unwrap();
    for round in 0..3 {
        churn(&db, round);
    }
    let txn = db.write().unwrap();
    assert!(txn.clean_log(0).unwrap() > 0);
    txn.commit().unwrap();

    assert_eq!(screen.update(&db.read().unwrap()).unwrap(), ScreenUpdate::Rescanned);
    let mut fresh = Screen::new(&db.read().unwrap(), by_lcn(), ScreenConfig::default()).unwrap();
    assert_eq!(ids(&mut screen), ids(&mut fresh));
    let top = screen.record_at_row(0).unwrap().map(|s| s.primary_key());
    assert_eq!(top, fresh.record_at_row(0).unwrap().map(|s| s.primary_key()));
}

#[test]
fn test_screen_over_source_without_change_log_rescans() {
    let config = DatabaseConfig::builder().change_log(false).build().unwrap();
    let db = Database::open_in_memory(DatabaseSchema::new("chdb").with::<Station>(), config).unwrap();
    let txn = db.write().unwrap();
    txn.put(&station(1, 10)).unwrap();
    txn.commit().unwrap();
    let mut screen = Screen::new(&db.read().unwrap(), by_lcn(), ScreenConfig::default()).unwrap();
    assert_eq!(screen.list_size(), 1);

    let txn = db.write().unwrap();
    txn.put(&station(2, 5)).unwrap();
    txn.commit().unwrap();
    assert_eq!(screen.update(&db.read().unwrap()).unwrap(), ScreenUpdate::Rescanned);
    assert_eq!(screen.list_size(), 2);
    let mut fresh = Screen::new(&db.read().unwrap(), by_lcn(), ScreenConfig::default()).unwrap();
    assert_eq!(ids(&mut screen), ids(&mut fresh));
    assert_eq!(ids(&mut screen), vec![2, 1]);

    assert_eq!(screen.update(&db.read().unwrap()).unwrap(), ScreenUpdate::Unchanged);
}

#[test]
fn test_screen_over_degraded_source_rescans() {
    let dir = TestDir::new();
    let path = dir.db_path("epgdb");
    let v1 = DatabaseSchema::new("epgdb").with::<GuideV1>();
    let v2 = DatabaseSchema::new("epgdb").with::<GuideV2>();
    let by_start = || ScreenOptions::<GuideV2>::builder().sort(SortOrder::Fields(vec![2])).build().unwrap();

    let db = Database::open(&path, v1.clone(), DatabaseConfig::default()).unwrap();
    let txn = db.write().unwrap();
    for event_id in 1..=3 {
        txn.put(&GuideV1 { event_id, start: 400 - event_id * 100 }).unwrap();
    }
    txn.commit().unwrap();
    db.close().unwrap();

    let db = Database::open(&path, v2.clone(), DatabaseConfig::default()).unwrap();
    assert!(db.is_degraded());
    let mut screen = Screen::new(&db.read().unwrap(), by_start(), ScreenConfig::default()).unwrap();
    assert_eq!(screen.list_size(), 3);
    db.close().unwrap();

    let db = Database::open(&path, v1, DatabaseConfig::default()).unwrap();
    let txn = db.write().unwrap();
    txn.put(&GuideV1 { event_id: 4, start: 50 }).unwrap();
    txn.delete(&GuideV1 { event_id: 2, start: 0 }).unwrap();
    txn.commit().unwrap();
    db.close().unwrap();

    let db = Database::open(&path, v2, DatabaseConfig::default()).unwrap();
    assert!(db.is_degraded());
    assert_eq!(screen.update(&db.read().unwrap()).unwrap(), ScreenUpdate::Rescanned);
    let mut fresh = Screen::new(&db.read().unwrap(), by_start(), ScreenConfig::default()).unwrap();
    let rows = screen.window(0, 10).unwrap();
    assert_eq!(rows, fresh.window(0, 10).unwrap());
    let events: Vec<u32> = rows.iter().map(|g| g.event_id).collect();
    assert_eq!(events, vec![4, 3, 1]);
    assert!(rows.iter().all(|g| g.rating == 12));
}
