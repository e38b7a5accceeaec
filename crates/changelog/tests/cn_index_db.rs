use changelog::config::StorageConfig;
use changelog::{ChangeNumberIndexDB, CnIndexRecord, Csn, DBCursor, SqliteStorage};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn open_storage(dir: &Path) -> Arc<SqliteStorage> {
    let config = StorageConfig {
        sqlite_cache_size: 1000,
        sqlite_busy_timeout: 5000,
        pool_size: 2,
    };
    Arc::new(SqliteStorage::open(dir.join("changelog.db"), &config).unwrap())
}

fn add(db: &ChangeNumberIndexDB<SqliteStorage>, domain: &str, time: u64) -> i64 {
    let change_number = db.next_change_number().unwrap();
    db.add_record(&CnIndexRecord::new(change_number, domain, Csn::new(time, 1, 0)))
        .unwrap();
    change_number
}

fn change_numbers(db: &ChangeNumberIndexDB<SqliteStorage>, from: i64) -> Vec<i64> {
    let mut cursor = db.get_cursor_from(from).unwrap();
    let mut numbers = Vec::new();
    while cursor.next().unwrap() {
        numbers.push(cursor.record().unwrap().change_number);
    }
    cursor.close();
    numbers
}

#[test]
fn test_numbering_survives_restart() {
    let temp = TempDir::new().unwrap();
    {
        let db = ChangeNumberIndexDB::open(open_storage(temp.path())).unwrap();
        assert!(db.is_empty().unwrap());
        assert_eq!(add(&db, "o=a", 10), 1);
        assert_eq!(add(&db, "o=b", 20), 2);
        // allocated but never indexed
        assert_eq!(db.next_change_number().unwrap(), 3);
    }

    let db = ChangeNumberIndexDB::open(open_storage(temp.path())).unwrap();
    assert_eq!(db.last_generated_change_number(), 3);
    assert_eq!(add(&db, "o=a", 30), 4);
    assert_eq!(change_numbers(&db, 1), vec![1, 2, 4]);
    assert_eq!(change_numbers(&db, 3), vec![4]);
    assert_eq!(
        db.get_record(2).unwrap(),
        Some(CnIndexRecord::new(2, "o=b", Csn::new(20, 1, 0)))
    );
}

#[test]
fn test_purge_keeps_newest_record() {
    let temp = TempDir::new().unwrap();
    let db = ChangeNumberIndexDB::open(open_storage(temp.path())).unwrap();
    for time in [10, 20, 30] {
        add(&db, "o=a", time);
    }

    assert_eq!(
        db.purge_up_to(&Csn::new(25, 0, 0)).unwrap(),
        Some(Csn::new(30, 1, 0))
    );
    assert_eq!(change_numbers(&db, 0), vec![3]);

    // everything is older, the newest record still stays
    assert_eq!(
        db.purge_up_to(&Csn::new(1_000, 0, 0)).unwrap(),
        Some(Csn::new(30, 1, 0))
    );
    assert_eq!(db.get_oldest_record().unwrap().map(|r| r.change_number), Some(3));
}

#[test]
fn test_clear_domain_keeps_other_numbers() {
    let temp = TempDir::new().unwrap();
    let db = ChangeNumberIndexDB::open(open_storage(temp.path())).unwrap();
    add(&db, "o=a", 10);
    add(&db, "o=b", 20);
    add(&db, "o=a", 30);

    assert_eq!(db.clear_domain("o=a").unwrap(), 2);
    assert_eq!(change_numbers(&db, 0), vec![2]);

    db.clear().unwrap();
    assert!(db.is_empty().unwrap());
    assert_eq!(add(&db, "o=b", 40), 4);
}
