use chrono::{TimeZone, Utc};
use tempfile::NamedTempFile;
use temporal_tables::{Attribute, DataType, Period, Timestamp, Value};
use temporal_tables_store::Database;

fn columns() -> Vec<Attribute> {
    vec![
        Attribute::new("name", DataType::Text),
        Attribute::new("salary", DataType::Integer),
        Attribute::new("sys_period", DataType::tstzrange()),
    ]
}

#[test]
fn history_survives_reopen() {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_str().unwrap().to_string();
    let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
    let t2 = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
    let t3 = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();

    {
        let db = Database::open(&path).unwrap();
        let mut s = db.session();
        s.create_table("employees", columns()).unwrap();
        s.create_table("employees_history", columns()).unwrap();
        s.enable_versioning(
            "employees",
            &[Some("sys_period"), Some("employees_history"), Some("false")],
        )
        .unwrap();
        s.begin_at(t1).unwrap();
        s.insert(
            "employees",
            &[("name", "Bernard Marx".into()), ("salary", 10_000_i64.into())],
        )
        .unwrap();
        s.commit().unwrap();
    }

    {
        // Transaction ids continue after reopen, so the row written before
        // is recognised as belonging to an earlier transaction.
        let db = Database::open(&path).unwrap();
        let mut s = db.session();
        s.begin_at(t2).unwrap();
        s.update("employees", |_| true, &[("salary", 11_200_i64.into())])
            .unwrap();
        s.commit().unwrap();
    }

    let db = Database::open(&path).unwrap();
    let mut s = db.session();
    s.begin_at(t3).unwrap();
    s.delete("employees", |_| true).unwrap();
    s.commit().unwrap();

    let history = s.scan("employees_history").unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].get("salary"), Some(&Value::Integer(10_000)));
    assert_eq!(
        history[0].get("sys_period"),
        Some(&Value::Period(Period::new(
            Some(Timestamp::from(t1)),
            Some(Timestamp::from(t2))
        )))
    );
    assert_eq!(history[1].get("salary"), Some(&Value::Integer(11_200)));
    assert!(s.scan("employees").unwrap().is_empty());
}

#[test]
fn uncommitted_work_is_lost_on_close() {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_str().unwrap().to_string();
    {
        let db = Database::open(&path).unwrap();
        let mut s = db.session();
        s.create_table("t", columns()).unwrap();
        s.begin().unwrap();
        s.insert("t", &[("name", "pending".into())]).unwrap();
        // Dropped without commit.
    }
    let db = Database::open(&path).unwrap();
    let mut s = db.session();
    assert!(s.scan("t").unwrap().is_empty());
}
