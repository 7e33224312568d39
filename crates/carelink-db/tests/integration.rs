use carelink_db::{create_pool, run_migrations, schema_version, PoolSettings};

fn temp_pool() -> (carelink_db::DbPool, tempfile::NamedTempFile) {
    let file = tempfile::NamedTempFile::new().expect("failed to create temp db");
    let path = file.path().to_str().expect("temp path is utf-8").to_string();
    let pool = create_pool(&path, PoolSettings::default()).expect("failed to create pool");
    (pool, file)
}

#[test]
fn pooled_connections_share_migrated_schema() {
    let (pool, _file) = temp_pool();

    {
        let conn = pool.get().expect("failed to get connection");
        assert_eq!(run_migrations(&conn).expect("failed to run migrations"), 3);
    }

    // A different pooled connection sees the same tables.
    let first = pool.get().expect("failed to get first connection");
    let second = pool.get().expect("failed to get second connection");
    assert_eq!(schema_version(&second).unwrap(), 3);
    second
        .execute("INSERT INTO chats (id) VALUES ('chat-1')", [])
        .expect("insert through second connection");

    let count: i64 = first
        .query_row("SELECT COUNT(*) FROM chats", [], |row| row.get(0))
        .expect("count through first connection");
    assert_eq!(count, 1);

    let mut stmt = first
        .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
        .expect("failed to prepare table query");
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .expect("failed to run table query")
        .map(|r| r.expect("failed to read table name"))
        .collect();
    assert_eq!(tables, vec!["chats", "messages", "notifications", "participants"]);
}

#[test]
fn concurrent_startups_migrate_once() {
    let (pool, _file) = temp_pool();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            std::thread::spawn(move || {
                let conn = pool.get().expect("failed to get connection");
                run_migrations(&conn).expect("migrations should not conflict")
            })
        })
        .collect();

    let applied: usize = handles
        .into_iter()
        .map(|h| h.join().expect("thread should not panic"))
        .sum();
    assert_eq!(applied, 3);
}

#[test]
fn foreign_keys_are_enforced_on_every_connection() {
    let (pool, _file) = temp_pool();
    run_migrations(&pool.get().unwrap()).unwrap();

    let conn = pool.get().unwrap();
    let orphan = conn.execute(
        "INSERT INTO participants (chat_id, user_id, user_type) VALUES ('ghost', 'pat-7', 'patient')",
        [],
    );
    assert!(orphan.is_err(), "participant of a missing chat must be rejected");
}
