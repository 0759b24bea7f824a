//! Tests for on-disk database creation

use lumen_common::db::init::init_database;

#[tokio::test]
async fn test_database_creation_when_missing() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("nested").join("lumen.db");
    assert!(!db_path.exists());

    let result = init_database(&db_path).await;
    assert!(result.is_ok(), "Database initialization failed: {:?}", result.err());
    assert!(db_path.exists(), "Database file was not created");
}

#[tokio::test]
async fn test_database_opens_existing() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("lumen.db");

    let pool1 = init_database(&db_path).await.unwrap();
    sqlx::query("INSERT INTO user_profiles (user_id) VALUES ('user-1')")
        .execute(&pool1)
        .await
        .unwrap();
    pool1.close().await;

    // Reopening must keep existing rows
    let pool2 = init_database(&db_path).await.unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_profiles")
        .fetch_one(&pool2)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_foreign_keys_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("lumen.db")).await.unwrap();

    // Stats rows require a profile row
    let result = sqlx::query("INSERT INTO user_stats (user_id) VALUES ('ghost')")
        .execute(&pool)
        .await;
    assert!(result.is_err());
}
