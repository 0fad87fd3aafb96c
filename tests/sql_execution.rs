use std::sync::Arc;
use tenant_db_rust::{
    AppConfig, BranchStatus, CreateBranchOptions, PlanBranchingPolicy, Platform, PlatformError,
    Project, ProjectStatus, QueryResult, Snapshot, SqlErrorKind,
};

fn setup_with(config: AppConfig) -> (Platform, Project) {
    let policy = Arc::new(PlanBranchingPolicy::from_config(&config.platform));
    policy.set_plan("org_1", "team");
    let platform = Platform::with_policy(config, policy);
    let project = platform.register_project("analytics", "org_1").unwrap();
    (platform, project)
}

fn setup() -> (Platform, Project) {
    setup_with(AppConfig::default())
}

#[tokio::test]
async fn test_insert_reports_command_tag() {
    let (platform, project) = setup();
    let db = platform.database();
    db.execute_sql(&project.id, "CREATE TABLE t (id int)")
        .await
        .unwrap();
    let result = db
        .execute_sql(&project.id, "INSERT INTO t VALUES (1)")
        .await
        .unwrap();
    assert_eq!(result.row_count(), 1);
    assert_eq!(result.status_message(), Some("INSERT 0 1"));

    let rows = db
        .execute_sql(&project.id, "SELECT id FROM t")
        .await
        .unwrap();
    assert!(matches!(rows, QueryResult::Rows(_)));
    assert_eq!(rows.row_count(), 1);
    assert_eq!(rows.rows()[0]["id"], serde_json::json!(1));
}

#[tokio::test]
async fn test_multi_statement_returns_last_result() {
    let (platform, project) = setup();
    let result = platform
        .database()
        .execute_sql(
            &project.id,
            "CREATE TABLE users (id serial primary key, email varchar(255) not null);
             INSERT INTO users (id, email) VALUES (1, 'a@example.com'), (2, 'b@example.com');
             UPDATE users SET email = 'c@example.com' WHERE id = 2",
        )
        .await
        .unwrap();
    assert_eq!(result.status_message(), Some("UPDATE 1"));

    let tables = platform.database().list_tables(&project.id, None).unwrap();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].primary_keys, vec!["id".to_string()]);
}

#[tokio::test]
async fn test_errors_are_translated() {
    let (platform, project) = setup();
    let err = platform
        .database()
        .execute_sql(&project.id, "SELECT * FROM nonexistent_table")
        .await
        .unwrap_err();
    assert_eq!(err.sql_kind(), Some(SqlErrorKind::UndefinedTable));
    assert!(err
        .to_string()
        .contains("relation \"nonexistent_table\" does not exist"));

    let err = platform
        .database()
        .execute_sql(&project.id, "SELEC 1")
        .await
        .unwrap_err();
    assert_eq!(err.sql_kind(), Some(SqlErrorKind::Syntax));
}

#[tokio::test]
async fn test_inactive_project_refuses_sql() {
    let (platform, project) = setup();
    platform
        .store()
        .set_project_status(&project.id, ProjectStatus::Pausing)
        .unwrap();
    assert!(matches!(
        platform.database().execute_sql(&project.id, "SELECT 1").await,
        Err(PlatformError::DatabaseConnection(_))
    ));
}

#[tokio::test]
async fn test_direct_ddl_on_branch_blocks_rebase_until_reset() {
    let (platform, project) = setup();
    let branch = platform
        .branches()
        .create(&project.id, "dev", CreateBranchOptions::default())
        .await
        .unwrap();

    platform
        .database()
        .execute_sql(&branch.branch_project_id, "SELECT 1")
        .await
        .unwrap();
    assert!(
        !platform
            .branches()
            .get_branch(&branch.id)
            .unwrap()
            .has_uncommitted_schema_changes
    );

    platform
        .database()
        .execute_sql(&branch.branch_project_id, "CREATE TABLE scratch (id int)")
        .await
        .unwrap();
    assert!(
        platform
            .branches()
            .get_branch(&branch.id)
            .unwrap()
            .has_uncommitted_schema_changes
    );
    assert!(matches!(
        platform.branches().rebase(&branch.id).await,
        Err(PlatformError::OperationNotPermitted(_))
    ));

    platform.branches().reset(&branch.id, None).await.unwrap();
    let branch_now = platform.branches().get_branch(&branch.id).unwrap();
    assert!(!branch_now.has_uncommitted_schema_changes);
    assert_eq!(branch_now.status, BranchStatus::ActiveHealthy);
    assert!(platform.branches().rebase(&branch.id).await.is_ok());
}

#[tokio::test]
async fn test_partial_multi_statement_ddl_marks_branch_dirty() {
    let (platform, project) = setup();
    let branch = platform
        .branches()
        .create(&project.id, "dev", CreateBranchOptions::default())
        .await
        .unwrap();

    let err = platform
        .database()
        .execute_sql(
            &branch.branch_project_id,
            "CREATE TABLE scratch (id int); SELEC 1",
        )
        .await
        .unwrap_err();
    assert_eq!(err.sql_kind(), Some(SqlErrorKind::Syntax));

    // the table was created before the second statement failed
    let tables = platform
        .database()
        .list_tables(&branch.branch_project_id, None)
        .unwrap();
    assert!(tables.iter().any(|t| t.name == "scratch"));
    assert!(
        platform
            .branches()
            .get_branch(&branch.id)
            .unwrap()
            .has_uncommitted_schema_changes
    );
    assert!(matches!(
        platform.branches().rebase(&branch.id).await,
        Err(PlatformError::OperationNotPermitted(_))
    ));
}

#[tokio::test]
async fn test_snapshot_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("platform.snapshot");

    let (platform, project) = setup();
    platform
        .ledger()
        .apply(&project.id, "init", "CREATE TABLE events (id int, payload jsonb)")
        .await
        .unwrap();
    let branch = platform
        .branches()
        .create(&project.id, "dev", CreateBranchOptions::default())
        .await
        .unwrap();
    let saved_to = platform.save_snapshot(Some(path.as_path())).await.unwrap();
    assert_eq!(saved_to, path);

    let blob = std::fs::read(&path).unwrap();
    assert_eq!(&blob[..2], &[0x1f, 0x8b]);
    let snapshot = Snapshot::from_blob(&blob).unwrap();
    assert_eq!(snapshot.checksum().unwrap(), platform.snapshot().checksum().unwrap());

    let (restored, _) = setup();
    restored.load_snapshot(Some(path.as_path())).await.unwrap();
    assert!(restored.store().get_project(&project.id).is_some());
    assert_eq!(
        restored.branches().get_branch(&branch.id).unwrap().name,
        "dev"
    );
    assert_eq!(restored.ledger().list(&project.id).unwrap().len(), 1);

    // the database is rebuilt from the restored catalog
    let rows = restored
        .database()
        .execute_sql(&branch.branch_project_id, "SELECT * FROM events")
        .await
        .unwrap();
    assert_eq!(rows.row_count(), 0);
    assert_eq!(rows.columns().len(), 2);
}

#[tokio::test]
async fn test_uncompressed_snapshot_uses_configured_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let mut config = AppConfig::default();
    config.snapshot.path = Some(path.to_string_lossy().into_owned());
    config.snapshot.compress = false;

    let (platform, project) = setup_with(config.clone());
    platform.save_snapshot(None).await.unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains(&project.id));

    let (restored, _) = setup_with(config);
    restored.load_snapshot(None).await.unwrap();
    assert!(restored.store().get_project(&project.id).is_some());
}
