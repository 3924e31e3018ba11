//! Runs against a live server only when `TEST_DATABASE_URL` points at one.

use architect_sync::diff::AddFieldPayload;
use architect_sync::{ApplyOptions, DiffType, Entity, Field, FieldType, Relation, SyncConfig, Synchronizer};

fn users() -> Entity {
    Entity::new("users")
        .with_field(Field::new("id", FieldType::Number).primary().auto_increment())
        .with_field(Field::new("email", FieldType::Text).unique().required())
}

fn posts() -> Entity {
    Entity::new("posts")
        .with_field(Field::new("id", FieldType::Number).primary().auto_increment())
        .with_field(Field::new("score", FieldType::Text))
        .with_field(Field::new("author_id", FieldType::Number).relation_field())
        .with_relation(Relation::belongs_to("author_id", "users", "id"))
}

#[tokio::test]
async fn edits_round_trip_on_postgres() {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        return;
    };
    let schema = format!("architect_sync_{}", std::process::id());
    let admin = sqlx::PgPool::connect(&url).await.unwrap();
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", schema))
        .execute(&admin)
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let config = SyncConfig::new(url).unwrap().with_schema(&schema).with_project_dir(dir.path());
    let mut sync = Synchronizer::open(&config).await.unwrap();
    let both = ApplyOptions::default();

    for entity in [users(), posts()] {
        let item = sync.entities().plan_create_entity(entity).unwrap();
        sync.edit(item, both).await.unwrap();
    }
    assert!(sync.diff().await.unwrap().is_empty());

    sqlx::query(&format!("ALTER TABLE \"{}\".users ADD COLUMN nickname text", schema))
        .execute(&admin)
        .await
        .unwrap();
    let diff = sync.diff().await.unwrap();
    assert!(diff.entities.is_empty() && diff.relations.is_empty());
    assert_eq!(diff.fields.len(), 1);
    assert_eq!(diff.fields[0].redo.kind, DiffType::AddField);
    let payload: AddFieldPayload = diff.fields[0].redo.payload().unwrap();
    assert_eq!(payload.field.name, "nickname");
    assert_eq!(payload.field.field_type, FieldType::Text);
    assert!(!payload.field.required);
    assert_eq!(payload.position, Some(2));
    sync.entities_from_database(&diff).await.unwrap();
    let names: Vec<_> = sync
        .entities()
        .entity("users")
        .unwrap()
        .fields
        .iter()
        .map(|f| f.name.as_str())
        .collect();
    assert_eq!(names, ["id", "email", "nickname"]);
    assert!(sync.diff().await.unwrap().is_empty());

    let db = sync.dialect().unwrap().clone();
    sqlx::query(&format!("INSERT INTO \"{}\".users (email) VALUES ('a@x')", schema))
        .execute(&admin)
        .await
        .unwrap();
    sqlx::query(&format!(
        "INSERT INTO \"{s}\".posts (score, author_id) SELECT '42', id FROM \"{s}\".users",
        s = schema
    ))
    .execute(&admin)
    .await
    .unwrap();

    let item = sync
        .entities()
        .plan_change_field("posts", "score", Field::new("score", FieldType::Number))
        .unwrap();
    sync.edit(item, both).await.unwrap();
    let (score,): (Option<i64>,) = sqlx::query_as(&format!("SELECT score::bigint FROM \"{}\".posts", schema))
        .fetch_one(&admin)
        .await
        .unwrap();
    assert_eq!(score, Some(42));
    assert!(sync.diff().await.unwrap().is_empty());

    let relation = Relation::belongs_to("author_id", "users", "id");
    let item = sync.entities().plan_delete_relation("posts", &relation).unwrap();
    sync.edit(item, both).await.unwrap();
    assert!(db.describe_table("posts").await.unwrap().iter().all(|c| c.name != "author_id"));
    sync.undo(both).await.unwrap();
    assert!(sync.diff().await.unwrap().is_empty());

    while sync.undo(both).await.unwrap().is_some() {}
    assert!(db.list_tables().await.unwrap().is_empty());
    assert!(sync.entities().entities().is_empty());

    sqlx::query(&format!("DROP SCHEMA \"{}\" CASCADE", schema))
        .execute(&admin)
        .await
        .unwrap();
}
