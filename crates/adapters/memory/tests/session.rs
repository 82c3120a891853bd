use trellis_adapter_memory::{MemoryStore, SessionEvent};
use trellis_domain_core::{Record, TableMeta, Value};
use trellis_errors::AppError;
use trellis_ports::{Command, IsolationLevel, Parameter, ResultSet, Session};

const AUTHORS: TableMeta = TableMeta::new("authors", &["name"]);
const BOOKS: TableMeta = TableMeta::new("books", &["title", "author_id"]).with_foreign_keys(&["author_id"]);

fn library() -> MemoryStore {
    let store = MemoryStore::new();
    store
        .create_table("authors")
        .create_table("books")
        .not_null("books", "title")
        .foreign_key("books", "author_id", "authors");
    store
}

#[tokio::test]
async fn test_insert_select_update_delete() {
    let store = library();
    let mut session = store.session();

    let key = session.insert(&AUTHORS, &["Ursula".into()]).await.unwrap();
    assert_eq!(key, 1);

    let row = session.select_by_key(&AUTHORS, key).await.unwrap().unwrap();
    assert_eq!(row.get::<String>("NAME").unwrap(), "Ursula");

    let updated = session.update(&AUTHORS, key, &["Ursula K.".into()]).await.unwrap();
    assert_eq!(updated, 1);
    assert_eq!(session.update(&AUTHORS, 42, &["x".into()]).await.unwrap(), 0);

    assert_eq!(session.delete(&AUTHORS, key).await.unwrap(), 1);
    assert_eq!(session.delete(&AUTHORS, key).await.unwrap(), 0);
    assert!(session.select_all(&AUTHORS).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rollback_restores_snapshot() {
    let store = library();
    let mut session = store.session();
    store.seed("authors", Record::new().with("name", "kept")).unwrap();

    session.begin(Some(IsolationLevel::Serializable)).await.unwrap();
    session.insert(&AUTHORS, &["discarded".into()]).await.unwrap();
    assert_eq!(store.rows("authors").len(), 2);
    session.rollback().await.unwrap();

    assert_eq!(store.rows("authors").len(), 1);
    assert!(store.journal().contains(&SessionEvent::Begin(Some(IsolationLevel::Serializable))));
    assert!(store.journal().contains(&SessionEvent::Rollback));
}

#[tokio::test]
async fn test_nested_begin_and_stray_commit_fail() {
    let store = library();
    let mut session = store.session();

    assert!(matches!(session.commit().await, Err(AppError::Database(_))));
    session.begin(None).await.unwrap();
    assert!(matches!(session.begin(None).await, Err(AppError::Database(_))));
    session.commit().await.unwrap();
}

#[tokio::test]
async fn test_constraint_violations_are_database_errors() {
    let store = library();
    let mut session = store.session();

    let err = session
        .insert(&BOOKS, &[Value::Text(None), Value::Int(None)])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Database(msg) if msg.contains("not-null")));

    let err = session
        .insert(&BOOKS, &["Earthsea".into(), 9_i32.into()])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Database(msg) if msg.contains("foreign key")));

    let author = session.insert(&AUTHORS, &["Ursula".into()]).await.unwrap();
    session
        .insert(&BOOKS, &["Earthsea".into(), author.into()])
        .await
        .unwrap();
    let err = session.delete(&AUTHORS, author).await.unwrap_err();
    assert!(matches!(err, AppError::Database(_)));
    assert_eq!(store.rows("books").len(), 1);
}

#[tokio::test]
async fn test_execute_registered_procedure() {
    let store = library().with_default_schema("dbo");
    store.register_procedure("spEcho", |params| {
        let row: Record = params
            .iter()
            .map(|p| (p.normalized_name().to_string(), p.value.clone()))
            .collect();
        Ok(vec![ResultSet::from_rows(vec![row])])
    });
    let mut session = store.session();
    assert_eq!(session.default_schema().as_deref(), Some("dbo"));

    let mut command = Command::stored_procedure("dbo.spEcho");
    command.parameters.push(Parameter::new("@value", 5_i32));
    let sets = session.execute(&command).await.unwrap();
    assert_eq!(sets[0].rows[0].get::<i32>("value").unwrap(), 5);

    let missing = session.execute(&Command::stored_procedure("spMissing")).await;
    assert!(matches!(missing, Err(AppError::Database(_))));
}

#[tokio::test]
async fn test_open_close_are_journaled_once() {
    let store = library();
    let mut session = store.session();
    assert!(!session.is_open());

    session.open().await.unwrap();
    session.open().await.unwrap();
    session.select_all(&AUTHORS).await.unwrap();
    session.close().await.unwrap();
    session.close().await.unwrap();

    assert_eq!(
        store.journal(),
        vec![
            SessionEvent::Open,
            SessionEvent::Select {
                table: "authors".into()
            },
            SessionEvent::Close,
        ]
    );
}
