mod common;

use std::sync::Arc;

use common::{Author, Book, library, transaction_events, unit_of_work, write_events};
use tokio_util::sync::CancellationToken;
use trellis_adapter_memory::SessionEvent;
use trellis_domain_core::Record;
use trellis_errors::AppError;

#[tokio::test]
async fn test_insert_with_save_assigns_key_and_round_trips() {
    let store = library();
    let uow = unit_of_work(&store);
    let authors = uow.repository::<Author>().unwrap();

    let mut author = Author::named("Ursula K. Le Guin");
    authors.insert(&mut author, true).await.unwrap();
    assert!(author.id > 0);

    let found = authors.find(author.id).await.unwrap().unwrap();
    assert_eq!(found, author);
    assert_eq!(store.rows("authors").len(), 1);
}

#[tokio::test]
async fn test_find_missing_returns_none() {
    let store = library();
    let uow = unit_of_work(&store);
    let authors = uow.repository::<Author>().unwrap();

    assert_eq!(authors.find(404).await.unwrap(), None);
}

#[tokio::test]
async fn test_find_reads_from_identity_map_after_first_load() {
    let store = library();
    let key = store
        .seed("authors", Record::new().with("name", "Octavia Butler"))
        .unwrap();
    let uow = unit_of_work(&store);
    let authors = uow.repository::<Author>().unwrap();

    authors.find(key).await.unwrap().unwrap();
    authors.find(key).await.unwrap().unwrap();

    let selects = store
        .journal()
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::Select { .. }))
        .count();
    assert_eq!(selects, 1);
}

#[tokio::test]
async fn test_delete_missing_id_is_silent_noop() {
    let store = library();
    store.seed("authors", Record::new().with("name", "kept")).unwrap();
    let uow = unit_of_work(&store);
    let authors = uow.repository::<Author>().unwrap();

    authors.delete_by_id(999, true).await.unwrap();

    assert_eq!(store.rows("authors").len(), 1);
    assert!(write_events(&store).is_empty());
    assert!(transaction_events(&store).is_empty());
}

#[tokio::test]
async fn test_empty_ranges_never_flush() {
    let store = library();
    let uow = unit_of_work(&store);
    let authors = uow.repository::<Author>().unwrap();

    // 先暂存一个插入：空批量如果刷新就会把它写出去
    let mut pending = Author::named("staged");
    authors.insert(&mut pending, false).await.unwrap();

    authors.insert_range(&mut [], true).await.unwrap();
    authors.delete_range(&[], true).await.unwrap();

    assert!(store.journal().is_empty());
    assert!(store.rows("authors").is_empty());
}

#[tokio::test]
async fn test_staged_changes_become_visible_only_after_save() {
    let store = library();
    let existing = store.seed("authors", Record::new().with("name", "old")).unwrap();
    let uow = unit_of_work(&store);
    let authors = uow.repository::<Author>().unwrap();

    let mut added = Author::named("new");
    authors.insert(&mut added, false).await.unwrap();
    authors.delete_by_id(existing, false).await.unwrap();

    assert!(added.id < 0);
    let names: Vec<String> = store
        .rows("authors")
        .iter()
        .map(|r| r.get("name").unwrap())
        .collect();
    assert_eq!(names, ["old"]);

    let rows = uow.save_changes(&CancellationToken::new()).await.unwrap();
    assert_eq!(rows, 2);

    let names: Vec<String> = store
        .rows("authors")
        .iter()
        .map(|r| r.get("name").unwrap())
        .collect();
    assert_eq!(names, ["new"]);
    let key = uow.resolve_key(added.id).await.unwrap();
    assert_eq!(authors.find(added.id).await.unwrap().unwrap().id, key);
}

#[tokio::test]
async fn test_save_flushes_changes_staged_by_other_repositories() {
    let store = library();
    let uow = unit_of_work(&store);
    let authors = uow.repository::<Author>().unwrap();
    let books = uow.repository::<Book>().unwrap();

    let mut author = Author::named("Iain Banks");
    authors.insert(&mut author, false).await.unwrap();

    let mut book = Book::by(&author, Some("Excession"));
    books.insert(&mut book, true).await.unwrap();

    assert_eq!(store.rows("authors").len(), 1);
    assert_eq!(store.rows("books").len(), 1);
    let stored: Book = books.find(book.id).await.unwrap().unwrap();
    assert_eq!(Some(stored.author_id), uow.resolve_key(author.id).await);
}

#[tokio::test]
async fn test_find_returns_staged_insert_by_temporary_key() {
    let store = library();
    let uow = unit_of_work(&store);
    let authors = uow.repository::<Author>().unwrap();

    let mut author = Author::named("draft");
    authors.insert(&mut author, false).await.unwrap();

    let found = authors.find(author.id).await.unwrap().unwrap();
    assert_eq!(found, author);
    assert!(store.journal().is_empty());
}

#[tokio::test]
async fn test_update_writes_caller_changes() {
    let store = library();
    let uow = unit_of_work(&store);
    let authors = uow.repository::<Author>().unwrap();

    let mut author = Author::named("Iain Banks");
    authors.insert(&mut author, true).await.unwrap();

    author.name = Some("Iain M. Banks".into());
    authors.update(&author, true).await.unwrap();

    assert_eq!(
        store.rows("authors")[0].get::<String>("name").unwrap(),
        "Iain M. Banks"
    );
    assert_eq!(
        authors.find(author.id).await.unwrap().unwrap().name.as_deref(),
        Some("Iain M. Banks")
    );
}

#[tokio::test]
async fn test_update_of_staged_insert_is_folded_into_insert() {
    let store = library();
    let uow = unit_of_work(&store);
    let authors = uow.repository::<Author>().unwrap();

    let mut author = Author::named("draft");
    authors.insert(&mut author, false).await.unwrap();
    author.name = Some("final".into());
    authors.update(&author, true).await.unwrap();

    assert_eq!(write_events(&store).len(), 1);
    assert_eq!(store.rows("authors")[0].get::<String>("name").unwrap(), "final");
}

#[tokio::test]
async fn test_update_of_vanished_row_is_conflict() {
    let store = library();
    let uow = unit_of_work(&store);
    let authors = uow.repository::<Author>().unwrap();

    let ghost = Author {
        id: 41,
        name: Some("ghost".into()),
    };
    let err = authors.update(&ghost, true).await.unwrap_err();

    assert!(matches!(err, AppError::Conflict(_)));
    assert!(!uow.has_active_transaction().await);
    assert_eq!(
        transaction_events(&store),
        vec![SessionEvent::Begin(None), SessionEvent::Rollback]
    );
}

#[tokio::test]
async fn test_update_of_never_inserted_entity_is_misuse() {
    let store = library();
    let uow = unit_of_work(&store);
    let authors = uow.repository::<Author>().unwrap();

    let err = authors.update(&Author::named("x"), true).await.unwrap_err();
    assert!(matches!(err, AppError::Misuse(_)));
}

#[tokio::test]
async fn test_inserting_persisted_entity_twice_is_misuse() {
    let store = library();
    let uow = unit_of_work(&store);
    let authors = uow.repository::<Author>().unwrap();

    let mut author = Author::named("once");
    authors.insert(&mut author, true).await.unwrap();
    let err = authors.insert(&mut author, true).await.unwrap_err();

    assert!(matches!(err, AppError::Misuse(_)));
    assert_eq!(store.rows("authors").len(), 1);
}

#[tokio::test]
async fn test_reinserting_entity_flushed_by_save_changes_is_misuse() {
    let store = library();
    let uow = unit_of_work(&store);
    let authors = uow.repository::<Author>().unwrap();

    let mut author = Author::named("flushed elsewhere");
    authors.insert(&mut author, false).await.unwrap();
    uow.save_changes(&CancellationToken::new()).await.unwrap();
    // 实体仍持有临时键，数据库键只在键映射里
    assert!(author.id < 0);

    let err = authors.insert(&mut author, true).await.unwrap_err();
    assert!(matches!(err, AppError::Misuse(_)));
    assert_eq!(store.rows("authors").len(), 1);
}

#[tokio::test]
async fn test_get_all_keeps_staged_update_visible_to_find() {
    let store = library();
    let key = store
        .seed("authors", Record::new().with("name", "Octavia Butler"))
        .unwrap();
    let uow = unit_of_work(&store);
    let authors = uow.repository::<Author>().unwrap();

    let mut author = authors.find(key).await.unwrap().unwrap();
    author.name = Some("Octavia E. Butler".into());
    authors.update(&author, false).await.unwrap();

    let all = authors.get_all().await.unwrap();
    assert_eq!(all[0].name.as_deref(), Some("Octavia Butler"));
    assert_eq!(
        authors.find(key).await.unwrap().unwrap().name.as_deref(),
        Some("Octavia E. Butler")
    );
}

#[tokio::test]
async fn test_delete_entity_and_range() {
    let store = library();
    let uow = unit_of_work(&store);
    let authors = uow.repository::<Author>().unwrap();

    let mut batch = vec![
        Author::named("a"),
        Author::named("b"),
        Author::named("c"),
    ];
    authors.insert_range(&mut batch, true).await.unwrap();
    assert!(batch.iter().all(|a| a.id > 0));

    authors.delete(&batch[0], true).await.unwrap();
    assert_eq!(authors.count().await.unwrap(), 2);

    authors.delete_range(&batch[1..], true).await.unwrap();
    assert_eq!(authors.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_query_helpers() {
    let store = library();
    for name in ["Banks", "Butler", "Le Guin"] {
        store.seed("authors", Record::new().with("name", name)).unwrap();
    }
    let uow = unit_of_work(&store);
    let authors = uow.repository::<Author>().unwrap();

    let starts_with_b = |a: &Author| a.name.as_deref().is_some_and(|n| n.starts_with('B'));

    assert_eq!(authors.filter(starts_with_b).await.unwrap().len(), 2);
    assert_eq!(
        authors
            .first_where(starts_with_b)
            .await
            .unwrap()
            .unwrap()
            .name
            .as_deref(),
        Some("Banks")
    );
    assert!(authors.any(|a| a.id == 3).await.unwrap());
    assert!(!authors.any(|a| a.id == 4).await.unwrap());
    assert_eq!(authors.count().await.unwrap(), 3);
    assert_eq!(authors.count_where(starts_with_b).await.unwrap(), 2);
    assert_eq!(
        authors
            .last_where(starts_with_b)
            .await
            .unwrap()
            .unwrap()
            .name
            .as_deref(),
        Some("Butler")
    );
    assert_eq!(authors.last_where(|a| a.id == 9).await.unwrap(), None);
}

#[tokio::test]
async fn test_single_where_rejects_multiple_matches() {
    let store = library();
    for name in ["Banks", "Butler", "Le Guin"] {
        store.seed("authors", Record::new().with("name", name)).unwrap();
    }
    let uow = unit_of_work(&store);
    let authors = uow.repository::<Author>().unwrap();

    let le_guin = authors
        .single_where(|a| a.name.as_deref() == Some("Le Guin"))
        .await
        .unwrap();
    assert_eq!(le_guin.map(|a| a.id), Some(3));
    assert_eq!(authors.single_where(|a| a.id == 9).await.unwrap(), None);

    let err = authors
        .single_where(|a| a.name.as_deref().is_some_and(|n| n.starts_with('B')))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn test_order_by() {
    let store = library();
    for name in ["Le Guin", "Banks", "Butler"] {
        store.seed("authors", Record::new().with("name", name)).unwrap();
    }
    let uow = unit_of_work(&store);
    let authors = uow.repository::<Author>().unwrap();

    let names: Vec<_> = authors
        .order_by(|a| a.name.clone())
        .await
        .unwrap()
        .into_iter()
        .filter_map(|a| a.name)
        .collect();
    assert_eq!(names, vec!["Banks", "Butler", "Le Guin"]);

    let ids: Vec<_> = authors
        .order_by(|a| std::cmp::Reverse(a.id))
        .await
        .unwrap()
        .iter()
        .map(|a| a.id)
        .collect();
    assert_eq!(ids, vec![3, 2, 1]);
}

#[tokio::test]
async fn test_repository_instances_are_cached_per_type() {
    let store = library();
    let uow = unit_of_work(&store);

    let first = uow.repository::<Author>().unwrap();
    let second = uow.repository::<Author>().unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let other = unit_of_work(&store).repository::<Author>().unwrap();
    assert!(!Arc::ptr_eq(&first, &other));
}

#[tokio::test]
async fn test_repository_is_invalid_after_dispose() {
    let store = library();
    let uow = unit_of_work(&store);
    let authors = uow.repository::<Author>().unwrap();

    uow.dispose().await.unwrap();

    let err = authors.get_all().await.unwrap_err();
    assert!(matches!(err, AppError::Misuse(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_find_blocking_from_worker_thread() {
    let store = library();
    let key = store.seed("authors", Record::new().with("name", "sync")).unwrap();
    let uow = unit_of_work(&store);
    let authors = uow.repository::<Author>().unwrap();
    let handle = tokio::runtime::Handle::current();

    let found = tokio::task::spawn_blocking(move || authors.find_blocking(&handle, key))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(found.unwrap().name.as_deref(), Some("sync"));
}
