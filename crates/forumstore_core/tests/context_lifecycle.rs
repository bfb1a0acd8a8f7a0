use forumstore_core::{
    ChangeSet, Entity, Predicate, Repository, Store, StoreConfig, StoreError,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct Post {
    thread_id: String,
    author: String,
    body: String,
    seen: bool,
}

impl Entity for Post {
    const TYPE_NAME: &'static str = "Post";
}

fn post(author: &str, body: &str) -> Post {
    Post {
        thread_id: "3836680".to_string(),
        author: author.to_string(),
        body: body.to_string(),
        seen: false,
    }
}

fn seeded_store() -> (Arc<Store>, Repository<Post>) {
    let store = Store::open_in_memory().unwrap();
    let repo = Repository::<Post>::new();
    let mut ctx = store.new_context();
    repo.insert_with(&mut ctx, post("Lowtax", "first")).unwrap();
    ctx.commit().unwrap();
    (store, repo)
}

#[test]
fn conflicting_commit_leaves_pending_state_intact() {
    let (store, repo) = seeded_store();
    let mut first = store.new_context();
    let mut second = store.new_context();

    let mut from_first = repo.fetch_all(&first).unwrap().remove(0);
    let mut from_second = repo.fetch_all(&second).unwrap().remove(0);

    from_first.body = "edited by first".to_string();
    repo.save(&mut first, &from_first).unwrap();
    first.commit().unwrap();

    from_second.body = "edited by second".to_string();
    repo.save(&mut second, &from_second).unwrap();
    let sequence_before = store.last_sequence();
    match second.commit() {
        Err(StoreError::Conflict { id }) => assert_eq!(id, from_second.id()),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(store.last_sequence(), sequence_before);
    assert_eq!(second.pending_counts(), (0, 1, 0));

    let persisted = repo.fetch_all(&store.new_context()).unwrap();
    assert_eq!(persisted[0].body, "edited by first");

    second.discard();
    assert!(!second.has_changes());
    second.commit().unwrap();
}

#[test]
fn conflict_rolls_back_the_whole_commit() {
    let (store, repo) = seeded_store();
    let mut stale = store.new_context();
    let mut stale_post = repo.fetch_all(&stale).unwrap().remove(0);

    let mut winner = store.new_context();
    let mut fresh_post = repo.fetch_all(&winner).unwrap().remove(0);
    fresh_post.seen = true;
    repo.save(&mut winner, &fresh_post).unwrap();
    winner.commit().unwrap();

    repo.insert_with(&mut stale, post("Zack", "second")).unwrap();
    stale_post.seen = false;
    repo.save(&mut stale, &stale_post).unwrap();
    assert!(stale.commit().is_err());

    assert_eq!(repo.count(&store.new_context(), None).unwrap(), 1);
    assert_eq!(stale.pending_counts(), (1, 1, 0));
}

#[test]
fn merge_changes_lets_a_stale_context_save_again() {
    let (store, repo) = seeded_store();
    let mut first = store.new_context();
    let mut second = store.new_context();

    let mut from_first = repo.fetch_all(&first).unwrap().remove(0);
    let mut from_second = repo.fetch_all(&second).unwrap().remove(0);

    from_first.seen = true;
    repo.save(&mut first, &from_first).unwrap();
    let change_set = first.commit().unwrap();
    assert_eq!(change_set.updated.len(), 1);
    assert_eq!(change_set.updated[0].version, 2);

    from_second.body = "merged".to_string();
    repo.save(&mut second, &from_second).unwrap();
    assert_eq!(second.merge_changes(&change_set), 0);
    second.commit().unwrap();

    let persisted = repo.fetch_all(&store.new_context()).unwrap().remove(0);
    assert_eq!(persisted.body, "merged");
    assert_eq!(persisted.version(), 3);
}

#[test]
fn merge_changes_drops_pending_work_on_deleted_rows() {
    let (store, repo) = seeded_store();
    let mut editor = store.new_context();
    let mut remover = store.new_context();

    let mut target = repo.fetch_all(&editor).unwrap().remove(0);
    target.body = "too late".to_string();
    repo.save(&mut editor, &target).unwrap();

    repo.delete_all(&mut remover, &Predicate::always()).unwrap();
    let change_set = remover.commit().unwrap();
    assert_eq!(change_set.deleted.len(), 1);

    assert_eq!(editor.merge_changes(&change_set), 1);
    assert!(!editor.has_changes());
    editor.commit().unwrap();
    assert_eq!(repo.count(&editor, None).unwrap(), 0);
}

#[test]
fn merging_own_change_set_is_ignored() {
    let (store, repo) = seeded_store();
    let mut ctx = store.new_context();
    let mut target = repo.fetch_all(&ctx).unwrap().remove(0);
    target.seen = true;
    repo.save(&mut ctx, &target).unwrap();
    let change_set = ctx.commit().unwrap();
    assert_eq!(change_set.origin, Some(ctx.id()));

    assert_eq!(ctx.merge_changes(&change_set), 0);
}

#[test]
fn saving_twice_after_commit_uses_refreshed_versions() {
    let store = Store::open_in_memory().unwrap();
    let repo = Repository::<Post>::new();
    let mut ctx = store.new_context();

    let mut draft = repo.insert_with(&mut ctx, post("Kiwi", "v1")).unwrap();
    ctx.commit().unwrap();

    draft.body = "v2".to_string();
    repo.save(&mut ctx, &draft).unwrap();
    ctx.commit().unwrap();

    draft.body = "v3".to_string();
    repo.save(&mut ctx, &draft).unwrap();
    ctx.commit().unwrap();

    let persisted = repo.fetch_all(&store.new_context()).unwrap().remove(0);
    assert_eq!(persisted.body, "v3");
    assert_eq!(persisted.version(), 3);
}

#[test]
fn refetching_after_another_commit_allows_saving_again() {
    let store = Store::open_in_memory().unwrap();
    let repo = Repository::<Post>::new();
    let mut author = store.new_context();
    let created = repo.insert_with(&mut author, post("Lowtax", "v1")).unwrap();
    author.commit().unwrap();

    let mut moderator = store.new_context();
    let mut moderated = repo.fetch_all(&moderator).unwrap().remove(0);
    moderated.body = "edited by mod".to_string();
    repo.save(&mut moderator, &moderated).unwrap();
    moderator.commit().unwrap();

    let mut refetched = repo.fetch_all(&author).unwrap().remove(0);
    assert_eq!(refetched.id(), created.id());
    assert_eq!(refetched.version(), 2);
    refetched.body = "edited again by author".to_string();
    repo.save(&mut author, &refetched).unwrap();
    author.commit().unwrap();

    let persisted = repo.fetch_all(&store.new_context()).unwrap().remove(0);
    assert_eq!(persisted.body, "edited again by author");
    assert_eq!(persisted.version(), 3);
}

#[test]
fn stale_instance_still_conflicts_after_another_commit() {
    let store = Store::open_in_memory().unwrap();
    let repo = Repository::<Post>::new();
    let mut author = store.new_context();
    let mut created = repo.insert_with(&mut author, post("Lowtax", "v1")).unwrap();
    author.commit().unwrap();

    let mut moderator = store.new_context();
    let mut moderated = repo.fetch_all(&moderator).unwrap().remove(0);
    moderated.seen = true;
    repo.save(&mut moderator, &moderated).unwrap();
    moderator.commit().unwrap();

    created.body = "v2 from a stale copy".to_string();
    repo.save(&mut author, &created).unwrap();
    assert!(matches!(
        author.commit(),
        Err(StoreError::Conflict { id }) if id == created.id()
    ));
}

#[test]
fn instances_from_another_context_are_rejected() {
    let (store, repo) = seeded_store();
    let reader = store.new_context();
    let mut writer = store.new_context();

    let foreign = repo.fetch_all(&reader).unwrap().remove(0);
    match repo.save(&mut writer, &foreign) {
        Err(StoreError::ForeignInstance { id, owner, context }) => {
            assert_eq!(id, foreign.id());
            assert_eq!(owner, reader.id());
            assert_eq!(context, writer.id());
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(matches!(
        repo.delete(&mut writer, &foreign),
        Err(StoreError::ForeignInstance { .. })
    ));
    assert!(!writer.has_changes());
}

#[test]
fn observers_receive_every_successful_commit() {
    let store = Store::open_in_memory().unwrap();
    let repo = Repository::<Post>::new();
    let received: Arc<Mutex<Vec<ChangeSet>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    store.on_commit(move |change_set| sink.lock().unwrap().push(change_set.clone()));

    let mut ctx = store.new_context();
    let mut created = repo.insert_with(&mut ctx, post("Fistgrrl", "hi")).unwrap();
    ctx.commit().unwrap();

    ctx.commit().unwrap();

    created.seen = true;
    repo.save(&mut ctx, &created).unwrap();
    ctx.commit().unwrap();

    repo.delete(&mut ctx, &created).unwrap();
    ctx.commit().unwrap();

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 3);
    assert_eq!(
        received.iter().map(|set| set.sequence).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(received[0].inserted[0].id, created.id());
    assert_eq!(received[1].updated[0].version, 2);
    assert_eq!(received[2].deleted[0].id, created.id());
    assert!(received.iter().all(|set| set.origin == Some(ctx.id())));
    assert!(received.iter().all(|set| set.touches("Post")));
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct AuditEntry {
    sequence: u64,
    changes: usize,
}

impl Entity for AuditEntry {
    const TYPE_NAME: &'static str = "AuditEntry";
}

#[test]
fn observers_may_commit_and_register_observers_from_callbacks() {
    let store = Store::open_in_memory().unwrap();
    let repo = Repository::<Post>::new();
    let late_calls = Arc::new(AtomicUsize::new(0));

    let weak_store = Arc::downgrade(&store);
    let late_counter = Arc::clone(&late_calls);
    let registered = AtomicBool::new(false);
    store.on_commit(move |change_set| {
        if !change_set.touches("Post") {
            return;
        }
        let Some(store) = weak_store.upgrade() else {
            return;
        };

        let audit = Repository::<AuditEntry>::new();
        let mut audit_ctx = store.new_context();
        audit
            .insert_with(
                &mut audit_ctx,
                AuditEntry {
                    sequence: change_set.sequence,
                    changes: change_set.len(),
                },
            )
            .unwrap();
        audit_ctx.commit().unwrap();

        if !registered.swap(true, Ordering::SeqCst) {
            let counter = Arc::clone(&late_counter);
            store.on_commit(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
    });

    let mut ctx = store.new_context();
    repo.insert_with(&mut ctx, post("Lowtax", "first")).unwrap();
    ctx.commit().unwrap();
    repo.insert_with(&mut ctx, post("Lowtax", "second")).unwrap();
    ctx.commit().unwrap();

    let audit = Repository::<AuditEntry>::new();
    let entries = audit.fetch_all(&store.new_context()).unwrap();
    let mut sequences: Vec<u64> = entries.iter().map(|entry| entry.sequence).collect();
    sequences.sort_unstable();
    assert_eq!(sequences, vec![1, 3]);
    assert!(entries.iter().all(|entry| entry.changes == 1));

    // Registered during the first audit commit's broadcast: sees the second
    // post commit and its audit commit.
    assert_eq!(late_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn deleting_an_already_deleted_row_is_idempotent() {
    let (store, repo) = seeded_store();
    let mut first = store.new_context();
    let mut second = store.new_context();

    repo.delete_all(&mut first, &Predicate::always()).unwrap();
    repo.delete_all(&mut second, &Predicate::always()).unwrap();

    let first_set = first.commit().unwrap();
    let second_set = second.commit().unwrap();
    assert_eq!(first_set.deleted.len(), 1);
    assert!(second_set.deleted.is_empty());
}

#[test]
fn contexts_on_separate_threads_share_one_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&StoreConfig::file(dir.path().join("threads.db"))).unwrap();

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let repo = Repository::<Post>::new();
                let mut ctx = store.new_context();
                for index in 0..5 {
                    repo.insert_with(&mut ctx, post(&format!("worker{worker}"), &index.to_string()))
                        .unwrap();
                }
                ctx.commit().unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let repo = Repository::<Post>::new();
    let ctx = store.new_context();
    assert_eq!(repo.count(&ctx, None).unwrap(), 20);
    let worker_two = Predicate::key("author").unwrap().eq("worker2");
    assert_eq!(repo.count(&ctx, Some(&worker_two)).unwrap(), 5);
    assert_eq!(store.last_sequence(), 4);
}

#[test]
fn dropping_a_context_discards_its_changes() {
    let store = Store::open_in_memory().unwrap();
    let repo = Repository::<Post>::new();
    {
        let mut ctx = store.new_context();
        repo.insert_with(&mut ctx, post("Lowtax", "never saved")).unwrap();
    }
    assert!(!store.exists("Post", None).unwrap());
}
