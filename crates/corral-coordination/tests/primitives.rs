//! Cross-client behavior of the coordination primitives.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use corral_coordination::CoordinationClient;
use corral_coordination::CoordinationConfig;
use corral_coordination::LeadershipEvent;
use corral_coordination::UpdateEventType;
use corral_coordination::WatchNotification;
use corral_testing::DeterministicCoordinationStore;
use parking_lot::Mutex;

type Client = CoordinationClient<DeterministicCoordinationStore>;

fn client(store: &Arc<DeterministicCoordinationStore>, node: &str) -> Arc<Client> {
    let mut config = CoordinationConfig::default();
    config.node_name = node.to_string();
    config.operation_timeout_ms = 2_000;
    config.write_retry_delay_ms = 5;
    config.session_ttl_secs = 10;
    config.election.campaign_timeout_secs = 2;
    config.election.observe_interval_ms = 50;
    config.election.error_backoff_ms = 50;
    config.watcher.reconnect_delay_ms = 50;
    Arc::new(CoordinationClient::new(store.clone(), config).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lock_holders_never_overlap() {
    let store = DeterministicCoordinationStore::new();
    let inside = Arc::new(AtomicBool::new(false));
    let entries = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for node in 0..4 {
        let client = client(&store, &format!("node-{node}"));
        let inside = inside.clone();
        let entries = entries.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..3 {
                client.lock("shared").await.unwrap();
                assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.store(false, Ordering::SeqCst);
                entries.fetch_add(1, Ordering::SeqCst);
                client.unlock("shared").await.unwrap();
            }
            client.close().await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(entries.load(Ordering::SeqCst), 12);
    assert!(store.keys().is_empty());
}

#[tokio::test]
async fn different_lock_keys_do_not_block_each_other() {
    let store = DeterministicCoordinationStore::new();
    let a = client(&store, "a");
    let b = client(&store, "b");

    a.lock("alpha").await.unwrap();
    b.lock_timeout("beta", Duration::from_millis(500)).await.unwrap();

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn destroying_a_held_lock_lets_the_next_waiter_in() {
    let store = DeterministicCoordinationStore::new();
    let holder = client(&store, "holder");
    let waiter = client(&store, "waiter");

    holder.lock("jobs").await.unwrap();
    let pending = {
        let waiter = waiter.clone();
        tokio::spawn(async move { waiter.lock_timeout("jobs", Duration::from_secs(3)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    holder.destroy_lock("jobs").await.unwrap();
    pending.await.unwrap().unwrap();

    waiter.close().await;
}

#[tokio::test]
async fn destroy_lock_on_unknown_key_succeeds() {
    let store = DeterministicCoordinationStore::new();
    client(&store, "a").destroy_lock("never-seen").await.unwrap();
}

#[tokio::test]
async fn one_leader_among_participants() {
    let store = DeterministicCoordinationStore::new();
    let clients: Vec<_> = (0..3).map(|i| client(&store, &format!("node-{i}"))).collect();
    let leaders = Arc::new(Mutex::new(HashSet::new()));

    let mut ids = Vec::new();
    for client in &clients {
        let leaders = leaders.clone();
        let node = client.node_name().to_string();
        let id = client
            .new_election("/election/scheduler", move |event: LeadershipEvent| {
                let mut leaders = leaders.lock();
                if event.is_leader() {
                    leaders.insert(node.clone());
                } else {
                    leaders.remove(&node);
                }
            })
            .await
            .unwrap();
        ids.push(id);
    }

    let mut saw_leader = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let current = leaders.lock().len();
        assert!(current <= 1, "more than one leader reported");
        saw_leader |= current == 1;
    }
    assert!(saw_leader);

    let winners = clients
        .iter()
        .zip(&ids)
        .filter(|(client, id)| client.election_state(**id).is_some_and(|state| state.is_leader()))
        .count();
    assert_eq!(winners, 1);

    for client in &clients {
        client.close().await;
    }
}

#[tokio::test]
async fn leadership_moves_when_the_leader_leaves() {
    let store = DeterministicCoordinationStore::new();
    let first = client(&store, "first");
    let second = client(&store, "second");

    let (first_id, mut first_events) = first.subscribe_election("/election/api").await.unwrap();
    loop {
        if first_events.recv().await.unwrap().is_leader() {
            break;
        }
    }

    let (_, mut second_events) = second.subscribe_election("/election/api").await.unwrap();
    loop {
        let event = second_events.recv().await.unwrap();
        if let LeadershipEvent::Following { leader } = event {
            assert_eq!(leader, "first");
            break;
        }
    }

    assert!(first.destroy_election(first_id).await);

    let took_over = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if second_events.recv().await.unwrap().is_leader() {
                break;
            }
        }
    })
    .await;
    assert!(took_over.is_ok());

    first.close().await;
    second.close().await;
}

#[tokio::test]
async fn watcher_reports_one_disconnect_then_resumes() {
    let store = DeterministicCoordinationStore::new();
    let client = client(&store, "watcher");
    let (_, mut events) = client.subscribe("/config/").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    store.close_watch_streams();
    let first = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
    assert_eq!(first, WatchNotification::Disconnected);

    tokio::time::sleep(Duration::from_millis(150)).await;
    client.put("/config/a", "1").await.unwrap();
    client.delete("/config/a").await.unwrap();

    let mut kinds = Vec::new();
    while kinds.len() < 2 {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap() {
            WatchNotification::Event(event) => kinds.push(event.kind),
            WatchNotification::Disconnected => panic!("second disconnect"),
        }
    }
    assert_eq!(kinds, vec![UpdateEventType::Put, UpdateEventType::Delete]);

    client.close().await;
}

#[tokio::test]
async fn watcher_callbacks_run_on_the_pool() {
    let store = DeterministicCoordinationStore::new();
    let client = client(&store, "watcher");
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let id = client
        .new_watcher("/jobs/", move |notification| {
            if matches!(notification, WatchNotification::Event(_)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    for i in 0..5 {
        client.put(&format!("/jobs/{i}"), "x").await.unwrap();
    }
    for _ in 0..100 {
        if seen.load(Ordering::SeqCst) == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(seen.load(Ordering::SeqCst), 5);

    assert!(client.stop_watcher(id).await);
    assert!(!client.stop_watcher(id).await);
}

#[tokio::test]
async fn queue_serves_priority_then_insertion_order() {
    let store = DeterministicCoordinationStore::new();
    let client = client(&store, "q");
    let queue = client.priority_queue("orders").unwrap();

    queue.push("A", 1).await.unwrap();
    queue.push("B", 2).await.unwrap();
    queue.push("C", 1).await.unwrap();

    let mut popped = Vec::new();
    while let Some(item) = queue.pop().await.unwrap() {
        popped.push(item.value);
    }
    assert_eq!(popped, vec!["A", "C", "B"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pops_claim_each_entry_once() {
    let store = DeterministicCoordinationStore::new();
    let producer = client(&store, "producer");
    let queue = producer.priority_queue("work").unwrap();
    for i in 0..20 {
        queue.push(&format!("item-{i}"), (i % 3) as u16).await.unwrap();
    }

    let mut consumers = Vec::new();
    for c in 0..8 {
        let consumer = client(&store, &format!("consumer-{c}"));
        consumers.push(tokio::spawn(async move {
            let queue = consumer.priority_queue("work").unwrap();
            let mut mine = Vec::new();
            while let Some(item) = queue.pop().await.unwrap() {
                mine.push(item.value);
            }
            mine
        }));
    }

    let mut all = Vec::new();
    for consumer in consumers {
        all.extend(consumer.await.unwrap());
    }
    let distinct: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 20);
    assert_eq!(distinct.len(), 20);
    assert_eq!(queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn deleted_queue_is_empty_and_unlisted() {
    let store = DeterministicCoordinationStore::new();
    let client = client(&store, "q");
    let queue = client.priority_queue("team-reports").unwrap();
    client.priority_queue("team-billing").unwrap().push("x", 0).await.unwrap();
    for i in 0..4 {
        queue.push(&i.to_string(), 2).await.unwrap();
    }

    queue.delete().await.unwrap();

    assert_eq!(queue.len().await.unwrap(), 0);
    assert_eq!(client.priority_queue_list("team-").await.unwrap(), vec!["team-billing"]);
}

#[tokio::test]
async fn blocking_pop_ends_when_the_client_closes() {
    let store = DeterministicCoordinationStore::new();
    let client = client(&store, "q");
    let queue = client.priority_queue("idle").unwrap();

    let waiting = tokio::spawn(async move { queue.pop_wait().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.close().await;

    let result = tokio::time::timeout(Duration::from_secs(1), waiting).await.unwrap().unwrap();
    assert!(result.is_err());
}
