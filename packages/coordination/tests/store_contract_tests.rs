// ABOUTME: Behavioural contract shared by every coordination store backend
// ABOUTME: Each property runs against both the in-memory and the SQL implementation

use pretty_assertions::assert_eq;
use sandchest_coordination::{
    CoordinationStore, LeaseManager, MemoryCoordinationStore, SqlCoordinationStore,
};
use sandchest_core::ManualClock;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;

const START_MS: i64 = 1_700_000_000_000;

async fn backends() -> Vec<(&'static str, Arc<dyn CoordinationStore>, ManualClock)> {
    let memory_clock = ManualClock::new(START_MS);
    let memory: Arc<dyn CoordinationStore> =
        Arc::new(MemoryCoordinationStore::new(Arc::new(memory_clock.clone())));

    let sql_clock = ManualClock::new(START_MS);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let sql: Arc<dyn CoordinationStore> = Arc::new(
        SqlCoordinationStore::new(pool, Arc::new(sql_clock.clone()))
            .await
            .unwrap(),
    );

    vec![("memory", memory, memory_clock), ("sql", sql, sql_clock)]
}

#[tokio::test]
async fn concurrent_acquire_has_exactly_one_winner() {
    for (name, store, _) in backends().await {
        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.acquire_slot_lease("n1", 0, "sb_a", 60).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.acquire_slot_lease("n1", 0, "sb_b", 60).await })
        };

        let results = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
        assert_eq!(
            results.iter().filter(|won| **won).count(),
            1,
            "backend {}",
            name
        );
    }
}

#[tokio::test]
async fn release_frees_the_slot() {
    for (name, store, _) in backends().await {
        assert!(store.acquire_slot_lease("n1", 3, "sb_a", 60).await.unwrap());
        assert!(!store.acquire_slot_lease("n1", 3, "sb_b", 60).await.unwrap());

        store.release_slot_lease("n1", 3).await.unwrap();
        store.release_slot_lease("n1", 3).await.unwrap();

        assert!(
            store.acquire_slot_lease("n1", 3, "sb_b", 60).await.unwrap(),
            "backend {}",
            name
        );
    }
}

#[tokio::test]
async fn lease_expires_without_renewal() {
    for (name, store, clock) in backends().await {
        assert!(store.acquire_slot_lease("n1", 0, "sb_a", 60).await.unwrap());

        clock.advance_secs(59);
        assert!(!store.acquire_slot_lease("n1", 0, "sb_b", 60).await.unwrap());

        clock.advance_secs(1);
        assert!(
            store.acquire_slot_lease("n1", 0, "sb_b", 60).await.unwrap(),
            "backend {}",
            name
        );
    }
}

#[tokio::test]
async fn renew_is_compare_and_set_on_holder() {
    for (name, store, clock) in backends().await {
        assert!(store.acquire_slot_lease("n1", 0, "sb_a", 60).await.unwrap());
        assert!(!store.renew_slot_lease("n1", 0, "sb_b", 60).await.unwrap());

        clock.advance_secs(50);
        assert!(store.renew_slot_lease("n1", 0, "sb_a", 60).await.unwrap());

        // The renewal pushed expiry to 110s after the start.
        clock.advance_secs(50);
        assert!(!store.acquire_slot_lease("n1", 0, "sb_b", 60).await.unwrap());
        assert_eq!(
            store.get_slot_holder("n1", 0).await.unwrap().as_deref(),
            Some("sb_a"),
            "backend {}",
            name
        );
    }
}

#[tokio::test]
async fn leader_lock_is_reentrant_for_holder_only() {
    for (name, store, clock) in backends().await {
        assert!(store.acquire_leader_lock("ttl", "inst_a", 30).await.unwrap());
        assert!(store.acquire_leader_lock("ttl", "inst_a", 30).await.unwrap());
        assert!(!store.acquire_leader_lock("ttl", "inst_b", 30).await.unwrap());

        clock.advance_secs(30);
        assert!(
            store.acquire_leader_lock("ttl", "inst_b", 30).await.unwrap(),
            "backend {}",
            name
        );
        assert!(!store.acquire_leader_lock("ttl", "inst_a", 30).await.unwrap());
    }
}

#[tokio::test]
async fn rate_limit_window_rejects_then_resets() {
    for (name, store, clock) in backends().await {
        for i in 0..5 {
            let decision = store.check_rate_limit("org_1", "exec", 5, 60).await.unwrap();
            assert!(decision.allowed, "backend {} request {}", name, i + 1);
            assert_eq!(decision.remaining, 4 - i);
        }

        let rejected = store.check_rate_limit("org_1", "exec", 5, 60).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.limit, 5);
        assert_eq!(rejected.remaining, 0);

        // Other tenants and categories have their own counters.
        assert!(store.check_rate_limit("org_2", "exec", 5, 60).await.unwrap().allowed);
        assert!(store.check_rate_limit("org_1", "read", 5, 60).await.unwrap().allowed);

        clock.set_ms(rejected.reset_at_ms);
        let fresh = store.check_rate_limit("org_1", "exec", 5, 60).await.unwrap();
        assert!(fresh.allowed, "backend {}", name);
        assert_eq!(fresh.remaining, 4);
    }
}

#[tokio::test]
async fn replay_list_filters_by_sequence_and_expires() {
    for (name, store, clock) in backends().await {
        for seq in 1..=3u64 {
            store
                .push_replay_event("sb_1", seq, &format!("{{\"seq\":{}}}", seq), 100)
                .await
                .unwrap();
        }

        let all = store.get_replay_events("sb_1", 0).await.unwrap();
        assert_eq!(all.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3]);

        let tail = store.get_replay_events("sb_1", 2).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].event, "{\"seq\":3}");

        clock.advance_secs(101);
        assert!(
            store.get_replay_events("sb_1", 0).await.unwrap().is_empty(),
            "backend {}",
            name
        );
        assert!(store.purge_expired().await.unwrap() > 0);
    }
}

#[tokio::test]
async fn heartbeats_expire() {
    for (name, store, clock) in backends().await {
        assert!(!store.has_node_heartbeat("node_1").await.unwrap());
        store.register_node_heartbeat("node_1", 45).await.unwrap();
        assert!(store.has_node_heartbeat("node_1").await.unwrap());

        clock.advance_secs(45);
        assert!(
            !store.has_node_heartbeat("node_1").await.unwrap(),
            "backend {}",
            name
        );
    }
}

#[tokio::test]
async fn lease_manager_propagates_store_failure() {
    let clock = ManualClock::new(START_MS);
    let store = Arc::new(MemoryCoordinationStore::new(Arc::new(clock)));
    let leases = LeaseManager::new(store.clone(), 60);

    store.set_unavailable(true);
    assert!(leases.acquire_any("n1", 4, "sb_a").await.is_err());
}
