//! End-to-end query layer tests: de-duplication, stale-while-revalidate,
//! and multi-site convergence through the shared cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use turma_client::cache::CacheConfig;
use turma_client::error::FetchError;
use turma_client::query::{QueryClient, QueryOptions, RevalidationConfig};

fn slow_fetcher(
    calls: &Arc<AtomicUsize>,
    value: &str,
    delay: Duration,
) -> impl Fn() -> std::pin::Pin<
    Box<dyn std::future::Future<Output = Result<String, FetchError>> + Send>,
> + Send
+ Sync
+ 'static {
    let calls = Arc::clone(calls);
    let value = value.to_string();
    move || {
        calls.fetch_add(1, Ordering::SeqCst);
        let value = value.clone();
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(value)
        })
    }
}

#[tokio::test]
async fn concurrent_sites_share_one_fetch() {
    let client: Arc<QueryClient<String>> = Arc::new(QueryClient::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let coordinators: Vec<_> = (0..8)
        .map(|_| {
            client.query(
                "students:1:p1:s20",
                slow_fetcher(&calls, "roster", Duration::from_millis(30)),
                QueryOptions::default(),
            )
        })
        .collect();

    for coordinator in &coordinators {
        coordinator.activate();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for coordinator in &coordinators {
        let state = coordinator.state();
        assert_eq!(state.data.as_deref(), Some("roster"));
        assert!(!state.is_loading);
        assert!(state.error.is_none());
    }
    assert!(client.pending().is_empty());
}

#[tokio::test]
async fn stale_value_is_served_while_one_refetch_runs() {
    let client: QueryClient<String> = QueryClient::default();
    let calls = Arc::new(AtomicUsize::new(0));

    // A TTL of zero makes the entry stale the moment it is written.
    client
        .cache()
        .set("classes", "old".to_string(), Duration::ZERO);

    let a = client.query(
        "classes",
        slow_fetcher(&calls, "new", Duration::from_millis(30)),
        QueryOptions::default(),
    );
    let b = client.query(
        "classes",
        slow_fetcher(&calls, "new", Duration::from_millis(30)),
        QueryOptions::default(),
    );

    a.activate();
    b.activate();

    // The stale value is visible immediately, marked as refreshing.
    let state = a.state();
    assert_eq!(state.data.as_deref(), Some("old"));
    assert!(state.is_stale);
    assert!(state.is_refreshing);
    assert!(!state.is_loading);

    tokio::time::sleep(Duration::from_millis(100)).await;

    // Exactly one refetch ran and both sites converged on its result.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.state().data.as_deref(), Some("new"));
    assert_eq!(b.state().data.as_deref(), Some("new"));
    assert!(a.state().is_fresh);
}

#[tokio::test]
async fn cold_start_goes_through_loading_to_data() {
    let client: QueryClient<String> = QueryClient::default();
    let calls = Arc::new(AtomicUsize::new(0));

    let coordinator = client.query(
        "grades",
        slow_fetcher(&calls, "grades-v1", Duration::from_millis(50)),
        QueryOptions::default(),
    );

    coordinator.activate();

    let state = coordinator.state();
    assert!(state.data.is_none());
    assert!(state.is_loading);

    tokio::time::sleep(Duration::from_millis(120)).await;

    let state = coordinator.state();
    assert_eq!(state.data.as_deref(), Some("grades-v1"));
    assert!(!state.is_loading);
    assert!(state.is_fresh);
}

#[tokio::test]
async fn refresh_on_one_site_updates_every_site() {
    let client: QueryClient<String> = QueryClient::default();
    let fetch_a = Arc::new(AtomicUsize::new(0));
    let fetch_b = Arc::new(AtomicUsize::new(0));

    let a = client.query(
        "classes",
        slow_fetcher(&fetch_a, "from-a", Duration::ZERO),
        QueryOptions::default(),
    );
    let b = client.query(
        "classes",
        slow_fetcher(&fetch_b, "from-b", Duration::ZERO),
        QueryOptions::default(),
    );

    a.refresh().await;

    // B never fetched; it converged through the shared cache.
    assert_eq!(fetch_b.load(Ordering::SeqCst), 0);
    assert_eq!(b.state().data.as_deref(), Some("from-a"));
    assert!(b.state().is_fresh);
}

#[tokio::test]
async fn detached_site_stops_observing_cache_writes() {
    let client: QueryClient<String> = QueryClient::default();

    let a = client.query(
        "classes",
        || async { Ok("v1".to_string()) },
        QueryOptions::default(),
    );
    let mut b = client.query(
        "classes",
        || async { Ok("unused".to_string()) },
        QueryOptions::default(),
    );

    b.detach();
    a.refresh().await;

    assert_eq!(a.state().data.as_deref(), Some("v1"));
    assert!(b.state().data.is_none());
}

#[tokio::test]
async fn per_site_ttl_controls_freshness() {
    let client: QueryClient<String> = QueryClient::new(
        RevalidationConfig::default(),
        CacheConfig {
            default_ttl: Duration::from_secs(30),
            max_entries: 100,
        },
    );

    let coordinator = client.query(
        "volatile",
        || async { Ok("v".to_string()) },
        QueryOptions {
            ttl: Some(Duration::from_millis(20)),
            ..QueryOptions::default()
        },
    );

    coordinator.refresh().await;
    assert!(client.cache().is_fresh("volatile"));

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(client.cache().is_stale("volatile"));
    // The value itself is never evicted by age.
    assert_eq!(client.cache().get("volatile").as_deref(), Some("v"));
}
