mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::net::TcpListener;
use trellis::{
    ClientConfig, FailMode, KvPair, Metadata, RpcError, SelectMode, Server, Service,
    StaticDiscovery, XClient,
};

use common::{arith_service, start_server, Args, Reply};

/// Binds and drops a listener, yielding an address nothing listens on.
async fn dead_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    format!("tcp@{addr}")
}

/// A service that counts invocations and replies with a fixed value after an
/// optional delay.
fn counting_service(hits: Arc<AtomicUsize>, value: i64, delay: Duration) -> Service {
    Service::new("Ping").method("Echo", move |_args: Args, _metadata: Metadata| {
        let hits = Arc::clone(&hits);
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok::<_, RpcError>(Reply { c: value })
        }
    })
}

#[tokio::test]
async fn failover_reaches_the_surviving_server() {
    let live = Arc::new(Server::new());
    live.register(arith_service());
    let live_key = start_server(Arc::clone(&live)).await;
    let dead_key = dead_address().await;

    let discovery = StaticDiscovery::new(vec![
        KvPair::new(dead_key, ""),
        KvPair::new(live_key, ""),
    ]);
    let config = ClientConfig {
        retries: 3,
        connect_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    };
    let xclient = XClient::new(
        "Arith",
        "Mul",
        FailMode::Failover,
        SelectMode::RoundRobin,
        &discovery,
        config,
    );

    // Round-robin lands on the dead server for some of these calls; every
    // one must still succeed by failing over.
    for i in 1..=4 {
        let reply: Reply = xclient
            .call(&Args { a: i, b: 100 }, Metadata::new())
            .await
            .expect("failover call");
        assert_eq!(reply.c, i * 100);
    }
}

#[tokio::test]
async fn failfast_reports_the_connect_failure() {
    let discovery = StaticDiscovery::new(vec![KvPair::new(dead_address().await, "")]);
    let config = ClientConfig {
        connect_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    };
    let xclient = XClient::new(
        "Arith",
        "Mul",
        FailMode::Failfast,
        SelectMode::Random,
        &discovery,
        config,
    );

    let err = xclient
        .call::<_, Reply>(&Args::default(), Metadata::new())
        .await
        .expect_err("nothing is listening");
    assert!(matches!(err, RpcError::ConnectFailed { .. }), "{err}");
}

#[tokio::test]
async fn failtry_retries_the_same_server() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let server = Arc::new(Server::new());
    let seen = Arc::clone(&attempts);
    server.register(Service::new("Arith").method(
        "Mul",
        move |args: Args, _metadata: Metadata| {
            let seen = Arc::clone(&seen);
            async move {
                // Fail the first attempt, succeed afterwards.
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(RpcError::Handler("warming up".to_string()))
                } else {
                    Ok(Reply {
                        c: args.a * args.b,
                    })
                }
            }
        },
    ));
    let key = start_server(Arc::clone(&server)).await;

    let discovery = StaticDiscovery::new(vec![KvPair::new(key, "")]);
    let config = ClientConfig {
        retries: 2,
        ..ClientConfig::default()
    };
    let xclient = XClient::new(
        "Arith",
        "Mul",
        FailMode::Failtry,
        SelectMode::Random,
        &discovery,
        config,
    );

    let reply: Reply = xclient
        .call(&Args { a: 5, b: 5 }, Metadata::new())
        .await
        .expect("second attempt succeeds");
    assert_eq!(reply.c, 25);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn broadcast_hits_every_server_exactly_once() {
    let mut keys = Vec::new();
    let mut counters = Vec::new();
    for _ in 0..3 {
        let hits = Arc::new(AtomicUsize::new(0));
        let server = Arc::new(Server::new());
        server.register(counting_service(Arc::clone(&hits), 1, Duration::ZERO));
        keys.push(KvPair::new(start_server(server).await, ""));
        counters.push(hits);
    }

    let discovery = StaticDiscovery::new(keys);
    let xclient = XClient::new(
        "Ping",
        "Echo",
        FailMode::Failfast,
        SelectMode::Random,
        &discovery,
        ClientConfig::default(),
    );

    let reply: Reply = xclient
        .broadcast(&Args::default(), Metadata::new())
        .await
        .expect("broadcast");
    assert_eq!(reply.c, 1);
    for hits in &counters {
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn broadcast_fails_if_any_server_fails() {
    let healthy = Arc::new(Server::new());
    healthy.register(counting_service(
        Arc::new(AtomicUsize::new(0)),
        1,
        Duration::ZERO,
    ));
    let healthy_key = start_server(Arc::clone(&healthy)).await;

    let failing = Arc::new(Server::new());
    failing.register(Service::new("Ping").method(
        "Echo",
        |_args: Args, _metadata: Metadata| async move {
            Err::<Reply, _>(RpcError::Handler("broken shard".to_string()))
        },
    ));
    let failing_key = start_server(Arc::clone(&failing)).await;

    let discovery = StaticDiscovery::new(vec![
        KvPair::new(healthy_key, ""),
        KvPair::new(failing_key, ""),
    ]);
    let xclient = XClient::new(
        "Ping",
        "Echo",
        FailMode::Failfast,
        SelectMode::Random,
        &discovery,
        ClientConfig::default(),
    );

    let err = xclient
        .broadcast::<_, Reply>(&Args::default(), Metadata::new())
        .await
        .expect_err("one branch fails");
    assert!(matches!(err, RpcError::Handler(_)), "{err}");
}

#[tokio::test]
async fn fork_returns_the_fastest_reply() {
    let delays = [
        (Duration::from_millis(10), 1),
        (Duration::from_millis(50), 2),
        (Duration::from_millis(500), 3),
    ];
    let mut keys = Vec::new();
    for (delay, value) in delays {
        let server = Arc::new(Server::new());
        server.register(counting_service(
            Arc::new(AtomicUsize::new(0)),
            value,
            delay,
        ));
        keys.push(KvPair::new(start_server(server).await, ""));
    }

    let discovery = StaticDiscovery::new(keys);
    let xclient = XClient::new(
        "Ping",
        "Echo",
        FailMode::Failfast,
        SelectMode::Random,
        &discovery,
        ClientConfig::default(),
    );

    let started = Instant::now();
    let reply: Reply = xclient
        .fork(&Args::default(), Metadata::new())
        .await
        .expect("fork");
    assert_eq!(reply.c, 1, "the 10ms server must win");
    assert!(
        started.elapsed() < Duration::from_millis(400),
        "fork must not wait for the slow branches"
    );
}

#[tokio::test]
async fn fork_reports_the_last_error_when_every_branch_fails() {
    let server = Arc::new(Server::new());
    server.register(Service::new("Ping").method(
        "Echo",
        |_args: Args, _metadata: Metadata| async move {
            Err::<Reply, _>(RpcError::Handler("no luck".to_string()))
        },
    ));
    let key = start_server(Arc::clone(&server)).await;

    let discovery = StaticDiscovery::new(vec![KvPair::new(key, "")]);
    let xclient = XClient::new(
        "Ping",
        "Echo",
        FailMode::Failfast,
        SelectMode::Random,
        &discovery,
        ClientConfig::default(),
    );

    let err = xclient
        .fork::<_, Reply>(&Args::default(), Metadata::new())
        .await
        .expect_err("every branch fails");
    assert!(matches!(err, RpcError::Handler(_)), "{err}");
}

#[tokio::test]
async fn discovery_refresh_evicts_stale_connections() {
    let first = Arc::new(Server::new());
    first.register(arith_service());
    let first_key = start_server(Arc::clone(&first)).await;

    let second = Arc::new(Server::new());
    second.register(arith_service());
    let second_key = start_server(Arc::clone(&second)).await;

    let discovery = StaticDiscovery::new(vec![
        KvPair::new(first_key.clone(), ""),
        KvPair::new(second_key.clone(), ""),
    ]);
    let xclient = XClient::new(
        "Arith",
        "Mul",
        FailMode::Failfast,
        SelectMode::RoundRobin,
        &discovery,
        ClientConfig::default(),
    );

    // Populate the cache with both endpoints.
    let _: Reply = xclient
        .broadcast(&Args { a: 1, b: 1 }, Metadata::new())
        .await
        .expect("broadcast");
    assert_eq!(xclient.cached_endpoints().await.len(), 2);

    // Drop the first server from discovery; its connection must be evicted
    // within the refresh cycle.
    discovery.update(vec![KvPair::new(second_key.clone(), "")]);
    for _ in 0..200 {
        if xclient.cached_endpoints().await == vec![second_key.clone()] {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(xclient.cached_endpoints().await, vec![second_key]);

    // Calls keep working against the remaining server.
    let reply: Reply = xclient
        .call(&Args { a: 3, b: 4 }, Metadata::new())
        .await
        .expect("call after refresh");
    assert_eq!(reply.c, 12);
}

#[tokio::test]
async fn closest_mode_prefers_the_nearby_server() {
    let near = Arc::new(Server::new());
    near.register(counting_service(
        Arc::new(AtomicUsize::new(0)),
        1,
        Duration::ZERO,
    ));
    let near_key = start_server(Arc::clone(&near)).await;

    let far = Arc::new(Server::new());
    far.register(counting_service(
        Arc::new(AtomicUsize::new(0)),
        2,
        Duration::ZERO,
    ));
    let far_key = start_server(Arc::clone(&far)).await;

    let discovery = StaticDiscovery::new(vec![
        KvPair::new(near_key, "latitude=52.52&longitude=13.40"),
        KvPair::new(far_key, "latitude=-33.87&longitude=151.21"),
    ]);
    let xclient = XClient::new(
        "Ping",
        "Echo",
        FailMode::Failfast,
        SelectMode::Closest,
        &discovery,
        ClientConfig::default(),
    );
    // Caller sits in Paris; the Berlin server must win.
    xclient.set_geo_selector(48.86, 2.35);

    for _ in 0..3 {
        let reply: Reply = xclient
            .call(&Args::default(), Metadata::new())
            .await
            .expect("call");
        assert_eq!(reply.c, 1);
    }
}

#[tokio::test]
async fn empty_server_set_yields_no_server() {
    let discovery = StaticDiscovery::new(Vec::new());
    let xclient = XClient::new(
        "Arith",
        "Mul",
        FailMode::Failover,
        SelectMode::Random,
        &discovery,
        ClientConfig::default(),
    );

    let err = xclient
        .call::<_, Reply>(&Args::default(), Metadata::new())
        .await
        .expect_err("no servers");
    assert!(matches!(err, RpcError::NoServer), "{err}");

    let err = xclient
        .broadcast::<_, Reply>(&Args::default(), Metadata::new())
        .await
        .expect_err("no servers");
    assert!(matches!(err, RpcError::NoServer), "{err}");
}

#[tokio::test]
async fn closed_xclient_rejects_calls() {
    let server = Arc::new(Server::new());
    server.register(arith_service());
    let key = start_server(Arc::clone(&server)).await;

    let discovery = StaticDiscovery::new(vec![KvPair::new(key, "")]);
    let xclient = XClient::new(
        "Arith",
        "Mul",
        FailMode::Failfast,
        SelectMode::Random,
        &discovery,
        ClientConfig::default(),
    );

    let _: Reply = xclient
        .call(&Args { a: 1, b: 1 }, Metadata::new())
        .await
        .expect("call");
    xclient.close().await.expect("close");

    let err = xclient
        .call::<_, Reply>(&Args { a: 1, b: 1 }, Metadata::new())
        .await
        .expect_err("client is closed");
    assert!(matches!(err, RpcError::Shutdown), "{err}");
}
