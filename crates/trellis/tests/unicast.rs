mod common;

use std::sync::Arc;

use trellis::{
    Client, ClientConfig, CompressType, FailMode, Metadata, RpcError, SelectMode, SerializeType,
    Server, Service, StaticDiscovery, XClient,
};

use common::{arith_service, start_server, Args, Reply};

fn json_gzip() -> ClientConfig {
    ClientConfig {
        serialize_type: SerializeType::Json,
        compress_type: CompressType::Gzip,
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn arith_mul_happy_path_over_json_gzip() {
    let server = Arc::new(Server::new());
    server.register(arith_service());
    let key = start_server(Arc::clone(&server)).await;

    let discovery = StaticDiscovery::new(vec![trellis::KvPair::new(key, "")]);
    let xclient = XClient::new(
        "Arith",
        "Mul",
        FailMode::Failfast,
        SelectMode::Random,
        &discovery,
        json_gzip(),
    );

    let reply: Reply = xclient
        .call(&Args { a: 10, b: 20 }, Metadata::new())
        .await
        .expect("call");
    assert_eq!(reply.c, 200);

    xclient.close().await.expect("close");
}

#[tokio::test]
async fn unknown_method_surfaces_method_not_found() {
    let server = Arc::new(Server::new());
    server.register(arith_service());
    let key = start_server(Arc::clone(&server)).await;

    let discovery = StaticDiscovery::new(vec![trellis::KvPair::new(key, "")]);
    let xclient = XClient::new(
        "Arith",
        "Add",
        FailMode::Failfast,
        SelectMode::Random,
        &discovery,
        json_gzip(),
    );

    let err = xclient
        .call::<_, Reply>(&Args { a: 1, b: 2 }, Metadata::new())
        .await
        .expect_err("Add is not registered");
    assert!(matches!(err, RpcError::MethodNotFound(_)), "{err}");
}

#[tokio::test]
async fn unknown_service_surfaces_service_not_found() {
    let server = Arc::new(Server::new());
    server.register(arith_service());
    let key = start_server(Arc::clone(&server)).await;

    let discovery = StaticDiscovery::new(vec![trellis::KvPair::new(key, "")]);
    let xclient = XClient::new(
        "Geometry",
        "Mul",
        FailMode::Failfast,
        SelectMode::Random,
        &discovery,
        ClientConfig::default(),
    );

    let err = xclient
        .call::<_, Reply>(&Args::default(), Metadata::new())
        .await
        .expect_err("Geometry is not registered");
    assert!(matches!(err, RpcError::ServiceNotFound(_)), "{err}");
}

#[tokio::test]
async fn handler_errors_are_carried_in_metadata() {
    let server = Arc::new(Server::new());
    server.register(Service::new("Flaky").method(
        "Fail",
        |_args: Args, _metadata: Metadata| async move {
            Err::<Reply, _>(RpcError::Handler("deliberate failure".to_string()))
        },
    ));
    let key = start_server(Arc::clone(&server)).await;
    let addr = key.trim_start_matches("tcp@");

    let client = Client::connect("tcp", addr, ClientConfig::default())
        .await
        .expect("connect");
    let err = client
        .call::<_, Reply>("Flaky", "Fail", &Args::default(), Metadata::new())
        .await
        .expect_err("handler fails");
    match err {
        RpcError::Handler(text) => assert!(text.contains("deliberate failure"), "{text}"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn auth_token_gates_dispatch() {
    let server = Arc::new(Server::new());
    server.register(arith_service());
    server.set_auth(|token| match token {
        Some("sesame") => Ok(()),
        _ => Err(RpcError::Unauthorized("bad or missing token".to_string())),
    });
    let key = start_server(Arc::clone(&server)).await;

    let discovery = StaticDiscovery::new(vec![trellis::KvPair::new(key, "")]);
    let xclient = XClient::new(
        "Arith",
        "Mul",
        FailMode::Failfast,
        SelectMode::Random,
        &discovery,
        ClientConfig::default(),
    );

    let err = xclient
        .call::<_, Reply>(&Args { a: 2, b: 2 }, Metadata::new())
        .await
        .expect_err("no token set");
    assert!(matches!(err, RpcError::Unauthorized(_)), "{err}");

    xclient.auth("sesame");
    let reply: Reply = xclient
        .call(&Args { a: 2, b: 2 }, Metadata::new())
        .await
        .expect("authorized call");
    assert_eq!(reply.c, 4);
}

#[tokio::test]
async fn go_returns_an_awaitable_handle() {
    let server = Arc::new(Server::new());
    server.register(arith_service());
    let key = start_server(Arc::clone(&server)).await;

    let discovery = StaticDiscovery::new(vec![trellis::KvPair::new(key, "")]);
    let xclient = XClient::new(
        "Arith",
        "Mul",
        FailMode::Failfast,
        SelectMode::RoundRobin,
        &discovery,
        ClientConfig::default(),
    );

    let handle = xclient
        .go(&Args { a: 3, b: 5 }, Metadata::new())
        .await
        .expect("go");
    let reply: Reply = handle.recv().await.expect("recv");
    assert_eq!(reply.c, 15);
}

#[tokio::test]
async fn plugins_wrap_every_call() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use trellis::{Plugin, PluginContainer};

    struct Stamp {
        post_calls: AtomicUsize,
    }

    impl Plugin for Stamp {
        fn pre_call(
            &self,
            _service_path: &str,
            _service_method: &str,
            metadata: &mut Metadata,
        ) -> Result<(), RpcError> {
            metadata.insert("stamp".to_string(), "present".to_string());
            Ok(())
        }

        fn post_call(
            &self,
            _service_path: &str,
            _service_method: &str,
            _metadata: &Metadata,
            _error: Option<&RpcError>,
        ) {
            self.post_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    let server = Arc::new(Server::new());
    server.register(Service::new("Meta").method(
        "Stamped",
        |_args: Args, metadata: Metadata| async move {
            Ok::<_, RpcError>(Reply {
                c: i64::from(metadata.get("stamp").map(String::as_str) == Some("present")),
            })
        },
    ));
    let key = start_server(Arc::clone(&server)).await;

    let discovery = StaticDiscovery::new(vec![trellis::KvPair::new(key, "")]);
    let xclient = XClient::new(
        "Meta",
        "Stamped",
        FailMode::Failfast,
        SelectMode::Random,
        &discovery,
        ClientConfig::default(),
    );

    let stamp = Arc::new(Stamp {
        post_calls: AtomicUsize::new(0),
    });
    let mut plugins = PluginContainer::default();
    plugins.add(Arc::clone(&stamp) as Arc<dyn Plugin>);
    xclient.set_plugins(plugins);

    let reply: Reply = xclient
        .call(&Args::default(), Metadata::new())
        .await
        .expect("call");
    assert_eq!(reply.c, 1, "the pre-call hook must rewrite metadata");
    assert_eq!(stamp.post_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejecting_pre_call_plugin_short_circuits() {
    use trellis::{Plugin, PluginContainer};

    struct Deny;

    impl Plugin for Deny {
        fn pre_call(
            &self,
            _service_path: &str,
            _service_method: &str,
            _metadata: &mut Metadata,
        ) -> Result<(), RpcError> {
            Err(RpcError::Unauthorized("denied by policy".to_string()))
        }
    }

    let server = Arc::new(Server::new());
    server.register(arith_service());
    let key = start_server(Arc::clone(&server)).await;

    let discovery = StaticDiscovery::new(vec![trellis::KvPair::new(key, "")]);
    let xclient = XClient::new(
        "Arith",
        "Mul",
        FailMode::Failfast,
        SelectMode::Random,
        &discovery,
        ClientConfig::default(),
    );
    let mut plugins = PluginContainer::default();
    plugins.add(Arc::new(Deny));
    xclient.set_plugins(plugins);

    let err = xclient
        .call::<_, Reply>(&Args { a: 1, b: 1 }, Metadata::new())
        .await
        .expect_err("plugin rejects the call");
    assert!(matches!(err, RpcError::Unauthorized(_)), "{err}");
}

#[tokio::test]
async fn unix_transport_round_trips() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("trellis.sock");
    let path = path.to_str().expect("utf-8 path").to_string();

    let server = Arc::new(Server::new());
    server.register(arith_service());
    tokio::spawn({
        let server = Arc::clone(&server);
        let path = path.clone();
        async move {
            let _ = server.serve("unix", &path).await;
        }
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let client = Client::connect("unix", &path, ClientConfig::default())
        .await
        .expect("connect");
    let reply: Reply = client
        .call("Arith", "Mul", &Args { a: 9, b: 9 }, Metadata::new())
        .await
        .expect("call");
    assert_eq!(reply.c, 81);
}
