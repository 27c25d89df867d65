use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{wire_serde, Metadata, RpcError, Server, Service};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Args {
    pub a: i64,
    pub b: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Reply {
    pub c: i64,
}

wire_serde!(Args, Reply);

pub(crate) fn arith_service() -> Service {
    Service::new("Arith").method("Mul", |args: Args, _metadata: Metadata| async move {
        Ok::<_, RpcError>(Reply {
            c: args.a * args.b,
        })
    })
}

/// Serves `server` on an ephemeral TCP port and returns the bound address.
pub(crate) async fn start_server(server: Arc<Server>) -> String {
    tokio::spawn({
        let server = Arc::clone(&server);
        async move {
            let _ = server.serve("tcp", "127.0.0.1:0").await;
        }
    });
    for _ in 0..200 {
        if let Some(addr) = server.local_addr() {
            return addr.to_string();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("server did not bind");
}
