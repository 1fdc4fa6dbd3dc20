//! Shared fixture: a real orchestrator behind a real gateway on an
//! ephemeral port.

#![allow(dead_code)]

use devorch_core::{Orchestrator, OrchestratorConfig};
use devorch_gateway::{Gateway, GatewayClient, GatewayConfig, GatewayConnection, ServerFrame};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub struct Fixture {
    pub orchestrator: Arc<Orchestrator>,
    pub gateway: Arc<Gateway>,
    pub addr: SocketAddr,
    pub dir: tempfile::TempDir,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
}

impl Fixture {
    pub async fn start() -> Self {
        Self::start_with(GatewayConfig::default()).await
    }

    pub async fn start_with(config: GatewayConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator_config = OrchestratorConfig::default()
            .with_allowed_directories(vec![dir.path().to_string_lossy().into_owned()])
            .with_stop_timeout(2);
        let orchestrator = Orchestrator::start(orchestrator_config).await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let gateway = Arc::new(Gateway::new(config, orchestrator.clone()));
        let (tx, rx) = oneshot::channel::<()>();
        let server = {
            let gateway = gateway.clone();
            tokio::spawn(async move {
                gateway
                    .serve(listener, async {
                        let _ = rx.await;
                    })
                    .await
                    .unwrap();
            })
        };

        Self {
            orchestrator,
            gateway,
            addr,
            dir,
            shutdown: Some(tx),
            server: Some(server),
        }
    }

    pub fn cwd(&self) -> PathBuf {
        self.dir.path().canonicalize().unwrap()
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn connect(&self) -> GatewayConnection {
        GatewayClient::new(format!("ws://{}/ws", self.addr))
            .connect()
            .await
            .unwrap()
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
        }
        self.orchestrator.shutdown().await;
    }
}

/// Next frame of the given type, failing the test after five seconds
pub async fn expect_kind(conn: &mut GatewayConnection, kind: &str) -> ServerFrame {
    tokio::time::timeout(Duration::from_secs(5), conn.recv_kind(kind))
        .await
        .unwrap_or_else(|_| panic!("no {} frame", kind))
        .unwrap()
        .unwrap_or_else(|| panic!("connection closed before {} frame", kind))
}
