use anyhow::{Context, Result};
use backoff::ExponentialBackoff;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agent;

/// 稼働中のエッジリレーのハンドル
pub struct Tunnel {
    tunnel_id: String,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<Result<()>>,
}

impl Tunnel {
    /// このリレーが使うトンネルID
    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    /// リレーを停止して終了を待つ
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.handle.await??;
        Ok(())
    }
}

/// ローカルサービスをハブ経由で公開する（メインAPI・Exposer側）
///
/// # 引数
/// * `hub` - ハブのURL (例: "ws://hub.example.com:8080")
/// * `token` - ハブに提示するベアラートークン
/// * `tunnel_id` - 両端で共有するトンネルID
/// * `local_addr` - 公開するローカルサービスのアドレス
///
/// リレーが落ちた場合は指数バックオフで登録し直す
pub async fn expose(
    hub: impl Into<String>,
    token: impl Into<String>,
    tunnel_id: impl Into<String>,
    local_addr: impl Into<String>,
) -> Result<Tunnel> {
    let hub = hub.into();
    let token = token.into();
    let tunnel_id = tunnel_id.into();
    let local_addr = local_addr.into();

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
    let id = tunnel_id.clone();
    let handle = tokio::spawn(async move {
        tokio::select! {
            result = run_exposer(&hub, &token, &id, &local_addr) => result,
            _ = shutdown_rx.recv() => {
                info!("Exposer for {} shut down", id);
                Ok(())
            }
        }
    });

    Ok(Tunnel {
        tunnel_id,
        shutdown_tx,
        handle,
    })
}

async fn run_exposer(hub: &str, token: &str, tunnel_id: &str, local_addr: &str) -> Result<()> {
    backoff::future::retry_notify(
        reconnect_policy(),
        || async {
            agent::relay_remote_to_local(hub, token, tunnel_id, || TcpStream::connect(local_addr))
                .await
                .map_err(backoff::Error::transient)
        },
        |err, wait| warn!("Tunnel lost: {:#}, retrying in {:?}", err, wait),
    )
    .await
}

/// ローカルポートへの接続をハブ経由でリモートに転送する（メインAPI・Connector側）
///
/// リスナーのバインド失敗はその場でエラーを返す
pub async fn connect(
    hub: impl Into<String>,
    token: impl Into<String>,
    tunnel_id: impl Into<String>,
    listen_addr: impl Into<String>,
) -> Result<Tunnel> {
    let hub = hub.into();
    let token = token.into();
    let tunnel_id = tunnel_id.into();
    let listen_addr = listen_addr.into();

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", listen_addr))?;
    info!("Listening on {}", listener.local_addr()?);

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
    let id = tunnel_id.clone();
    let handle = tokio::spawn(async move {
        tokio::select! {
            result = agent::relay_local_to_remote(listener, &hub, &token, &id) => result,
            _ = shutdown_rx.recv() => {
                info!("Connector for {} shut down", id);
                Ok(())
            }
        }
    });

    Ok(Tunnel {
        tunnel_id,
        shutdown_tx,
        handle,
    })
}

/// 再登録は諦めずに続ける
fn reconnect_policy() -> ExponentialBackoff {
    ExponentialBackoff {
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_stops_a_retrying_exposer() {
        // 存在しないハブ相手でもshutdownで即座に畳める
        let tunnel = expose("ws://127.0.0.1:1", "", "tunnel-01", "127.0.0.1:1")
            .await
            .unwrap();
        assert_eq!(tunnel.tunnel_id(), "tunnel-01");
        tunnel.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_fails_fast_on_unbindable_listener() {
        let result = connect("ws://127.0.0.1:1", "", "tunnel-01", "203.0.113.1:1").await;
        assert!(result.is_err());
    }
}
