use std::future::Future;
use std::io;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::splice::splice;
use crate::stream;

/// トンネル越しに届いた接続をローカルサービスへ中継する（Exposer）
///
/// `accept`が失敗するまでループし、その失敗だけを呼び出し元へ返す。
/// ローカル側へのダイヤル失敗はそのセッションを捨てて続行する
pub async fn relay_remote_to_local<C, F, Fut>(
    hub: &str,
    token: &str,
    tunnel_id: &str,
    mut local_dial: F,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<C>>,
{
    loop {
        let remote = stream::accept(hub, token, tunnel_id)
            .await
            .context("Tunnel accept failed")?;
        debug!("Accepted tunnel session {}", remote.descriptor());

        let local = match local_dial().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Local dial failed: {}", e);
                continue;
            }
        };

        tokio::spawn(async move {
            match splice(remote, local).await {
                Ok((sent, received)) => {
                    debug!("Session closed: {} bytes out, {} bytes in", sent, received);
                }
                Err(e) => debug!("Session ended with error: {}", e),
            }
        });
    }
}

/// ローカルで受けた接続をトンネル越しのリモートへ中継する（Connector）
///
/// ローカルリスナーの`accept`が失敗したときだけ戻る。
/// ハブへのダイヤル失敗はその接続を閉じて続行する
pub async fn relay_local_to_remote(
    listener: TcpListener,
    hub: &str,
    token: &str,
    tunnel_id: &str,
) -> Result<()> {
    loop {
        let (local, peer) = listener.accept().await.context("Local accept failed")?;
        debug!("Local connection from {}", peer);

        let remote = match stream::dial(hub, token, tunnel_id).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Tunnel dial for {} failed: {}", peer, e);
                continue;
            }
        };

        tokio::spawn(async move {
            match splice(local, remote).await {
                Ok((sent, received)) => {
                    debug!("Session closed: {} bytes out, {} bytes in", sent, received);
                }
                Err(e) => debug!("Session ended with error: {}", e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::broadcast;
    use tokio::time;

    async fn start_hub() -> (String, broadcast::Sender<()>) {
        let hub = Hub::bind("127.0.0.1:0").await.unwrap();
        let addr = hub.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(hub.serve(shutdown_rx));
        (format!("ws://{}", addr), shutdown_tx)
    }

    // 受けたバイトをそのまま返すローカルサービス
    async fn start_echo_service() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut conn, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let (mut reader, mut writer) = conn.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        addr
    }

    // 接続ごとに決まったバナーを書いて閉じるローカルサービス
    async fn start_banner_service(banner: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut conn, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let _ = conn.write_all(banner).await;
                    let _ = conn.flush().await;
                    time::sleep(Duration::from_millis(100)).await;
                });
            }
        });
        addr
    }

    async fn start_relay_pair(hub: &str, tunnel_id: &'static str, service: SocketAddr) -> SocketAddr {
        let exposer_hub = hub.to_string();
        tokio::spawn(async move {
            let _ = relay_remote_to_local(&exposer_hub, "", tunnel_id, move || {
                TcpStream::connect(service)
            })
            .await;
        });

        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let entry = local.local_addr().unwrap();
        let connector_hub = hub.to_string();
        tokio::spawn(async move {
            let _ = relay_local_to_remote(local, &connector_hub, "", tunnel_id).await;
        });
        entry
    }

    #[tokio::test]
    async fn test_end_to_end_relay() {
        let (hub, _shutdown) = start_hub().await;
        let echo = start_echo_service().await;
        let entry = start_relay_pair(&hub, "e2e", echo).await;

        let mut client = TcpStream::connect(entry).await.unwrap();
        client.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .expect("echo must round-trip through the tunnel")
            .unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_sessions_do_not_cross_tunnels() {
        let (hub, _shutdown) = start_hub().await;
        let alpha = start_banner_service(b"AAAA").await;
        let beta = start_banner_service(b"BBBB").await;

        let alpha_entry = start_relay_pair(&hub, "alpha", alpha).await;
        let beta_entry = start_relay_pair(&hub, "beta", beta).await;

        let mut alpha_client = TcpStream::connect(alpha_entry).await.unwrap();
        let mut beta_client = TcpStream::connect(beta_entry).await.unwrap();

        let mut buf = [0u8; 4];
        time::timeout(Duration::from_secs(5), beta_client.read_exact(&mut buf))
            .await
            .expect("beta banner must arrive")
            .unwrap();
        assert_eq!(&buf, b"BBBB");

        time::timeout(Duration::from_secs(5), alpha_client.read_exact(&mut buf))
            .await
            .expect("alpha banner must arrive")
            .unwrap();
        assert_eq!(&buf, b"AAAA");
    }
}
