use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot, Mutex, Notify};
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::form_urlencoded;

use crate::stream::{Role, HANDSHAKE_SIGNAL, PROBE_INTERVAL, SESSION_DEADLINE};

type HubWs = WebSocketStream<TcpStream>;

/// トンネルIDごとの資格情報検証フック
///
/// 既定実装は常に許可する。実際のアクセス制御が要る場合は
/// 利用側がこのポリシーを差し替える
pub trait Authorize: Send + Sync + 'static {
    fn authorized(&self, token: &str, tunnel_id: &str) -> bool;
}

/// 既定のポリシー: すべて許可
pub struct AllowAll;

impl Authorize for AllowAll {
    fn authorized(&self, _token: &str, _tunnel_id: &str) -> bool {
        true
    }
}

/// ランデブーハブ
///
/// `/ws/listen`と`/ws/dial`で同じトンネルIDを持つ2接続をペアにし、
/// 以後は生フレームを双方向に中継する
pub struct Hub {
    listener: TcpListener,
    auth: Box<dyn Authorize>,
}

struct Shared {
    auth: Box<dyn Authorize>,
    tunnels: Mutex<HashMap<String, Rendezvous>>,
}

/// トンネルIDごとのランデブーポイント
///
/// 受け渡しは同期的: 生きているリッスン側が受け取ったときだけ成立する
#[derive(Default)]
struct Rendezvous {
    waiters: VecDeque<oneshot::Sender<PendingDial>>,
    arrivals: Arc<Notify>,
}

/// ダイヤル側からリッスン側へ渡される登録
struct PendingDial {
    conn: HubWs,
    done: oneshot::Sender<()>,
}

impl Hub {
    /// 指定アドレスにバインドしたハブを作る
    pub async fn bind(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        Ok(Hub {
            listener,
            auth: Box::new(AllowAll),
        })
    }

    /// 資格情報の検証ポリシーを差し替える
    pub fn with_authorizer(mut self, auth: impl Authorize) -> Self {
        self.auth = Box::new(auth);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 接続を受け付け続ける。シャットダウン受信で戻る
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let addr = self.listener.local_addr()?;
        info!("Hub listening on {}", addr);

        let shared = Arc::new(Shared {
            auth: self.auth,
            tunnels: Mutex::new(HashMap::new()),
        });
        let cancel = CancellationToken::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!("New connection from {}", peer);
                            let shared = shared.clone();
                            let cancel = cancel.child_token();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, shared, cancel).await {
                                    error!("Connection error from {}: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Hub shutdown requested");
                    cancel.cancel();
                    return Ok(());
                }
            }
        }
    }
}

/// 接続を処理
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) -> Result<()> {
    // 資格情報の検証はアップグレード前に行い、拒否はHTTPレスポンスで返す
    let mut target = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        match route_upgrade(req, shared.auth.as_ref()) {
            Ok(route) => {
                target = Some(route);
                Ok(resp)
            }
            Err(rejection) => Err(rejection),
        }
    })
    .await
    .context("WebSocket upgrade failed")?;
    let target = target.context("upgrade callback did not run")?;

    match target.role {
        Role::Listen => handle_listen(shared, ws, target.tunnel_id, peer, cancel).await,
        Role::Dial => handle_dial(shared, ws, target.tunnel_id, peer, cancel).await,
    }
}

struct RouteTarget {
    role: Role,
    tunnel_id: String,
}

fn route_upgrade(req: &Request, auth: &dyn Authorize) -> Result<RouteTarget, ErrorResponse> {
    let role = match req.uri().path() {
        "/ws/listen" => Role::Listen,
        "/ws/dial" => Role::Dial,
        _ => return Err(reject(StatusCode::NOT_FOUND, "No such endpoint")),
    };

    let tunnel_id = req.uri().query().and_then(|query| {
        form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "tunnel_id")
            .map(|(_, value)| value.into_owned())
    });
    let tunnel_id = match tunnel_id {
        Some(id) if !id.is_empty() => id,
        _ => return Err(reject(StatusCode::BAD_REQUEST, "Missing tunnel_id")),
    };

    if !auth.authorized(bearer_token(req), &tunnel_id) {
        return Err(reject(StatusCode::UNAUTHORIZED, "Not authorized"));
    }

    Ok(RouteTarget { role, tunnel_id })
}

fn bearer_token(req: &Request) -> &str {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or("")
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_string()));
    *resp.status_mut() = status;
    resp
}

/// リッスン側の登録を処理する。1リクエストにつき1セッション
async fn handle_listen(
    shared: Arc<Shared>,
    mut ws: HubWs,
    tunnel_id: String,
    peer: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    debug!("Listen-side registration for {} from {}", tunnel_id, peer);
    let mut claim = shared.register_listener(&tunnel_id).await;
    let mut probe = time::interval(PROBE_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws.close(None).await;
                shared.release(&tunnel_id).await;
                return Ok(());
            }
            _ = probe.tick() => {
                if let Err(e) = ws.send(Message::Ping(Vec::new())).await {
                    debug!("Listen-side probe to {} failed: {}", peer, e);
                    shared.release(&tunnel_id).await;
                    return Ok(());
                }
            }
            pending = &mut claim => {
                let result = match pending {
                    Ok(PendingDial { conn, done }) => {
                        info!("Paired tunnel {} ({} serving listen side)", tunnel_id, peer);
                        let session = relay_session(ws, conn).await;
                        let _ = done.send(());
                        session
                    }
                    // ランデブーポイントごと破棄された。通常終了扱い
                    Err(_) => Ok(()),
                };
                shared.release(&tunnel_id).await;
                return result;
            }
        }
    }
}

/// ダイヤル側の登録を処理する
///
/// リッスン側が現れるまで待ち、受け渡し後はセッション完了まで戻らない
async fn handle_dial(
    shared: Arc<Shared>,
    ws: HubWs,
    tunnel_id: String,
    peer: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    debug!("Dial-side registration for {} from {}", tunnel_id, peer);
    let mut conn = ws;
    let mut probe = time::interval(PROBE_INTERVAL);

    loop {
        // 生きているリッスン側がいれば受け渡す
        match shared.claim_waiter(&tunnel_id).await {
            Some(waiter) => {
                let (done_tx, done_rx) = oneshot::channel();
                match waiter.send(PendingDial { conn, done: done_tx }) {
                    Ok(()) => {
                        let _ = done_rx.await;
                        shared.release(&tunnel_id).await;
                        return Ok(());
                    }
                    // 受け手が直前に消えた。登録を取り戻して次を探す
                    Err(returned) => conn = returned.conn,
                }
            }
            None => {
                let arrivals = shared.arrivals(&tunnel_id).await;
                let notified = arrivals.notified();
                tokio::pin!(notified);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = conn.close(None).await;
                        shared.release(&tunnel_id).await;
                        return Ok(());
                    }
                    _ = &mut notified => {}
                    _ = probe.tick() => {
                        if let Err(e) = conn.send(Message::Ping(Vec::new())).await {
                            debug!("Dial-side probe to {} failed: {}", peer, e);
                            shared.release(&tunnel_id).await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

/// ペアになった2接続の生フレームを双方向に中継する
async fn relay_session(listen: HubWs, dial: HubWs) -> Result<()> {
    let mut listen = listen;
    let mut dial = dial;

    // 中継開始の前にハンドシェイク信号を両端へ送る
    dial.send(Message::Binary(HANDSHAKE_SIGNAL.to_vec()))
        .await
        .context("Failed to send handshake to dial side")?;
    listen
        .send(Message::Binary(HANDSHAKE_SIGNAL.to_vec()))
        .await
        .context("Failed to send handshake to listen side")?;

    let (listen_sink, listen_stream) = listen.split();
    let (dial_sink, dial_stream) = dial.split();
    let cancel = CancellationToken::new();

    let inbound = tokio::spawn(forward(listen_stream, dial_sink, cancel.clone()));
    let outbound = tokio::spawn(forward(dial_stream, listen_sink, cancel.clone()));
    let _ = tokio::join!(inbound, outbound);
    Ok(())
}

/// 1方向分の転送。メッセージ種別は変えずにそのまま送る
async fn forward(
    mut from: SplitStream<HubWs>,
    mut to: SplitSink<HubWs, Message>,
    cancel: CancellationToken,
) {
    let mut probe = time::interval(PROBE_INTERVAL);
    let idle = time::sleep(SESSION_DEADLINE);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            () = &mut idle => {
                debug!("Session idle deadline exceeded");
                break;
            }
            _ = probe.tick() => {
                if to.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            next = from.next() => {
                // デッドラインは読み取りのたびに更新する
                idle.as_mut().reset(Instant::now() + SESSION_DEADLINE);
                match next {
                    None => break,
                    Some(Err(e)) => {
                        debug!("Relay read ended: {}", e);
                        break;
                    }
                    Some(Ok(frame)) => {
                        let closing = frame.is_close();
                        if to.send(frame).await.is_err() || closing {
                            break;
                        }
                    }
                }
            }
        }
    }

    // 先に終わった側がセッション全体を畳む
    cancel.cancel();
    let _ = to.close().await;
}

impl Shared {
    /// リッスン側の待機枠を登録し、その受信側を返す
    async fn register_listener(&self, tunnel_id: &str) -> oneshot::Receiver<PendingDial> {
        let (tx, rx) = oneshot::channel();
        let mut tunnels = self.tunnels.lock().await;
        let entry = tunnels.entry(tunnel_id.to_string()).or_default();
        entry.waiters.push_back(tx);
        entry.arrivals.notify_one();
        rx
    }

    /// 生きている待機枠をひとつ取り出す
    async fn claim_waiter(&self, tunnel_id: &str) -> Option<oneshot::Sender<PendingDial>> {
        let mut tunnels = self.tunnels.lock().await;
        let entry = tunnels.get_mut(tunnel_id)?;
        while let Some(waiter) = entry.waiters.pop_front() {
            if !waiter.is_closed() {
                return Some(waiter);
            }
        }
        None
    }

    async fn arrivals(&self, tunnel_id: &str) -> Arc<Notify> {
        let mut tunnels = self.tunnels.lock().await;
        tunnels
            .entry(tunnel_id.to_string())
            .or_default()
            .arrivals
            .clone()
    }

    /// 死んだ待機枠を掃除し、空になったエントリは捨てる
    async fn release(&self, tunnel_id: &str) {
        let mut tunnels = self.tunnels.lock().await;
        let emptied = match tunnels.get_mut(tunnel_id) {
            Some(entry) => {
                entry.waiters.retain(|waiter| !waiter.is_closed());
                entry.waiters.is_empty()
            }
            None => false,
        };
        if emptied {
            tunnels.remove(tunnel_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TunnelError;
    use crate::stream::{accept, dial};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start_hub() -> (String, broadcast::Sender<()>) {
        let hub = Hub::bind("127.0.0.1:0").await.unwrap();
        let addr = hub.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(hub.serve(shutdown_rx));
        (format!("ws://{}", addr), shutdown_tx)
    }

    #[tokio::test]
    async fn test_pairing_and_roundtrip() {
        let (hub, _shutdown) = start_hub().await;

        let listen_hub = hub.clone();
        let listen_side = tokio::spawn(async move {
            let mut conn = accept(&listen_hub, "listen-token", "tunnel-01").await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            conn.write_all(b"pong").await.unwrap();
            conn.flush().await.unwrap();
            // 相手が読み終わるまで閉じない
            time::sleep(Duration::from_millis(100)).await;
        });

        let mut conn = dial(&hub, "dial-token", "tunnel-01").await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        conn.flush().await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        listen_side.await.unwrap();
    }

    #[tokio::test]
    async fn test_unmatched_dial_stays_blocked() {
        let (hub, _shutdown) = start_hub().await;

        // リッスン側が現れない限りダイヤル側は返らない
        let attempt =
            time::timeout(Duration::from_millis(300), dial(&hub, "", "nobody-listens")).await;
        assert!(attempt.is_err());
    }

    struct DenyAll;

    impl Authorize for DenyAll {
        fn authorized(&self, _token: &str, _tunnel_id: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_rejected_credentials_never_upgrade() {
        let hub = Hub::bind("127.0.0.1:0").await.unwrap().with_authorizer(DenyAll);
        let addr = hub.local_addr().unwrap();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(hub.serve(shutdown_rx));

        let err = dial(&format!("ws://{}", addr), "bad-token", "tunnel-01")
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_close_propagates_to_peer() {
        let (hub, _shutdown) = start_hub().await;

        let listen_hub = hub.clone();
        let listen_side = tokio::spawn(async move {
            let mut conn = accept(&listen_hub, "", "closing").await.unwrap();
            let mut buf = [0u8; 16];
            // 相手が閉じたらこちらにもEOFが届く
            let n = time::timeout(Duration::from_secs(3), conn.read(&mut buf))
                .await
                .expect("peer close must propagate")
                .unwrap();
            assert_eq!(n, 0);
        });

        let conn = dial(&hub, "", "closing").await.unwrap();
        drop(conn);

        listen_side.await.unwrap();
    }

    fn spawn_listen_expecting(
        hub: String,
        tunnel_id: &'static str,
        expect: &'static [u8; 4],
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut conn = accept(&hub, "", tunnel_id).await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, expect);
        })
    }

    fn spawn_dial_sending(
        hub: String,
        tunnel_id: &'static str,
        payload: &'static [u8; 4],
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut conn = dial(&hub, "", tunnel_id).await.unwrap();
            conn.write_all(payload).await.unwrap();
            conn.flush().await.unwrap();
            time::sleep(Duration::from_millis(100)).await;
        })
    }

    #[tokio::test]
    async fn test_concurrent_tunnels_stay_isolated() {
        let (hub, _shutdown) = start_hub().await;

        let listens = [
            spawn_listen_expecting(hub.clone(), "alpha", b"AAAA"),
            spawn_listen_expecting(hub.clone(), "beta", b"BBBB"),
        ];
        let dials = [
            spawn_dial_sending(hub.clone(), "alpha", b"AAAA"),
            spawn_dial_sending(hub.clone(), "beta", b"BBBB"),
        ];

        for task in listens.into_iter().chain(dials) {
            task.await.unwrap();
        }
    }
}
