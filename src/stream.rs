use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::TunnelError;

/// ペアリング完了を示すハンドシェイクペイロード
pub(crate) const HANDSHAKE_SIGNAL: &[u8] = b"GREENLIGHT";

/// 生存確認のping送信間隔
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// ハンドシェイク待ちとセッションのデッドライン
pub(crate) const SESSION_DEADLINE: Duration = Duration::from_secs(60);

type WsConn = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// トンネル両端の役割
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dial,
    Listen,
}

impl Role {
    pub(crate) fn endpoint(&self) -> &'static str {
        match self {
            Role::Dial => "dial",
            Role::Listen => "listen",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.endpoint())
    }
}

/// ダイヤル側としてハブに登録し、ペアリング完了後の接続を返す
pub async fn dial(hub: &str, token: &str, tunnel_id: &str) -> Result<TunnelStream, TunnelError> {
    connect(hub, token, tunnel_id, Role::Dial).await
}

/// リッスン側としてハブに登録し、ペアリング完了後の接続を返す
pub async fn accept(hub: &str, token: &str, tunnel_id: &str) -> Result<TunnelStream, TunnelError> {
    connect(hub, token, tunnel_id, Role::Listen).await
}

async fn connect(
    hub: &str,
    token: &str,
    tunnel_id: &str,
    role: Role,
) -> Result<TunnelStream, TunnelError> {
    let url = endpoint_url(hub, tunnel_id, role)?;
    let mut request = url.as_str().into_client_request()?;
    let bearer =
        HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| TunnelError::InvalidToken)?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let (mut ws, _) = match connect_async(request).await {
        Ok(pair) => pair,
        Err(tungstenite::Error::Http(resp)) if resp.status() == StatusCode::UNAUTHORIZED => {
            return Err(TunnelError::Unauthorized(tunnel_id.to_string()));
        }
        Err(err) => return Err(TunnelError::Transport(err)),
    };

    await_greenlight(&mut ws).await?;

    Ok(TunnelStream {
        ws,
        role,
        tunnel_id: tunnel_id.to_string(),
        hub: hub.to_string(),
        partial: Bytes::new(),
        terminal: None,
    })
}

fn endpoint_url(hub: &str, tunnel_id: &str, role: Role) -> Result<Url, TunnelError> {
    let mut url = Url::parse(hub)?;
    url.path_segments_mut()
        .map_err(|_| TunnelError::Protocol("hub address cannot be a base URL".to_string()))?
        .pop_if_empty()
        .extend(["ws", role.endpoint()]);
    url.query_pairs_mut().append_pair("tunnel_id", tunnel_id);
    Ok(url)
}

/// ハンドシェイク信号を待つ。生存確認は読み捨て、
/// それ以外の信号以前のメッセージはプロトコル違反とする
///
/// デッドラインはメッセージを受け取るたびに引き直す。ハブのpingが
/// 届いている限り、マッチ待ちの登録は呼び出し元が諦めるまで生き続ける
async fn await_greenlight(ws: &mut WsConn) -> Result<(), TunnelError> {
    loop {
        let msg = match time::timeout(SESSION_DEADLINE, ws.next()).await {
            Err(_) => return Err(TunnelError::HandshakeTimeout(SESSION_DEADLINE)),
            Ok(None) => return Err(TunnelError::Transport(tungstenite::Error::ConnectionClosed)),
            Ok(Some(msg)) => msg?,
        };
        match msg {
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Binary(payload) if payload == HANDSHAKE_SIGNAL => return Ok(()),
            Message::Close(_) => {
                return Err(TunnelError::Transport(tungstenite::Error::ConnectionClosed));
            }
            other => {
                return Err(TunnelError::Protocol(format!(
                    "expected handshake signal, got {} frame of {} bytes",
                    frame_kind(&other),
                    other.len(),
                )));
            }
        }
    }
}

fn frame_kind(msg: &Message) -> &'static str {
    match msg {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "raw",
    }
}

/// メッセージ指向のWebSocketをバイトストリームとして見せるアダプター
///
/// 読み取りはメッセージ境界をまたいでバッファリングする。
/// 長さゼロのメッセージは「まだデータがない」であってEOFではなく、
/// トランスポート自体が閉じたときだけ終端を報告する
pub struct TunnelStream {
    ws: WsConn,
    role: Role,
    tunnel_id: String,
    hub: String,
    partial: Bytes,
    terminal: Option<Terminal>,
}

/// キャッシュされた終端状態。以後のreadはこれだけを返す
enum Terminal {
    Eof,
    Failed(io::ErrorKind, String),
}

impl fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelStream")
            .field("role", &self.role)
            .field("tunnel_id", &self.tunnel_id)
            .field("hub", &self.hub)
            .finish()
    }
}

impl TunnelStream {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    /// 診断用の合成エンドポイント記述子。ルーティングには使わない
    pub fn descriptor(&self) -> String {
        format!("{}:{}:{}", self.role, self.tunnel_id, self.hub)
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            // 前回のメッセージの食べ残しを先に消化する
            if !this.partial.is_empty() {
                let n = usize::min(buf.remaining(), this.partial.len());
                buf.put_slice(&this.partial.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match &this.terminal {
                Some(Terminal::Eof) => return Poll::Ready(Ok(())),
                Some(Terminal::Failed(kind, msg)) => {
                    return Poll::Ready(Err(io::Error::new(*kind, msg.clone())));
                }
                None => {}
            }

            match Pin::new(&mut this.ws).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => this.terminal = Some(Terminal::Eof),
                Poll::Ready(Some(Err(err))) => this.terminal = Some(terminal_for(err)),
                Poll::Ready(Some(Ok(msg))) => match msg {
                    Message::Binary(data) if data.is_empty() => continue,
                    Message::Binary(data) => this.partial = Bytes::from(data),
                    Message::Text(text) if text.is_empty() => continue,
                    Message::Text(text) => this.partial = Bytes::from(text.into_bytes()),
                    // 生存確認はバイトストリームには現れない
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                    Message::Close(_) => this.terminal = Some(Terminal::Eof),
                },
            }
        }
    }
}

impl AsyncWrite for TunnelStream {
    /// 1回のwriteは1つのバイナリメッセージとして丸ごと送る
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.ws).poll_ready(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(err)) => return Poll::Ready(Err(ws_to_io(err))),
            Poll::Ready(Ok(())) => {}
        }
        match Pin::new(&mut this.ws).start_send(Message::Binary(data.to_vec())) {
            Ok(()) => Poll::Ready(Ok(data.len())),
            Err(err) => Poll::Ready(Err(ws_to_io(err))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.ws).poll_flush(cx).map_err(ws_to_io)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.ws).poll_close(cx).map_err(ws_to_io)
    }
}

fn terminal_for(err: tungstenite::Error) -> Terminal {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => Terminal::Eof,
        tungstenite::Error::Io(io_err) => Terminal::Failed(io_err.kind(), io_err.to_string()),
        other => Terminal::Failed(io::ErrorKind::Other, other.to_string()),
    }
}

fn ws_to_io(err: tungstenite::Error) -> io::Error {
    match err {
        tungstenite::Error::Io(io_err) => io_err,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
        }
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}
