use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// トンネル確立時のエラー分類
#[derive(Debug, Error)]
pub enum TunnelError {
    /// ハブがアップグレード前に資格情報を拒否した
    #[error("hub rejected credentials for tunnel {0}")]
    Unauthorized(String),

    /// ハンドシェイク前に想定外のメッセージを受信した
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// ハンドシェイク待ちがデッドラインを超えた
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// ハブアドレスがURLとして不正
    #[error("invalid hub address: {0}")]
    Address(#[from] url::ParseError),

    /// ベアラートークンがヘッダーに載らない文字を含む
    #[error("bearer token contains invalid characters")]
    InvalidToken,

    /// 接続断などのトランスポート層エラー
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
}
