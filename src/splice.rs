use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 2つの接続を双方向に橋渡しする
///
/// 先に終わった方向が共有キャンセルを立て、両方の接続を閉じ、
/// 両方向のタスクの終了を待ってから戻る。戻り値は(a→b, b→a)の転送バイト数
pub async fn splice<A, B>(a: A, b: B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let cancel = CancellationToken::new();

    let forward = tokio::spawn(copy_then_shutdown(a_read, b_write, cancel.clone()));
    let backward = tokio::spawn(copy_then_shutdown(b_read, a_write, cancel.clone()));

    let (forward, backward) = tokio::join!(forward, backward);
    let sent = flatten(forward)?;
    let received = flatten(backward)?;
    Ok((sent, received))
}

/// 1方向分のコピー。終了経路はキャンセル信号ただひとつ:
/// コピーが終わったら必ずキャンセルを立て、書き込み側を閉じる
async fn copy_then_shutdown<R, W>(
    mut from: ReadHalf<R>,
    mut to: WriteHalf<W>,
    cancel: CancellationToken,
) -> io::Result<u64>
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let result = tokio::select! {
        result = tokio::io::copy(&mut from, &mut to) => result,
        _ = cancel.cancelled() => {
            debug!("Copy direction cancelled by its sibling");
            Ok(0)
        }
    };

    cancel.cancel();
    let _ = to.shutdown().await;
    result
}

fn flatten(joined: Result<io::Result<u64>, tokio::task::JoinError>) -> io::Result<u64> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_relays_both_directions_and_tears_down() {
        let (a, mut a_far) = tokio::io::duplex(64);
        let (b, mut b_far) = tokio::io::duplex(64);
        let session = tokio::spawn(splice(a, b));

        a_far.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b_far.write_all(b"pong").await.unwrap();
        a_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // 片側を閉じれば両方向とも終わり、spliceが戻る
        drop(a_far);
        let (sent, _received) = session.await.unwrap().unwrap();
        assert_eq!(sent, 4);

        // 反対側の接続も閉じられている
        assert_eq!(b_far.read(&mut buf).await.unwrap(), 0);
    }
}
