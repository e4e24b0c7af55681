//! Relay pipelines: SOCKS5 front end, TCP session handling, UDP NAT.

use std::io;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub mod local;
pub mod socks5;
pub mod tcprelay;
pub mod udprelay;

pub(crate) const TCP_BUF_SIZE: usize = 1024;
pub(crate) const UDP_BUF_SIZE: usize = 10 * 1024;

/// Copies between `left` and `right` bidirectionally. Returns the number of
/// bytes copied right→left, left→right, and the first error observed.
///
/// When either direction finishes, both write halves are shut down and the
/// peer copier is unblocked through a shared token, so neither side can be
/// left reading a dead connection. Both copiers have terminated by the time
/// this returns.
pub async fn relay<L, R>(left: L, right: R) -> (u64, u64, Option<io::Error>)
where
    L: AsyncRead + AsyncWrite + Send + Unpin,
    R: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (left_r, left_w) = tokio::io::split(left);
    let (right_r, right_w) = tokio::io::split(right);

    let done = CancellationToken::new();
    let first_err = Arc::new(Mutex::new(None));

    // Both copiers run inside this future, so dropping it (force-close)
    // tears down both endpoints at once.
    let (left_to_right, right_to_left) = tokio::join!(
        copy_one_way(left_r, right_w, done.clone(), first_err.clone()),
        copy_one_way(right_r, left_w, done.clone(), first_err.clone()),
    );

    let err = first_err.lock().unwrap().take();
    (right_to_left, left_to_right, err)
}

async fn copy_one_way<R, W>(
    mut from: R,
    mut to: W,
    done: CancellationToken,
    first_err: Arc<Mutex<Option<io::Error>>>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let record = |e: io::Error| {
        let mut slot = first_err.lock().unwrap();
        if slot.is_none() {
            *slot = Some(e);
        }
    };

    let mut buf = vec![0u8; TCP_BUF_SIZE];
    let mut copied = 0u64;
    loop {
        let n = tokio::select! {
            biased;
            _ = done.cancelled() => break,
            res = from.read(&mut buf) => match res {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    record(e);
                    break;
                }
            },
        };
        let written = tokio::select! {
            biased;
            _ = done.cancelled() => break,
            res = async {
                to.write_all(&buf[..n]).await?;
                to.flush().await
            } => res,
        };
        if let Err(e) = written {
            record(e);
            break;
        }
        copied += n as u64;
    }

    // Pushes the EOF through to the peer and unblocks the other copier.
    let _ = to.shutdown().await;
    done.cancel();
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn copies_both_directions_and_counts() {
        let (left, left_peer) = duplex(4096);
        let (right, right_peer) = duplex(4096);

        let handle = tokio::spawn(relay(left, right));

        let (mut lp, mut rp) = (left_peer, right_peer);
        lp.write_all(b"from-left").await.unwrap();
        lp.shutdown().await.unwrap();

        let mut got = Vec::new();
        rp.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"from-left");

        let (_r2l, l2r, err) = handle.await.unwrap();
        assert_eq!(l2r, 9);
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn peer_eof_terminates_both_copiers() {
        let (left, left_peer) = duplex(4096);
        let (right, right_peer) = duplex(4096);

        let handle = tokio::spawn(relay(left, right));

        // Close one side without ever touching the other. The relay must
        // still terminate and release the second peer.
        drop(left_peer);
        let mut rp = right_peer;
        let mut buf = Vec::new();
        rp.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        let (r2l, l2r, _err) = handle.await.unwrap();
        assert_eq!((r2l, l2r), (0, 0));
    }

    #[tokio::test]
    async fn bytes_survive_round_trip_echo() {
        let (left, left_peer) = duplex(4096);
        let (right, mut right_peer) = duplex(4096);

        let handle = tokio::spawn(relay(left, right));

        // Echo everything arriving on the right side back.
        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                match right_peer.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if right_peer.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut lp = left_peer;
        for i in 0..10u8 {
            let msg = [i; 32];
            lp.write_all(&msg).await.unwrap();
            let mut got = [0u8; 32];
            lp.read_exact(&mut got).await.unwrap();
            assert_eq!(got, msg);
        }
        drop(lp);

        let (r2l, l2r, _) = handle.await.unwrap();
        assert_eq!(r2l, 320);
        assert_eq!(l2r, 320);
        echo.await.unwrap();
    }
}
