// 双向字节流转发
//
// 两条方向各自独立拷贝，一个方向读到 EOF 后立即半关闭对端写侧，
// 两个方向都结束后才返回，调用方据此约束连接生命周期

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// 在两条全双工流之间双向转发，直到两个方向都结束
///
/// 返回 (a->b, b->a) 各自拷贝的字节数。单个方向的读写错误
/// 只终止该方向，不中断另一方向（对端关闭后自然收尾）
pub async fn relay_streams<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_reader, mut a_writer) = tokio::io::split(a);
    let (mut b_reader, mut b_writer) = tokio::io::split(b);

    let a_to_b = async {
        let copied = tokio::io::copy(&mut a_reader, &mut b_writer)
            .await
            .unwrap_or(0);
        // 拷贝结束（EOF 或出错）即向对端传播半关闭
        let _ = b_writer.shutdown().await;
        copied
    };

    let b_to_a = async {
        let copied = tokio::io::copy(&mut b_reader, &mut a_writer)
            .await
            .unwrap_or(0);
        let _ = a_writer.shutdown().await;
        copied
    };

    tokio::join!(a_to_b, b_to_a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// 建一对经 relay 相连的 TCP 端点：返回 (client, target)
    async fn relay_pair() -> (TcpStream, TcpStream) {
        let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_a = listener_a.local_addr().unwrap();
        let addr_b = listener_b.local_addr().unwrap();

        let client = TcpStream::connect(addr_a).await.unwrap();
        let target = TcpStream::connect(addr_b).await.unwrap();
        let (side_a, _) = listener_a.accept().await.unwrap();
        let (side_b, _) = listener_b.accept().await.unwrap();

        tokio::spawn(async move {
            relay_streams(side_a, side_b).await;
        });

        (client, target)
    }

    #[tokio::test]
    async fn test_roundtrip_both_directions() {
        let (mut client, mut target) = relay_pair().await;

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        target.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_large_payload_in_order() {
        let (mut client, mut target) = relay_pair().await;

        // 4 MiB，足够跨越多次内部缓冲
        let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
            client
        });

        let mut received = Vec::with_capacity(expected.len());
        target.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_length_stream() {
        let (mut client, mut target) = relay_pair().await;

        client.shutdown().await.unwrap();
        let mut received = Vec::new();
        target.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_half_close_propagates_but_reverse_stays_open() {
        let (mut client, mut target) = relay_pair().await;

        // 客户端发完即半关闭
        client.write_all(b"done").await.unwrap();
        client.shutdown().await.unwrap();

        let mut buf = [0u8; 4];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"done");
        // 目标端读到 EOF
        assert_eq!(target.read(&mut buf).await.unwrap(), 0);

        // 反方向仍然可用
        target.write_all(b"late").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"late");
    }

    #[tokio::test]
    async fn test_returns_after_both_sides_close() {
        let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_a = listener_a.local_addr().unwrap();
        let addr_b = listener_b.local_addr().unwrap();

        let mut client = TcpStream::connect(addr_a).await.unwrap();
        let mut target = TcpStream::connect(addr_b).await.unwrap();
        let (side_a, _) = listener_a.accept().await.unwrap();
        let (side_b, _) = listener_b.accept().await.unwrap();

        let relay = tokio::spawn(async move { relay_streams(side_a, side_b).await });

        client.write_all(b"ab").await.unwrap();
        client.shutdown().await.unwrap();
        target.write_all(b"xyz").await.unwrap();
        target.shutdown().await.unwrap();

        let mut sink = Vec::new();
        target.read_to_end(&mut sink).await.unwrap();
        let mut sink2 = Vec::new();
        client.read_to_end(&mut sink2).await.unwrap();

        let (a_to_b, b_to_a) = relay.await.unwrap();
        assert_eq!(a_to_b, 2);
        assert_eq!(b_to_a, 3);
    }
}
