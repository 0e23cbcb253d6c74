// 经上游 HTTP 代理建立 CONNECT 隧道
//
// 对上游发一行裸 CONNECT，响应状态行含 200/201 即视为隧道建立

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

use super::error::ProxyError;

/// 连接上游代理的超时
const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// 通过上游 HTTP 代理连到目标，返回已建立的隧道连接
pub async fn dial_through_proxy(proxy_url: &str, target: &str) -> Result<TcpStream, ProxyError> {
    let parsed = Url::parse(proxy_url)
        .map_err(|e| ProxyError::Upstream(format!("invalid proxy URL {}: {}", proxy_url, e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| ProxyError::Upstream(format!("proxy URL {} has no host", proxy_url)))?;
    // 未写端口时默认 80
    let port = parsed.port().unwrap_or(80);
    let proxy_addr = format!("{}:{}", host, port);

    let mut conn = timeout(UPSTREAM_DIAL_TIMEOUT, TcpStream::connect(&proxy_addr))
        .await
        .map_err(|_| ProxyError::DialTimeout(proxy_addr.clone()))?
        .map_err(|e| ProxyError::Upstream(format!("failed to connect to proxy {}: {}", proxy_addr, e)))?;

    let connect_req = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target);
    conn.write_all(connect_req.as_bytes())
        .await
        .map_err(|e| ProxyError::Upstream(format!("failed to send CONNECT to proxy: {}", e)))?;

    // 读一段响应，检查状态行是否接受
    let mut buf = vec![0u8; 4096];
    let n = conn
        .read(&mut buf)
        .await
        .map_err(|e| ProxyError::Upstream(format!("failed to read proxy response: {}", e)))?;
    let response = String::from_utf8_lossy(&buf[..n]);

    if !response.contains("200") && !response.contains("201") {
        let summary: String = response.chars().take(200).collect();
        return Err(ProxyError::Upstream(format!(
            "proxy rejected connection: {}",
            summary.trim()
        )));
    }

    tracing::debug!("connected to {} through proxy {}", target, proxy_addr);
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    /// 起一个假上游代理：消费 CONNECT 头后按 accept 返回 200 或 403，成功后回显数据
    async fn fake_upstream(accept: bool) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = tokio::io::BufReader::new(stream);
            let mut line = String::new();
            loop {
                line.clear();
                reader.read_line(&mut line).await.unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            let mut stream = reader.into_inner();
            if accept {
                stream
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await
                    .unwrap();
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let _ = stream.write_all(&buf[..n]).await;
                        }
                    }
                }
            } else {
                stream
                    .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
                    .await
                    .unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_dial_through_accepting_proxy() {
        let addr = fake_upstream(true).await;
        let url = format!("http://{}", addr);
        let mut conn = dial_through_proxy(&url, "example.com:443").await.unwrap();

        conn.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_rejecting_proxy_is_error() {
        let addr = fake_upstream(false).await;
        let url = format!("http://{}", addr);
        let err = dial_through_proxy(&url, "example.com:443")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rejected"));
    }

    #[tokio::test]
    async fn test_invalid_proxy_url() {
        let err = dial_through_proxy("::not a url::", "example.com:443")
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Upstream(_)));
    }
}
