// 普通 HTTP 请求的代理转发
//
// 非 CONNECT 请求交给 reqwest 发出，剥掉 Proxy-* 头，
// 响应按 Connection: close 框架流式回写客户端

use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::error::ProxyError;
use super::server::RequestHead;

/// 发往目标服务器的请求超时
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// 这些头只在客户端与代理之间有意义，不往目标转发
const STRIPPED_HEADERS: [&str; 3] = ["proxy-connection", "proxy-authenticate", "proxy-authorization"];

fn is_stripped(name: &str) -> bool {
    STRIPPED_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// 转发一个普通 HTTP 请求并把响应写回 `client`
///
/// `http_proxy` 非空时，请求改经上游代理发出
pub async fn forward_request<W>(
    client: &mut W,
    head: &RequestHead,
    body: Vec<u8>,
    http_proxy: Option<&str>,
) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let mut builder = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none());
    if let Some(proxy_url) = http_proxy {
        let proxy = reqwest::Proxy::http(proxy_url)
            .map_err(|e| ProxyError::Upstream(format!("invalid proxy URL {}: {}", proxy_url, e)))?;
        builder = builder.proxy(proxy);
    }
    let http_client = builder
        .build()
        .map_err(|e| ProxyError::Upstream(format!("failed to build HTTP client: {}", e)))?;

    let method = reqwest::Method::from_bytes(head.method.as_bytes())
        .map_err(|_| ProxyError::BadRequest(format!("unsupported method: {}", head.method)))?;

    let mut request = http_client.request(method, &head.target);
    for (name, value) in &head.headers {
        if is_stripped(name) {
            continue;
        }
        // 请求体已整体读出，出站定界交给 reqwest 重新生成
        if name.eq_ignore_ascii_case("transfer-encoding")
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        request = request.header(name, value);
    }
    if !body.is_empty() {
        request = request.body(body);
    }

    let mut response = request
        .send()
        .await
        .map_err(|e| ProxyError::Upstream(format!("request to {} failed: {}", head.target, e)))?;

    // 状态行 + 过滤后的响应头；reqwest 已解码分块编码，改按连接关闭定界
    let status = response.status();
    let mut header_block = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in response.headers() {
        let lower = name.as_str();
        if lower.eq_ignore_ascii_case("transfer-encoding")
            || lower.eq_ignore_ascii_case("connection")
            || lower.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        if let Ok(v) = value.to_str() {
            header_block.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    header_block.push_str("Connection: close\r\n\r\n");
    client.write_all(header_block.as_bytes()).await?;

    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| ProxyError::Upstream(format!("failed to read response body: {}", e)))?
    {
        client.write_all(&chunk).await?;
        client.flush().await?;
    }
    client.shutdown().await?;

    tracing::debug!("{} {} -> {}", head.method, head.target, status.as_u16());
    Ok(())
}
