// 本地转发代理服务器
//
// 监听 127.0.0.1 回环口，CONNECT 建立原始隧道（HTTPS 等），
// 其余方法作为普通 HTTP 请求转发。单个连接出错只断开该连接，
// 监听循环继续服务

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::event::{CoreEvent, LogEntry};
use crate::relay::relay_streams;

use super::error::ProxyError;
use super::http;
use super::upstream;

/// 直连目标的超时
const CONNECT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// 单个请求允许的最大头数量
const MAX_HEADERS: usize = 100;

/// 请求行加头部允许的总字节数上限
const MAX_HEAD_BYTES: u64 = 64 * 1024;

/// 解析后的请求行与头部
#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

struct ProxyContext {
    http_proxy: Option<String>,
    https_proxy: Option<String>,
    events: mpsc::UnboundedSender<CoreEvent>,
}

impl ProxyContext {
    fn log(&self, entry: LogEntry) {
        let _ = self.events.send(CoreEvent::Log(entry));
    }
}

/// 本地转发代理
pub struct ProxyServer {
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
}

impl ProxyServer {
    /// 绑定本地回环口，端口被占用等绑定失败属于致命错误，直接返回
    pub async fn bind(
        port: u16,
        http_proxy: Option<String>,
        https_proxy: Option<String>,
        events: mpsc::UnboundedSender<CoreEvent>,
    ) -> Result<Self, ProxyError> {
        let addr = format!("127.0.0.1:{}", port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        Ok(Self {
            listener,
            ctx: Arc::new(ProxyContext {
                http_proxy,
                https_proxy,
                events,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// 接受循环，直到取消。每个连接一个任务，连接级错误不影响监听
    pub async fn serve(&self, cancel: CancellationToken) {
        let addr = self
            .listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        self.ctx
            .log(LogEntry::info(format!("Proxy listening on {}", addr)));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let ctx = self.ctx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, &ctx).await {
                                    tracing::debug!("client {} error: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            self.ctx.log(LogEntry::warn(format!("Accept error: {}", e)));
                        }
                    }
                }
            }
        }

        self.ctx.log(LogEntry::info("Proxy stopped"));
        let _ = self.ctx.events.send(CoreEvent::ProxyStatus {
            running: false,
            error: None,
        });
    }
}

/// 处理单个客户端连接：解析请求头后分派 CONNECT 或普通转发
async fn handle_client(stream: TcpStream, ctx: &ProxyContext) -> Result<(), ProxyError> {
    let mut reader = BufReader::new(stream);
    let head = match read_head(&mut reader).await {
        Ok(head) => head,
        Err(e) => {
            let _ = write_error(&mut reader, 400, "Bad Request", &e.to_string()).await;
            return Err(e);
        }
    };

    if head.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(reader, &head, ctx).await
    } else {
        let body = read_body(&mut reader, &head).await?;
        if let Err(e) =
            http::forward_request(&mut reader, &head, body, ctx.http_proxy.as_deref()).await
        {
            ctx.log(LogEntry::warn(format!(
                "Forward {} {} failed: {}",
                head.method, head.target, e
            )));
            let _ = write_error(&mut reader, 502, "Bad Gateway", &e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }
}

/// CONNECT 隧道：直连或经上游代理连到目标，成功后双向中继
///
/// 缓冲读取器原样传给中继，避免丢掉已读入缓冲的早到字节（如 TLS ClientHello）
async fn handle_connect(
    mut reader: BufReader<TcpStream>,
    head: &RequestHead,
    ctx: &ProxyContext,
) -> Result<(), ProxyError> {
    let target = head.target.clone();

    let dialed = if let Some(proxy_url) = ctx.https_proxy.as_deref() {
        upstream::dial_through_proxy(proxy_url, &target).await
    } else {
        timeout(CONNECT_DIAL_TIMEOUT, TcpStream::connect(&target))
            .await
            .map_err(|_| ProxyError::DialTimeout(target.clone()))
            .and_then(|r| r.map_err(ProxyError::Io))
    };

    let server_conn = match dialed {
        Ok(conn) => conn,
        Err(e) => {
            ctx.log(LogEntry::warn(format!("CONNECT {} failed: {}", target, e)));
            let _ = write_error(&mut reader, 502, "Bad Gateway", &e.to_string()).await;
            return Err(e);
        }
    };

    reader
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    reader.flush().await?;

    let (sent, received) = relay_streams(reader, server_conn).await;
    tracing::debug!("CONNECT {} closed, {}B out / {}B in", target, sent, received);
    Ok(())
}

/// 逐行读出请求行和头部，直到空行
///
/// 整个请求头限制在 MAX_HEAD_BYTES 内，超长的单行不会无限占内存
async fn read_head(reader: &mut BufReader<TcpStream>) -> Result<RequestHead, ProxyError> {
    let mut limited = (&mut *reader).take(MAX_HEAD_BYTES);

    let mut line = String::new();
    limited.read_line(&mut line).await?;
    let request_line = line.trim_end();
    if request_line.is_empty() {
        return Err(ProxyError::BadRequest("empty request line".to_string()));
    }

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ProxyError::BadRequest("missing method".to_string()))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| ProxyError::BadRequest("missing request target".to_string()))?
        .to_string();
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();

    let mut headers = Vec::new();
    loop {
        line.clear();
        let n = limited.read_line(&mut line).await?;
        if n == 0 {
            return Err(if limited.limit() == 0 {
                ProxyError::BadRequest("request head too large".to_string())
            } else {
                ProxyError::BadRequest("connection closed in headers".to_string())
            });
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADERS {
            return Err(ProxyError::BadRequest("too many headers".to_string()));
        }
        match trimmed.split_once(':') {
            Some((name, value)) => {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
            None => {
                return Err(ProxyError::BadRequest(format!(
                    "malformed header line: {}",
                    trimmed
                )));
            }
        }
    }

    Ok(RequestHead {
        method,
        target,
        version,
        headers,
    })
}

/// 读出请求体：chunked 编码按分块解出，否则按 Content-Length，都没有则为空
async fn read_body(
    reader: &mut BufReader<TcpStream>,
    head: &RequestHead,
) -> Result<Vec<u8>, ProxyError> {
    let chunked = head
        .header("transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    if chunked {
        return read_chunked_body(reader).await;
    }

    let length = match head.header("content-length") {
        Some(v) => v
            .parse::<usize>()
            .map_err(|_| ProxyError::BadRequest(format!("invalid Content-Length: {}", v)))?,
        None => return Ok(Vec::new()),
    };
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// 解 chunked 请求体：十六进制长度行 + 数据块，0 块结束，trailer 头读掉丢弃
async fn read_chunked_body(reader: &mut BufReader<TcpStream>) -> Result<Vec<u8>, ProxyError> {
    let mut body = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(ProxyError::BadRequest(
                "connection closed in chunked body".to_string(),
            ));
        }
        let size_str = line.trim_end().split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ProxyError::BadRequest(format!("invalid chunk size: {}", size_str)))?;
        if size == 0 {
            break;
        }
        let mut chunk = vec![0u8; size];
        reader.read_exact(&mut chunk).await?;
        body.extend_from_slice(&chunk);
        // 数据块后跟一个 CRLF
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
    }
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line.trim_end().is_empty() {
            break;
        }
    }
    Ok(body)
}

async fn write_error<W>(writer: &mut W, code: u16, reason: &str, detail: &str) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let body = format!("{}\n", detail);
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        code,
        reason,
        body.len(),
        body
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
