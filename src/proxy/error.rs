// 代理错误类型定义

use thiserror::Error;

/// 转发代理错误类型
#[derive(Debug, Error)]
pub enum ProxyError {
    /// 本地监听绑定失败（端口被占用等），启动时致命
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 请求不合法
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// 上游代理错误（URL 非法、拒绝 CONNECT 等）
    #[error("Upstream proxy error: {0}")]
    Upstream(String),

    /// 拨号超时
    #[error("Dial timeout connecting to {0}")]
    DialTimeout(String),
}
