// 隧道错误类型定义

use thiserror::Error;

/// SSH 隧道错误类型
#[derive(Debug, Error)]
pub enum TunnelError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 无可用认证方式
    #[error("no authentication methods available")]
    NoAuthMethods,

    /// IO 错误（网络连接等）
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 认证失败
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// SSH 协议错误
    #[error("SSH protocol error: {0}")]
    Protocol(String),

    /// 密钥错误
    #[error("Key error: {0}")]
    Key(String),

    /// 远端监听建立失败（端口被占用或服务端策略拒绝）
    #[error("Remote listen failed on port {port}: {reason}")]
    RemoteListen { port: u16, reason: String },

    /// 心跳失败，底层传输已死
    #[error("Keepalive failed: {0}")]
    Keepalive(String),

    /// 连接超时
    #[error("Connection timeout after {0}s")]
    Timeout(u64),

    /// 会话已断开
    #[error("Session disconnected: {0}")]
    Disconnected(String),
}

impl From<russh::Error> for TunnelError {
    fn from(e: russh::Error) -> Self {
        TunnelError::Protocol(e.to_string())
    }
}

impl From<russh::keys::Error> for TunnelError {
    fn from(e: russh::keys::Error) -> Self {
        TunnelError::Key(e.to_string())
    }
}

impl From<russh::AgentAuthError> for TunnelError {
    fn from(e: russh::AgentAuthError) -> Self {
        TunnelError::Auth(format!("agent: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions_keep_detail() {
        let err: TunnelError = std::io::Error::new(std::io::ErrorKind::Other, "refused").into();
        assert!(err.to_string().contains("refused"));

        let err = TunnelError::from(russh::Error::RequestDenied);
        assert!(matches!(err, TunnelError::Protocol(_)));
    }
}
