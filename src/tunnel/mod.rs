// SSH 反向隧道模块
//
// 模块结构:
// - config: 隧道配置 (TunnelConfig)
// - error: 错误类型 (TunnelError)
// - auth: 认证候选构建与按序尝试 (AuthCandidate, AuthSources)
// - handler: russh Handler 实现，转发远端 accept 的连接
// - manager: 状态机与重连逻辑 (SshTunnel)

pub mod auth;
pub mod config;
pub mod error;
pub mod handler;
pub mod manager;

// 公开导出
pub use auth::{AuthCandidate, AuthSources};
pub use config::{PasswordPrompt, TunnelConfig};
pub use error::TunnelError;
pub use manager::{SshTunnel, TunnelState};
