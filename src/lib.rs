// PortBridge - SSH 反向隧道 + 本地转发代理
//
// 双跳结构：浏览器等客户端指向受限主机上的远端监听口，
// 流量经 SSH 反向隧道回到本机，再由本地 HTTP/HTTPS 转发代理发往外网

pub mod app;
pub mod config;
pub mod event;
pub mod proxy;
pub mod relay;
pub mod state;
pub mod tunnel;

pub use app::App;
pub use config::{Config, ConfigError, RemoteRecord};
pub use event::{CoreEvent, LogEntry, LogLevel};
pub use proxy::{ProxyError, ProxyServer};
pub use state::{StateHandle, Status};
pub use tunnel::{SshTunnel, TunnelConfig, TunnelError, TunnelState};
