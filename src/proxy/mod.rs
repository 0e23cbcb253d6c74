// 本地 HTTP/HTTPS 转发代理模块
//
// 模块结构:
// - error: 错误类型 (ProxyError)
// - server: 监听循环、请求解析与 CONNECT 隧道 (ProxyServer)
// - http: 普通 HTTP 请求经 reqwest 转发
// - upstream: 经上游代理的 CONNECT 拨号

pub mod error;
pub mod http;
pub mod server;
pub mod upstream;

pub use error::ProxyError;
pub use server::{ProxyServer, RequestHead};
