// 隧道连接配置

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;

/// 密码补询回调（无静态密码时由 keyboard-interactive 认证调用）
pub type PasswordPrompt = Arc<dyn Fn() -> String + Send + Sync>;

/// SSH 隧道配置
#[derive(Clone)]
pub struct TunnelConfig {
    /// 目标主机
    pub host: String,
    /// SSH 端口
    pub port: u16,
    /// 用户名
    pub username: String,
    /// 静态密码（可为空）
    pub password: Option<String>,
    /// 指定的私钥路径
    pub key_path: Option<PathBuf>,
    /// 私钥口令
    pub key_passphrase: Option<String>,
    /// 远端监听端口（反向隧道）
    pub remote_port: u16,
    /// 本地代理端口（转发目的地）
    pub local_port: u16,
    /// SSH 拨号超时
    pub connect_timeout: Duration,
    /// 本地代理拨号超时
    pub local_dial_timeout: Duration,
    /// 心跳间隔
    pub keepalive_interval: Duration,
    /// 重连退避
    pub reconnect_delay: Duration,
    /// 密码补询回调
    pub password_prompt: Option<PasswordPrompt>,
}

impl TunnelConfig {
    /// 从应用配置构建
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.ssh_host.clone(),
            port: config.ssh_port,
            username: config.ssh_user.clone(),
            password: if config.ssh_password.is_empty() {
                None
            } else {
                Some(config.ssh_password.clone())
            },
            key_path: config.ssh_key_path.as_ref().map(PathBuf::from),
            key_passphrase: if config.ssh_key_passphrase.is_empty() {
                None
            } else {
                Some(config.ssh_key_passphrase.clone())
            },
            remote_port: config.remote_port,
            local_port: config.proxy_port,
            ..Default::default()
        }
    }

    /// 构建 russh 客户端配置
    pub fn to_russh_config(&self) -> russh::client::Config {
        russh::client::Config {
            nodelay: true,
            inactivity_timeout: None,
            ..Default::default()
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            password: None,
            key_path: None,
            key_passphrase: None,
            remote_port: 8080,
            local_port: 8080,
            connect_timeout: Duration::from_secs(30),
            local_dial_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            password_prompt: None,
        }
    }
}
