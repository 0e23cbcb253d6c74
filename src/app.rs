// 会话协调器
//
// Start 一次拉起一个会话：先绑定本地代理（失败即致命），
// 再启动 SSH 隧道与事件泵。重复 Start 先停掉上一个会话。
// Stop 取消整个会话并复位状态，对无会话的情况也安全

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::event::{CoreEvent, LogEntry, LogLevel};
use crate::proxy::ProxyServer;
use crate::state::{LogCallback, StateHandle, Status};
use crate::tunnel::{PasswordPrompt, SshTunnel, TunnelConfig};

struct Session {
    cancel: CancellationToken,
    // 代理任务退出才释放本地监听口，重启同端口前要等它结束
    proxy_task: tokio::task::JoinHandle<()>,
}

/// 应用入口：持有共享状态并协调代理与隧道的生命周期
pub struct App {
    state: StateHandle,
    session: Mutex<Option<Session>>,
    draining: Mutex<Option<tokio::task::JoinHandle<()>>>,
    password_prompt: Mutex<Option<PasswordPrompt>>,
}

impl App {
    pub fn new() -> Self {
        Self {
            state: StateHandle::new(),
            session: Mutex::new(None),
            draining: Mutex::new(None),
            password_prompt: Mutex::new(None),
        }
    }

    /// 注册日志回调，新日志行进入缓冲的同时转发给回调
    pub fn set_log_callback(&self, callback: LogCallback) {
        self.state.set_log_callback(callback);
    }

    /// 注册密码补询回调（无静态密码时 keyboard-interactive 认证会用到）
    pub fn set_password_prompt(&self, prompt: PasswordPrompt) {
        *self.password_prompt.lock().unwrap() = Some(prompt);
    }

    /// 当前状态快照
    pub fn status(&self) -> Status {
        self.state.status()
    }

    /// 日志缓冲快照（旧 -> 新）
    pub fn logs(&self) -> Vec<String> {
        self.state.logs()
    }

    /// 启动一个会话。配置不完整立即报错；本地代理端口被占用同样立即报错。
    /// 已有会话在运行时先停掉再启动
    pub async fn start(&self, config: &Config) -> Result<()> {
        config.validate().context("invalid config")?;
        self.stop();

        // 上一个会话的监听随代理任务退出才释放，等它结束后端口才能重绑
        let draining = self.draining.lock().unwrap().take();
        if let Some(task) = draining {
            let _ = task.await;
        }

        // 会话持有配置副本，启动后外部修改不影响运行中的会话
        let config = config.clone();
        self.state.set_min_level(LogLevel::parse(&config.log_level));

        let (events, mut event_rx) = mpsc::unbounded_channel::<CoreEvent>();
        let cancel = CancellationToken::new();

        // 绑定失败属于致命错误，不进入重连，直接返回给调用方
        let proxy = ProxyServer::bind(
            config.proxy_port,
            config.http_proxy.clone(),
            config.https_proxy.clone(),
            events.clone(),
        )
        .await
        .map_err(|e| {
            self.state.update_proxy(false, Some(e.to_string()));
            self.state.push_log(&LogEntry::error(format!("Proxy start failed: {}", e)));
            anyhow::Error::from(e)
        })?;

        let mut tunnel_config = TunnelConfig::from_config(&config);
        tunnel_config.password_prompt = self.password_prompt.lock().unwrap().clone();
        let tunnel = Arc::new(SshTunnel::new(tunnel_config, events.clone(), cancel.clone()));
        drop(events); // 事件泵随最后一个发送端（代理/隧道任务）退出而结束

        let proxy_cancel = cancel.clone();
        let proxy_task = tokio::spawn(async move { proxy.serve(proxy_cancel).await });
        tokio::spawn({
            let tunnel = tunnel.clone();
            async move { tunnel.run().await }
        });

        // 事件泵：把代理/隧道上报的事件落到共享状态
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    CoreEvent::Log(entry) => state.push_log(&entry),
                    CoreEvent::TunnelStatus { connected, error } => {
                        state.update_tunnel(connected, error);
                    }
                    CoreEvent::ProxyStatus { running, error } => {
                        state.update_proxy(running, error);
                    }
                }
            }
        });

        self.state.update_status(true, false, true, None);
        self.state.mark_started();
        self.state.push_log(&LogEntry::info(format!(
            "Session started: proxy 127.0.0.1:{}, tunnel {}@{}:{}",
            config.proxy_port, config.ssh_user, config.ssh_host, config.ssh_port
        )));

        *self.session.lock().unwrap() = Some(Session { cancel, proxy_task });
        Ok(())
    }

    /// 停止当前会话并复位状态，无会话时为空操作
    pub fn stop(&self) {
        let session = self.session.lock().unwrap().take();
        if let Some(session) = session {
            session.cancel.cancel();
            *self.draining.lock().unwrap() = Some(session.proxy_task);
            self.state.update_status(false, false, false, None);
            self.state.push_log(&LogEntry::info("Session stopping..."));
        }
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// 占个端口再立即释放，得到一个大概率关闭的端口号
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    fn test_config(ssh_port: u16, proxy_port: u16) -> Config {
        let mut config = Config::default_config();
        config.ssh_host = "127.0.0.1".into();
        config.ssh_port = ssh_port;
        config.ssh_user = "test".into();
        config.ssh_password = "secret".into();
        config.proxy_port = proxy_port;
        config
    }

    #[tokio::test]
    async fn test_start_rejects_incomplete_config() {
        let app = App::new();
        let err = app.start(&Config::default_config()).await.unwrap_err();
        assert!(err.to_string().contains("invalid config"));
        assert!(!app.status().proxy_running);
    }

    #[tokio::test]
    async fn test_start_fails_fast_on_proxy_port_conflict() {
        // 先占住代理端口
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let app = App::new();
        let err = app.start(&test_config(22, port)).await.unwrap_err();
        assert!(err.to_string().contains("listen"), "got: {}", err);
        assert!(!app.status().proxy_running);
        assert!(app.status().last_error.is_some());
    }

    #[tokio::test]
    async fn test_session_lifecycle_with_unreachable_ssh() {
        let ssh_port = closed_port().await;
        let app = App::new();
        // proxy_port 0 让系统分配，避免测试间端口冲突
        app.start(&test_config(ssh_port, 0)).await.unwrap();

        let status = app.status();
        assert!(status.proxy_running);
        assert!(status.tunnel_running);
        assert!(!status.tunnel_connected);
        assert!(status.start_time.is_some());

        // SSH 不可达，隧道侧最终上报错误
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if app.status().last_error.is_some() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "no tunnel error reported");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        app.stop();
        let status = app.status();
        assert!(!status.proxy_running);
        assert!(!status.tunnel_running);
        assert!(!status.tunnel_connected);
    }

    #[tokio::test]
    async fn test_restart_replaces_previous_session() {
        let ssh_port = closed_port().await;
        let app = App::new();
        app.start(&test_config(ssh_port, 0)).await.unwrap();
        app.start(&test_config(ssh_port, 0)).await.unwrap();
        assert!(app.status().proxy_running);
        app.stop();
    }

    #[tokio::test]
    async fn test_restart_reuses_same_proxy_port() {
        let ssh_port = closed_port().await;
        let proxy_port = closed_port().await;
        let app = App::new();
        app.start(&test_config(ssh_port, proxy_port)).await.unwrap();
        // 同端口重启：旧监听释放后才重绑，不得报端口占用
        app.start(&test_config(ssh_port, proxy_port)).await.unwrap();
        assert!(app.status().proxy_running);
        app.stop();
    }

    #[tokio::test]
    async fn test_stop_then_start_on_same_port() {
        let ssh_port = closed_port().await;
        let proxy_port = closed_port().await;
        let app = App::new();
        app.start(&test_config(ssh_port, proxy_port)).await.unwrap();
        app.stop();
        app.start(&test_config(ssh_port, proxy_port)).await.unwrap();
        assert!(app.status().proxy_running);
        app.stop();
    }

    #[tokio::test]
    async fn test_stop_without_session_is_noop() {
        let app = App::new();
        app.stop();
        app.stop();
        assert!(!app.status().proxy_running);
    }
}
