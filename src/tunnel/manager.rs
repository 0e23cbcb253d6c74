// SSH 反向隧道状态机
//
// 单次 Start 对应一个实例：Idle -> Connecting -> Listening -> Relaying，
// 任何非主动停止的错误进入 Reconnecting（固定退避后重连），
// Stop / 取消则进入 Stopped 并不再重连

use std::sync::Arc;
use std::time::Duration;

use russh::Disconnect;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::event::{CoreEvent, LogEntry};

use super::auth::{self, AuthSources};
use super::config::TunnelConfig;
use super::error::TunnelError;
use super::handler::ForwardHandler;

/// 传输存活探测周期，远小于心跳间隔，会话死亡能较快被发现
const TRANSPORT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// 隧道状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Connecting,
    Listening,
    Relaying,
    Reconnecting,
    Stopped,
}

/// SSH 反向隧道管理器
pub struct SshTunnel {
    config: TunnelConfig,
    events: mpsc::UnboundedSender<CoreEvent>,
    cancel: CancellationToken,
    auth_sources: AuthSources,
    state_tx: watch::Sender<TunnelState>,
}

impl SshTunnel {
    pub fn new(
        config: TunnelConfig,
        events: mpsc::UnboundedSender<CoreEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(TunnelState::Idle);
        Self {
            config,
            events,
            cancel,
            auth_sources: AuthSources::from_env(),
            state_tx,
        }
    }

    /// 覆盖认证材料来源（测试用）
    pub fn with_auth_sources(mut self, sources: AuthSources) -> Self {
        self.auth_sources = sources;
        self
    }

    /// 订阅状态变化
    pub fn subscribe_state(&self) -> watch::Receiver<TunnelState> {
        self.state_tx.subscribe()
    }

    /// 停止隧道并禁止后续重连，可重复调用，无活跃会话时也安全
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn set_state(&self, state: TunnelState) {
        tracing::debug!("tunnel state -> {:?}", state);
        // send_replace 在没有订阅者时也保留最新值，晚订阅者能看到当前状态
        self.state_tx.send_replace(state);
    }

    fn log(&self, entry: LogEntry) {
        let _ = self.events.send(CoreEvent::Log(entry));
    }

    fn report_status(&self, connected: bool, error: Option<String>) {
        let _ = self.events.send(CoreEvent::TunnelStatus { connected, error });
    }

    /// 带自动重连地运行隧道，直到 Stop 或取消
    pub async fn run(&self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.connect_once().await {
                Ok(()) => break, // 主动停止
                Err(e) => {
                    self.log(LogEntry::error(format!("Connection error: {}", e)));
                    self.report_status(false, Some(e.to_string()));
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }

            self.set_state(TunnelState::Reconnecting);
            self.log(LogEntry::info(format!(
                "Reconnecting in {} seconds...",
                self.config.reconnect_delay.as_secs()
            )));
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(self.config.reconnect_delay) => {}
            }
        }

        self.set_state(TunnelState::Stopped);
        self.log(LogEntry::info("Tunnel stopped"));
    }

    /// 单次连接尝试：拨号、认证、建立远端监听、维持心跳
    ///
    /// 返回 Ok 表示因 Stop/取消而结束，Err 则交由重连逻辑处理
    async fn connect_once(&self) -> Result<(), TunnelError> {
        self.set_state(TunnelState::Connecting);

        let candidates = self.auth_sources.candidates(&self.config, &self.events);
        if candidates.is_empty() {
            return Err(TunnelError::NoAuthMethods);
        }

        let addr = (self.config.host.as_str(), self.config.port);
        self.log(LogEntry::info(format!(
            "Dialing {}:{}...",
            self.config.host, self.config.port
        )));

        let russh_config = Arc::new(self.config.to_russh_config());
        let handler = ForwardHandler::new(
            self.events.clone(),
            self.config.local_port,
            self.config.local_dial_timeout,
        );

        let connect_secs = self.config.connect_timeout.as_secs();
        let mut handle = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            dialed = timeout(
                self.config.connect_timeout,
                russh::client::connect(russh_config, addr, handler),
            ) => dialed
                .map_err(|_| TunnelError::Timeout(connect_secs))?
                .map_err(TunnelError::from)?,
        };

        self.log(LogEntry::info(format!(
            "Connected, authenticating as '{}'...",
            self.config.username
        )));

        tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            result = auth::authenticate(&mut handle, &self.config, candidates, &self.events) => {
                result?;
            }
        }

        // 请求远端回环口上的反向监听
        self.set_state(TunnelState::Listening);
        let remote_port = self.config.remote_port;
        timeout(
            self.config.connect_timeout,
            handle.tcpip_forward("127.0.0.1", remote_port as u32),
        )
        .await
        .map_err(|_| TunnelError::Timeout(connect_secs))?
        .map_err(|e| match e {
            russh::Error::RequestDenied => TunnelError::RemoteListen {
                port: remote_port,
                reason: "request denied (port in use or server policy)".to_string(),
            },
            other => TunnelError::RemoteListen {
                port: remote_port,
                reason: other.to_string(),
            },
        })?;

        self.log(LogEntry::info(format!(
            "Reverse tunnel established: remote:{} -> local:{}",
            remote_port, self.config.local_port
        )));
        self.report_status(true, None);
        self.set_state(TunnelState::Relaying);

        // 转发连接由 Handler 回调逐条处理，这里短周期探测传输存活，
        // 到达心跳间隔时发一次带回执的心跳
        let mut next_keepalive = tokio::time::Instant::now() + self.config.keepalive_interval;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = handle.cancel_tcpip_forward("127.0.0.1", remote_port as u32).await;
                    let _ = handle
                        .disconnect(Disconnect::ByApplication, "stopped", "en")
                        .await;
                    return Ok(());
                }
                _ = sleep(TRANSPORT_POLL_INTERVAL) => {
                    if handle.is_closed() {
                        return Err(TunnelError::Disconnected("session closed".to_string()));
                    }
                    if tokio::time::Instant::now() >= next_keepalive {
                        handle
                            .send_keepalive(true)
                            .await
                            .map_err(|e| TunnelError::Keepalive(e.to_string()))?;
                        next_keepalive = tokio::time::Instant::now() + self.config.keepalive_interval;
                    }
                }
            }
        }
    }
}
