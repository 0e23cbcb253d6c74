// SSH 客户端 Handler 实现
//
// 远端监听 accept 的每条连接经 server_channel_open_forwarded_tcpip 回调进来，
// 各自独立 spawn 转发任务，不阻塞 SSH 会话本身的消息处理

use std::future::Future;
use std::time::Duration;

use russh::keys::PublicKey;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::event::{CoreEvent, LogEntry};
use crate::relay::relay_streams;

/// SSH 客户端 Handler
pub struct ForwardHandler {
    /// 事件发送器
    events: mpsc::UnboundedSender<CoreEvent>,
    /// 本地代理地址（转发目的地）
    local_addr: String,
    /// 本地代理拨号超时
    local_dial_timeout: Duration,
}

impl ForwardHandler {
    pub fn new(
        events: mpsc::UnboundedSender<CoreEvent>,
        local_port: u16,
        local_dial_timeout: Duration,
    ) -> Self {
        Self {
            events,
            local_addr: format!("127.0.0.1:{}", local_port),
            local_dial_timeout,
        }
    }

    fn log(&self, entry: LogEntry) {
        let _ = self.events.send(CoreEvent::Log(entry));
    }
}

impl russh::client::Handler for ForwardHandler {
    type Error = russh::Error;

    /// 检查服务器公钥
    /// 这里接受所有公钥（与原始行为一致，已知安全缺口），只记录指纹
    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let fingerprint = server_public_key.fingerprint(russh::keys::ssh_key::HashAlg::Sha256);
        self.log(LogEntry::debug(format!(
            "Server key fingerprint: {} ({})",
            fingerprint,
            server_public_key.algorithm()
        )));
        async { Ok(true) }
    }

    /// 远端监听 accept 了一条连接：转发到本地代理
    fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: russh::Channel<russh::client::Msg>,
        _connected_address: &str,
        _connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut russh::client::Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let events = self.events.clone();
        let local_addr = self.local_addr.clone();
        let dial_timeout = self.local_dial_timeout;
        let origin = format!("{}:{}", originator_address, originator_port);

        async move {
            // 不在 Handler 内等待拷贝完成，否则会阻塞会话的报文处理
            tokio::spawn(async move {
                let dialed = timeout(dial_timeout, TcpStream::connect(&local_addr)).await;
                match dialed {
                    Ok(Ok(local_conn)) => {
                        let _ = events.send(CoreEvent::Log(LogEntry::debug(format!(
                            "Forwarding remote connection from {}",
                            origin
                        ))));
                        let (up, down) = relay_streams(channel.into_stream(), local_conn).await;
                        let _ = events.send(CoreEvent::Log(LogEntry::debug(format!(
                            "Remote connection from {} closed ({} up / {} down bytes)",
                            origin, up, down
                        ))));
                    }
                    Ok(Err(e)) => {
                        let _ = events.send(CoreEvent::Log(LogEntry::error(format!(
                            "Failed to connect to local proxy {}: {}",
                            local_addr, e
                        ))));
                        let _ = channel.close().await;
                    }
                    Err(_) => {
                        let _ = events.send(CoreEvent::Log(LogEntry::error(format!(
                            "Timed out connecting to local proxy {}",
                            local_addr
                        ))));
                        let _ = channel.close().await;
                    }
                }
            });
            Ok(())
        }
    }
}
