// 会话状态与日志缓冲
//
// Status 和日志环形缓冲是唯一真正共享的可变状态，
// 写入走独占锁，读取返回快照副本，不向外暴露内部引用

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::event::{LogEntry, LogLevel};

/// 日志缓冲上限，超过后丢弃最旧的行
const MAX_LOG_LINES: usize = 100;

/// 日志回调类型 (level, message)
pub type LogCallback = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// 当前连接状态快照
#[derive(Clone, Debug, Default, Serialize)]
pub struct Status {
    pub proxy_running: bool,
    pub tunnel_connected: bool,
    pub tunnel_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
}

struct StateInner {
    status: Status,
    logs: VecDeque<String>,
    min_level: LogLevel,
    log_callback: Option<LogCallback>,
}

/// 共享状态句柄
///
/// 协调器持有并写入，UI/CLI 只通过 `status()` / `logs()` 取快照
#[derive(Clone)]
pub struct StateHandle {
    inner: Arc<Mutex<StateInner>>,
}

impl StateHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StateInner {
                status: Status::default(),
                logs: VecDeque::with_capacity(MAX_LOG_LINES),
                min_level: LogLevel::Info,
                log_callback: None,
            })),
        }
    }

    /// 设置日志过滤级别（低于该级别的日志不进入缓冲）
    pub fn set_min_level(&self, level: LogLevel) {
        self.inner.lock().unwrap().min_level = level;
    }

    /// 注册日志回调
    pub fn set_log_callback(&self, callback: LogCallback) {
        self.inner.lock().unwrap().log_callback = Some(callback);
    }

    /// 获取状态快照
    pub fn status(&self) -> Status {
        self.inner.lock().unwrap().status.clone()
    }

    /// 获取日志快照（旧 -> 新）
    pub fn logs(&self) -> Vec<String> {
        self.inner.lock().unwrap().logs.iter().cloned().collect()
    }

    /// 整体更新状态，所有字段在同一临界区内一次写入
    pub fn update_status(
        &self,
        proxy_running: bool,
        tunnel_connected: bool,
        tunnel_running: bool,
        last_error: Option<String>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.status.proxy_running = proxy_running;
        inner.status.tunnel_connected = tunnel_connected;
        inner.status.tunnel_running = tunnel_running;
        inner.status.last_error = last_error;
    }

    /// 仅更新隧道侧字段，代理侧保持当前值
    pub fn update_tunnel(&self, connected: bool, error: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.status.tunnel_connected = connected;
        inner.status.last_error = error;
    }

    /// 仅更新代理侧字段
    pub fn update_proxy(&self, running: bool, error: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.status.proxy_running = running;
        if error.is_some() {
            inner.status.last_error = error;
        }
    }

    /// 记录会话启动时间
    pub fn mark_started(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.status.start_time =
            Some(chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string());
    }

    /// 追加日志行，超过上限时丢弃最旧的
    pub fn push_log(&self, entry: &LogEntry) {
        // 回调在锁外调用，避免回调内再访问本状态时死锁
        let (line, callback) = {
            let mut inner = self.inner.lock().unwrap();
            if entry.level < inner.min_level {
                return;
            }
            let line = entry.format_line();
            if inner.logs.len() >= MAX_LOG_LINES {
                inner.logs.pop_front();
            }
            inner.logs.push_back(line.clone());
            (line, inner.log_callback.clone())
        };
        if let Some(callback) = callback {
            callback(entry.level, &line);
        }
    }
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_snapshot_is_copy() {
        let state = StateHandle::new();
        state.update_status(true, false, true, None);
        let snapshot = state.status();
        state.update_status(false, false, false, Some("boom".into()));
        // 之前取出的快照不受后续写入影响
        assert!(snapshot.proxy_running);
        assert!(snapshot.last_error.is_none());
        assert_eq!(state.status().last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_log_ring_caps_at_100() {
        let state = StateHandle::new();
        for i in 0..150 {
            state.push_log(&LogEntry::info(format!("line {}", i)));
        }
        let logs = state.logs();
        assert_eq!(logs.len(), 100);
        // 最旧的 50 行被丢弃
        assert!(logs[0].ends_with("line 50"));
        assert!(logs[99].ends_with("line 149"));
    }

    #[test]
    fn test_log_level_filter() {
        let state = StateHandle::new();
        state.set_min_level(LogLevel::Error);
        state.push_log(&LogEntry::info("hidden"));
        state.push_log(&LogEntry::debug("hidden too"));
        state.push_log(&LogEntry::error("visible"));
        let logs = state.logs();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].ends_with("visible"));
    }
}
