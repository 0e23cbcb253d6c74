// 核心事件定义
//
// 代理服务器和 SSH 隧道通过事件通道向会话协调器上报状态和日志，
// 避免在异步任务中直接持有可变共享状态

use chrono::{DateTime, Local};

/// 核心事件（代理/隧道 -> 协调器）
#[derive(Clone, Debug)]
pub enum CoreEvent {
    /// 日志消息
    Log(LogEntry),
    /// 隧道状态变化（connected 仅在远端监听建立后为 true）
    TunnelStatus {
        connected: bool,
        error: Option<String>,
    },
    /// 代理服务器状态变化
    ProxyStatus {
        running: bool,
        error: Option<String>,
    },
}

/// 日志级别
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }

    /// 从配置字符串解析（未知值回退 INFO）
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Self::Debug,
            "WARN" => Self::Warn,
            "ERROR" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// 日志条目
#[derive(Clone, Debug)]
pub struct LogEntry {
    /// 时间戳
    pub timestamp: DateTime<Local>,
    /// 日志级别
    pub level: LogLevel,
    /// 消息内容
    pub message: String,
}

impl LogEntry {
    /// 创建新的日志条目
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            level,
            message: message.into(),
        }
    }

    /// 创建 Debug 级别日志
    pub fn debug(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Debug, message)
    }

    /// 创建 Info 级别日志
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    /// 创建 Warn 级别日志
    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    /// 创建 Error 级别日志
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    /// 格式化为 "[HH:MM:SS] message" 形式
    pub fn format_line(&self) -> String {
        format!("[{}] {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("DEBUG"), LogLevel::Debug);
        assert_eq!(LogLevel::parse("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::parse("ERROR"), LogLevel::Error);
        assert_eq!(LogLevel::parse(""), LogLevel::Info);
        assert_eq!(LogLevel::parse("whatever"), LogLevel::Info);
    }

    #[test]
    fn test_log_level_order() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Error);
    }
}
