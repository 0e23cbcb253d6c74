// 连接配置与本地持久化
//
// 配置文件为 JSON，存放在系统配置目录下（dirs::config_dir），
// 支持多条远程记录（records）+ 活跃记录指针，顶层平铺字段与活跃记录保持同步

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 默认 SSH 端口
pub const DEFAULT_SSH_PORT: u16 = 22;
/// 默认本地代理端口 / 远端监听端口
pub const DEFAULT_PROXY_PORT: u16 = 8080;

/// 配置错误类型
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to write config: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config directory unavailable")]
    NoConfigDir,

    #[error("incomplete config: {0}")]
    Incomplete(&'static str),
}

/// 一条远程连接记录
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteRecord {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<String>,
    pub proxy_port: u16,
    pub remote_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl RemoteRecord {
    /// 端口为 0 时补默认值
    fn apply_defaults(&mut self) {
        if self.ssh_port == 0 {
            self.ssh_port = DEFAULT_SSH_PORT;
        }
        if self.proxy_port == 0 {
            self.proxy_port = DEFAULT_PROXY_PORT;
        }
        if self.remote_port == 0 {
            self.remote_port = DEFAULT_PROXY_PORT;
        }
    }
}

/// 应用配置
///
/// 顶层平铺字段是"当前生效"的一份（兼容旧格式），records 是完整的多记录列表。
/// 密码与密钥口令只存在于内存，永远不写入磁盘
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<RemoteRecord>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub active_id: String,

    // SSH 连接设置
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    #[serde(skip_serializing)]
    pub ssh_password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<String>,
    #[serde(skip_serializing)]
    pub ssh_key_passphrase: String,

    // 端口设置
    pub proxy_port: u16,
    pub remote_port: u16,

    // 上游代理（本机访问外网用）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,

    // 日志级别: DEBUG / INFO / ERROR
    pub log_level: String,
}

impl Config {
    /// 带一条默认记录的初始配置
    pub fn default_config() -> Self {
        let record = RemoteRecord {
            id: new_record_id(),
            ssh_port: DEFAULT_SSH_PORT,
            proxy_port: DEFAULT_PROXY_PORT,
            remote_port: DEFAULT_PROXY_PORT,
            ..Default::default()
        };
        let mut config = Config {
            active_id: record.id.clone(),
            records: vec![record],
            ..Default::default()
        };
        config.sync_from_active();
        config
    }

    /// 校验必填项：主机、用户名、至少一种认证材料
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ssh_host.is_empty() {
            return Err(ConfigError::Incomplete("ssh_host is required"));
        }
        if self.ssh_user.is_empty() {
            return Err(ConfigError::Incomplete("ssh_user is required"));
        }
        if self.ssh_password.is_empty() && self.ssh_key_path.is_none() {
            return Err(ConfigError::Incomplete(
                "either ssh_password or ssh_key_path is required",
            ));
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.validate().is_ok()
    }

    /// 规范化：迁移旧平铺格式、补默认端口、修正活跃记录指针
    pub fn normalize(&mut self) {
        if self.records.is_empty() {
            let mut record = RemoteRecord {
                id: new_record_id(),
                ssh_host: self.ssh_host.clone(),
                ssh_port: self.ssh_port,
                ssh_user: self.ssh_user.clone(),
                ssh_key_path: self.ssh_key_path.clone(),
                proxy_port: self.proxy_port,
                remote_port: self.remote_port,
                http_proxy: self.http_proxy.clone(),
                https_proxy: self.https_proxy.clone(),
                ..Default::default()
            };
            record.apply_defaults();
            self.records.push(record);
        }

        for record in &mut self.records {
            record.apply_defaults();
            if record.id.is_empty() {
                record.id = new_record_id();
            }
        }

        let active_valid = self.records.iter().any(|r| r.id == self.active_id);
        if self.active_id.is_empty() || !active_valid {
            self.active_id = self.records[0].id.clone();
        }

        if self.log_level.is_empty() {
            self.log_level = "INFO".to_string();
        }
    }

    /// 用活跃记录覆盖顶层平铺字段
    pub fn sync_from_active(&mut self) {
        let Some(record) = self.active_record().cloned() else {
            return;
        };
        self.ssh_host = record.ssh_host;
        self.ssh_port = record.ssh_port;
        self.ssh_user = record.ssh_user;
        self.ssh_key_path = record.ssh_key_path;
        self.proxy_port = record.proxy_port;
        self.remote_port = record.remote_port;
        self.http_proxy = record.http_proxy;
        self.https_proxy = record.https_proxy;
        if let Some(level) = record.log_level {
            self.log_level = level;
        }
        if self.log_level.is_empty() {
            self.log_level = "INFO".to_string();
        }
    }

    /// 获取活跃记录
    pub fn active_record(&self) -> Option<&RemoteRecord> {
        self.records.iter().find(|r| r.id == self.active_id)
    }

    /// 全部记录快照
    pub fn records(&self) -> &[RemoteRecord] {
        &self.records
    }

    /// 新增或更新一条记录（按 id 匹配；id 为空时生成）
    pub fn save_record(&mut self, mut record: RemoteRecord) -> String {
        record.apply_defaults();
        if record.id.is_empty() {
            record.id = new_record_id();
        }
        let id = record.id.clone();
        match self.records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
        if self.active_id == id {
            self.sync_from_active();
        }
        id
    }

    /// 删除一条记录；删除活跃记录时活跃指针退回第一条
    pub fn delete_record(&mut self, id: &str) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.id != id);
        let removed = self.records.len() != before;
        if removed {
            self.normalize();
            self.sync_from_active();
        }
        removed
    }

    /// 切换活跃记录
    pub fn set_active_record(&mut self, id: &str) -> bool {
        if self.records.iter().any(|r| r.id == id) {
            self.active_id = id.to_string();
            self.sync_from_active();
            true
        } else {
            false
        }
    }
}

fn new_record_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// 获取配置文件路径（不存在时创建父目录）
pub fn config_path() -> Result<PathBuf, ConfigError> {
    let dir = dirs::config_dir()
        .ok_or(ConfigError::NoConfigDir)?
        .join("portbridge");
    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(ConfigError::Write)?;
    }
    Ok(dir.join("config.json"))
}

/// 从默认路径加载配置，文件不存在时返回默认配置
pub fn load_or_default() -> Result<Config, ConfigError> {
    load_from(&config_path()?)
}

/// 从指定路径加载配置
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Ok(Config::default_config());
    }
    let content = fs::read_to_string(path).map_err(ConfigError::Read)?;
    let mut config: Config = serde_json::from_str(&content)?;
    config.normalize();
    config.sync_from_active();
    Ok(config)
}

/// 保存配置到默认路径（密码字段不落盘）
pub fn save(config: &Config) -> Result<(), ConfigError> {
    save_to(config, &config_path()?)
}

/// 保存配置到指定路径
pub fn save_to(config: &Config, path: &Path) -> Result<(), ConfigError> {
    let mut to_save = config.clone();
    to_save.normalize();
    let content = serde_json::to_string_pretty(&to_save)?;
    fs::write(path, content).map_err(ConfigError::Write)?;
    tracing::debug!("config saved to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config_path() -> PathBuf {
        std::env::temp_dir().join(format!("portbridge-test-{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_defaults_applied_on_fresh_config() {
        let config = Config::default_config();
        assert_eq!(config.ssh_port, DEFAULT_SSH_PORT);
        assert_eq!(config.proxy_port, DEFAULT_PROXY_PORT);
        assert_eq!(config.remote_port, DEFAULT_PROXY_PORT);
        assert!(!config.active_id.is_empty());
    }

    #[test]
    fn test_defaults_applied_on_loaded_config() {
        let path = temp_config_path();
        fs::write(
            &path,
            r#"{"ssh_host":"example.com","ssh_user":"alice","ssh_port":0,"proxy_port":0,"remote_port":0}"#,
        )
        .unwrap();

        let config = load_from(&path).unwrap();
        assert_eq!(config.ssh_host, "example.com");
        assert_eq!(config.ssh_port, 22);
        assert_eq!(config.proxy_port, 8080);
        assert_eq!(config.remote_port, 8080);
        assert_eq!(config.log_level, "INFO");
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_validate_requires_auth_material() {
        let mut config = Config::default_config();
        config.ssh_host = "example.com".into();
        config.ssh_user = "alice".into();
        assert!(!config.is_complete());

        config.ssh_password = "secret".into();
        assert!(config.is_complete());

        config.ssh_password.clear();
        config.ssh_key_path = Some("/home/alice/.ssh/id_ed25519".into());
        assert!(config.is_complete());
    }

    #[test]
    fn test_password_never_persisted() {
        let path = temp_config_path();
        let mut config = Config::default_config();
        config.ssh_host = "example.com".into();
        config.ssh_user = "alice".into();
        config.ssh_password = "secret".into();
        config.ssh_key_passphrase = "phrase".into();
        save_to(&config, &path).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("secret"));
        assert!(!raw.contains("phrase"));

        let loaded = load_from(&path).unwrap();
        assert!(loaded.ssh_password.is_empty());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_record_crud_and_active_pointer() {
        let mut config = Config::default_config();
        let second = RemoteRecord {
            name: Some("work".into()),
            ssh_host: "work.example.com".into(),
            ssh_user: "bob".into(),
            ..Default::default()
        };
        let id = config.save_record(second);
        assert_eq!(config.records().len(), 2);

        assert!(config.set_active_record(&id));
        assert_eq!(config.ssh_host, "work.example.com");
        assert_eq!(config.ssh_port, DEFAULT_SSH_PORT);

        assert!(config.delete_record(&id));
        // 活跃指针退回剩余的第一条
        assert_eq!(config.active_id, config.records()[0].id);
        assert!(!config.set_active_record("missing"));
    }

    #[test]
    fn test_legacy_flat_config_migrates_to_record() {
        let path = temp_config_path();
        fs::write(
            &path,
            r#"{"ssh_host":"old.example.com","ssh_user":"carol","ssh_port":2222,"proxy_port":3128,"remote_port":9000}"#,
        )
        .unwrap();

        let config = load_from(&path).unwrap();
        assert_eq!(config.records().len(), 1);
        let record = config.active_record().unwrap();
        assert_eq!(record.ssh_host, "old.example.com");
        assert_eq!(record.ssh_port, 2222);
        assert_eq!(record.proxy_port, 3128);
        fs::remove_file(&path).unwrap();
    }
}
