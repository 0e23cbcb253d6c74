// SSH 认证方式构建与按序尝试
//
// 认证候选按固定优先级排列：agent -> 指定私钥 -> 默认私钥 -> 密码 -> 交互式，
// 拨号后按序尝试，首个成功即停止

use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::client::{AuthResult, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::agent::client::AgentClient;
use tokio::sync::mpsc;

use crate::event::{CoreEvent, LogEntry};

use super::config::TunnelConfig;
use super::error::TunnelError;
use super::handler::ForwardHandler;

/// 认证候选
pub enum AuthCandidate {
    /// 本机 SSH agent（逐个尝试 agent 中的身份）
    Agent { socket: String },
    /// 私钥文件（构建阶段已解析成功）
    Key {
        path: PathBuf,
        key: Arc<russh::keys::PrivateKey>,
    },
    /// 静态密码
    Password(String),
    /// keyboard-interactive，用密码或补询回调应答
    Interactive,
}

impl AuthCandidate {
    pub fn label(&self) -> String {
        match self {
            Self::Agent { .. } => "ssh-agent".to_string(),
            Self::Key { path, .. } => format!("key {}", path.display()),
            Self::Password(_) => "password".to_string(),
            Self::Interactive => "keyboard-interactive".to_string(),
        }
    }
}

fn emit(events: &mpsc::UnboundedSender<CoreEvent>, entry: LogEntry) {
    let _ = events.send(CoreEvent::Log(entry));
}

/// 用户 SSH 目录下的常见私钥路径
fn default_key_paths(ssh_dir: &Path) -> Vec<PathBuf> {
    ["id_rsa", "id_ed25519", "id_ecdsa", "id_dsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .collect()
}

/// 加载并解析私钥，先试无口令，失败再用配置口令重试
fn load_key(path: &Path, passphrase: Option<&str>) -> Result<russh::keys::PrivateKey, TunnelError> {
    match russh::keys::load_secret_key(path, None) {
        Ok(key) => Ok(key),
        Err(first_err) => match passphrase {
            Some(pass) => russh::keys::load_secret_key(path, Some(pass))
                .map_err(|e| TunnelError::Key(format!("failed to decode key: {}", e))),
            None => Err(TunnelError::Key(format!(
                "failed to decode key (no passphrase): {}",
                first_err
            ))),
        },
    }
}

/// 认证材料的来源（agent socket、SSH 目录），可注入以便测试
pub struct AuthSources {
    pub agent_socket: Option<String>,
    pub ssh_dir: Option<PathBuf>,
}

impl AuthSources {
    /// 从运行环境取：SSH_AUTH_SOCK 环境变量 + ~/.ssh
    pub fn from_env() -> Self {
        Self {
            agent_socket: std::env::var("SSH_AUTH_SOCK").ok().filter(|s| !s.is_empty()),
            ssh_dir: dirs::home_dir().map(|home| home.join(".ssh")),
        }
    }

    /// 无环境来源，只剩配置里显式给出的认证材料
    pub fn empty() -> Self {
        Self {
            agent_socket: None,
            ssh_dir: None,
        }
    }

    /// 构建认证候选列表
    pub fn candidates(
        &self,
        config: &TunnelConfig,
        events: &mpsc::UnboundedSender<CoreEvent>,
    ) -> Vec<AuthCandidate> {
        candidates_from(
            config,
            self.agent_socket.as_deref(),
            self.ssh_dir.as_deref(),
            events,
        )
    }
}

/// 构建候选的内层实现，agent socket 与 SSH 目录可注入（便于测试）
pub fn candidates_from(
    config: &TunnelConfig,
    agent_socket: Option<&str>,
    ssh_dir: Option<&Path>,
    events: &mpsc::UnboundedSender<CoreEvent>,
) -> Vec<AuthCandidate> {
    let mut candidates = Vec::new();

    // 1. SSH agent（可达性在认证时再确认）
    if let Some(socket) = agent_socket {
        candidates.push(AuthCandidate::Agent {
            socket: socket.to_string(),
        });
    }

    // 2. 指定的私钥路径
    if let Some(path) = &config.key_path {
        match load_key(path, config.key_passphrase.as_deref()) {
            Ok(key) => {
                emit(events, LogEntry::info(format!("Loaded key from {}", path.display())));
                candidates.push(AuthCandidate::Key {
                    path: path.clone(),
                    key: Arc::new(key),
                });
            }
            Err(e) => {
                emit(
                    events,
                    LogEntry::warn(format!("Could not load key {}: {}", path.display(), e)),
                );
            }
        }
    }

    // 3. 默认私钥路径
    if let Some(ssh_dir) = ssh_dir {
        for path in default_key_paths(ssh_dir) {
            if Some(&path) == config.key_path.as_ref() {
                continue;
            }
            if !path.exists() {
                continue;
            }
            if let Ok(key) = load_key(&path, config.key_passphrase.as_deref()) {
                emit(events, LogEntry::info(format!("Found key at {}", path.display())));
                candidates.push(AuthCandidate::Key {
                    path,
                    key: Arc::new(key),
                });
            }
        }
    }

    // 4. 静态密码
    if let Some(password) = &config.password {
        candidates.push(AuthCandidate::Password(password.clone()));
    }

    // 5. 交互式（只有在能给出应答时才有意义）
    if config.password.is_some() || config.password_prompt.is_some() {
        candidates.push(AuthCandidate::Interactive);
    }

    candidates
}

/// 按序尝试候选，首个握手成功即返回
pub async fn authenticate(
    handle: &mut Handle<ForwardHandler>,
    config: &TunnelConfig,
    candidates: Vec<AuthCandidate>,
    events: &mpsc::UnboundedSender<CoreEvent>,
) -> Result<(), TunnelError> {
    let mut last_failure = String::new();

    for candidate in candidates {
        let label = candidate.label();
        emit(events, LogEntry::debug(format!("Trying {} authentication", label)));

        let result = match candidate {
            AuthCandidate::Agent { socket } => try_agent(handle, config, &socket).await,
            AuthCandidate::Key { key, .. } => try_key(handle, config, key).await,
            AuthCandidate::Password(password) => try_password(handle, config, &password).await,
            AuthCandidate::Interactive => try_interactive(handle, config, events).await,
        };

        match result {
            Ok(true) => {
                emit(events, LogEntry::info(format!("Authenticated via {}", label)));
                return Ok(());
            }
            Ok(false) => {
                last_failure = format!("{} rejected", label);
            }
            Err(e) => {
                emit(events, LogEntry::debug(format!("{} failed: {}", label, e)));
                last_failure = e.to_string();
            }
        }
    }

    Err(TunnelError::Auth(if last_failure.is_empty() {
        "all methods rejected".to_string()
    } else {
        last_failure
    }))
}

async fn try_agent(
    handle: &mut Handle<ForwardHandler>,
    config: &TunnelConfig,
    socket: &str,
) -> Result<bool, TunnelError> {
    // 用候选构建时确定的 socket 路径连接，而不是再读一次环境
    let mut agent = AgentClient::connect_uds(socket)
        .await
        .map_err(|e| TunnelError::Auth(format!("could not connect to SSH agent: {}", e)))?;

    let identities = agent
        .request_identities()
        .await
        .map_err(|e| TunnelError::Auth(format!("could not list agent keys: {}", e)))?;

    if identities.is_empty() {
        return Err(TunnelError::Auth("SSH agent has no keys".to_string()));
    }

    let hash_alg = handle
        .best_supported_rsa_hash()
        .await
        .map_err(TunnelError::from)?
        .flatten();

    for key in identities {
        let result = handle
            .authenticate_publickey_with(&config.username, key, hash_alg, &mut agent)
            .await
            .map_err(TunnelError::from)?;
        if matches!(result, AuthResult::Success) {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn try_key(
    handle: &mut Handle<ForwardHandler>,
    config: &TunnelConfig,
    key: Arc<russh::keys::PrivateKey>,
) -> Result<bool, TunnelError> {
    let hash_alg = handle
        .best_supported_rsa_hash()
        .await
        .map_err(TunnelError::from)?
        .flatten();

    let key_with_alg = russh::keys::PrivateKeyWithHashAlg::new(key, hash_alg);
    let result = handle
        .authenticate_publickey(&config.username, key_with_alg)
        .await
        .map_err(TunnelError::from)?;

    Ok(matches!(result, AuthResult::Success))
}

async fn try_password(
    handle: &mut Handle<ForwardHandler>,
    config: &TunnelConfig,
    password: &str,
) -> Result<bool, TunnelError> {
    let result = handle
        .authenticate_password(&config.username, password)
        .await
        .map_err(TunnelError::from)?;

    match result {
        AuthResult::Success => Ok(true),
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } => {
            if partial_success {
                return Err(TunnelError::Auth(
                    "partial authentication - additional auth required".to_string(),
                ));
            }
            tracing::debug!(
                "password authentication failed, server suggests: {:?}",
                remaining_methods
            );
            Ok(false)
        }
    }
}

async fn try_interactive(
    handle: &mut Handle<ForwardHandler>,
    config: &TunnelConfig,
    events: &mpsc::UnboundedSender<CoreEvent>,
) -> Result<bool, TunnelError> {
    let mut response = handle
        .authenticate_keyboard_interactive_start(&config.username, None)
        .await
        .map_err(TunnelError::from)?;

    loop {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                let mut answers = Vec::with_capacity(prompts.len());
                for _ in &prompts {
                    if let Some(password) = &config.password {
                        answers.push(password.clone());
                    } else if let Some(prompt) = &config.password_prompt {
                        emit(
                            events,
                            LogEntry::info(format!(
                                "Password required for {}@{}",
                                config.username, config.host
                            )),
                        );
                        answers.push(prompt());
                    } else {
                        answers.push(String::new());
                    }
                }
                response = handle
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(TunnelError::from)?;
            }
        }
    }
}
