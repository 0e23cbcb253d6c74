// PortBridge 命令行入口
//
// 加载配置、拉起会话，Ctrl+C 退出

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};

use portbridge::event::LogLevel;
use portbridge::{config, App};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志系统
    // 可以通过 RUST_LOG 环境变量控制日志级别，例如：RUST_LOG=debug cargo run
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .init();

    let cfg = config::load_or_default().context("failed to load config")?;
    if !cfg.is_complete() {
        let path = config::config_path()?;
        config::save(&cfg).ok();
        anyhow::bail!(
            "config is incomplete, fill in ssh_host / ssh_user and auth material in {}",
            path.display()
        );
    }

    let app = Arc::new(App::new());
    app.set_log_callback(Arc::new(|level: LogLevel, line: &str| {
        println!("{:5} {}", level.as_str(), line);
    }));
    // 无静态密码时从终端补询
    app.set_password_prompt(Arc::new(|| {
        print!("SSH password: ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        line.trim_end().to_string()
    }));

    app.start(&cfg).await?;

    tokio::signal::ctrl_c().await?;
    app.stop();
    Ok(())
}
