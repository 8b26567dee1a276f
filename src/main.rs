use anyhow::Result;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wsproxy_ng::config::{Config, ServerConfig};
use wsproxy_ng::server;

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());

    // 加载配置
    let config = Config::load(&path)?;

    // 初始化日志系统，guard 需要活到进程结束
    let _guard = init_logging(&config.server);

    info!("Starting wsproxy-ng...");
    info!("Configuration loaded from {}", path);

    if let Err(e) = server::run(config).await {
        error!("Server failed: {:#}", e);
        return Err(e);
    }

    Ok(())
}

/// 初始化日志系统
fn init_logging(server: &ServerConfig) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&server.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let registry = tracing_subscriber::registry().with(env_filter);

    if server.log_format == "json" {
        registry
            .with(fmt::layer().json().with_writer(writer).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_target(false)
                    .with_thread_ids(true),
            )
            .init();
    }

    guard
}
