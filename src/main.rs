//! # API Relay 主程序
//!
//! 单端口同时提供 Claude 兼容网关与管理端接口

use api_relay::{
    AppState, Result,
    config::ConfigManager,
    error::Context,
    lerror, linfo,
    logging::{self, LogComponent, LogStage},
    management::admin_router,
    proxy::gateway_router,
    store::{AccountStore, MemoryStore},
    usage::{MemoryUsageRecorder, UsageRecorder},
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// 命令行参数
#[derive(Debug, Parser)]
#[command(name = "api-relay", version, about = "Claude-compatible account pool gateway")]
struct Args {
    /// 配置文件路径，默认读取 `API_RELAY_CONFIG_PATH` 或 `config/config.<RUST_ENV>.toml`
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 日志级别
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_optimized_logging(args.log_level.as_ref());

    if let Err(e) = run(args).await {
        lerror!(
            "system",
            LogStage::Startup,
            LogComponent::Main,
            "service_start_failed",
            "服务启动失败",
            error = %e
        );
        std::process::exit(1);
    }

    linfo!(
        "system",
        LogStage::Shutdown,
        LogComponent::Main,
        "service_shutdown",
        "服务正常关闭"
    );
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let config_manager = match args.config {
        Some(path) => ConfigManager::from_file(path)?,
        None => ConfigManager::new()?,
    };
    let config = config_manager.get_config().await;

    let store: Arc<dyn AccountStore> = Arc::new(MemoryStore::from_seed(config.seed.clone()));
    let usage: Arc<dyn UsageRecorder> = Arc::new(MemoryUsageRecorder::new());
    let state = AppState::build(config_manager, store, usage).await?;

    let app = gateway_router(state.clone(), config.server.request_body_limit)
        .merge(admin_router(state.clone()))
        .layer(TraceLayer::new_for_http());

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("无法监听 {addr}"))?;
    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Main,
        "service_started",
        "网关已启动",
        addr = %addr,
        admin_enabled = config.server.admin_token.is_some()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.shutdown.clone()))
        .await
        .context("HTTP 服务异常退出")?;
    Ok(())
}

/// 等待 Ctrl-C，随后取消所有进行中的流式中继
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        lerror!(
            "system",
            LogStage::Shutdown,
            LogComponent::Main,
            "signal_failed",
            "无法监听退出信号",
            error = %e
        );
        std::future::pending::<()>().await;
    }
    linfo!(
        "system",
        LogStage::Shutdown,
        LogComponent::Main,
        "shutdown_requested",
        "收到退出信号，开始优雅关闭"
    );
    shutdown.cancel();
}
