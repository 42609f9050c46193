//! OpenTherm Gateway → MQTT 网桥入口。

mod bridge;

use bridge::GatewayBridge;
use otgw_config::BridgeConfig;
use otgw_telemetry::{init_tracing, install_panic_hook};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    // 默认值 → appsettings.json → OTGW_* 环境变量
    let config = BridgeConfig::load()?;
    // 初始化结构化日志
    init_tracing();
    // 未处理的 panic 也进入日志
    install_panic_hook();
    info!(
        target: "otgw.bridge",
        version = env!("CARGO_PKG_VERSION"),
        "OpenTherm Gateway to MQTT bridge starting"
    );

    let mut bridge = GatewayBridge::new(config);
    bridge.start().await;

    shutdown_signal().await?;
    info!(target: "otgw.bridge", "shutdown signal received");
    bridge.stop().await;
    Ok(())
}

/// 等待 Ctrl-C（Unix 下同时等待 SIGTERM）
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
