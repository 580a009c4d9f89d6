//! airdesk 信令服务器
//!
//! 独立运行的信令中继，在被控端和控制端之间转发 SDP 和 ICE 候选
//!
//! # 运行方式
//!
//! ```bash
//! airdesk-signaling --port 8080
//! ```

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use airdesk::signaling::SignalingRelay;

/// airdesk 信令服务器
#[derive(Parser, Debug)]
#[command(name = "airdesk-signaling")]
#[command(about = "airdesk 信令中继服务器")]
#[command(version)]
struct Args {
    /// 监听主机地址
    #[arg(long, default_value = "0.0.0.0", env = "SIGNALING_HOST")]
    host: String,

    /// 监听端口
    #[arg(short, long, default_value = "8080", env = "SIGNALING_PORT")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut relay = SignalingRelay::new(format!("{}:{}", args.host, args.port));
    let port = relay.start().await?;

    tracing::info!("信令服务器已启动: ws://{}:{}", args.host, port);
    println!("信令服务器监听 ws://{}:{}，按 Ctrl+C 退出", args.host, port);

    tokio::signal::ctrl_c().await?;
    tracing::info!("收到退出信号，正在关闭...");
    relay.stop();
    Ok(())
}
