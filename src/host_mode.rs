//! 被控端模式
//!
//! 注册到信令服务器，等待控制端的 Offer。每个会话建立后启动推流和输入注入，
//! 新的 Offer 会替换当前会话。

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use airdesk::capture::{self, Capturer, SyntheticCapturer};
use airdesk::config::Config;
use airdesk::input::{self, InputInjector, LoggingInjector};
use airdesk::pipeline::HostPipeline;
use airdesk::session::{Negotiator, Role};
use airdesk::signaling::{ClientType, SignalingClient};
use airdesk::webrtc;

/// 合成画面尺寸
const SYNTHETIC_SIZE: (u32, u32) = (1280, 720);

pub async fn run_host_mode(config: Config, synthetic: bool) -> Result<()> {
    info!("airdesk 被控端模式启动...");

    let factory = webrtc::default_engine_factory()?;
    let device_id = config.signaling.device_id_for(ClientType::Host);

    let client = SignalingClient::new(
        config.signaling.url.clone(),
        device_id.clone(),
        ClientType::Host,
        config.signaling.heartbeat(),
    );
    let events = client.take_events().context("无法获取信令事件接收器")?;
    client
        .connect()
        .await
        .with_context(|| format!("连接信令服务器失败: {}", config.signaling.url))?;
    let client = Arc::new(client);

    let display_index = config.capture.display_index;
    let pipeline = HostPipeline::new(
        move || -> Result<Box<dyn Capturer>> {
            if synthetic {
                Ok(Box::new(SyntheticCapturer::new(SYNTHETIC_SIZE.0, SYNTHETIC_SIZE.1)))
            } else {
                capture::create_capturer(display_index)
            }
        },
        move || -> Result<Box<dyn InputInjector>> {
            if synthetic {
                Ok(Box::new(LoggingInjector::new()))
            } else {
                input::create_injector()
            }
        },
        config.capture.quality,
        config.capture.fps,
    );

    let negotiator = Negotiator::new(Role::Host, config.webrtc.clone(), factory, client.clone())
        .with_attach(Arc::new(pipeline));

    let mut state = negotiator.state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow();
            info!("会话状态: {}", current);
        }
    });

    println!();
    println!("========================================");
    println!("  airdesk 被控端已启动");
    println!("========================================");
    println!();
    println!("  设备 ID: {}", device_id);
    println!("  信令:    {}", config.signaling.url);
    println!("  画面:    {} fps, 质量 {}", config.capture.fps, config.capture.quality);
    println!();
    println!("控制端连接:");
    println!("  airdesk connect --signaling {} --host {}", config.signaling.url, device_id);
    println!();
    println!("按 Ctrl+C 退出");

    let cancel = CancellationToken::new();
    let mut run = tokio::spawn(negotiator.run(events, cancel.clone()));

    let result = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("收到退出信号，正在关闭...");
            cancel.cancel();
            (&mut run).await
        }
        res = &mut run => res,
    };

    client.close().await;

    match result.context("协商任务异常退出")? {
        Ok(()) => {
            info!("被控端模式已退出");
            Ok(())
        }
        Err(e) => {
            error!("被控端退出: {}", e);
            Err(e.into())
        }
    }
}
