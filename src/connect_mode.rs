//! 控制端模式
//!
//! 网络协商在运行时上执行，显示循环占用主线程。

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use airdesk::config::Config;
use airdesk::decoder::JpegDecoder;
use airdesk::display::{console, Display, HeadlessDisplay, LatestFrame};
use airdesk::pipeline::ControllerPipeline;
use airdesk::session::{NegotiationState, Negotiator, Role};
use airdesk::signaling::{ClientType, SignalingClient, SignalingEvent};
use airdesk::webrtc;

/// 等待主机列表的时间
const HOST_LIST_TIMEOUT: Duration = Duration::from_secs(5);

async fn connect_client(
    config: &Config,
) -> Result<(Arc<SignalingClient>, mpsc::UnboundedReceiver<SignalingEvent>)> {
    let client = SignalingClient::new(
        config.signaling.url.clone(),
        config.signaling.device_id_for(ClientType::Controller),
        ClientType::Controller,
        config.signaling.heartbeat(),
    );
    let events = client.take_events().context("无法获取信令事件接收器")?;
    client
        .connect()
        .await
        .with_context(|| format!("连接信令服务器失败: {}", config.signaling.url))?;
    Ok((Arc::new(client), events))
}

/// 连接被控端，直到会话结束或用户退出
pub fn run_connect_mode(runtime: &Runtime, config: Config, host: String) -> Result<()> {
    info!("airdesk 控制端模式启动，目标: {}", host);

    let factory = webrtc::default_engine_factory()?;
    let (client, events) = runtime.block_on(connect_client(&config))?;

    let sink = Arc::new(LatestFrame::new());
    let pipeline = Arc::new(ControllerPipeline::new(Arc::new(JpegDecoder::new()), sink.clone()));
    let input = pipeline.input();

    let negotiator = Negotiator::new(Role::Controller, config.webrtc.clone(), factory, client.clone())
        .with_target(host.clone())
        .with_attach(pipeline);
    let mut state = negotiator.state();

    let cancel = CancellationToken::new();

    let session = runtime.spawn({
        let cancel = cancel.clone();
        async move {
            let result = negotiator.run(events, cancel.clone()).await;
            // 会话结束时让显示循环退出
            cancel.cancel();
            result
        }
    });

    runtime.spawn({
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                res = tokio::signal::ctrl_c() => {
                    if res.is_ok() {
                        info!("收到退出信号，正在关闭...");
                    }
                    cancel.cancel();
                }
            }
        }
    });

    runtime.spawn({
        let cancel = cancel.clone();
        async move {
            while state.changed().await.is_ok() {
                let current = *state.borrow();
                match current {
                    NegotiationState::Connected => info!("已连接到 {}", host),
                    other => info!("会话状态: {}", other),
                }
            }
            cancel.cancel();
        }
    });

    println!("正在连接被控端，按 Ctrl+C 退出");
    println!("输入命令控制远端: move X Y | click X Y [right] | scroll DX DY | key NAME [cmd shift ...]");
    HeadlessDisplay::new(sink)
        .with_input_source(console::spawn_stdin_input())
        .run(input, cancel.clone())?;

    let result = runtime.block_on(session).context("协商任务异常退出")?;
    runtime.block_on(client.close());
    result?;
    info!("控制端模式已退出");
    Ok(())
}

/// 列出在线的被控端
pub async fn list_hosts(config: Config) -> Result<()> {
    let (client, mut events) = connect_client(&config).await?;
    client.request_host_list().await?;

    let hosts = tokio::time::timeout(HOST_LIST_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            match event {
                SignalingEvent::HostList(hosts) => return Some(hosts),
                SignalingEvent::Error(message) => warn!("信令错误: {}", message),
                _ => {}
            }
        }
        None
    })
    .await;
    client.close().await;

    let hosts = match hosts {
        Ok(Some(hosts)) => hosts,
        Ok(None) => anyhow::bail!("信令连接已断开"),
        Err(_) => anyhow::bail!("等待主机列表超时"),
    };

    if hosts.is_empty() {
        println!("没有在线的被控端");
    } else {
        println!("在线被控端:");
        for host in hosts.iter().filter(|h| h.online) {
            println!("  {}", host.id);
        }
    }
    Ok(())
}
