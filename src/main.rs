//! airdesk - 点对点远程桌面
//!
//! 主入口程序

mod cli;
mod connect_mode;
mod host_mode;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

use airdesk::config::{Config, LoggingConfig};
use cli::{Args, Commands, ConnectionArgs};

fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = Config::get_config_path(args.config.as_deref());

    if let Commands::Config { path, force } = &args.command {
        init_logging(args.verbose, &LoggingConfig::default())?;
        let path = path.clone().unwrap_or(config_path);
        return generate_config(&path, *force);
    }

    let mut config = Config::load(&config_path)?;
    init_logging(args.verbose, &config.logging)?;

    // 控制端的显示循环必须留在主线程，网络任务全部交给运行时
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("创建 tokio 运行时失败")?;

    match args.command {
        Commands::Host {
            connection,
            fps,
            display,
            quality,
            synthetic,
        } => {
            apply_connection_args(&mut config, connection);
            if let Some(fps) = fps {
                config.capture.fps = fps;
            }
            if let Some(display) = display {
                config.capture.display_index = display;
            }
            if let Some(quality) = quality {
                config.capture.quality = quality;
            }
            runtime.block_on(host_mode::run_host_mode(config, synthetic))
        }
        Commands::Connect {
            connection,
            host,
            list,
        } => {
            apply_connection_args(&mut config, connection);
            match host {
                Some(host) if !list => connect_mode::run_connect_mode(&runtime, config, host),
                _ => runtime.block_on(connect_mode::list_hosts(config)),
            }
        }
        Commands::Config { .. } => Ok(()),
    }
}

/// 命令行参数覆盖配置
fn apply_connection_args(config: &mut Config, connection: ConnectionArgs) {
    if let Some(url) = connection.signaling {
        config.signaling.url = url;
    }
    if let Some(id) = connection.id {
        config.signaling.device_id = Some(id);
    }
}

/// 初始化日志
///
/// `-v` 次数优先于配置文件，`RUST_LOG` 优先于两者
fn init_logging(verbose: u8, logging: &LoggingConfig) -> Result<()> {
    let level = match verbose {
        0 => logging.level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true);

    match &logging.file {
        Some(file) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .with_context(|| format!("无法打开日志文件: {}", file))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

/// 生成配置文件
fn generate_config(path: &str, force: bool) -> Result<()> {
    if Path::new(path).exists() && !force {
        anyhow::bail!("配置文件已存在: {} (使用 --force 覆盖)", path);
    }
    Config::default().save(path)?;
    println!("配置文件已生成: {}", path);
    Ok(())
}
