//! 配置管理模块
//!
//! 负责加载和管理应用程序配置

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::signaling::ClientType;
use crate::webrtc::WebRTCConfig;

/// 配置文件名
pub const CONFIG_FILE_NAME: &str = "airdesk.toml";

/// 应用程序配置
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// ICE 服务器，每个会话显式传入
    #[serde(default)]
    pub webrtc: WebRTCConfig,
}

/// 信令配置
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SignalingConfig {
    /// 信令服务器地址
    #[serde(default = "default_signaling_url")]
    pub url: String,
    /// 设备 ID (为空时按角色自动生成)
    #[serde(default)]
    pub device_id: Option<String>,
    /// 心跳间隔（秒）
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

/// 屏幕捕获配置
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CaptureConfig {
    /// 目标帧率
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// 屏幕索引 (0 = 主显示器)
    #[serde(default)]
    pub display_index: u32,
    /// JPEG 质量 1-100
    #[serde(default = "default_quality")]
    pub quality: u8,
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 日志文件路径 (None = 仅控制台)
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        SignalingConfig {
            url: default_signaling_url(),
            device_id: None,
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            fps: default_fps(),
            display_index: 0,
            quality: default_quality(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_signaling_url() -> String {
    "ws://localhost:8080".to_string()
}

fn default_heartbeat_secs() -> u64 {
    25
}

fn default_fps() -> u32 {
    30
}

fn default_quality() -> u8 {
    crate::encoder::DEFAULT_QUALITY
}

fn default_log_level() -> String {
    "info".to_string()
}

/// 生成设备 ID，形如 `host-1a2b3c4d`
pub fn generate_device_id(client_type: ClientType) -> String {
    let bytes: [u8; 4] = rand::random();
    let prefix = match client_type {
        ClientType::Host => "host",
        ClientType::Controller => "controller",
    };
    format!("{}-{}", prefix, hex::encode(bytes))
}

impl SignalingConfig {
    /// 配置的设备 ID，未配置时生成一个
    pub fn device_id_for(&self, client_type: ClientType) -> String {
        match &self.device_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => generate_device_id(client_type),
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

impl Config {
    /// 从文件加载配置
    ///
    /// 文件不存在时返回默认配置
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::warn!("配置文件不存在: {:?}, 使用默认配置", path);
            return Ok(Config::default());
        }

        let content =
            fs::read_to_string(path).with_context(|| format!("读取配置文件失败: {:?}", path))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("配置文件解析失败: {}", e))?;

        tracing::info!("配置加载成功: {:?}", path);
        Ok(config)
    }

    /// 保存配置到文件
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("写入配置文件失败: {:?}", path))?;
        Ok(())
    }

    /// 获取配置文件路径
    ///
    /// 优先级: 命令行指定 > 当前目录 > 用户主目录
    pub fn get_config_path(cli_path: Option<&str>) -> String {
        if let Some(p) = cli_path {
            return p.to_string();
        }

        if Path::new(CONFIG_FILE_NAME).exists() {
            return CONFIG_FILE_NAME.to_string();
        }

        if let Ok(home) = std::env::var("HOME") {
            let config_path = format!("{}/.config/airdesk/{}", home, CONFIG_FILE_NAME);
            if Path::new(&config_path).exists() {
                return config_path;
            }
        }

        CONFIG_FILE_NAME.to_string()
    }
}
