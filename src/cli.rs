//! airdesk 命令行参数定义

use clap::{ArgAction, Args as ClapArgs, Parser, Subcommand};

/// airdesk - 点对点远程桌面
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// 配置文件路径
    #[arg(short, long, global = true, env = "AIRDESK_CONFIG")]
    pub config: Option<String>,

    /// 日志详细程度，可重复 (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

/// 两种模式共用的连接参数
#[derive(ClapArgs, Debug, Default)]
pub struct ConnectionArgs {
    /// 信令服务器地址 (如 ws://relay.example.com:8080)
    #[arg(short, long, env = "AIRDESK_SIGNALING")]
    pub signaling: Option<String>,

    /// 本机设备 ID (默认自动生成)
    #[arg(long, env = "AIRDESK_ID")]
    pub id: Option<String>,
}

/// 子命令
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 被控端模式 - 注册到信令服务器并等待控制端
    Host {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// 目标帧率
        #[arg(short, long)]
        fps: Option<u32>,

        /// 屏幕索引
        #[arg(short = 'i', long)]
        display: Option<u32>,

        /// JPEG 质量 (1-100)
        #[arg(short, long, value_parser = clap::value_parser!(u8).range(1..=100))]
        quality: Option<u8>,

        /// 使用合成画面代替真实屏幕，输入只记录日志
        #[arg(long)]
        synthetic: bool,
    },

    /// 控制端模式 - 连接指定被控端
    Connect {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// 被控端设备 ID
        #[arg(long)]
        host: Option<String>,

        /// 只列出在线被控端
        #[arg(long, conflicts_with = "host")]
        list: bool,
    },

    /// 生成配置文件
    Config {
        /// 配置文件路径
        #[arg(short, long)]
        path: Option<String>,

        /// 覆盖已存在的文件
        #[arg(long)]
        force: bool,
    },
}
