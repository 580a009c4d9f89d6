//! 标准输入控制台
//!
//! 无界面显示没有窗口事件，本地输入用文本命令描述，每行一条:
//!
//! ```text
//! move X Y
//! click X Y [left|right|middle]
//! down X Y [button] / up X Y [button]
//! scroll DX DY
//! key NAME [shift] [ctrl] [alt] [meta]
//! ```
//!
//! 坐标是虚拟视图中的坐标。

use std::io::BufRead;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::mpsc;

use super::ViewInput;
use crate::input::{Key, Modifiers, MouseButton};

fn parse_f64(token: Option<&str>, what: &str) -> Result<f64> {
    let token = token.ok_or_else(|| anyhow!("缺少{}", what))?;
    token
        .parse::<f64>()
        .with_context(|| format!("无效的{}: {}", what, token))
}

fn parse_button(token: Option<&str>) -> Result<MouseButton> {
    match token.map(str::to_ascii_lowercase).as_deref() {
        None | Some("left") => Ok(MouseButton::Left),
        Some("right") => Ok(MouseButton::Right),
        Some("middle") => Ok(MouseButton::Middle),
        Some(other) => bail!("未知的鼠标按钮: {}", other),
    }
}

fn parse_modifier(token: &str) -> Result<Modifiers> {
    match token.to_ascii_lowercase().as_str() {
        "shift" => Ok(Modifiers::SHIFT),
        "ctrl" | "control" => Ok(Modifiers::CTRL),
        "alt" | "option" => Ok(Modifiers::ALT),
        "meta" | "cmd" | "command" => Ok(Modifiers::META),
        other => bail!("未知的修饰键: {}", other),
    }
}

/// 解析一行命令，空行返回空列表
pub fn parse_line(line: &str) -> Result<Vec<ViewInput>> {
    let mut tokens = line.split_whitespace();
    let Some(command) = tokens.next() else {
        return Ok(Vec::new());
    };

    let inputs = match command.to_ascii_lowercase().as_str() {
        "move" => {
            let x = parse_f64(tokens.next(), "横坐标")?;
            let y = parse_f64(tokens.next(), "纵坐标")?;
            vec![ViewInput::PointerMove { x, y }]
        }
        cmd @ ("click" | "down" | "up") => {
            let x = parse_f64(tokens.next(), "横坐标")?;
            let y = parse_f64(tokens.next(), "纵坐标")?;
            let button = parse_button(tokens.next())?;
            let press = ViewInput::PointerButton { x, y, button, pressed: true };
            let release = ViewInput::PointerButton { x, y, button, pressed: false };
            match cmd {
                "down" => vec![press],
                "up" => vec![release],
                _ => vec![ViewInput::PointerMove { x, y }, press, release],
            }
        }
        "scroll" => {
            let dx = parse_f64(tokens.next(), "横向滚动量")?;
            let dy = parse_f64(tokens.next(), "纵向滚动量")?;
            vec![ViewInput::Scroll { dx, dy }]
        }
        "key" => {
            let name = tokens.next().ok_or_else(|| anyhow!("缺少按键名"))?;
            let key = Key::from_name(name);
            if key == Key::Other {
                bail!("未知按键: {}", name);
            }
            let mut modifiers = Modifiers::NONE;
            for token in tokens.by_ref() {
                modifiers |= parse_modifier(token)?;
            }
            vec![
                ViewInput::Key { key, modifiers, pressed: true },
                ViewInput::Key { key, modifiers, pressed: false },
            ]
        }
        other => bail!("未知命令: {}", other),
    };

    if let Some(extra) = tokens.next() {
        bail!("多余的参数: {}", extra);
    }
    Ok(inputs)
}

/// 在后台线程读取标准输入，解析后的输入写入返回的通道
///
/// 读取线程在标准输入结束或接收端关闭后退出
pub fn spawn_stdin_input() -> mpsc::UnboundedReceiver<ViewInput> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!("读取标准输入失败: {}", e);
                    break;
                }
            };
            match parse_line(&line) {
                Ok(inputs) => {
                    for input in inputs {
                        if tx.send(input).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => tracing::warn!("{:#}", e),
            }
        }
        tracing::debug!("标准输入已结束");
    });
    rx
}
