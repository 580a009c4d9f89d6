//! 输入事件模块
//!
//! 输入通道上每条消息是一个 JSON 编码的 [`InputEvent`]。坐标是远端屏幕的
//! 像素坐标，键码是 macOS 虚拟键码。

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod keymap;

pub use keymap::{Key, UNMAPPED_KEY_CODE};

/// 鼠标按钮，线上为数字 0/1/2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

impl TryFrom<u8> for MouseButton {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(MouseButton::Left),
            1 => Ok(MouseButton::Right),
            2 => Ok(MouseButton::Middle),
            other => Err(format!("未知的鼠标按钮: {}", other)),
        }
    }
}

impl From<MouseButton> for u8 {
    fn from(button: MouseButton) -> u8 {
        match button {
            MouseButton::Left => 0,
            MouseButton::Right => 1,
            MouseButton::Middle => 2,
        }
    }
}

/// 修饰键位掩码: bit0=Shift, bit1=Ctrl, bit2=Alt, bit3=Meta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Modifiers(pub u8);

impl Modifiers {
    pub const NONE: Modifiers = Modifiers(0);
    pub const SHIFT: Modifiers = Modifiers(1);
    pub const CTRL: Modifiers = Modifiers(2);
    pub const ALT: Modifiers = Modifiers(4);
    pub const META: Modifiers = Modifiers(8);

    pub fn contains(self, other: Modifiers) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// 转换为 CGEventFlags
    pub fn to_cg_flags(self) -> u64 {
        let mut flags = 0;
        if self.contains(Self::SHIFT) {
            flags |= 0x0002_0000;
        }
        if self.contains(Self::CTRL) {
            flags |= 0x0004_0000;
        }
        if self.contains(Self::ALT) {
            flags |= 0x0008_0000;
        }
        if self.contains(Self::META) {
            flags |= 0x0010_0000;
        }
        flags
    }
}

impl std::ops::BitOr for Modifiers {
    type Output = Modifiers;

    fn bitor(self, rhs: Modifiers) -> Modifiers {
        Modifiers(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Modifiers {
    fn bitor_assign(&mut self, rhs: Modifiers) {
        self.0 |= rhs.0;
    }
}

/// 输入事件
///
/// 对端省略值为零的字段，所以所有字段都有默认值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEvent {
    MouseMove {
        #[serde(default)]
        x: f64,
        #[serde(default)]
        y: f64,
    },
    MouseDown {
        #[serde(default)]
        x: f64,
        #[serde(default)]
        y: f64,
        #[serde(default)]
        button: MouseButton,
    },
    MouseUp {
        #[serde(default)]
        x: f64,
        #[serde(default)]
        y: f64,
        #[serde(default)]
        button: MouseButton,
    },
    MouseScroll {
        #[serde(rename = "scrollDX", default)]
        dx: f64,
        #[serde(rename = "scrollDY", default)]
        dy: f64,
    },
    KeyDown {
        #[serde(rename = "keyCode", default)]
        key_code: u16,
        #[serde(default)]
        modifiers: Modifiers,
    },
    KeyUp {
        #[serde(rename = "keyCode", default)]
        key_code: u16,
        #[serde(default)]
        modifiers: Modifiers,
    },
}

impl InputEvent {
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    /// 线上的类型名
    pub fn kind(&self) -> &'static str {
        match self {
            InputEvent::MouseMove { .. } => "mouse_move",
            InputEvent::MouseDown { .. } => "mouse_down",
            InputEvent::MouseUp { .. } => "mouse_up",
            InputEvent::MouseScroll { .. } => "mouse_scroll",
            InputEvent::KeyDown { .. } => "key_down",
            InputEvent::KeyUp { .. } => "key_up",
        }
    }
}

/// 输入注入器
pub trait InputInjector: Send {
    fn inject(&mut self, event: &InputEvent) -> Result<()>;
}

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos::MacOSInputInjector;

/// 创建平台输入注入器
pub fn create_injector() -> Result<Box<dyn InputInjector>> {
    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(MacOSInputInjector::new()))
    }

    #[cfg(not(target_os = "macos"))]
    {
        Err(anyhow::anyhow!("当前平台不支持输入注入"))
    }
}

/// 只记录日志的注入器，用于不支持注入的平台
#[derive(Debug, Default)]
pub struct LoggingInjector {
    count: u64,
}

impl LoggingInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl InputInjector for LoggingInjector {
    fn inject(&mut self, event: &InputEvent) -> Result<()> {
        self.count += 1;
        tracing::debug!("输入事件 #{}: {:?}", self.count, event);
        Ok(())
    }
}
