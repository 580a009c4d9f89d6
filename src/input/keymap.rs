//! 控制端按键到 macOS 虚拟键码的映射
//!
//! 控制端在本地捕获按键，发送前统一换算成 macOS 虚拟键码。
//! 没有对应关系的键发送 [`UNMAPPED_KEY_CODE`]。

/// 未映射按键的键码
pub const UNMAPPED_KEY_CODE: u16 = 0xFF;

/// 平台无关的按键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    A, B, C, D, E, F, G, H, I, J, K, L, M,
    N, O, P, Q, R, S, T, U, V, W, X, Y, Z,
    Digit0, Digit1, Digit2, Digit3, Digit4,
    Digit5, Digit6, Digit7, Digit8, Digit9,
    Enter,
    Tab,
    Space,
    Backspace,
    Escape,
    ArrowLeft,
    ArrowRight,
    ArrowDown,
    ArrowUp,
    F1, F2, F3, F4, F5, F6, F7, F8, F9, F10, F11, F12,
    Delete,
    Home,
    End,
    PageUp,
    PageDown,
    /// 其它无法映射的键
    Other,
}

const KEY_TABLE: &[(Key, u16)] = &[
    (Key::A, 0x00),
    (Key::S, 0x01),
    (Key::D, 0x02),
    (Key::F, 0x03),
    (Key::H, 0x04),
    (Key::G, 0x05),
    (Key::Z, 0x06),
    (Key::X, 0x07),
    (Key::C, 0x08),
    (Key::V, 0x09),
    (Key::B, 0x0B),
    (Key::Q, 0x0C),
    (Key::W, 0x0D),
    (Key::E, 0x0E),
    (Key::R, 0x0F),
    (Key::Y, 0x10),
    (Key::T, 0x11),
    (Key::Digit1, 0x12),
    (Key::Digit2, 0x13),
    (Key::Digit3, 0x14),
    (Key::Digit4, 0x15),
    (Key::Digit6, 0x16),
    (Key::Digit5, 0x17),
    (Key::Digit9, 0x19),
    (Key::Digit7, 0x1A),
    (Key::Digit8, 0x1C),
    (Key::Digit0, 0x1D),
    (Key::O, 0x1F),
    (Key::U, 0x20),
    (Key::I, 0x22),
    (Key::P, 0x23),
    (Key::Enter, 0x24),
    (Key::L, 0x25),
    (Key::J, 0x26),
    (Key::K, 0x28),
    (Key::N, 0x2D),
    (Key::M, 0x2E),
    (Key::Tab, 0x30),
    (Key::Space, 0x31),
    (Key::Backspace, 0x33),
    (Key::Escape, 0x35),
    (Key::F5, 0x60),
    (Key::F6, 0x61),
    (Key::F7, 0x62),
    (Key::F3, 0x63),
    (Key::F8, 0x64),
    (Key::F9, 0x65),
    (Key::F11, 0x67),
    (Key::F10, 0x6D),
    (Key::F12, 0x6F),
    (Key::Home, 0x73),
    (Key::PageUp, 0x74),
    (Key::Delete, 0x75),
    (Key::F4, 0x76),
    (Key::End, 0x77),
    (Key::F2, 0x78),
    (Key::PageDown, 0x79),
    (Key::F1, 0x7A),
    (Key::ArrowLeft, 0x7B),
    (Key::ArrowRight, 0x7C),
    (Key::ArrowDown, 0x7D),
    (Key::ArrowUp, 0x7E),
];

impl Key {
    /// macOS 虚拟键码
    pub fn mac_key_code(self) -> u16 {
        KEY_TABLE
            .iter()
            .find(|(key, _)| *key == self)
            .map(|(_, code)| *code)
            .unwrap_or(UNMAPPED_KEY_CODE)
    }

    /// 按名称解析，大小写不敏感，兼容浏览器 KeyboardEvent.code 的写法
    pub fn from_name(name: &str) -> Key {
        let lower = name.to_ascii_lowercase();
        let name = lower
            .strip_prefix("key")
            .filter(|rest| rest.len() == 1)
            .unwrap_or(&lower);

        if name.len() == 1 {
            let c = name.as_bytes()[0];
            if c.is_ascii_lowercase() {
                return LETTERS[(c - b'a') as usize];
            }
            if c.is_ascii_digit() {
                return DIGITS[(c - b'0') as usize];
            }
        }
        if let Some(d) = name.strip_prefix("digit").and_then(|d| d.parse::<usize>().ok()) {
            if d < 10 {
                return DIGITS[d];
            }
        }
        if let Some(n) = name.strip_prefix('f').and_then(|n| n.parse::<usize>().ok()) {
            if (1..=12).contains(&n) {
                return FUNCTION_KEYS[n - 1];
            }
        }

        match name {
            "enter" | "return" => Key::Enter,
            "tab" => Key::Tab,
            "space" | " " => Key::Space,
            "backspace" => Key::Backspace,
            "escape" | "esc" => Key::Escape,
            "arrowleft" | "left" => Key::ArrowLeft,
            "arrowright" | "right" => Key::ArrowRight,
            "arrowdown" | "down" => Key::ArrowDown,
            "arrowup" | "up" => Key::ArrowUp,
            "delete" => Key::Delete,
            "home" => Key::Home,
            "end" => Key::End,
            "pageup" => Key::PageUp,
            "pagedown" => Key::PageDown,
            _ => Key::Other,
        }
    }
}

const LETTERS: [Key; 26] = [
    Key::A, Key::B, Key::C, Key::D, Key::E, Key::F, Key::G, Key::H, Key::I,
    Key::J, Key::K, Key::L, Key::M, Key::N, Key::O, Key::P, Key::Q, Key::R,
    Key::S, Key::T, Key::U, Key::V, Key::W, Key::X, Key::Y, Key::Z,
];

const DIGITS: [Key; 10] = [
    Key::Digit0, Key::Digit1, Key::Digit2, Key::Digit3, Key::Digit4,
    Key::Digit5, Key::Digit6, Key::Digit7, Key::Digit8, Key::Digit9,
];

const FUNCTION_KEYS: [Key; 12] = [
    Key::F1, Key::F2, Key::F3, Key::F4, Key::F5, Key::F6,
    Key::F7, Key::F8, Key::F9, Key::F10, Key::F11, Key::F12,
];
