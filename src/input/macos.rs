//! macOS 输入注入实现
//!
//! 使用 Core Graphics CGEvent API，事件投递到 HID 事件流

use super::{InputEvent, InputInjector, Modifiers, MouseButton};
use anyhow::{anyhow, Result};
use core_graphics::event::{
    CGEvent, CGEventFlags, CGEventTapLocation, CGEventType, CGMouseButton,
};
use core_graphics::event_source::{CGEventSource, CGEventSourceStateID};
use core_graphics::geometry::CGPoint;

/// macOS 输入注入器
///
/// 坐标直接使用远端屏幕像素坐标，不做缩放
#[derive(Debug, Default)]
pub struct MacOSInputInjector {
    injected: u64,
}

impl MacOSInputInjector {
    pub fn new() -> Self {
        tracing::info!("macOS 输入注入器已创建");
        Self::default()
    }

    pub fn injected(&self) -> u64 {
        self.injected
    }

    fn event_source() -> Result<CGEventSource> {
        CGEventSource::new(CGEventSourceStateID::HIDSystemState)
            .map_err(|e| anyhow!("创建 CGEventSource 失败: {:?}", e))
    }

    fn convert_button(button: MouseButton) -> CGMouseButton {
        match button {
            MouseButton::Left => CGMouseButton::Left,
            MouseButton::Right => CGMouseButton::Right,
            MouseButton::Middle => CGMouseButton::Center,
        }
    }

    fn mouse_event_type(button: MouseButton, pressed: bool) -> CGEventType {
        match (button, pressed) {
            (MouseButton::Left, true) => CGEventType::LeftMouseDown,
            (MouseButton::Left, false) => CGEventType::LeftMouseUp,
            (MouseButton::Right, true) => CGEventType::RightMouseDown,
            (MouseButton::Right, false) => CGEventType::RightMouseUp,
            (MouseButton::Middle, true) => CGEventType::OtherMouseDown,
            (MouseButton::Middle, false) => CGEventType::OtherMouseUp,
        }
    }

    fn post_mouse(
        &self,
        event_type: CGEventType,
        x: f64,
        y: f64,
        button: MouseButton,
    ) -> Result<()> {
        let event = CGEvent::new_mouse_event(
            Self::event_source()?,
            event_type,
            CGPoint::new(x, y),
            Self::convert_button(button),
        )
        .map_err(|e| anyhow!("创建鼠标事件失败: {:?}", e))?;
        event.post(CGEventTapLocation::HID);
        Ok(())
    }

    fn post_scroll(&self, dx: f64, dy: f64) -> Result<()> {
        // kCGHIDEventTap = 0
        const HID_EVENT_TAP: u32 = 0;

        let event = create_scroll_event(dx, dy)?;
        unsafe {
            CGEventPost(HID_EVENT_TAP, event);
            CFRelease(event);
        }
        Ok(())
    }

    fn post_key(&self, key_code: u16, modifiers: Modifiers, pressed: bool) -> Result<()> {
        let event = CGEvent::new_keyboard_event(Self::event_source()?, key_code, pressed)
            .map_err(|e| anyhow!("创建键盘事件失败: {:?}", e))?;
        event.set_flags(CGEventFlags::from_bits_truncate(modifiers.to_cg_flags()));
        event.post(CGEventTapLocation::HID);
        Ok(())
    }
}

// core-graphics 没有暴露 CGEventCreateScrollWheelEvent；
// 它是变参函数，wheel1 之后的滚轮值必须按变参传递
extern "C" {
    fn CGEventCreateScrollWheelEvent(
        source: *const std::ffi::c_void,
        units: u32,
        wheel_count: u32,
        wheel1: i32,
        ...
    ) -> *mut std::ffi::c_void;
    fn CGEventPost(tap: u32, event: *mut std::ffi::c_void);
    fn CFRelease(cf: *mut std::ffi::c_void);
}

/// 创建像素单位的双轴滚轮事件，调用方负责 CFRelease
fn create_scroll_event(dx: f64, dy: f64) -> Result<*mut std::ffi::c_void> {
    // kCGScrollEventUnitPixel = 0
    const SCROLL_UNIT_PIXEL: u32 = 0;

    let event = unsafe {
        CGEventCreateScrollWheelEvent(
            std::ptr::null(),
            SCROLL_UNIT_PIXEL,
            2,
            dy as i32,
            dx as i32,
        )
    };
    if event.is_null() {
        return Err(anyhow!("创建滚轮事件失败"));
    }
    Ok(event)
}

impl InputInjector for MacOSInputInjector {
    fn inject(&mut self, event: &InputEvent) -> Result<()> {
        match *event {
            InputEvent::MouseMove { x, y } => {
                self.post_mouse(CGEventType::MouseMoved, x, y, MouseButton::Left)?
            }
            InputEvent::MouseDown { x, y, button } => {
                self.post_mouse(Self::mouse_event_type(button, true), x, y, button)?
            }
            InputEvent::MouseUp { x, y, button } => {
                self.post_mouse(Self::mouse_event_type(button, false), x, y, button)?
            }
            InputEvent::MouseScroll { dx, dy } => self.post_scroll(dx, dy)?,
            InputEvent::KeyDown {
                key_code,
                modifiers,
            } => self.post_key(key_code, modifiers, true)?,
            InputEvent::KeyUp {
                key_code,
                modifiers,
            } => self.post_key(key_code, modifiers, false)?,
        }

        self.injected += 1;
        tracing::trace!("注入输入事件: {}", event.kind());
        Ok(())
    }
}
