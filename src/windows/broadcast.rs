//! Command delivery through a broadcast window message.

use tracing::{debug, trace};
use windows::Win32::Foundation::{LPARAM, WPARAM};
use windows::Win32::UI::WindowsAndMessaging::{HWND_BROADCAST, RegisterWindowMessageW, SendNotifyMessageW};
use windows::core::PCWSTR;

use super::mapping::wide_string;
use crate::command::{CommandMessage, CommandSink};
use crate::{ConnectionError, Result};

/// Posts [`CommandMessage`]s to every top-level window; the simulator picks
/// up the registered message id.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastSender {
    message_id: u32,
}

impl BroadcastSender {
    /// Register `message_name` and return a sender for it.
    pub fn register(message_name: &str) -> Result<Self> {
        let wide_name = wide_string(message_name);
        let message_id = unsafe { RegisterWindowMessageW(PCWSTR::from_raw(wide_name.as_ptr())) };
        if message_id == 0 {
            let win_err = windows::core::Error::from_thread();
            return Err(ConnectionError::windows_api_error("RegisterWindowMessageW", win_err));
        }

        debug!(message_name, message_id, "Registered broadcast message");
        Ok(Self { message_id })
    }

    pub fn message_id(&self) -> u32 {
        self.message_id
    }
}

impl CommandSink for BroadcastSender {
    fn send(&self, message: CommandMessage) -> Result<()> {
        trace!(command = message.command, var1 = message.var1, "Broadcasting command");
        unsafe {
            SendNotifyMessageW(
                HWND_BROADCAST,
                self.message_id,
                WPARAM(message.wparam() as usize),
                LPARAM(message.lparam() as i32 as isize),
            )
        }
        .map_err(|e| ConnectionError::windows_api_error("SendNotifyMessageW", e))
    }
}
