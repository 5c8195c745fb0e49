//! Outbound simulator commands.
//!
//! Commands travel as a registered window message with two 32-bit
//! parameters. The first packs the command id (low half) with `var1` (high
//! half); the second packs `var2` and `var3`, or carries a whole 32-bit
//! argument split across the two halves. Float arguments are sent as 16.16
//! fixed point.

use serde::{Deserialize, Serialize};

use crate::Result;

/// Command ids understood by the simulator (`irsdk_BroadcastMsg`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum BroadcastCommand {
    CameraSwitchPosition = 0,
    CameraSwitchNumber = 1,
    CameraSetState = 2,
    ReplaySetPlaySpeed = 3,
    ReplaySetPlayPosition = 4,
    ReplaySearch = 5,
    ReplaySetState = 6,
    ReloadTextures = 7,
    ChatCommand = 8,
    PitCommand = 9,
    TelemetryCommand = 10,
    ForceFeedbackCommand = 11,
    ReplaySearchSessionTime = 12,
    VideoCapture = 13,
}

/// One packed command message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandMessage {
    pub command: u16,
    pub var1: u16,
    pub var2: u16,
    pub var3: u16,
}

impl CommandMessage {
    pub fn new(command: BroadcastCommand, var1: u16, var2: u16, var3: u16) -> Self {
        Self { command: command as u16, var1, var2, var3 }
    }

    /// Command with a 32-bit integer argument in the second parameter.
    pub fn with_int(command: BroadcastCommand, var1: u16, value: i32) -> Self {
        let bits = value as u32;
        Self {
            command: command as u16,
            var1,
            var2: (bits & 0xFFFF) as u16,
            var3: (bits >> 16) as u16,
        }
    }

    /// Command with a float argument encoded as 16.16 fixed point.
    pub fn with_float(command: BroadcastCommand, var1: u16, value: f32) -> Self {
        Self::with_int(command, var1, (value * 65536.0) as i32)
    }

    /// First message parameter: `command | var1 << 16`.
    pub fn wparam(&self) -> u32 {
        self.command as u32 | (self.var1 as u32) << 16
    }

    /// Second message parameter: `var2 | var3 << 16`.
    pub fn lparam(&self) -> u32 {
        self.var2 as u32 | (self.var3 as u32) << 16
    }

    /// The integer argument packed by [`Self::with_int`].
    pub fn int_argument(&self) -> i32 {
        self.lparam() as i32
    }

    /// The float argument packed by [`Self::with_float`].
    pub fn float_argument(&self) -> f32 {
        self.int_argument() as f32 / 65536.0
    }
}

/// Delivers commands to the simulator.
pub trait CommandSink: Send + Sync {
    fn send(&self, message: CommandMessage) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn int_arguments_survive_packing(value in any::<i32>(), var1 in any::<u16>()) {
            let message = CommandMessage::with_int(BroadcastCommand::ReplaySetPlayPosition, var1, value);
            prop_assert_eq!(message.int_argument(), value);
            prop_assert_eq!(message.wparam() >> 16, var1 as u32);
            prop_assert_eq!(message.wparam() & 0xFFFF, BroadcastCommand::ReplaySetPlayPosition as u32);
        }

        #[test]
        fn float_arguments_keep_sixteen_fraction_bits(value in -30000.0f32..30000.0f32) {
            let message = CommandMessage::with_float(BroadcastCommand::ForceFeedbackCommand, 0, value);
            prop_assert!((message.float_argument() - value).abs() <= 1.0 / 65536.0 + value.abs() * 1e-6);
        }
    }

    #[test]
    fn plain_fields_pack_into_two_halves() {
        let message = CommandMessage::new(BroadcastCommand::CameraSwitchNumber, 12, 3, 0xBEEF);
        assert_eq!(message.wparam(), 1 | (12 << 16));
        assert_eq!(message.lparam(), 3 | (0xBEEF << 16));
    }

    #[test]
    fn sinks_receive_messages() {
        #[derive(Default)]
        struct Recording(Mutex<Vec<CommandMessage>>);

        impl CommandSink for Recording {
            fn send(&self, message: CommandMessage) -> Result<()> {
                self.0.lock().push(message);
                Ok(())
            }
        }

        let sink = Recording::default();
        let message = CommandMessage::with_int(BroadcastCommand::PitCommand, 2, 45);
        sink.send(message).unwrap();
        assert_eq!(sink.0.lock().as_slice(), &[message]);
    }
}
