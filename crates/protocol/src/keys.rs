//! Key codes reported by the remote
//!
//! A key code packs the DJ sub id (keyboard or consumer control) into bits
//! 16-17 and the 16-bit usage from the report into the low bits. Bit 18 marks
//! a long press, i.e. a key that was still held when the long-press
//! threshold elapsed.

use std::fmt;

/// Key code delivered to key callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyCode(pub u32);

impl KeyCode {
    /// Flag bit set on codes resolved as long presses
    pub const LONG_PRESS_FLAG: u32 = 0x40000;

    pub const OFF: KeyCode = KeyCode(0x3EC01);
    pub const DEVICE_1: KeyCode = KeyCode(0x3E801);
    pub const DEVICE_2: KeyCode = KeyCode(0x3ED01);
    pub const DEVICE_3: KeyCode = KeyCode(0x3E901);
    pub const DIM_UP: KeyCode = KeyCode(0x3F00F);
    pub const DIM_DOWN: KeyCode = KeyCode(0x3F10F);
    pub const BULB_1: KeyCode = KeyCode(0x3F20F);
    pub const BULB_2: KeyCode = KeyCode(0x3F30F);
    pub const PLUG_1: KeyCode = KeyCode(0x3F40F);
    pub const PLUG_2: KeyCode = KeyCode(0x3F50F);
    pub const RED: KeyCode = KeyCode(0x3F701);
    pub const GREEN: KeyCode = KeyCode(0x3F601);
    pub const YELLOW: KeyCode = KeyCode(0x3F501);
    pub const BLUE: KeyCode = KeyCode(0x3F401);
    pub const DVR: KeyCode = KeyCode(0x39A00);
    pub const GUIDE: KeyCode = KeyCode(0x38D00);
    pub const INFO: KeyCode = KeyCode(0x3FF01);
    pub const EXIT: KeyCode = KeyCode(0x39400);
    pub const MENU: KeyCode = KeyCode(0x10065);
    pub const VOL_UP: KeyCode = KeyCode(0x3E900);
    pub const VOL_DOWN: KeyCode = KeyCode(0x3EA00);
    pub const CHN_UP: KeyCode = KeyCode(0x39C00);
    pub const CHN_DOWN: KeyCode = KeyCode(0x39D00);
    pub const UP: KeyCode = KeyCode(0x10052);
    pub const DOWN: KeyCode = KeyCode(0x10051);
    pub const LEFT: KeyCode = KeyCode(0x10050);
    pub const RIGHT: KeyCode = KeyCode(0x1004F);
    pub const OK: KeyCode = KeyCode(0x10058);
    pub const MUTE: KeyCode = KeyCode(0x3E200);
    pub const BACK: KeyCode = KeyCode(0x32402);
    pub const RWD: KeyCode = KeyCode(0x3B400);
    pub const FWD: KeyCode = KeyCode(0x3B300);
    pub const RECORD: KeyCode = KeyCode(0x3B200);
    pub const STOP: KeyCode = KeyCode(0x3B700);
    pub const PLAY: KeyCode = KeyCode(0x3B000);
    pub const PAUSE: KeyCode = KeyCode(0x3B100);
    pub const NUM_1: KeyCode = KeyCode(0x1001E);
    pub const NUM_2: KeyCode = KeyCode(0x1001F);
    pub const NUM_3: KeyCode = KeyCode(0x10020);
    pub const NUM_4: KeyCode = KeyCode(0x10021);
    pub const NUM_5: KeyCode = KeyCode(0x10022);
    pub const NUM_6: KeyCode = KeyCode(0x10023);
    pub const NUM_7: KeyCode = KeyCode(0x10024);
    pub const NUM_8: KeyCode = KeyCode(0x10025);
    pub const NUM_9: KeyCode = KeyCode(0x10026);
    pub const NUM_0: KeyCode = KeyCode(0x10027);
    pub const CLEAR: KeyCode = KeyCode(0x10056);
    pub const ENTER: KeyCode = KeyCode(0x10028);

    /// Build a key code from the key fields of a DJ keyboard/consumer report
    ///
    /// Returns `None` when both key bytes are zero, which is how the remote
    /// signals a release.
    pub fn from_report(sub_id: u8, msb: u8, lsb: u8) -> Option<Self> {
        if msb == 0 && lsb == 0 {
            return None;
        }
        Some(KeyCode(
            (u32::from(sub_id & 0x3) << 16) | (u32::from(msb) << 8) | u32::from(lsb),
        ))
    }

    /// Raw integer value, long-press flag included
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Same key with the long-press flag set
    pub const fn long(self) -> Self {
        KeyCode(self.0 | Self::LONG_PRESS_FLAG)
    }

    /// Same key with the long-press flag cleared
    pub const fn base(self) -> Self {
        KeyCode(self.0 & !Self::LONG_PRESS_FLAG)
    }

    pub const fn is_long_press(self) -> bool {
        self.0 & Self::LONG_PRESS_FLAG != 0
    }

    /// Human-readable name of the key, ignoring the long-press flag
    pub fn name(self) -> &'static str {
        let code = self.base().0;
        KEY_NAMES
            .binary_search_by_key(&code, |&(c, _)| c)
            .map(|idx| KEY_NAMES[idx].1)
            .unwrap_or("UNKNOWN KEY")
    }
}

impl From<KeyCode> for u32 {
    fn from(key: KeyCode) -> u32 {
        key.0
    }
}

impl fmt::Display for KeyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        if self.is_long_press() && name != "UNKNOWN KEY" {
            write!(f, "LONG {}", name)
        } else {
            f.write_str(name)
        }
    }
}

/// Sorted by code for binary search
static KEY_NAMES: [(u32, &str); 48] = [
    (0x1001E, "NUM 1"),
    (0x1001F, "NUM 2"),
    (0x10020, "NUM 3"),
    (0x10021, "NUM 4"),
    (0x10022, "NUM 5"),
    (0x10023, "NUM 6"),
    (0x10024, "NUM 7"),
    (0x10025, "NUM 8"),
    (0x10026, "NUM 9"),
    (0x10027, "NUM 0"),
    (0x10028, "ENTER"),
    (0x1004F, "RIGHT"),
    (0x10050, "LEFT"),
    (0x10051, "DOWN"),
    (0x10052, "UP"),
    (0x10056, "CLEAR"),
    (0x10058, "OK"),
    (0x10065, "MENU"),
    (0x32402, "BACK"),
    (0x38D00, "GUIDE"),
    (0x39400, "EXIT"),
    (0x39A00, "DVR"),
    (0x39C00, "CHN UP"),
    (0x39D00, "CHN DOWN"),
    (0x3B000, "PLAY"),
    (0x3B100, "PAUSE"),
    (0x3B200, "RECORD"),
    (0x3B300, "FWD"),
    (0x3B400, "RWD"),
    (0x3B700, "STOP"),
    (0x3E200, "MUTE"),
    (0x3E801, "DEVICE 1"),
    (0x3E900, "VOL UP"),
    (0x3E901, "DEVICE 3"),
    (0x3EA00, "VOL DOWN"),
    (0x3EC01, "OFF"),
    (0x3ED01, "DEVICE 2"),
    (0x3F00F, "DIM UP"),
    (0x3F10F, "DIM DOWN"),
    (0x3F20F, "BULB 1"),
    (0x3F30F, "BULB 2"),
    (0x3F401, "BLUE"),
    (0x3F40F, "PLUG 1"),
    (0x3F501, "YELLOW"),
    (0x3F50F, "PLUG 2"),
    (0x3F601, "GREEN"),
    (0x3F701, "RED"),
    (0x3FF01, "INFO"),
];
