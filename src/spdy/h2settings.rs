//! HTTP/2 SETTINGS values.
//!
//! One `H2Settings` describes what we advertise (local) and another what the
//! server advertised (remote). Both start at the RFC 7540 Section 6.5.2
//! defaults and change only through explicit SETTINGS parameters.

/// SETTINGS parameter identifiers.
pub const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
pub const SETTINGS_ENABLE_PUSH: u16 = 0x2;
pub const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
pub const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// Initial flow-control window for connections and new streams.
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
/// Smallest legal MAX_FRAME_SIZE, also its default.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
/// Largest legal MAX_FRAME_SIZE.
pub const MAX_ALLOWED_FRAME_SIZE: u32 = (1 << 24) - 1;
/// Largest legal flow-control window.
pub const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

/// HTTP/2 SETTINGS configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct H2Settings {
    /// SETTINGS_HEADER_TABLE_SIZE (0x1) - HPACK dynamic table size
    pub header_table_size: u32,
    /// SETTINGS_ENABLE_PUSH (0x2) - Server push enabled
    pub enable_push: bool,
    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x3), `None` is unlimited
    pub max_concurrent_streams: Option<u32>,
    /// SETTINGS_INITIAL_WINDOW_SIZE (0x4) - Flow control window
    pub initial_window_size: u32,
    /// SETTINGS_MAX_FRAME_SIZE (0x5) - Maximum frame payload
    pub max_frame_size: u32,
    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x6), `None` is unlimited
    pub max_header_list_size: Option<u32>,
}

impl Default for H2Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl H2Settings {
    /// Apply one received parameter. Unknown ids are ignored; values outside
    /// their legal range are ignored too and reported as `false`.
    pub fn apply(&mut self, id: u16, value: u32) -> bool {
        match id {
            SETTINGS_HEADER_TABLE_SIZE => self.header_table_size = value,
            SETTINGS_ENABLE_PUSH => match value {
                0 => self.enable_push = false,
                1 => self.enable_push = true,
                _ => return false,
            },
            SETTINGS_MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = Some(value),
            SETTINGS_INITIAL_WINDOW_SIZE => {
                if value > MAX_WINDOW_SIZE {
                    return false;
                }
                self.initial_window_size = value;
            }
            SETTINGS_MAX_FRAME_SIZE => {
                if !(DEFAULT_MAX_FRAME_SIZE..=MAX_ALLOWED_FRAME_SIZE).contains(&value) {
                    return false;
                }
                self.max_frame_size = value;
            }
            SETTINGS_MAX_HEADER_LIST_SIZE => self.max_header_list_size = Some(value),
            _ => {
                tracing::trace!(id, value, "ignoring unknown SETTINGS parameter");
            }
        }
        true
    }

    /// Parameters that differ from the RFC defaults, in id order.
    ///
    /// An all-default configuration yields an empty list, which is sent as
    /// an empty SETTINGS frame.
    pub fn to_params(&self) -> Vec<(u16, u32)> {
        let defaults = Self::default();
        let mut params = Vec::new();
        if self.header_table_size != defaults.header_table_size {
            params.push((SETTINGS_HEADER_TABLE_SIZE, self.header_table_size));
        }
        if self.enable_push != defaults.enable_push {
            params.push((SETTINGS_ENABLE_PUSH, u32::from(self.enable_push)));
        }
        if let Some(v) = self.max_concurrent_streams {
            params.push((SETTINGS_MAX_CONCURRENT_STREAMS, v));
        }
        if self.initial_window_size != defaults.initial_window_size {
            params.push((SETTINGS_INITIAL_WINDOW_SIZE, self.initial_window_size));
        }
        if self.max_frame_size != defaults.max_frame_size {
            params.push((SETTINGS_MAX_FRAME_SIZE, self.max_frame_size));
        }
        if let Some(v) = self.max_header_list_size {
            params.push((SETTINGS_MAX_HEADER_LIST_SIZE, v));
        }
        params
    }
}
