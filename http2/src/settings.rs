//! Session settings bookkeeping.

use crate::frame::{
    DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_CONCURRENT_STREAMS, DEFAULT_MAX_FRAME_SIZE, Setting,
    setting,
};

/// The settings one side of a session advertises (or has learned from the
/// peer's SETTINGS frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub header_table_size: u32,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: u32::MAX,
        }
    }
}

impl SessionSettings {
    /// The SETTINGS payload advertising this configuration.
    pub fn to_settings(self) -> Vec<Setting> {
        vec![
            Setting {
                id: setting::MAX_CONCURRENT_STREAMS,
                value: self.max_concurrent_streams,
            },
            Setting {
                id: setting::INITIAL_WINDOW_SIZE,
                value: self.initial_window_size,
            },
            Setting {
                id: setting::MAX_FRAME_SIZE,
                value: self.max_frame_size,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_rfc() {
        let s = SessionSettings::default();
        assert_eq!(s.initial_window_size, 65_535);
        assert_eq!(s.max_frame_size, 16_384);
    }

    #[test]
    fn advertised_settings() {
        let s = SessionSettings::default();
        let list = s.to_settings();
        assert_eq!(list.len(), 3);
        assert!(list.iter().any(|x| x.id == setting::MAX_CONCURRENT_STREAMS));
    }
}
