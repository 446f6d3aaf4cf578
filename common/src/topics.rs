pub const DEFAULT_DEVICE_ID: &str = "device_001";

pub const CONTROL_SET_LOCK: &str = "control/set_lock";
pub const STATUS: &str = "status";
pub const HEARTBEAT: &str = "timestamp";

/// Per-device topic paths of the remote control and status channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub control: String,
    pub status: String,
    pub heartbeat: String,
}

impl Topics {
    pub fn for_device(device_id: &str) -> Self {
        Self {
            control: format!("{device_id}/{CONTROL_SET_LOCK}"),
            status: format!("{device_id}/{STATUS}"),
            heartbeat: format!("{device_id}/{HEARTBEAT}"),
        }
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::for_device(DEFAULT_DEVICE_ID)
    }
}
