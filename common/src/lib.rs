pub mod actuator;
pub mod bridge;
pub mod config;
pub mod inbox;
pub mod input;
pub mod latch;
pub mod link;
pub mod persist;
pub mod store;
pub mod topics;
pub mod types;

pub use actuator::{ActuatorController, ActuatorFrame, AlarmPhase, AlarmSequence, BellSequence};
pub use bridge::{BridgeError, CloudBridge, PayloadError, StatusReport};
pub use config::{LatchConfig, NetworkConfig, PinConfig, RuntimeConfig};
pub use inbox::{command_inbox, CommandReceiver, CommandSender, InboxError};
pub use input::{InputEvaluator, InputSample};
pub use latch::{latch_status, restore_state, LatchEngine, LatchEvent, LatchTick};
pub use link::{Backoff, LinkMonitor};
pub use persist::{LockStore, MemoryLockStore, StoreError, LOCKED_KEY, LOCK_NAMESPACE};
pub use store::StateStore;
pub use topics::Topics;
pub use types::{
    lock_label, ActuatorAction, DeviceState, IndicatorColor, LatchStatus, LockCommand, LockSource,
    StatusPayload,
};
