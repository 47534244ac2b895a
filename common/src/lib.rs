pub mod config;
pub mod message;
pub mod monitor;
pub mod status;
pub mod types;

pub use config::{DeviceConfig, RuntimeConfig, SmsConfig, SmtpConfig, WifiConfig};
pub use message::{startup_event, transition_event, NotificationEvent, TIME_UNAVAILABLE};
pub use monitor::{average_volts, classify, volts_from_raw, StateStore};
pub use status::{http_ok, render_status_page, StatusSnapshot};
pub use types::{Condition, Transition};
