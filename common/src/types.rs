use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Condition {
    Normal,
    Alert,
}

impl Condition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Alert => "ALERT",
        }
    }

    /// Indicator output for this condition; the alert state drives the LED on.
    pub fn indicator_on(self) -> bool {
        matches!(self, Self::Alert)
    }
}

/// A change between two consecutive classifications of the sensor signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Condition,
    pub to: Condition,
}
