use crate::types::Condition;

/// Placeholder substituted when the external time lookup fails.
pub const TIME_UNAVAILABLE: &str = "Time unavailable";

/// One composed notification, ready for the channels. Consumed once per
/// transition; there is no queue and no retry log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub subject: String,
    pub email_body: String,
    pub sms_body: String,
}

/// Composes the message for a confirmed condition transition. The text depends
/// only on the condition being entered; the reading is reported to two
/// decimal places.
pub fn transition_event(
    device: &str,
    location: &str,
    timestamp: &str,
    entered: Condition,
    volts: f32,
) -> NotificationEvent {
    let message = match entered {
        Condition::Alert => "ALERT: Coin dispenser is running low and needs to be refilled!",
        Condition::Normal => "Coin dispenser has been refilled and is now operational.",
    };
    let detail = format!("{message}\nVoltage Reading: {volts:.2}V");
    compose(device, location, timestamp, format!("{device} Status Alert"), &detail)
}

/// Composed once after the network comes up, before monitoring begins.
pub fn startup_event(device: &str, location: &str, timestamp: &str) -> NotificationEvent {
    compose(
        device,
        location,
        timestamp,
        format!("{device} Started"),
        "Voltage monitoring system has started",
    )
}

fn compose(
    device: &str,
    location: &str,
    timestamp: &str,
    subject: String,
    detail: &str,
) -> NotificationEvent {
    NotificationEvent {
        subject,
        email_body: format!(
            "Device: {device}\nLocation: {location}\nTime: {timestamp}\n\n{detail}"
        ),
        sms_body: format!("{device} - {location}\nTime: {timestamp}\n{detail}"),
    }
}
