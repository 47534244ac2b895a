use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub location: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "Coin Dispenser".to_string(),
            location: "Game Room".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WifiConfig {
    pub ssid: String,
    pub pass: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub recipient: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            // SMTP over implicit TLS.
            port: 465,
            username: String::new(),
            password: String::new(),
            recipient: String::new(),
        }
    }
}

impl SmtpConfig {
    pub fn is_configured(&self) -> bool {
        !self.server.is_empty() && !self.recipient.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmsConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub to_number: String,
}

impl SmsConfig {
    pub fn is_configured(&self) -> bool {
        !self.account_sid.is_empty() && !self.to_number.is_empty()
    }
}

/// Full configuration surface, loaded once at startup and never reloaded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub wifi: WifiConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub sms: SmsConfig,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"device":{"name":"Dispenser 2","location":"Lobby"}}"#)
                .unwrap();

        assert_eq!(config.device.name, "Dispenser 2");
        assert_eq!(config.device.location, "Lobby");
        assert_eq!(config.smtp.port, 465);
        assert!(!config.smtp.is_configured());
        assert!(!config.sms.is_configured());
    }

    #[test]
    fn configured_channels_are_detected() {
        let mut config = RuntimeConfig::default();
        config.smtp.server = "smtp.example.com".to_string();
        config.smtp.recipient = "ops@example.com".to_string();
        config.sms.account_sid = "AC123".to_string();
        config.sms.to_number = "+15550001111".to_string();

        assert!(config.smtp.is_configured());
        assert!(config.sms.is_configured());
    }
}
