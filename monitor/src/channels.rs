use std::time::Duration;

use dispenser_common::{
    startup_event, transition_event, Condition, NotificationEvent, SmsConfig, SmtpConfig,
    TIME_UNAVAILABLE,
};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use tracing::warn;

/// Upper bound on any single delivery attempt. A stalled channel must not
/// hold up the next monitoring cycle's notifications.
pub const CHANNEL_TIMEOUT: Duration = Duration::from_secs(10);

const TIME_API_URL: &str = "http://worldtimeapi.org/api/timezone/America/New_York";

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("smtp transport error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("message build error: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gateway rejected the message with status {0}")]
    Gateway(reqwest::StatusCode),
}

pub trait EmailChannel {
    async fn send(&self, event: &NotificationEvent) -> Result<(), ChannelError>;
}

pub trait SmsChannel {
    async fn send(&self, event: &NotificationEvent) -> Result<(), ChannelError>;
}

pub trait TimeLookup {
    async fn current_time(&self) -> Option<String>;
}

/// SMTP delivery over implicit TLS. The authenticated account doubles as the
/// sender address.
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
    recipient: Mailbox,
}

impl EmailNotifier {
    pub fn new(config: &SmtpConfig) -> Result<Self, ChannelError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.server)?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .build();
        Ok(Self {
            transport,
            sender: config.username.parse()?,
            recipient: config.recipient.parse()?,
        })
    }
}

impl EmailChannel for EmailNotifier {
    async fn send(&self, event: &NotificationEvent) -> Result<(), ChannelError> {
        let message = Message::builder()
            .from(self.sender.clone())
            .to(self.recipient.clone())
            .subject(&event.subject)
            .body(event.email_body.clone())?;
        self.transport.send(message).await?;
        Ok(())
    }
}

/// Twilio REST delivery. The API answers 201 Created on acceptance; anything
/// else is a failure.
pub struct SmsNotifier {
    client: reqwest::Client,
    config: SmsConfig,
}

impl SmsNotifier {
    pub fn new(config: SmsConfig) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(CHANNEL_TIMEOUT)
            .build()?;
        Ok(Self { client, config })
    }
}

impl SmsChannel for SmsNotifier {
    async fn send(&self, event: &NotificationEvent) -> Result<(), ChannelError> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.config.account_sid
        );
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[
                ("To", self.config.to_number.as_str()),
                ("From", self.config.from_number.as_str()),
                ("Body", event.sms_body.as_str()),
            ])
            .send()
            .await?;
        if response.status() != reqwest::StatusCode::CREATED {
            return Err(ChannelError::Gateway(response.status()));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct TimeApiResponse {
    datetime: String,
}

/// Fetches wall-clock time from worldtimeapi.org. Failures are absorbed;
/// notifications carry a placeholder instead of blocking on time.
pub struct TimeService {
    client: reqwest::Client,
}

impl TimeService {
    pub fn new() -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(CHANNEL_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    async fn fetch(&self) -> Result<String, ChannelError> {
        let response: TimeApiResponse = self
            .client
            .get(TIME_API_URL)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(normalize_datetime(&response.datetime))
    }
}

impl TimeLookup for TimeService {
    async fn current_time(&self) -> Option<String> {
        match self.fetch().await {
            Ok(timestamp) => Some(timestamp),
            Err(err) => {
                warn!("time lookup failed: {err}");
                None
            }
        }
    }
}

/// Trims an RFC 3339 timestamp down to seconds. Falls back to chopping at the
/// fractional part when the offset is missing or malformed.
fn normalize_datetime(raw: &str) -> String {
    match chrono::DateTime::parse_from_rfc3339(raw) {
        Ok(parsed) => parsed.format("%Y-%m-%dT%H:%M:%S").to_string(),
        Err(_) => raw.split('.').next().unwrap_or(raw).to_string(),
    }
}

/// Fans one event out to every configured channel. Channels are independent:
/// an email failure never suppresses the SMS, and vice versa.
pub struct Dispatcher<E, S, T> {
    device: String,
    location: String,
    email: Option<E>,
    sms: Option<S>,
    time: T,
}

impl<E, S, T> Dispatcher<E, S, T>
where
    E: EmailChannel,
    S: SmsChannel,
    T: TimeLookup,
{
    pub fn new(
        device: String,
        location: String,
        email: Option<E>,
        sms: Option<S>,
        time: T,
    ) -> Self {
        Self {
            device,
            location,
            email,
            sms,
            time,
        }
    }

    pub async fn notify_transition(&self, entered: Condition, volts: f32) {
        let timestamp = self.timestamp().await;
        let event = transition_event(&self.device, &self.location, &timestamp, entered, volts);
        self.deliver(&event, true).await;
    }

    /// Startup announcement goes to email only; SMS is reserved for
    /// condition transitions.
    pub async fn notify_startup(&self) {
        let timestamp = self.timestamp().await;
        let event = startup_event(&self.device, &self.location, &timestamp);
        self.deliver(&event, false).await;
    }

    async fn timestamp(&self) -> String {
        self.time
            .current_time()
            .await
            .unwrap_or_else(|| TIME_UNAVAILABLE.to_string())
    }

    async fn deliver(&self, event: &NotificationEvent, with_sms: bool) {
        if let Some(email) = &self.email {
            match tokio::time::timeout(CHANNEL_TIMEOUT, email.send(event)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("email delivery failed: {err}"),
                Err(_) => warn!("email delivery timed out"),
            }
        }
        if with_sms {
            if let Some(sms) = &self.sms {
                match tokio::time::timeout(CHANNEL_TIMEOUT, sms.send(event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!("sms delivery failed: {err}"),
                    Err(_) => warn!("sms delivery timed out"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    struct MockEmail {
        sent: Arc<Mutex<Vec<NotificationEvent>>>,
        fail: bool,
    }

    impl EmailChannel for MockEmail {
        async fn send(&self, event: &NotificationEvent) -> Result<(), ChannelError> {
            if self.fail {
                return Err(ChannelError::Gateway(reqwest::StatusCode::BAD_GATEWAY));
            }
            self.sent.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct MockSms {
        sent: Arc<Mutex<Vec<NotificationEvent>>>,
    }

    impl SmsChannel for MockSms {
        async fn send(&self, event: &NotificationEvent) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct StalledEmail;

    impl EmailChannel for StalledEmail {
        async fn send(&self, _event: &NotificationEvent) -> Result<(), ChannelError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    struct FixedTime;

    impl TimeLookup for FixedTime {
        async fn current_time(&self) -> Option<String> {
            Some("2026-08-23T09:15:42".to_string())
        }
    }

    struct NoTime;

    impl TimeLookup for NoTime {
        async fn current_time(&self) -> Option<String> {
            None
        }
    }

    fn dispatcher<E: EmailChannel, S: SmsChannel, T: TimeLookup>(
        email: Option<E>,
        sms: Option<S>,
        time: T,
    ) -> Dispatcher<E, S, T> {
        Dispatcher::new(
            "Coin Dispenser".to_string(),
            "Game Room".to_string(),
            email,
            sms,
            time,
        )
    }

    #[tokio::test]
    async fn failing_email_does_not_block_sms() {
        let email_sent = Arc::new(Mutex::new(Vec::new()));
        let sms_sent = Arc::new(Mutex::new(Vec::new()));
        let d = dispatcher(
            Some(MockEmail {
                sent: email_sent.clone(),
                fail: true,
            }),
            Some(MockSms {
                sent: sms_sent.clone(),
            }),
            FixedTime,
        );

        d.notify_transition(Condition::Alert, 2.73).await;

        assert!(email_sent.lock().unwrap().is_empty());
        let sms = sms_sent.lock().unwrap();
        assert_eq!(sms.len(), 1);
        assert!(sms[0].sms_body.contains("running low"));
    }

    #[tokio::test]
    async fn startup_goes_to_email_only() {
        let email_sent = Arc::new(Mutex::new(Vec::new()));
        let sms_sent = Arc::new(Mutex::new(Vec::new()));
        let d = dispatcher(
            Some(MockEmail {
                sent: email_sent.clone(),
                fail: false,
            }),
            Some(MockSms {
                sent: sms_sent.clone(),
            }),
            FixedTime,
        );

        d.notify_startup().await;

        assert_eq!(email_sent.lock().unwrap().len(), 1);
        assert!(sms_sent.lock().unwrap().is_empty());
        assert_eq!(
            email_sent.lock().unwrap()[0].subject,
            "Coin Dispenser Started"
        );
    }

    #[tokio::test]
    async fn missing_time_uses_placeholder() {
        let sms_sent = Arc::new(Mutex::new(Vec::new()));
        let d = dispatcher(
            None::<MockEmail>,
            Some(MockSms {
                sent: sms_sent.clone(),
            }),
            NoTime,
        );

        d.notify_transition(Condition::Normal, 1.04).await;

        let sms = sms_sent.lock().unwrap();
        assert!(sms[0].sms_body.contains("Time: Time unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_channel_is_abandoned_after_timeout() {
        let sms_sent = Arc::new(Mutex::new(Vec::new()));
        let d = dispatcher(
            Some(StalledEmail),
            Some(MockSms {
                sent: sms_sent.clone(),
            }),
            FixedTime,
        );

        d.notify_transition(Condition::Alert, 2.9).await;

        assert_eq!(sms_sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn datetime_is_truncated_to_seconds() {
        assert_eq!(
            normalize_datetime("2026-08-23T09:15:42.123456-04:00"),
            "2026-08-23T09:15:42"
        );
        assert_eq!(
            normalize_datetime("2026-08-23T09:15:42.123456"),
            "2026-08-23T09:15:42"
        );
        assert_eq!(normalize_datetime("garbage"), "garbage");
    }
}
