use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dispenser_common::monitor::{MONITOR_PERIOD_MS, SAMPLES_PER_READING, SAMPLE_SPACING_MS};
use dispenser_common::{
    average_volts, classify, http_ok, render_status_page, Condition, RuntimeConfig, StateStore,
    StatusSnapshot,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::channels::{Dispatcher, EmailNotifier, SmsNotifier, TimeService};

const CLIENT_IO_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dispenser_monitor=debug,dispenser_common=debug".into()),
        )
        .init();

    let config = load_config().await?;
    info!(
        device = %config.device.name,
        location = %config.device.location,
        "starting voltage monitor"
    );

    let email = if config.smtp.is_configured() {
        Some(EmailNotifier::new(&config.smtp).context("smtp channel")?)
    } else {
        info!("smtp not configured, email notifications disabled");
        None
    };
    let sms = if config.sms.is_configured() {
        Some(SmsNotifier::new(config.sms.clone()).context("sms channel")?)
    } else {
        info!("sms not configured, text notifications disabled");
        None
    };
    let dispatcher = Arc::new(Dispatcher::new(
        config.device.name.clone(),
        config.device.location.clone(),
        email,
        sms,
        TimeService::new().context("time service")?,
    ));

    let state = Arc::new(StateStore::new());
    let adc = Arc::new(tokio::sync::Mutex::new(SimulatedAdc::from_env()));
    let indicator = Indicator::new();

    // Establish the baseline before anything can observe the store: the first
    // classification drives the indicator but never a notification.
    let volts = sample_voltage(&adc).await;
    let condition = classify(volts);
    indicator.set(condition);
    state.set(condition);
    info!("baseline: {volts:.2}V ({})", condition.as_str());

    dispatcher.notify_startup().await;

    spawn_monitor_loop(
        Arc::clone(&state),
        Arc::clone(&adc),
        Arc::clone(&dispatcher),
        indicator,
    );

    let port: u16 = std::env::var("MONITOR_HTTP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding status server on port {port}"))?;
    info!(port, "status server listening");

    serve_status(listener, config, state, adc).await
}

async fn load_config() -> anyhow::Result<RuntimeConfig> {
    let dir = std::env::var("MONITOR_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.dispenser"));
    let path = dir.join("runtime.json");
    let mut config = match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display()))?,
        Err(err) if err.kind() == ErrorKind::NotFound => RuntimeConfig::default(),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Secrets come from the environment so runtime.json can stay committable.
fn apply_env_overrides(config: &mut RuntimeConfig) {
    let mut set = |name: &str, field: &mut String| {
        if let Ok(value) = std::env::var(name) {
            *field = value;
        }
    };
    set("DEVICE", &mut config.device.name);
    set("LOCATION", &mut config.device.location);
    set("SMTP_SERVER", &mut config.smtp.server);
    set("SMTP_USERNAME", &mut config.smtp.username);
    set("SMTP_PASSWORD", &mut config.smtp.password);
    set("SMTP_TO_EMAIL", &mut config.smtp.recipient);
    set("TWILIO_ACCOUNT_SID", &mut config.sms.account_sid);
    set("TWILIO_AUTH_TOKEN", &mut config.sms.auth_token);
    set("TWILIO_FROM_NUMBER", &mut config.sms.from_number);
    set("TWILIO_TO_NUMBER", &mut config.sms.to_number);
    if let Ok(port) = std::env::var("SMTP_PORT") {
        match port.parse() {
            Ok(port) => config.smtp.port = port,
            Err(_) => warn!("ignoring unparseable SMTP_PORT {port:?}"),
        }
    }
}

/// Stand-in for the LED on the host. State changes are only logged.
struct Indicator {
    lit: AtomicBool,
}

impl Indicator {
    fn new() -> Self {
        Self {
            lit: AtomicBool::new(false),
        }
    }

    fn set(&self, condition: Condition) {
        let on = condition.indicator_on();
        if self.lit.swap(on, Ordering::Relaxed) != on {
            info!(indicator = on, "indicator changed");
        }
    }
}

fn spawn_monitor_loop(
    state: Arc<StateStore>,
    adc: Arc<tokio::sync::Mutex<SimulatedAdc>>,
    dispatcher: Arc<Dispatcher<EmailNotifier, SmsNotifier, TimeService>>,
    indicator: Indicator,
) {
    tokio::spawn(async move {
        // The baseline sample already ran; the first periodic cycle comes one
        // full period later.
        let period = Duration::from_millis(MONITOR_PERIOD_MS);
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let volts = sample_voltage(&adc).await;
            let condition = classify(volts);
            debug!("cycle reading: {volts:.2}V ({})", condition.as_str());
            indicator.set(condition);
            if let Some(transition) = state.record(condition) {
                info!(
                    from = transition.from.as_str(),
                    to = transition.to.as_str(),
                    "condition transition"
                );
                // Delivery is detached so a slow channel cannot stretch the
                // sampling period.
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    dispatcher.notify_transition(transition.to, volts).await;
                });
            }
        }
    });
}

async fn serve_status(
    listener: TcpListener,
    config: RuntimeConfig,
    state: Arc<StateStore>,
    adc: Arc<tokio::sync::Mutex<SimulatedAdc>>,
) -> anyhow::Result<()> {
    // One client at a time. The page is a single fixed document, so there is
    // nothing to gain from concurrent connections.
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("accept failed: {err}");
                continue;
            }
        };
        debug!(%peer, "status request");
        match tokio::time::timeout(
            CLIENT_IO_TIMEOUT,
            handle_client(stream, &config, &state, &adc),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(%peer, "client error: {err}"),
            Err(_) => warn!(%peer, "client timed out"),
        }
    }
}

async fn handle_client(
    mut stream: TcpStream,
    config: &RuntimeConfig,
    state: &StateStore,
    adc: &tokio::sync::Mutex<SimulatedAdc>,
) -> anyhow::Result<()> {
    // The request itself is irrelevant; every path gets the same page.
    let mut buf = [0u8; 1024];
    let _ = stream.read(&mut buf).await?;

    // Serve a fresh reading rather than the last cycle's. The page may show a
    // condition the monitor loop has not confirmed yet.
    let volts = sample_voltage(adc).await;
    let condition = classify(volts);
    if state.get() != Some(condition) {
        debug!(condition = condition.as_str(), "page reading ahead of monitor cycle");
    }

    let snapshot = StatusSnapshot::new(condition, volts);
    let page = render_status_page(&config.device.name, &config.device.location, snapshot);
    stream.write_all(http_ok(&page).as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn sample_voltage(adc: &tokio::sync::Mutex<SimulatedAdc>) -> f32 {
    let mut readings = [0u16; SAMPLES_PER_READING];
    let mut adc = adc.lock().await;
    for (i, slot) in readings.iter_mut().enumerate() {
        if i > 0 {
            tokio::time::sleep(Duration::from_millis(SAMPLE_SPACING_MS)).await;
        }
        *slot = adc.read_raw();
    }
    average_volts(&readings)
}

/// Host stand-in for the analog input. Produces a slow sawtooth that crosses
/// the alert threshold, or a fixed level when MONITOR_SIM_VOLTS is set.
struct SimulatedAdc {
    tick: u32,
    fixed: Option<f32>,
}

impl SimulatedAdc {
    fn from_env() -> Self {
        let fixed = std::env::var("MONITOR_SIM_VOLTS")
            .ok()
            .and_then(|v| v.parse().ok());
        Self { tick: 0, fixed }
    }

    fn read_raw(&mut self) -> u16 {
        let volts = match self.fixed {
            Some(volts) => volts,
            None => {
                self.tick = self.tick.wrapping_add(1);
                1.2 + (self.tick % 240) as f32 * 0.01
            }
        };
        let raw = volts / 3.3 * f32::from(u16::MAX);
        raw.clamp(0.0, f32::from(u16::MAX)) as u16
    }
}
