use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::adc::attenuation::DB_11;
use esp_idf_hal::adc::oneshot::config::AdcChannelConfig;
use esp_idf_hal::adc::oneshot::{AdcChannelDriver, AdcDriver};
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::gpio::{Gpio34, Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    nvs::EspDefaultNvsPartition,
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, error, info, warn};
use serde::Deserialize;

use dispenser_common::monitor::{MONITOR_PERIOD_MS, SAMPLES_PER_READING, SAMPLE_SPACING_MS};
use dispenser_common::{
    average_volts, classify, http_ok, render_status_page, startup_event, transition_event,
    Condition, NotificationEvent, RuntimeConfig, StateStore, StatusSnapshot, TIME_UNAVAILABLE,
};

const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const CLIENT_IO_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_HTTP_BODY: usize = 2048;

const TIME_API_URL: &str = "http://worldtimeapi.org/api/timezone/America/New_York";

// The on-chip ADC is 12-bit; readings are stretched to the full 16-bit range
// the conversion math expects.
const ADC_RAW_MAX: u32 = 4095;

struct VoltageSensor {
    channel: AdcChannelDriver<'static, Gpio34, AdcDriver<'static, esp_idf_hal::adc::ADC1>>,
}

impl VoltageSensor {
    fn new(
        adc1: esp_idf_hal::adc::ADC1,
        pin: Gpio34,
    ) -> anyhow::Result<Self> {
        let adc = AdcDriver::new(adc1)?;
        let config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        let channel = AdcChannelDriver::new(adc, pin, &config)?;
        Ok(Self { channel })
    }

    /// Smoothed reading in volts, averaged over several spaced raw samples.
    fn sample(&mut self) -> anyhow::Result<f32> {
        let mut readings = [0_u16; SAMPLES_PER_READING];
        for (i, slot) in readings.iter_mut().enumerate() {
            if i > 0 {
                FreeRtos::delay_ms(SAMPLE_SPACING_MS as u32);
            }
            let raw = self.channel.read_raw()?;
            *slot = ((u32::from(raw) * u32::from(u16::MAX)) / ADC_RAW_MAX).min(u32::from(u16::MAX))
                as u16;
        }
        Ok(average_volts(&readings))
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let config = load_config();
    info!(
        "starting voltage monitor for `{}` at `{}`",
        config.device.name, config.device.location
    );

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals {
        modem, pins, adc1, ..
    } = Peripherals::take()?;

    let sensor = Arc::new(Mutex::new(
        VoltageSensor::new(adc1, pins.gpio34).context("adc init failed")?,
    ));
    let mut indicator = PinDriver::output(pins.gpio2)?;

    let _wifi =
        connect_wifi(modem, sys_loop, nvs_partition, &config).context("wifi startup failed")?;

    let state = Arc::new(StateStore::new());

    // Baseline classification drives the indicator but never a notification.
    let volts = sensor.lock().unwrap().sample()?;
    let condition = classify(volts);
    set_indicator(&mut indicator, condition)?;
    state.set(condition);
    info!("baseline: {:.2}V ({})", volts, condition.as_str());

    send_startup_notification(&config);

    spawn_monitor_thread(
        config.clone(),
        Arc::clone(&state),
        Arc::clone(&sensor),
        indicator,
    )?;

    serve_status(&config, &state, &sensor)
}

/// All configuration is baked in at build time; the device has no
/// provisioning surface.
fn load_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    let mut set = |value: Option<&str>, field: &mut String| {
        if let Some(value) = value {
            *field = value.to_string();
        }
    };
    set(option_env!("DEVICE"), &mut config.device.name);
    set(option_env!("LOCATION"), &mut config.device.location);
    set(option_env!("WIFI_SSID"), &mut config.wifi.ssid);
    set(option_env!("WIFI_PASS"), &mut config.wifi.pass);
    set(option_env!("SMTP_SERVER"), &mut config.smtp.server);
    set(option_env!("SMTP_USERNAME"), &mut config.smtp.username);
    set(option_env!("SMTP_PASSWORD"), &mut config.smtp.password);
    set(option_env!("SMTP_TO_EMAIL"), &mut config.smtp.recipient);
    set(
        option_env!("TWILIO_ACCOUNT_SID"),
        &mut config.sms.account_sid,
    );
    set(option_env!("TWILIO_AUTH_TOKEN"), &mut config.sms.auth_token);
    set(
        option_env!("TWILIO_FROM_NUMBER"),
        &mut config.sms.from_number,
    );
    set(option_env!("TWILIO_TO_NUMBER"), &mut config.sms.to_number);
    if let Some(port) = option_env!("SMTP_PORT") {
        match port.parse() {
            Ok(port) => config.smtp.port = port,
            Err(_) => warn!("ignoring unparseable SMTP_PORT {port:?}"),
        }
    }
    config
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    config: &RuntimeConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if config.wifi.pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: config
            .wifi
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: config
            .wifi
            .pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", config.wifi.ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect() {
            Ok(()) => match wifi.wait_netif_up() {
                Ok(()) => {
                    info!("wifi connected and netif up on attempt {attempt}");
                    last_err = None;
                    break;
                }
                Err(err) => {
                    warn!("wifi netif up failed on attempt {attempt}: {err:#}");
                    last_err = Some(err);
                }
            },
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(esp_wifi),
        Some(err) => Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed: {err:#}"
        )),
    }
}

fn set_indicator(
    indicator: &mut PinDriver<'static, esp_idf_hal::gpio::Gpio2, Output>,
    condition: Condition,
) -> anyhow::Result<()> {
    if condition.indicator_on() {
        indicator.set_high()?;
    } else {
        indicator.set_low()?;
    }
    Ok(())
}

fn spawn_monitor_thread(
    config: RuntimeConfig,
    state: Arc<StateStore>,
    sensor: Arc<Mutex<VoltageSensor>>,
    mut indicator: PinDriver<'static, esp_idf_hal::gpio::Gpio2, Output>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("monitor".to_string())
        .stack_size(8192)
        .spawn(move || loop {
            thread::sleep(Duration::from_millis(MONITOR_PERIOD_MS));

            let mut cycle = || -> anyhow::Result<()> {
                let volts = sensor.lock().unwrap().sample()?;
                let condition = classify(volts);
                debug!("cycle reading: {:.2}V ({})", volts, condition.as_str());
                set_indicator(&mut indicator, condition)?;
                if let Some(transition) = state.record(condition) {
                    info!(
                        "condition transition {} -> {}",
                        transition.from.as_str(),
                        transition.to.as_str()
                    );
                    // Delivery runs on its own thread so a slow channel
                    // cannot stretch the sampling period.
                    let config = config.clone();
                    if let Err(err) = thread::Builder::new()
                        .name("notify".to_string())
                        .stack_size(8192)
                        .spawn(move || notify_transition(&config, transition.to, volts))
                    {
                        warn!("failed to spawn notify thread: {err}");
                    }
                }
                Ok(())
            };

            if let Err(err) = cycle() {
                error!("monitor cycle failed: {err:#}; restarting");
                thread::sleep(Duration::from_millis(500));
                unsafe { esp_idf_svc::sys::esp_restart() };
            }
        })
        .context("failed to spawn monitor thread")?;
    Ok(())
}

fn notify_transition(config: &RuntimeConfig, entered: Condition, volts: f32) {
    let timestamp = current_time().unwrap_or_else(|| TIME_UNAVAILABLE.to_string());
    let event = transition_event(
        &config.device.name,
        &config.device.location,
        &timestamp,
        entered,
        volts,
    );
    deliver_email(config, &event);
    if config.sms.is_configured() {
        if let Err(err) = send_sms(config, &event) {
            warn!("sms delivery failed: {err:#}");
        }
    }
}

fn send_startup_notification(config: &RuntimeConfig) {
    let timestamp = current_time().unwrap_or_else(|| TIME_UNAVAILABLE.to_string());
    let event = startup_event(&config.device.name, &config.device.location, &timestamp);
    deliver_email(config, &event);
}

// SMTP delivery is only available in host builds; on device the composed
// email is logged so transitions still leave a trace.
fn deliver_email(config: &RuntimeConfig, event: &NotificationEvent) {
    if config.smtp.is_configured() {
        warn!(
            "smtp delivery unavailable on device; dropping email `{}`",
            event.subject
        );
    } else {
        debug!("smtp not configured, skipping email `{}`", event.subject);
    }
}

fn send_sms(config: &RuntimeConfig, event: &NotificationEvent) -> anyhow::Result<()> {
    let url = format!(
        "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
        config.sms.account_sid
    );
    let auth = format!(
        "Basic {}",
        BASE64.encode(format!(
            "{}:{}",
            config.sms.account_sid, config.sms.auth_token
        ))
    );
    let body = serde_urlencoded::to_string([
        ("To", config.sms.to_number.as_str()),
        ("From", config.sms.from_number.as_str()),
        ("Body", event.sms_body.as_str()),
    ])?;

    let mut client = new_http_client()?;
    let headers = [
        ("Authorization", auth.as_str()),
        ("Content-Type", "application/x-www-form-urlencoded"),
    ];
    let mut request = client.request(Method::Post, &url, &headers)?;
    request.write_all(body.as_bytes())?;
    let response = request.submit().map_err(|err| anyhow!("{err:?}"))?;

    let status = response.status();
    if status != 201 {
        return Err(anyhow!("gateway rejected the message with status {status}"));
    }
    info!("sms accepted by gateway");
    Ok(())
}

#[derive(Deserialize)]
struct TimeApiResponse {
    datetime: String,
}

fn current_time() -> Option<String> {
    match fetch_time() {
        Ok(timestamp) => Some(timestamp),
        Err(err) => {
            warn!("time lookup failed: {err:#}");
            None
        }
    }
}

fn fetch_time() -> anyhow::Result<String> {
    let mut client = new_http_client()?;
    let request = client.get(TIME_API_URL)?;
    let mut response = request.submit().map_err(|err| anyhow!("{err:?}"))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(anyhow!("time api answered HTTP {status}"));
    }

    let body = read_body(&mut response)?;
    let parsed: TimeApiResponse = serde_json::from_slice(&body)?;
    Ok(parsed
        .datetime
        .split('.')
        .next()
        .unwrap_or(&parsed.datetime)
        .to_string())
}

fn new_http_client() -> anyhow::Result<HttpClient<EspHttpConnection>> {
    let conf = HttpClientConfiguration {
        timeout: Some(HTTP_TIMEOUT),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    Ok(HttpClient::wrap(EspHttpConnection::new(&conf)?))
}

fn read_body(
    response: &mut embedded_svc::http::client::Response<&mut EspHttpConnection>,
) -> anyhow::Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut chunk = [0_u8; 256];
    loop {
        let read = response.read(&mut chunk).map_err(|err| anyhow!("{err:?}"))?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
        if body.len() > MAX_HTTP_BODY {
            return Err(anyhow!("response body too large"));
        }
    }
    Ok(body)
}

fn serve_status(
    config: &RuntimeConfig,
    state: &StateStore,
    sensor: &Mutex<VoltageSensor>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind("0.0.0.0:80").context("binding status server on port 80")?;
    info!("status server listening on port 80");

    // One client at a time; the page is a single fixed document.
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!("accept failed: {err}");
                continue;
            }
        };
        if let Err(err) = handle_client(stream, config, state, sensor) {
            warn!("client error: {err:#}");
        }
    }
    Ok(())
}

fn handle_client(
    mut stream: std::net::TcpStream,
    config: &RuntimeConfig,
    state: &StateStore,
    sensor: &Mutex<VoltageSensor>,
) -> anyhow::Result<()> {
    stream.set_read_timeout(Some(CLIENT_IO_TIMEOUT))?;
    stream.set_write_timeout(Some(CLIENT_IO_TIMEOUT))?;

    // The request itself is irrelevant; every path gets the same page.
    let mut buf = [0_u8; 1024];
    let _ = std::io::Read::read(&mut stream, &mut buf)?;

    // Serve a fresh reading rather than the last cycle's.
    let volts = sensor.lock().unwrap().sample()?;
    let condition = classify(volts);
    if state.get() != Some(condition) {
        debug!("page reading ahead of monitor cycle: {}", condition.as_str());
    }

    let snapshot = StatusSnapshot::new(condition, volts);
    let page = render_status_page(&config.device.name, &config.device.location, snapshot);
    std::io::Write::write_all(&mut stream, http_ok(&page).as_bytes())?;
    stream.shutdown(std::net::Shutdown::Both)?;
    Ok(())
}
