use crate::types::Condition;

/// Everything one status page render needs. Built per request, never cached.
#[derive(Debug, Clone, Copy)]
pub struct StatusSnapshot {
    pub condition: Condition,
    pub volts: f32,
}

impl StatusSnapshot {
    pub fn new(condition: Condition, volts: f32) -> Self {
        Self { condition, volts }
    }

    pub fn label(self) -> &'static str {
        match self.condition {
            Condition::Alert => "LOW ON COINS",
            Condition::Normal => "COINS OK",
        }
    }

    pub fn detail(self) -> &'static str {
        match self.condition {
            Condition::Alert => "Coin dispenser needs to be refilled!",
            Condition::Normal => "Coin dispenser is operational",
        }
    }

    pub fn background_color(self) -> &'static str {
        match self.condition {
            Condition::Alert => "#FFB6C1",
            Condition::Normal => "#90EE90",
        }
    }

    pub fn text_color(self) -> &'static str {
        match self.condition {
            Condition::Alert => "#8B0000",
            Condition::Normal => "#006400",
        }
    }
}

/// Renders the fixed status document. Pure; the caller owns all I/O.
pub fn render_status_page(device: &str, location: &str, snapshot: StatusSnapshot) -> String {
    format!(
        r#"<html>
<head>
    <title>Coin Dispenser Monitor</title>
    <meta http-equiv="refresh" content="10">
</head>
<body style="text-align: center; padding: 20px;">
    <h1>{device} Monitor</h1>
    <p>{location}</p>
    <div style="padding: 20px; margin: 20px; border-radius: 8px; background-color: {background}; color: {text};">
        <h2>Status: {label}</h2>
        <p>Voltage Reading: {volts:.2}V</p>
        <p style="font-size: 0.9em;">{detail}</p>
    </div>
    <p style="color: #666;">Monitoring coin level sensor on the analog input</p>
    <p style="color: #666;">Monitoring is active even when this page is closed</p>
</body>
</html>
"#,
        device = device,
        location = location,
        background = snapshot.background_color(),
        text = snapshot.text_color(),
        label = snapshot.label(),
        volts = snapshot.volts,
        detail = snapshot.detail(),
    )
}

/// Wraps a rendered page in the one response the status server ever sends.
pub fn http_ok(html: &str) -> String {
    format!("HTTP/1.0 200 OK\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n{html}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_page_shows_alert_texture() {
        let snapshot = StatusSnapshot::new(Condition::Alert, 2.73);
        let page = render_status_page("Coin Dispenser", "Game Room", snapshot);

        assert!(page.contains("LOW ON COINS"));
        assert!(page.contains("2.73"));
        assert!(page.contains("#FFB6C1"));
        assert!(page.contains("Coin Dispenser Monitor"));
        assert!(page.contains("Game Room"));
    }

    #[test]
    fn normal_page_shows_normal_texture() {
        let snapshot = StatusSnapshot::new(Condition::Normal, 1.2);
        let page = render_status_page("Coin Dispenser", "Game Room", snapshot);

        assert!(page.contains("COINS OK"));
        assert!(page.contains("#90EE90"));
        assert!(page.contains("Coin dispenser is operational"));
    }

    #[test]
    fn page_auto_refreshes_every_ten_seconds() {
        let snapshot = StatusSnapshot::new(Condition::Normal, 0.0);
        let page = render_status_page("d", "l", snapshot);

        assert!(page.contains(r#"<meta http-equiv="refresh" content="10">"#));
    }

    #[test]
    fn http_ok_wraps_the_page() {
        let response = http_ok("<html></html>");

        assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(response.contains("Content-Type: text/html\r\n"));
        assert!(response.ends_with("\r\n\r\n<html></html>"));
    }
}
