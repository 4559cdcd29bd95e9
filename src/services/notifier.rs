use serde_json::json;

use crate::models::Alert;

/// Telegram notification service. Failures are logged but never block the main flow.
#[derive(Debug, Clone)]
pub struct Notifier {
    http: reqwest::Client,
    bot_token: String,
    chat_id: String,
}

impl Notifier {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            bot_token,
            chat_id,
        }
    }

    /// Send a Telegram message. Failures are logged as warnings.
    pub async fn send(&self, message: &str) {
        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            self.bot_token
        );

        let body = json!({
            "chat_id": self.chat_id,
            "text": message,
            "parse_mode": "Markdown",
        });

        match self.http.post(&url).json(&body).send().await {
            Ok(resp) => {
                if !resp.status().is_success() {
                    tracing::warn!(
                        status = %resp.status(),
                        "Telegram sendMessage returned non-2xx"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to send Telegram notification");
            }
        }
    }
}

fn short(s: &str) -> String {
    if s.len() > 10 {
        format!("{}...{}", &s[..6], &s[s.len() - 4..])
    } else {
        s.to_string()
    }
}

/// Format a detector alert for Telegram.
pub fn format_alert(alert: &Alert) -> String {
    let market = alert
        .asset_id
        .as_deref()
        .map(|a| a[..16.min(a.len())].to_string())
        .unwrap_or_else(|| "multiple".into());

    let addresses: Vec<String> = alert.addresses.iter().take(5).map(|a| short(a)).collect();

    format!(
        "*{} ({})*\nConfidence: {}%\nTrades: {}\nVolume: ${} USDC\nMarket: `{}`\nAddresses: `{}`",
        alert.alert_type,
        alert.severity,
        (alert.confidence * 100.0).round(),
        alert.trade_count,
        alert.volume.round_dp(2),
        market,
        addresses.join(", "),
    )
}
