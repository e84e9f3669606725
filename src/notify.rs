//! Webhook notifier: POSTs form-encoded chain-tip events to the
//! configured URL. Only used in incremental mode, never during the
//! initial bulk sync, since a bulk run has no single "new block" to
//! announce. A failed delivery is logged and swallowed — a missed
//! webhook must never abort an otherwise-successful sync.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct NotifyEvent {
    pub event: &'static str,
    pub coin_type: String,
    pub symbol: String,
    pub height: i64,
    pub hash: String,
    pub timestamp: i64,
    pub addresses: Vec<String>,
}

pub struct Notifier {
    http: reqwest::blocking::Client,
    url: String,
}

impl Notifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("reqwest client"),
            url: url.into(),
        }
    }

    pub fn notify(&self, event: &NotifyEvent) {
        let mut addresses = event.addresses.clone();
        addresses.sort();
        addresses.dedup();
        let addresses = addresses.join(",");
        let height = event.height.to_string();
        let timestamp = event.timestamp.to_string();

        let form = [
            ("event", event.event),
            ("type", event.coin_type.as_str()),
            ("symbol", event.symbol.as_str()),
            ("height", height.as_str()),
            ("hash", event.hash.as_str()),
            ("timestamp", timestamp.as_str()),
            ("addresses", addresses.as_str()),
        ];

        match self.http.post(&self.url).form(&form).send() {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(url = %self.url, event = event.event, "notification delivered");
            }
            Ok(response) => {
                tracing::warn!(url = %self.url, status = %response.status(), "notification rejected");
            }
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "notification delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedups_and_sorts_addresses() {
        let event = NotifyEvent {
            event: "new_block",
            coin_type: "full".into(),
            symbol: "EXA".into(),
            height: 100,
            hash: "abc".into(),
            timestamp: 123,
            addresses: vec!["b".into(), "a".into(), "a".into()],
        };
        let mut addresses = event.addresses.clone();
        addresses.sort();
        addresses.dedup();
        assert_eq!(addresses.join(","), "a,b");
    }
}
