//! Alert Dispatcher (§4.7): multi-channel fan-out with per-channel
//! cooldown. Never throws; channel failures are logged as warnings.

use dashmap::DashMap;
use jobcrawler_core::config::AlertConfig;
use jobcrawler_metrics::Severity;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Slack,
    GenericWebhook,
    Sendmail,
}

pub struct AlertDispatcher {
    config: AlertConfig,
    client: reqwest::Client,
    last_sent: DashMap<(Channel, String), chrono::DateTime<chrono::Utc>>,
}

impl AlertDispatcher {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            last_sent: DashMap::new(),
        }
    }

    fn severity_key(severity: Severity) -> String {
        format!("{severity:?}")
    }

    fn in_cooldown(&self, channel: Channel, severity: Severity) -> bool {
        let key = (channel, Self::severity_key(severity));
        match self.last_sent.get(&key) {
            Some(last) => {
                chrono::Utc::now() - *last < chrono::Duration::minutes(self.config.cooldown_minutes)
            }
            None => false,
        }
    }

    fn mark_sent(&self, channel: Channel, severity: Severity) {
        self.last_sent
            .insert((channel, Self::severity_key(severity)), chrono::Utc::now());
    }

    /// Fan out `message` to every configured channel whose cooldown has
    /// elapsed. Never propagates a channel failure — each is logged and
    /// the next channel still runs.
    pub async fn dispatch(&self, severity: Severity, message: &str) {
        if !self.config.enabled {
            return;
        }

        if let Some(url) = &self.config.slack_webhook_url {
            self.send_webhook(Channel::Slack, severity, url, &slack_payload(message)).await;
        }
        if let Some(url) = &self.config.generic_webhook_url {
            let body = serde_json::json!({ "severity": format!("{severity:?}"), "message": message });
            self.send_webhook(Channel::GenericWebhook, severity, url, &body).await;
        }
        if let Some(to) = &self.config.sendmail_to {
            self.send_sendmail(severity, to, message).await;
        }
    }

    async fn send_webhook(
        &self,
        channel: Channel,
        severity: Severity,
        url: &str,
        body: &serde_json::Value,
    ) {
        if self.in_cooldown(channel, severity) {
            return;
        }
        match self.client.post(url).json(body).send().await {
            Ok(resp) if resp.status().is_success() => self.mark_sent(channel, severity),
            Ok(resp) => warn!(channel = ?channel, status = %resp.status(), "alert webhook rejected"),
            Err(e) => warn!(channel = ?channel, error = %e, "alert webhook failed"),
        }
    }

    async fn send_sendmail(&self, severity: Severity, to: &str, message: &str) {
        if self.in_cooldown(Channel::Sendmail, severity) {
            return;
        }
        let body = format!("Subject: [{severity:?}] job-crawler alert\n\n{message}\n");
        match tokio::process::Command::new("sendmail")
            .arg(to)
            .stdin(std::process::Stdio::piped())
            .spawn()
        {
            Ok(mut child) => {
                if let Some(mut stdin) = child.stdin.take() {
                    use tokio::io::AsyncWriteExt;
                    if let Err(e) = stdin.write_all(body.as_bytes()).await {
                        warn!(error = %e, "sendmail write failed");
                        return;
                    }
                }
                match child.wait().await {
                    Ok(status) if status.success() => self.mark_sent(Channel::Sendmail, severity),
                    Ok(status) => warn!(%status, "sendmail exited non-zero"),
                    Err(e) => warn!(error = %e, "sendmail wait failed"),
                }
            }
            Err(e) => warn!(error = %e, "sendmail spawn failed"),
        }
    }
}

fn slack_payload(message: &str) -> serde_json::Value {
    serde_json::json!({ "text": message })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(cooldown_minutes: i64) -> AlertConfig {
        AlertConfig {
            enabled: true,
            slack_webhook_url: None,
            generic_webhook_url: None,
            sendmail_to: None,
            cooldown_minutes,
        }
    }

    #[test]
    fn second_send_within_cooldown_is_suppressed() {
        let dispatcher = AlertDispatcher::new(cfg(15));
        assert!(!dispatcher.in_cooldown(Channel::Slack, Severity::Critical));
        dispatcher.mark_sent(Channel::Slack, Severity::Critical);
        assert!(dispatcher.in_cooldown(Channel::Slack, Severity::Critical));
    }

    #[test]
    fn cooldown_is_per_channel_and_severity() {
        let dispatcher = AlertDispatcher::new(cfg(15));
        dispatcher.mark_sent(Channel::Slack, Severity::Critical);
        assert!(!dispatcher.in_cooldown(Channel::Slack, Severity::Warning));
        assert!(!dispatcher.in_cooldown(Channel::GenericWebhook, Severity::Critical));
    }

    #[tokio::test]
    async fn disabled_dispatcher_sends_nothing() {
        let mut c = cfg(15);
        c.enabled = false;
        c.generic_webhook_url = Some("http://127.0.0.1:1/unreachable".to_string());
        let dispatcher = AlertDispatcher::new(c);
        dispatcher.dispatch(Severity::Critical, "test").await;
        assert!(!dispatcher.in_cooldown(Channel::GenericWebhook, Severity::Critical));
    }
}
