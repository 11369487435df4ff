use anyhow::{Context, Result};
use serde_json::json;
use std::future::Future;
use std::time::Duration;

use crate::config::Config;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Delivery collaborators for alert notifications. Each channel may fail
/// independently; callers decide which channels to attempt and record only
/// the ones that succeeded.
pub trait AlertChannels: Send + Sync {
    /// Recipient address when email delivery is configured, `None` otherwise.
    fn email_recipient(&self) -> Option<&str>;

    fn chat_enabled(&self) -> bool;

    fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    fn send_chat(&self, text: &str) -> impl Future<Output = Result<()>> + Send;
}

/// HTTP-backed channels: a JSON mail relay and a chat webhook.
#[derive(Clone, Debug)]
pub struct HttpChannels {
    http: reqwest::Client,
    email_to: Option<String>,
    mail_relay_url: Option<String>,
    mail_relay_token: Option<String>,
    chat_webhook_url: Option<String>,
    chat_webhook_token: Option<String>,
}

impl HttpChannels {
    pub fn from_config(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            email_to: config.alert_email_to.clone(),
            mail_relay_url: config.mail_relay_url.clone(),
            mail_relay_token: config.mail_relay_token.clone(),
            chat_webhook_url: config.chat_webhook_url.clone(),
            chat_webhook_token: config.chat_webhook_token.clone(),
        }
    }
}

impl AlertChannels for HttpChannels {
    fn email_recipient(&self) -> Option<&str> {
        if self.mail_relay_url.is_none() {
            return None;
        }
        self.email_to.as_deref()
    }

    fn chat_enabled(&self) -> bool {
        self.chat_webhook_url.is_some()
    }

    fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> impl Future<Output = Result<()>> + Send {
        let payload = json!({ "to": to, "subject": subject, "body": body });
        async move {
            let url = self
                .mail_relay_url
                .as_deref()
                .context("mail relay is not configured")?;
            let mut request = self.http.post(url).timeout(SEND_TIMEOUT).json(&payload);
            if let Some(token) = &self.mail_relay_token {
                request = request.bearer_auth(token);
            }
            request.send().await?.error_for_status()?;
            Ok(())
        }
    }

    fn send_chat(&self, text: &str) -> impl Future<Output = Result<()>> + Send {
        let payload = json!({ "text": text });
        async move {
            let url = self
                .chat_webhook_url
                .as_deref()
                .context("chat webhook is not configured")?;
            let mut request = self.http.post(url).timeout(SEND_TIMEOUT).json(&payload);
            if let Some(token) = &self.chat_webhook_token {
                request = request.bearer_auth(token);
            }
            request.send().await?.error_for_status()?;
            Ok(())
        }
    }
}
