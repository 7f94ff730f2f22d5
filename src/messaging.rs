use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::MessagingSettings;
use crate::sequences::models::Channel;
use crate::sequences::template::RenderedMessage;

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct DispatchReceipt {
    pub provider_message_id: String,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("messaging provider not configured: {0}")]
    NotConfigured(&'static str),
    #[error("channel {} is not supported by this provider", .0.as_str())]
    Unsupported(Channel),
    #[error("provider rejected message ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("provider response carried no message id")]
    MissingReceipt,
    #[error("provider call timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// key: messaging-provider -> outbound sms/voice/email dispatch
#[async_trait]
pub trait MessagingProvider: Send + Sync {
    async fn send(
        &self,
        channel: Channel,
        destination: &str,
        message: &RenderedMessage,
    ) -> Result<DispatchReceipt, DispatchError>;
}

/// Twilio REST client for SMS and voice, with email relayed to a JSON endpoint.
pub struct TwilioMessenger {
    base: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
    status_callback_url: Option<String>,
    email_endpoint: Option<String>,
    client: Client,
}

impl TwilioMessenger {
    pub fn new(settings: &MessagingSettings) -> Result<Self, DispatchError> {
        let account_sid = settings
            .account_sid
            .clone()
            .ok_or(DispatchError::NotConfigured("account sid"))?;
        let auth_token = settings
            .auth_token
            .clone()
            .ok_or(DispatchError::NotConfigured("auth token"))?;
        let from_number = settings
            .from_number
            .clone()
            .ok_or(DispatchError::NotConfigured("from number"))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;
        Ok(Self {
            base: settings.api_base.trim_end_matches('/').to_string(),
            account_sid,
            auth_token,
            from_number,
            status_callback_url: settings.status_callback_url.clone(),
            email_endpoint: settings.email_endpoint.clone(),
            client,
        })
    }

    fn account_url(&self, resource: &str) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/{}.json",
            self.base, self.account_sid, resource
        )
    }

    async fn post_form(
        &self,
        resource: &str,
        form: Vec<(&str, String)>,
    ) -> Result<DispatchReceipt, DispatchError> {
        let response = self
            .client
            .post(self.account_url(resource))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await?;
        receipt(response, "sid").await
    }

    async fn send_sms(
        &self,
        destination: &str,
        message: &RenderedMessage,
    ) -> Result<DispatchReceipt, DispatchError> {
        let mut form = vec![
            ("To", destination.to_string()),
            ("From", self.from_number.clone()),
            ("Body", message.body.clone()),
        ];
        if let Some(callback) = &self.status_callback_url {
            form.push(("StatusCallback", callback.clone()));
        }
        self.post_form("Messages", form).await
    }

    async fn send_voice(
        &self,
        destination: &str,
        message: &RenderedMessage,
    ) -> Result<DispatchReceipt, DispatchError> {
        let twiml = format!(
            "<Response><Say>{}</Say></Response>",
            escape_xml(&message.body)
        );
        let mut form = vec![
            ("To", destination.to_string()),
            ("From", self.from_number.clone()),
            ("Twiml", twiml),
        ];
        if let Some(callback) = &self.status_callback_url {
            form.push(("StatusCallback", callback.clone()));
        }
        self.post_form("Calls", form).await
    }

    async fn send_email(
        &self,
        destination: &str,
        message: &RenderedMessage,
    ) -> Result<DispatchReceipt, DispatchError> {
        let endpoint = self
            .email_endpoint
            .as_deref()
            .ok_or(DispatchError::Unsupported(Channel::Email))?;
        let response = self
            .client
            .post(endpoint)
            .json(&json!({
                "to": destination,
                "subject": message.subject.clone().unwrap_or_default(),
                "body": message.body,
            }))
            .send()
            .await?;
        receipt(response, "id").await
    }
}

#[async_trait]
impl MessagingProvider for TwilioMessenger {
    async fn send(
        &self,
        channel: Channel,
        destination: &str,
        message: &RenderedMessage,
    ) -> Result<DispatchReceipt, DispatchError> {
        let result = match channel {
            Channel::Sms => self.send_sms(destination, message).await,
            Channel::Voice => self.send_voice(destination, message).await,
            Channel::Email => self.send_email(destination, message).await,
        };
        match &result {
            Ok(receipt) => debug!(
                channel = channel.as_str(),
                provider_message_id = %receipt.provider_message_id,
                "message accepted by provider"
            ),
            Err(err) => warn!(?err, channel = channel.as_str(), "message dispatch failed"),
        }
        result
    }
}

/// Stand-in used when no provider credentials are configured; every send fails.
pub struct UnconfiguredMessenger;

#[async_trait]
impl MessagingProvider for UnconfiguredMessenger {
    async fn send(
        &self,
        _channel: Channel,
        _destination: &str,
        _message: &RenderedMessage,
    ) -> Result<DispatchReceipt, DispatchError> {
        Err(DispatchError::NotConfigured("messaging credentials"))
    }
}

async fn receipt(response: reqwest::Response, id_field: &str) -> Result<DispatchReceipt, DispatchError> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("no error message")
            .to_string();
        return Err(DispatchError::Rejected {
            status: status.as_u16(),
            message,
        });
    }
    body.get(id_field)
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(|id| DispatchReceipt {
            provider_message_id: id.to_string(),
        })
        .ok_or(DispatchError::MissingReceipt)
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}
