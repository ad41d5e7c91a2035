//! Webhook notification delivery.
//!
//! POSTs the rendered [`Notification`] as JSON to the configured URL. Any
//! non-2xx answer is a [`NotifierError::Rejected`]; connection errors and
//! timeouts are [`NotifierError::Delivery`]. The caller decides whether the
//! delivery is recorded in `notification_history`.

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;

use crate::alerts::notifier::{Notification, NotifierError};

/// JSON body sent to the webhook receiver.
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    #[serde(flatten)]
    notification: &'a Notification,
    source: &'static str,
}

/// Deliver `notification` to `url`.
pub async fn deliver(
    http: &Client,
    url: &str,
    timeout: Duration,
    notification: &Notification,
) -> Result<(), NotifierError> {
    let payload = WebhookPayload {
        notification,
        source: "nowcast-monitor",
    };

    let response = http
        .post(url)
        .timeout(timeout)
        .json(&payload)
        .send()
        .await
        .map_err(|e| NotifierError::Delivery {
            message: format!("POST {} failed: {}", url, e),
        })?;

    let status = response.status();
    if !status.is_success() {
        tracing::warn!("Webhook {} answered HTTP {}", url, status);
        return Err(NotifierError::Rejected {
            status: status.as_u16(),
        });
    }

    tracing::debug!("Webhook delivered '{}' to {}", notification.subject, url);
    Ok(())
}
