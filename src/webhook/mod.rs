/// Webhook notifier
///
/// Posts a best-effort notification once a job completes. Failures are
/// logged but never fail the job. The payload is signed with HMAC-SHA256
/// over the shared secret so the receiver can verify it actually came from
/// here rather than trusting a bare shared value in a header.
use crate::config::WebhookConfig;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    job_id: &'a str,
    correlation_id: Option<&'a str>,
    hls_master_url: &'a str,
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("reqwest client builds with a fixed timeout");
        Self { client, config }
    }

    pub async fn notify_completed(&self, job_id: &str, correlation_id: Option<&str>, hls_master_url: &str) {
        let payload = WebhookPayload {
            job_id,
            correlation_id,
            hls_master_url,
        };

        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "failed to serialize webhook payload");
                return;
            }
        };
        let signature = sign_payload(&self.config.shared_secret, &body);

        let result = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Signature", format!("sha256={signature}"))
            .body(body)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(job_id, "webhook notification delivered");
            }
            Ok(response) => {
                tracing::warn!(job_id, status = %response.status(), "webhook notification rejected");
            }
            Err(e) => {
                tracing::warn!(job_id, error = %e, "webhook notification failed");
            }
        }
    }
}

fn sign_payload(shared_secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(shared_secret.as_bytes()).expect("HMAC accepts a key of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_payload_is_deterministic_and_keyed() {
        let body = br#"{"job_id":"abc"}"#;
        let sig_a = sign_payload("secret-one", body);
        let sig_b = sign_payload("secret-one", body);
        let sig_c = sign_payload("secret-two", body);

        assert_eq!(sig_a, sig_b);
        assert_ne!(sig_a, sig_c);
        assert_eq!(sig_a.len(), 64, "hex-encoded SHA-256 digest is 64 chars");
    }
}
