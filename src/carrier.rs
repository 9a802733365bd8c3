//! Carrier REST client and webhook signature verification
//!
//! Thin wrapper around the Twilio-shaped "place an outbound call" REST
//! call, plus the HMAC-SHA1 webhook signature scheme Twilio uses to let a
//! receiver confirm a webhook really came from the carrier.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use tracing::warn;

use crate::config::CarrierConfig;
use crate::error::CoreError;

type HmacSha1 = Hmac<Sha1>;

pub struct CarrierClient {
    http: reqwest::Client,
    config: CarrierConfig,
}

impl CarrierClient {
    pub fn new(config: CarrierConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Place an outbound call, pointing the carrier at `twiml_url` for
    /// markup and `status_callback_url` for status updates. Returns the
    /// carrier-assigned call SID.
    pub async fn place_call(&self, to: &str, twiml_url: &str, status_callback_url: &str) -> Result<String, CoreError> {
        #[derive(serde::Deserialize)]
        struct CallResponse {
            sid: String,
        }

        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Calls.json",
            self.config.account_sid
        );
        let params = [
            ("To", to),
            ("From", &self.config.from_number),
            ("Url", twiml_url),
            ("StatusCallback", status_callback_url),
            ("StatusCallbackEvent", "initiated ringing answered completed"),
        ];

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| CoreError::Carrier(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::Carrier(format!("carrier returned {status}: {body}")));
        }

        response
            .json::<CallResponse>()
            .await
            .map(|r| r.sid)
            .map_err(|e| CoreError::Carrier(e.to_string()))
    }

    /// Verify a Twilio-style `X-Twilio-Signature` header: HMAC-SHA1 over
    /// the full request URL with sorted `key+value` pairs appended,
    /// base64-encoded, compared against the header. Returns `true`
    /// (accepting the request) when no signing key is configured, which
    /// is only appropriate for local development (§6.1 webhook auth).
    pub fn verify_signature(&self, url: &str, params: &[(String, String)], signature: &str) -> bool {
        let Some(key) = &self.config.webhook_signing_key else {
            return true;
        };

        let mut sorted = params.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let mut data = url.to_string();
        for (k, v) in &sorted {
            data.push_str(k);
            data.push_str(v);
        }

        let Ok(mut mac) = HmacSha1::new_from_slice(key.as_bytes()) else {
            warn!("failed to construct hmac for webhook signature verification");
            return false;
        };
        mac.update(data.as_bytes());
        let expected = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        expected == signature
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with_key(key: &str) -> CarrierClient {
        let mut config = crate::config::Config::for_tests().carrier;
        config.webhook_signing_key = Some(key.to_string());
        CarrierClient::new(config)
    }

    #[test]
    fn verify_signature_accepts_matching_signature() {
        let client = client_with_key("secret");
        let params = vec![("CallStatus".to_string(), "completed".to_string())];
        let url = "https://example.com/webhooks/status/123";

        let mut mac = HmacSha1::new_from_slice(b"secret").unwrap();
        mac.update(format!("{url}CallStatuscompleted").as_bytes());
        let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        assert!(client.verify_signature(url, &params, &signature));
    }

    #[test]
    fn verify_signature_rejects_tampered_signature() {
        let client = client_with_key("secret");
        let params = vec![("CallStatus".to_string(), "completed".to_string())];
        assert!(!client.verify_signature("https://example.com/webhooks/status/123", &params, "bogus"));
    }

    #[test]
    fn verify_signature_accepts_anything_when_no_key_configured() {
        let config = crate::config::Config::for_tests().carrier;
        let client = CarrierClient::new(config);
        assert!(client.verify_signature("https://example.com", &[], "whatever"));
    }
}
