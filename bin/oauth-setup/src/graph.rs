//! Microsoft identity platform device-code flow, plus an optional one-off
//! `sendMail` call to confirm the enrolled token actually works. Kept local
//! to this binary the same way `emailer`'s `graph.rs` keeps its own
//! concrete Graph adapters — each agent owns the provider calls it needs.

use std::{thread, time::Duration as StdDuration};

use anyhow::Context;
use collections_auth::validator::RefreshedToken;
use serde::Deserialize;
use time::OffsetDateTime;

const AUTHORITY: &str = "https://login.microsoftonline.com";
const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

#[derive(Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
    expires_in: i64,
    refresh_token: Option<String>,
    scope: Option<String>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
}

/// Starts the device-code flow, prints the verification URL and user code
/// for the operator to complete in a browser, then polls the token
/// endpoint until the grant is approved (or the code expires).
pub fn run_device_code_flow(http: &reqwest::blocking::Client, tenant_id: &str, client_id: &str, scope: &str) -> anyhow::Result<RefreshedToken> {
    let devicecode_url = format!("{AUTHORITY}/{tenant_id}/oauth2/v2.0/devicecode");
    let response = http
        .post(&devicecode_url)
        .form(&[("client_id", client_id), ("scope", scope)])
        .send()
        .context("failed to start device-code flow")?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        anyhow::bail!("devicecode endpoint returned {status}: {body}");
    }
    let device: DeviceCodeResponse = response.json().context("failed to parse devicecode response")?;

    println!(
        "{}",
        device
            .message
            .unwrap_or_else(|| format!("To sign in, visit {} and enter the code {}", device.verification_uri, device.user_code))
    );

    let token_url = format!("{AUTHORITY}/{tenant_id}/oauth2/v2.0/token");
    let mut interval = StdDuration::from_secs(device.interval.unwrap_or(DEFAULT_POLL_INTERVAL_SECS));

    loop {
        thread::sleep(interval);

        let response = http
            .post(&token_url)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                ("client_id", client_id),
                ("device_code", &device.device_code),
            ])
            .send()
            .context("failed to poll token endpoint")?;

        if response.status().is_success() {
            let parsed: TokenResponse = response.json().context("failed to parse token response")?;
            return Ok(RefreshedToken {
                access_token: parsed.access_token,
                token_type: parsed.token_type,
                expires_at: OffsetDateTime::now_utc() + time::Duration::seconds(parsed.expires_in),
                refresh_token: parsed.refresh_token,
                scope: parsed.scope,
            });
        }

        let body = response.text().unwrap_or_default();
        let error = serde_json::from_str::<TokenErrorResponse>(&body).map(|e| e.error).unwrap_or_default();
        match error.as_str() {
            "authorization_pending" => continue,
            "slow_down" => interval += StdDuration::from_secs(5),
            "expired_token" => anyhow::bail!("device code expired before sign-in was completed"),
            "authorization_declined" => anyhow::bail!("sign-in was declined"),
            _ => anyhow::bail!("token endpoint returned an error: {body}"),
        }
    }
}

/// Sends a one-line confirmation email through `POST /users/{account}/sendMail`,
/// to prove the freshly-enrolled token is actually usable.
pub fn send_test_mail(http: &reqwest::blocking::Client, access_token: &str, account: &str, to: &str) -> anyhow::Result<()> {
    let url = format!("{GRAPH_BASE}/users/{account}/sendMail");
    let body = serde_json::json!({
        "message": {
            "subject": "novotechno-collections OAuth setup",
            "body": { "contentType": "Text", "content": "This test message confirms the collections agent can send mail." },
            "toRecipients": [{ "emailAddress": { "address": to } }],
        },
        "saveToSentItems": false,
    });

    let response = http.post(&url).bearer_auth(access_token).json(&body).send().context("failed to send test mail")?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        anyhow::bail!("sendMail returned {status}: {body}");
    }
    Ok(())
}
