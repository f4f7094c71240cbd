//! Microsoft Graph / identity-platform adapters: the concrete backends for
//! the injected collaborators `collections_auth::TokenRefresher`,
//! `collections_scheduler::MailSender`, and `collections_reply::InboxReader`.
//! Kept out of the library crates themselves (spec §1: "swap the concrete
//! provider without touching the scoring/scheduling logic").

use collections_auth::validator::{RefreshError, RefreshedToken, TokenRefresher};
use collections_reply::{InboxMessage, InboxReader, ReaderError};
use collections_scheduler::{MailSender, MessageId, ReminderMessage, SendOutcome};
use serde::Deserialize;
use time::OffsetDateTime;

const AUTHORITY: &str = "https://login.microsoftonline.com";
const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";

pub struct OAuthConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub scope: String,
}

pub struct GraphTokenRefresher {
    http: reqwest::blocking::Client,
    config: OAuthConfig,
}

impl GraphTokenRefresher {
    pub fn new(http: reqwest::blocking::Client, config: OAuthConfig) -> Self {
        Self { http, config }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
    expires_in: i64,
    refresh_token: Option<String>,
    scope: Option<String>,
}

impl TokenRefresher for GraphTokenRefresher {
    fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, RefreshError> {
        let url = format!("{AUTHORITY}/{}/oauth2/v2.0/token", self.config.tenant_id);
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("client_id", &self.config.client_id),
            ("refresh_token", refresh_token),
            ("scope", &self.config.scope),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret));
        }

        let response = self
            .http
            .post(&url)
            .form(&form)
            .send()
            .map_err(|e| RefreshError { message: e.to_string() })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(RefreshError {
                message: format!("token endpoint returned {status}: {body}"),
            });
        }

        let parsed: TokenResponse = response.json().map_err(|e| RefreshError { message: e.to_string() })?;
        Ok(RefreshedToken {
            access_token: parsed.access_token,
            token_type: parsed.token_type,
            expires_at: OffsetDateTime::now_utc() + time::Duration::seconds(parsed.expires_in),
            refresh_token: parsed.refresh_token,
            scope: parsed.scope,
        })
    }
}

/// Sends mail through `POST /users/{account}/sendMail`. One instance is
/// built per cycle with that cycle's freshly-validated access token, since
/// [`MailSender::send`] is synchronous and carries no token parameter.
pub struct GraphMailClient {
    http: reqwest::blocking::Client,
    access_token: String,
    account: String,
}

impl GraphMailClient {
    pub fn new(http: reqwest::blocking::Client, access_token: String, account: String) -> Self {
        Self { http, access_token, account }
    }
}

impl MailSender for GraphMailClient {
    fn send(&self, msg: &ReminderMessage<'_>) -> Result<MessageId, SendOutcome> {
        let url = format!("{GRAPH_BASE}/users/{}/sendMail", self.account);
        let body = serde_json::json!({
            "message": {
                "subject": format!("Invoice {} — {}", msg.invoice.number, msg.template),
                "body": { "contentType": "Text", "content": render_body(msg) },
                "toRecipients": [{ "emailAddress": { "address": msg.to } }],
            },
            "saveToSentItems": true,
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .map_err(|e| SendOutcome::Transient(e.to_string()))?;

        match response.status().as_u16() {
            202 | 200 => Ok(format!("{}:{}", msg.invoice.number, msg.rule_id)),
            401 | 403 => Err(SendOutcome::AuthError(response.text().unwrap_or_default())),
            429 => Err(SendOutcome::RateLimited),
            _ => Err(SendOutcome::Transient(response.text().unwrap_or_default())),
        }
    }
}

fn render_body(msg: &ReminderMessage<'_>) -> String {
    format!(
        "Dear {},\n\nThis is a {} notice for invoice {} (amount {}), due {}.\n\nPlease remit payment at your earliest convenience.",
        msg.invoice.client,
        msg.rule_id,
        msg.invoice.number,
        msg.invoice.amount,
        msg.invoice.due_day(),
    )
}

#[derive(Deserialize)]
struct GraphMessage {
    subject: Option<String>,
    #[serde(rename = "bodyPreview")]
    body_preview: Option<String>,
    from: Option<GraphFrom>,
}

#[derive(Deserialize)]
struct GraphFrom {
    #[serde(rename = "emailAddress")]
    email_address: GraphEmailAddress,
}

#[derive(Deserialize)]
struct GraphEmailAddress {
    address: String,
}

#[derive(Deserialize)]
struct GraphMessagesPage {
    value: Vec<GraphMessage>,
}

/// Long-lived [`InboxReader`] wrapping a [`GraphInboxClient`] behind a
/// swappable access token. [`collections_reply::ReplyClassifier`] owns its
/// reader for the life of the process (so `last_check` advances across
/// cycles instead of resetting), but the access token it should use changes
/// every time the validator refreshes — this adapter lets the caller update
/// the token in place with [`RotatingInboxReader::set_token`] before each
/// `check_replies` call rather than rebuilding the classifier.
pub struct RotatingInboxReader {
    http: reqwest::blocking::Client,
    account: String,
    token: std::sync::Mutex<String>,
}

impl RotatingInboxReader {
    pub fn new(http: reqwest::blocking::Client, account: String) -> Self {
        Self {
            http,
            account,
            token: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn set_token(&self, access_token: String) {
        *self.token.lock().expect("token mutex poisoned") = access_token;
    }
}

impl InboxReader for RotatingInboxReader {
    fn messages_since(&self, since: Option<OffsetDateTime>, senders: &[String]) -> Result<Vec<InboxMessage>, ReaderError> {
        let token = self.token.lock().expect("token mutex poisoned").clone();
        GraphInboxClient::new(self.http.clone(), token, self.account.clone()).messages_since(since, senders)
    }
}

/// Reads `GET /users/{account}/mailFolders/Inbox/messages` filtered to
/// senders the scheduler cares about, built fresh per call by
/// [`RotatingInboxReader`].
pub struct GraphInboxClient {
    http: reqwest::blocking::Client,
    access_token: String,
    account: String,
}

impl GraphInboxClient {
    pub fn new(http: reqwest::blocking::Client, access_token: String, account: String) -> Self {
        Self { http, access_token, account }
    }
}

impl InboxReader for GraphInboxClient {
    fn messages_since(&self, since: Option<OffsetDateTime>, senders: &[String]) -> Result<Vec<InboxMessage>, ReaderError> {
        let mut filters = Vec::new();
        if let Some(since) = since {
            let ts = since.format(&time::format_description::well_known::Rfc3339).map_err(|e| ReaderError::Failed(e.to_string()))?;
            filters.push(format!("receivedDateTime ge {ts}"));
        }
        let sender_filter = senders
            .iter()
            .map(|s| format!("from/emailAddress/address eq '{s}'"))
            .collect::<Vec<_>>()
            .join(" or ");
        if !sender_filter.is_empty() {
            filters.push(format!("({sender_filter})"));
        }

        let url = format!("{GRAPH_BASE}/users/{}/mailFolders/Inbox/messages", self.account);
        let mut request = self.http.get(&url).bearer_auth(&self.access_token);
        if !filters.is_empty() {
            request = request.query(&[("$filter", filters.join(" and "))]);
        }

        let response = request.send().map_err(|e| ReaderError::Failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ReaderError::Failed(format!("Graph returned {}", response.status())));
        }
        let page: GraphMessagesPage = response.json().map_err(|e| ReaderError::Failed(e.to_string()))?;

        Ok(page
            .value
            .into_iter()
            .map(|m| InboxMessage {
                subject: m.subject.unwrap_or_default(),
                body: m.body_preview.unwrap_or_default(),
                from_address: m.from.map(|f| f.email_address.address).unwrap_or_default(),
            })
            .collect())
    }
}
