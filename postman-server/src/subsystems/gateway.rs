//! HTTP mail gateway client
//!
//! The server does not speak SMTP/IMAP itself. It talks JSON to a small
//! gateway service that owns the mailbox:
//!
//! - `GET  {base}/messages?unread=true&subject=<tag>` → `[RawMail]`
//! - `POST {base}/messages/{uid}/read`
//! - `POST {base}/messages` with an [`OutgoingMail`] body
//!
//! Each call is retried a few times with jittered backoff before the error
//! reaches the caller.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use postman_core::config::MailConfig;

use super::mail::{MailError, MailTransport, OutgoingMail, RawMail};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub user: String,
    pub password: Option<String>,
    pub timeout: Duration,
    pub retry_attempts: usize,
    pub retry_delay_ms: u64,
}

impl From<&MailConfig> for GatewayConfig {
    fn from(config: &MailConfig) -> Self {
        Self {
            user: config.user.clone(),
            password: config.password.clone(),
            timeout: Duration::from_secs(config.request_timeout_secs),
            retry_attempts: 2,
            retry_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpMailGateway {
    client: Client,
    config: GatewayConfig,
    base_url: String,
}

impl HttpMailGateway {
    pub fn new(mail: &MailConfig) -> Result<Self, MailError> {
        if mail.gateway_url.trim().is_empty() {
            return Err(MailError::InvalidConfig("mail.gateway_url is empty".into()));
        }
        Self::with_base_url(GatewayConfig::from(mail), mail.gateway_url.clone())
    }

    /// Create a client with a custom base URL (for testing / integration)
    pub fn with_base_url(config: GatewayConfig, base_url: String) -> Result<Self, MailError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            config,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.config.password {
            Some(password) => req.basic_auth(&self.config.user, Some(password)),
            None => req,
        }
    }

    async fn with_retry<F, Fut>(&self, op: &'static str, call: F) -> Result<Response, MailError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<Response, MailError>>,
    {
        let strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.config.retry_attempts);

        Retry::spawn(strategy, call).await.map_err(|e| {
            tracing::error!(op, attempts = self.config.retry_attempts + 1, error = %e, "Mail gateway call failed");
            match e {
                MailError::Gateway { code, message } if (400..500).contains(&code) => {
                    MailError::Gateway { code, message }
                }
                other => MailError::RetryExhausted {
                    attempts: self.config.retry_attempts + 1,
                    last: other.to_string(),
                },
            }
        })
    }
}

async fn check(response: Response) -> Result<Response, MailError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(MailError::Gateway {
        code: status.as_u16(),
        message,
    })
}

#[async_trait]
impl MailTransport for HttpMailGateway {
    async fn fetch_unread(&self, subject_tag: &str) -> Result<Vec<RawMail>, MailError> {
        let url = format!("{}/messages", self.base_url);
        let response = self
            .with_retry("fetch_unread", || async {
                let req = self
                    .client
                    .get(&url)
                    .query(&[("unread", "true"), ("subject", subject_tag)]);
                check(self.authed(req).send().await?).await
            })
            .await?;
        Ok(response.json().await?)
    }

    async fn mark_read(&self, uid: &str) -> Result<(), MailError> {
        let url = format!("{}/messages/{}/read", self.base_url, uid);
        self.with_retry("mark_read", || async {
            check(self.authed(self.client.post(&url)).send().await?).await
        })
        .await?;
        Ok(())
    }

    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        let url = format!("{}/messages", self.base_url);
        self.with_retry("send", || async {
            check(self.authed(self.client.post(&url).json(mail)).send().await?).await
        })
        .await?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(password: Option<&str>) -> GatewayConfig {
        GatewayConfig {
            user: "me@example.com".to_string(),
            password: password.map(str::to_string),
            timeout: Duration::from_secs(5),
            retry_attempts: 2,
            retry_delay_ms: 10,
        }
    }

    #[tokio::test]
    async fn test_fetch_unread_filters_by_subject() {
        let mock_server = MockServer::start().await;
        let gateway = HttpMailGateway::with_base_url(test_config(None), mock_server.uri()).unwrap();

        Mock::given(method("GET"))
            .and(path("/messages"))
            .and(query_param("unread", "true"))
            .and(query_param("subject", "[claude-postman]"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "uid": "42",
                    "from": "me@example.com",
                    "subject": "Re: [claude-postman] New Session",
                    "body": "hello",
                    "message_id": "<a@b>",
                    "in_reply_to": "<t@claude-postman>"
                }
            ])))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mails = gateway.fetch_unread("[claude-postman]").await.unwrap();
        assert_eq!(mails.len(), 1);
        assert_eq!(mails[0].uid, "42");
        assert_eq!(mails[0].in_reply_to.as_deref(), Some("<t@claude-postman>"));
        assert!(mails[0].references.is_empty());
    }

    #[tokio::test]
    async fn test_send_posts_json_with_auth() {
        let mock_server = MockServer::start().await;
        let gateway =
            HttpMailGateway::with_base_url(test_config(Some("secret")), mock_server.uri()).unwrap();

        let mail = OutgoingMail {
            from: "me@example.com".into(),
            to: "me@example.com".into(),
            subject: "result".into(),
            html_body: "<pre>ok</pre>".into(),
            message_id: Some("<m@claude-postman>".into()),
            in_reply_to: None,
        };

        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header_exists("authorization"))
            .and(body_json(&mail))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&mock_server)
            .await;

        gateway.send(&mail).await.unwrap();
    }

    #[tokio::test]
    async fn test_mark_read_hits_uid_path() {
        let mock_server = MockServer::start().await;
        let gateway = HttpMailGateway::with_base_url(test_config(None), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .and(path("/messages/7/read"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        gateway.mark_read("7").await.unwrap();
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_then_reported() {
        let mock_server = MockServer::start().await;
        let gateway = HttpMailGateway::with_base_url(test_config(None), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .expect(3)
            .mount(&mock_server)
            .await;

        let mail = OutgoingMail {
            from: "a".into(),
            to: "a".into(),
            subject: "s".into(),
            html_body: "b".into(),
            message_id: None,
            in_reply_to: None,
        };
        let err = gateway.send(&mail).await.unwrap_err();
        assert!(
            matches!(err, MailError::RetryExhausted { attempts: 3, .. }),
            "got {:?}",
            err
        );
    }

    #[tokio::test]
    async fn test_empty_gateway_url_rejected() {
        let config = MailConfig {
            user: "me@example.com".into(),
            ..Default::default()
        };
        assert!(matches!(
            HttpMailGateway::new(&config),
            Err(MailError::InvalidConfig(_))
        ));
    }
}
