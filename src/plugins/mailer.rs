use async_trait::async_trait;
use lettre::message::header::{Header, HeaderName, HeaderValue};
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum MailError {
    #[error("Invalid mail address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("Could not build mail: {0}")]
    Build(String),
    #[error("SMTP error: {message}")]
    Smtp { message: String, permanent: bool },
}

impl MailError {
    /// Permanent failures will not succeed on retry (bad recipient, rejected credentials).
    pub fn is_permanent(&self) -> bool {
        match self {
            MailError::InvalidAddress { .. } | MailError::Build(_) => true,
            MailError::Smtp { permanent, .. } => *permanent,
        }
    }
}

impl From<lettre::transport::smtp::Error> for MailError {
    fn from(e: lettre::transport::smtp::Error) -> Self {
        MailError::Smtp {
            permanent: e.is_permanent(),
            message: e.to_string(),
        }
    }
}

/// Server and login for one authenticated SMTP session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    pub server: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

/// One outgoing mail. The HTML alternative is derived from `text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub text: String,
    pub unsubscribe_url: Option<String>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Opens a fresh session, sends, and closes it.
    async fn send(&self, smtp: &SmtpSettings, mail: &OutgoingMail) -> Result<(), MailError>;

    /// Connects and authenticates without sending anything.
    async fn check(&self, smtp: &SmtpSettings) -> Result<(), MailError>;
}

/// `List-Unsubscribe` header (RFC 2369).
#[derive(Clone)]
struct ListUnsubscribe(String);

impl Header for ListUnsubscribe {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("List-Unsubscribe")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(
            s.trim().trim_start_matches('<').trim_end_matches('>').to_string(),
        ))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), format!("<{}>", self.0))
    }
}

/// Escapes text for HTML and keeps line breaks visible.
pub fn format_html(text: &str) -> String {
    let body = tera::escape_html(text).replace("\r\n", "\n").replace('\n', "<br>\n");
    format!("<!DOCTYPE html>\n<html><body><p>{body}</p></body></html>")
}

pub fn parse_mailbox(address: &str) -> Result<Mailbox, MailError> {
    address
        .trim()
        .parse::<Mailbox>()
        .map_err(|e| MailError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

pub fn build_message(mail: &OutgoingMail) -> Result<Message, MailError> {
    let mut builder = Message::builder()
        .from(parse_mailbox(&mail.from)?)
        .subject(mail.subject.clone());
    for to in &mail.to {
        builder = builder.to(parse_mailbox(to)?);
    }
    if let Some(url) = &mail.unsubscribe_url {
        builder = builder.header(ListUnsubscribe(url.clone()));
    }
    builder
        .multipart(MultiPart::alternative_plain_html(
            mail.text.clone(),
            format_html(&mail.text),
        ))
        .map_err(|e| MailError::Build(e.to_string()))
}

/// Sends through lettre. Port 465 uses implicit TLS, every other port STARTTLS.
#[derive(Default)]
pub struct SmtpMailer;

impl SmtpMailer {
    pub fn new() -> Self {
        Self
    }

    fn transport(smtp: &SmtpSettings) -> Result<AsyncSmtpTransport<Tokio1Executor>, MailError> {
        let builder = if smtp.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.server)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.server)?
        };
        Ok(builder
            .port(smtp.port)
            .credentials(Credentials::new(smtp.user.clone(), smtp.password.clone()))
            .timeout(Some(SMTP_TIMEOUT))
            .build())
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, smtp: &SmtpSettings, mail: &OutgoingMail) -> Result<(), MailError> {
        let message = build_message(mail)?;
        let transport = Self::transport(smtp)?;
        let response = transport.send(message).await?;
        debug!(server = %smtp.server, code = %response.code(), "Mail accepted by SMTP server.");
        Ok(())
    }

    async fn check(&self, smtp: &SmtpSettings) -> Result<(), MailError> {
        let transport = Self::transport(smtp)?;
        if transport.test_connection().await? {
            Ok(())
        } else {
            Err(MailError::Smtp {
                message: format!("could not connect to {}:{}", smtp.server, smtp.port),
                permanent: false,
            })
        }
    }
}
