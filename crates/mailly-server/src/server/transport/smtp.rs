//! Persistent SMTP sessions backed by `lettre`.
//!
//! Each [`SmtpConnection`] wraps one [`AsyncSmtpConnection`]: TCP connect,
//! `EHLO`, optional TLS upgrade and `AUTH` happen once in
//! [`SmtpProvider::open`], after which every message reuses the session
//! (`MAIL FROM` / `RCPT TO` / `DATA`). The session ends with `QUIT` in
//! [`Transport::close`].

use super::{Transport, TransportProvider};
use core::time::Duration;
use lettre::{
    Address, Message,
    message::{Mailbox, header::ContentType},
    transport::smtp::{
        authentication::{Credentials, Mechanism},
        client::{AsyncSmtpConnection, TlsParameters},
        extension::ClientId,
    },
};
use mailly_core::{Error, Result, types::MessageRequest};
use std::sync::Arc;

/// How the session is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Plain connect, then upgrade with `STARTTLS` (port 587).
    StartTls,
    /// TLS from the first byte (port 465).
    Wrapper,
    /// No encryption. Local relays and test servers only.
    Plain,
}

#[derive(Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub tls: TlsMode,
    pub hello_name: String,
    pub sender: String,
    pub password: String,
    pub connect_timeout: Duration,
}

impl core::fmt::Debug for SmtpSettings {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SmtpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("hello_name", &self.hello_name)
            .field("sender", &self.sender)
            .field("password", &"<redacted>")
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Opens authenticated SMTP sessions against one configured relay.
#[derive(Debug, Clone)]
pub struct SmtpProvider {
    settings: Arc<SmtpSettings>,
    sender: Address,
}

impl SmtpProvider {
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the configured sender is not a valid
    /// address.
    pub fn new(settings: SmtpSettings) -> Result<Self> {
        let sender = settings
            .sender
            .parse::<Address>()
            .map_err(|e| Error::transport(format!("invalid sender address: {e}")))?;
        Ok(Self {
            settings: Arc::new(settings),
            sender,
        })
    }

    fn tls_parameters(&self) -> Result<TlsParameters> {
        TlsParameters::new(self.settings.host.clone())
            .map_err(|e| Error::transport(format!("failed to configure TLS: {e}")))
    }
}

impl TransportProvider for SmtpProvider {
    type Connection = SmtpConnection;

    async fn open(&self) -> Result<SmtpConnection> {
        let settings = &self.settings;
        let hello = ClientId::Domain(settings.hello_name.clone());

        let wrapper_tls = match settings.tls {
            TlsMode::Wrapper => Some(self.tls_parameters()?),
            TlsMode::StartTls | TlsMode::Plain => None,
        };

        let mut conn = AsyncSmtpConnection::connect_tokio1(
            (settings.host.as_str(), settings.port),
            Some(settings.connect_timeout),
            &hello,
            wrapper_tls,
            None,
        )
        .await
        .map_err(|e| Error::transport(format!("failed to connect to SMTP: {e}")))?;

        if settings.tls == TlsMode::StartTls && conn.can_starttls() {
            let params = self.tls_parameters()?;
            conn.starttls(params, &hello)
                .await
                .map_err(|e| Error::transport(format!("failed to start TLS: {e}")))?;
        }

        let credentials = Credentials::new(settings.sender.clone(), settings.password.clone());
        conn.auth(&[Mechanism::Plain, Mechanism::Login], &credentials)
            .await
            .map_err(|e| Error::transport(format!("failed to authenticate: {e}")))?;

        tracing::debug!(host = %settings.host, port = settings.port, "SMTP session opened");

        Ok(SmtpConnection {
            conn,
            sender: self.sender.clone(),
        })
    }
}

/// One authenticated SMTP session. Dropping it without [`Transport::close`]
/// still releases the socket, it just skips the `QUIT`.
pub struct SmtpConnection {
    conn: AsyncSmtpConnection,
    sender: Address,
}

/// Renders a batch item into an RFC 5322 message sent as HTML.
fn build_message(sender: &Address, message: &MessageRequest) -> Result<Message> {
    let to = message
        .recipient
        .trim()
        .parse::<Mailbox>()
        .map_err(|e| Error::delivery(format!("invalid recipient: {e}")))?;
    let display_name = Some(message.sender_name.trim())
        .filter(|name| !name.is_empty())
        .map(str::to_string);
    let from = Mailbox::new(display_name, sender.clone());

    Message::builder()
        .from(from)
        .to(to)
        .subject(message.subject.as_str())
        .header(ContentType::TEXT_HTML)
        .body(message.body.clone())
        .map_err(|e| Error::delivery(format!("failed to build message: {e}")))
}

impl Transport for SmtpConnection {
    async fn send(&mut self, message: &MessageRequest) -> Result<()> {
        let email = build_message(&self.sender, message)?;
        self.conn
            .send(email.envelope(), &email.formatted())
            .await
            .map(|_| ())
            .map_err(Error::delivery)
    }

    fn is_broken(&self) -> bool {
        self.conn.has_broken()
    }

    async fn close(mut self) -> Result<()> {
        self.conn.quit().await.map(|_| ()).map_err(Error::transport)
    }
}
