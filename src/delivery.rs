//! Delivery backends: maildir, sendmail, SMTP, IMAP.
//!
//! The runner hands a backend a recipient and a fully rendered
//! [`Message`]; the backend's only job is to get those bytes out. Which
//! backend a feed uses is resolved from configuration once per feed,
//! before any entry is processed.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::config::DeliveryTarget;
use crate::message::Message;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("maildir write failed: {0}")]
    Maildir(#[from] std::io::Error),

    #[error("failed to run sendmail: {0}")]
    Sendmail(String),

    #[error("sendmail exited with {0}")]
    SendmailStatus(std::process::ExitStatus),

    #[error("SMTP send failed: {0}")]
    Smtp(String),

    #[error("IMAP append failed: {0}")]
    Imap(String),

    #[error("invalid mail address '{address}': {message}")]
    Address { address: String, message: String },
}

/// One way of getting a rendered message to its recipient.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, recipient: &str, message: &Message) -> Result<(), DeliveryError>;
}

/// Construct the backend a feed's settings call for.
pub fn from_target(target: &DeliveryTarget, from: &str) -> Result<Box<dyn Delivery>, DeliveryError> {
    Ok(match target {
        DeliveryTarget::Maildir { path } => Box::new(MaildirDelivery::new(path.clone())),
        DeliveryTarget::Sendmail { command } => Box::new(SendmailDelivery::new(command.clone())),
        DeliveryTarget::Smtp {
            host,
            port,
            username,
            password,
        } => Box::new(SmtpDelivery::new(
            host,
            *port,
            username.as_deref(),
            password.as_deref(),
            from,
        )?),
        DeliveryTarget::Imap {
            host,
            port,
            username,
            password,
            mailbox,
        } => Box::new(ImapDelivery::new(
            host.clone(),
            *port,
            username.clone(),
            password.clone(),
            mailbox.clone(),
        )),
    })
}

// ============================================================================
// Maildir
// ============================================================================

/// Writes messages straight into a local maildir, no MTA involved.
pub struct MaildirDelivery {
    root: PathBuf,
}

impl MaildirDelivery {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn unique_name() -> String {
        // Maildir delivery protocol: unique name in tmp/, rename into new/.
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        format!("{}.{}.{}", nanos, std::process::id(), uuid::Uuid::new_v4().simple())
    }
}

#[async_trait]
impl Delivery for MaildirDelivery {
    async fn deliver(&self, _recipient: &str, message: &Message) -> Result<(), DeliveryError> {
        for sub in ["tmp", "new", "cur"] {
            tokio::fs::create_dir_all(self.root.join(sub)).await?;
        }
        let name = Self::unique_name();
        let tmp = self.root.join("tmp").join(&name);
        let new = self.root.join("new").join(&name);

        tokio::fs::write(&tmp, message.render()).await?;
        tokio::fs::rename(&tmp, &new).await?;
        tracing::debug!(path = %new.display(), "delivered to maildir");
        Ok(())
    }
}

// ============================================================================
// Sendmail
// ============================================================================

/// Pipes the rendered message to a local sendmail-compatible command.
pub struct SendmailDelivery {
    command: PathBuf,
}

impl SendmailDelivery {
    pub fn new(command: PathBuf) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Delivery for SendmailDelivery {
    async fn deliver(&self, recipient: &str, message: &Message) -> Result<(), DeliveryError> {
        let mut child = tokio::process::Command::new(&self.command)
            .arg("-oi")
            .arg(recipient)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| DeliveryError::Sendmail(format!("{}: {e}", self.command.display())))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DeliveryError::Sendmail("stdin unavailable".into()))?;
        stdin
            .write_all(&message.render())
            .await
            .map_err(|e| DeliveryError::Sendmail(e.to_string()))?;
        drop(stdin);

        let status = child
            .wait()
            .await
            .map_err(|e| DeliveryError::Sendmail(e.to_string()))?;
        if !status.success() {
            return Err(DeliveryError::SendmailStatus(status));
        }
        tracing::debug!(recipient = %recipient, "delivered via sendmail");
        Ok(())
    }
}

// ============================================================================
// SMTP
// ============================================================================

/// Submits messages to an SMTP relay over STARTTLS.
pub struct SmtpDelivery {
    transport: lettre::AsyncSmtpTransport<lettre::Tokio1Executor>,
    from: lettre::Address,
}

impl SmtpDelivery {
    pub fn new(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        from: &str,
    ) -> Result<Self, DeliveryError> {
        let mut builder =
            lettre::AsyncSmtpTransport::<lettre::Tokio1Executor>::starttls_relay(host)
                .map_err(|e| DeliveryError::Smtp(e.to_string()))?
                .port(port);
        if let (Some(user), Some(pass)) = (username, password) {
            builder = builder.credentials(lettre::transport::smtp::authentication::Credentials::new(
                user.to_string(),
                pass.to_string(),
            ));
        }
        Ok(Self {
            transport: builder.build(),
            from: parse_address(from)?,
        })
    }
}

#[async_trait]
impl Delivery for SmtpDelivery {
    async fn deliver(&self, recipient: &str, message: &Message) -> Result<(), DeliveryError> {
        use lettre::AsyncTransport;

        let envelope =
            lettre::address::Envelope::new(Some(self.from.clone()), vec![parse_address(recipient)?])
                .map_err(|e| DeliveryError::Smtp(e.to_string()))?;
        self.transport
            .send_raw(&envelope, &message.render())
            .await
            .map_err(|e| DeliveryError::Smtp(e.to_string()))?;
        tracing::debug!(recipient = %recipient, "delivered via smtp");
        Ok(())
    }
}

// ============================================================================
// IMAP
// ============================================================================

/// Appends messages to a mailbox over IMAPS. The recipient address is
/// ignored; the mailbox itself is the destination.
pub struct ImapDelivery {
    host: String,
    port: u16,
    username: String,
    password: String,
    mailbox: String,
}

impl ImapDelivery {
    pub fn new(
        host: String,
        port: u16,
        username: String,
        password: String,
        mailbox: String,
    ) -> Self {
        Self {
            host,
            port,
            username,
            password,
            mailbox,
        }
    }

    async fn connect(
        &self,
    ) -> Result<tokio_rustls::client::TlsStream<tokio::net::TcpStream>, DeliveryError> {
        let tcp = tokio::net::TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| DeliveryError::Imap(format!("{}:{}: {e}", self.host, self.port)))?;

        let mut roots = tokio_rustls::rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        // Name the provider: other TLS users in this crate may enable a
        // second one, which makes the provider-less builder panic.
        let provider =
            std::sync::Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
        let config = tokio_rustls::rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| DeliveryError::Imap(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(std::sync::Arc::new(config));
        let server_name = tokio_rustls::rustls::pki_types::ServerName::try_from(self.host.clone())
            .map_err(|e| DeliveryError::Imap(format!("bad server name '{}': {e}", self.host)))?;
        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| DeliveryError::Imap(format!("TLS handshake with {}: {e}", self.host)))
    }
}

#[async_trait]
impl Delivery for ImapDelivery {
    async fn deliver(&self, _recipient: &str, message: &Message) -> Result<(), DeliveryError> {
        let stream = self.connect().await?;
        let client = async_imap::Client::new(stream);
        let mut session = client
            .login(&self.username, &self.password)
            .await
            .map_err(|(e, _)| DeliveryError::Imap(format!("login failed: {e}")))?;

        session
            .append(&self.mailbox, None, None, message.render())
            .await
            .map_err(|e| DeliveryError::Imap(e.to_string()))?;
        // A failed logout does not un-deliver the message.
        let _ = session.logout().await;
        tracing::debug!(mailbox = %self.mailbox, host = %self.host, "delivered via imap");
        Ok(())
    }
}

fn parse_address(address: &str) -> Result<lettre::Address, DeliveryError> {
    address.parse().map_err(|e: lettre::address::AddressError| {
        DeliveryError::Address {
            address: address.to_string(),
            message: e.to_string(),
        }
    })
}

// ============================================================================
// Test support
// ============================================================================

/// Records every delivered message instead of sending it. Used by the
/// runner's tests and by dry-run-style inspection.
#[derive(Default)]
pub struct CollectingDelivery {
    sent: std::sync::Mutex<Vec<(String, Message)>>,
}

impl CollectingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, Message)> {
        self.sent.lock().expect("delivery log poisoned").clone()
    }
}

#[async_trait]
impl Delivery for CollectingDelivery {
    async fn deliver(&self, recipient: &str, message: &Message) -> Result<(), DeliveryError> {
        self.sent
            .lock()
            .expect("delivery log poisoned")
            .push((recipient.to_string(), message.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        let mut m = Message::new();
        m.set_header("Subject", "hello");
        m.set_header("To", "inbox@example.com");
        m.set_body("body");
        m
    }

    #[tokio::test]
    async fn test_maildir_delivery_lands_in_new() {
        let root = std::env::temp_dir().join("feedmail_maildir_test");
        std::fs::remove_dir_all(&root).ok();

        let delivery = MaildirDelivery::new(root.clone());
        delivery
            .deliver("inbox@example.com", &sample_message())
            .await
            .unwrap();
        delivery
            .deliver("inbox@example.com", &sample_message())
            .await
            .unwrap();

        let new: Vec<_> = std::fs::read_dir(root.join("new")).unwrap().collect();
        assert_eq!(new.len(), 2);
        let tmp: Vec<_> = std::fs::read_dir(root.join("tmp")).unwrap().collect();
        assert!(tmp.is_empty(), "tmp/ holds no leftovers");

        let first = std::fs::read_to_string(new[0].as_ref().unwrap().path()).unwrap();
        assert!(first.contains("Subject: hello"));

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_sendmail_failure_is_reported() {
        let delivery = SendmailDelivery::new(PathBuf::from("/bin/false"));
        let err = delivery
            .deliver("inbox@example.com", &sample_message())
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::SendmailStatus(_)));
    }

    #[tokio::test]
    async fn test_missing_sendmail_binary() {
        let delivery = SendmailDelivery::new(PathBuf::from("/nonexistent/sendmail"));
        let err = delivery
            .deliver("inbox@example.com", &sample_message())
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Sendmail(_)));
    }

    #[tokio::test]
    async fn test_imap_connection_failure_is_reported() {
        // Port 1 is never an IMAP server; connect fails immediately.
        let delivery = ImapDelivery::new(
            "127.0.0.1".into(),
            1,
            "user".into(),
            "pass".into(),
            "INBOX".into(),
        );
        let err = delivery
            .deliver("inbox@example.com", &sample_message())
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Imap(_)));
        assert!(err.to_string().contains("127.0.0.1:1"));
    }

    #[test]
    fn test_imap_target_builds_imap_backend() {
        let target = crate::config::DeliveryTarget::Imap {
            host: "mail.example.com".into(),
            port: 993,
            username: "me".into(),
            password: "hunter2".into(),
            mailbox: "feeds".into(),
        };
        assert!(from_target(&target, "feeds@example.com").is_ok());
    }

    #[test]
    fn test_bad_smtp_address_rejected() {
        let err = parse_address("not an address").unwrap_err();
        assert!(matches!(err, DeliveryError::Address { .. }));
    }

    #[tokio::test]
    async fn test_collecting_delivery_records_in_order() {
        let delivery = CollectingDelivery::new();
        let mut first = sample_message();
        first.set_header("Subject", "one");
        delivery.deliver("a@example.com", &first).await.unwrap();
        delivery
            .deliver("b@example.com", &sample_message())
            .await
            .unwrap();

        let sent = delivery.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "a@example.com");
        assert_eq!(sent[0].1.header("Subject"), Some("one"));
    }
}
