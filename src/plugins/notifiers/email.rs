use async_trait::async_trait;
use lettre::message::{header, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

use crate::config::SmtpConfig;
use crate::plugins::traits::{ChangeNotification, NotificationResult, Notifier};
use crate::utils::{AppError, Result};

/// Plain-text change emails over async SMTP.
pub struct EmailNotifier {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailNotifier {
    /// `None` when SMTP is disabled or has no sender address.
    pub fn from_config(config: &SmtpConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        let Some(from_address) = &config.from_address else {
            return Ok(None);
        };

        let from: Mailbox = format!("{} <{}>", config.from_name, from_address)
            .parse()
            .map_err(|e| AppError::Notification(format!("Invalid sender address: {}", e)))?;

        let builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| AppError::Notification(format!("Invalid SMTP relay: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };

        let mut builder = builder.port(config.port);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Some(Self {
            mailer: builder.build(),
            from,
        }))
    }

    fn compose(&self, notification: &ChangeNotification) -> Result<Message> {
        let to: Mailbox = notification
            .recipient
            .parse()
            .map_err(|e| AppError::Notification(format!("Invalid recipient '{}': {}", notification.recipient, e)))?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(format_subject(notification))
            .header(header::ContentType::TEXT_PLAIN)
            .body(format_text_body(notification))
            .map_err(|e| AppError::Notification(format!("Failed to build email: {}", e)))
    }
}

pub fn format_subject(notification: &ChangeNotification) -> String {
    let host = url::Url::parse(&notification.url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| notification.url.clone());
    format!("Change detected on {}", host)
}

pub fn format_text_body(notification: &ChangeNotification) -> String {
    let mut text = String::new();

    text.push_str("PAGEWATCH CHANGE ALERT\n\n");
    text.push_str(&format!("Page: {}\n", notification.url));
    text.push_str(&format!("Selector: {}\n", notification.selector));
    text.push_str(&format!(
        "Previous: {}\n",
        notification.old_value.as_deref().unwrap_or("(none)")
    ));
    text.push_str(&format!("Current: {}\n", notification.new_value));
    text.push_str(&format!(
        "Detected: {}\n",
        notification.detected_at.format("%Y-%m-%d %H:%M UTC")
    ));

    text
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &str {
        "email"
    }

    async fn notify(&self, notification: &ChangeNotification) -> Result<NotificationResult> {
        let email = self.compose(notification)?;

        match self.mailer.send(email).await {
            Ok(response) => {
                debug!(monitor_id = %notification.monitor_id, code = %response.code(), "Change email sent");
                Ok(NotificationResult::sent(format!(
                    "email-{}-{}",
                    notification.monitor_id,
                    notification.detected_at.timestamp()
                )))
            }
            Err(e) => Ok(NotificationResult::failed(e.to_string())),
        }
    }
}
