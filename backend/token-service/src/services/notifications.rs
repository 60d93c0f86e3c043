//! Security notification delivery.
//!
//! Two alerts leave this subsystem: concurrent token usage (theft signal)
//! and a sign-in from a new country. Delivery failures are the caller's
//! problem to log, never to propagate — a broken mail relay must not make
//! authentication decisions.

use crate::config::EmailSettings;
use crate::error::{Result, TokenError};
use crate::models::{GeoLocation, User};
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use std::sync::Arc;
use tracing::info;

#[async_trait::async_trait]
pub trait SecurityNotifier: Send + Sync {
    /// Alert the principal that their token was used from several IPs at
    /// once and every credential has been revoked.
    async fn concurrent_access(
        &self,
        user: &User,
        current_ip: &str,
        concurrent_ips: &[String],
        user_agent: Option<&str>,
    ) -> Result<()>;

    /// Alert the principal about a sign-in from a new country.
    async fn location_change(
        &self,
        user: &User,
        location: &GeoLocation,
        ip: &str,
        user_agent: Option<&str>,
    ) -> Result<()>;
}

/// SMTP-backed notifier.
///
/// With no SMTP host configured it runs in no-op mode and only logs, which
/// keeps development environments working without mail infrastructure.
#[derive(Clone)]
pub struct EmailNotifier {
    transport: Option<Arc<AsyncSmtpTransport<Tokio1Executor>>>,
    from: Mailbox,
}

impl EmailNotifier {
    pub fn new(config: &EmailSettings) -> Result<Self> {
        let from = config
            .smtp_from
            .parse::<Mailbox>()
            .map_err(|e| TokenError::Internal(format!("Invalid SMTP_FROM address: {}", e)))?;

        let transport = if config.smtp_host.trim().is_empty() {
            info!("SMTP host not configured; security notifier will operate in no-op mode");
            None
        } else {
            let builder = if config.use_starttls {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            } else {
                AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
            }
            .map_err(|e| {
                TokenError::Internal(format!("Failed to configure SMTP transport: {}", e))
            })?
            .port(config.smtp_port);

            let builder = if let (Some(username), Some(password)) =
                (&config.smtp_username, &config.smtp_password)
            {
                builder.credentials(Credentials::new(username.to_string(), password.to_string()))
            } else {
                builder
            };

            Some(Arc::new(builder.build()))
        };

        Ok(Self { transport, from })
    }

    async fn send_mail(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
        if let Some(transport) = &self.transport {
            let to = recipient.parse::<Mailbox>().map_err(|e| {
                TokenError::Notification(format!("Invalid recipient email address: {}", e))
            })?;

            let email = Message::builder()
                .from(self.from.clone())
                .to(to)
                .subject(subject)
                .header(header::ContentType::TEXT_PLAIN)
                .body(body.to_string())
                .map_err(|e| {
                    TokenError::Notification(format!("Failed to build email message: {}", e))
                })?;

            transport
                .send(email)
                .await
                .map_err(|e| TokenError::Notification(format!("Failed to send email: {}", e)))?;
            info!(subject, "security email sent");
        } else {
            info!(
                subject,
                recipient, "security notifier in no-op mode; skipping actual send"
            );
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SecurityNotifier for EmailNotifier {
    async fn concurrent_access(
        &self,
        user: &User,
        current_ip: &str,
        concurrent_ips: &[String],
        user_agent: Option<&str>,
    ) -> Result<()> {
        let subject = "Security alert: your session was used from multiple locations";
        let body = format!(
            "Hi {},\n\nWe detected your account being used from several network locations at the same time:\n\n\
            Latest request: {} ({})\nOther active addresses: {}\n\n\
            As a precaution every session has been signed out. Please sign in again and review your account security.",
            user.username,
            current_ip,
            user_agent.unwrap_or("unknown client"),
            concurrent_ips.join(", "),
        );

        self.send_mail(&user.email, subject, &body).await
    }

    async fn location_change(
        &self,
        user: &User,
        location: &GeoLocation,
        ip: &str,
        user_agent: Option<&str>,
    ) -> Result<()> {
        let place = match (&location.city, &location.country) {
            (Some(city), Some(country)) => format!("{}, {}", city, country),
            (None, Some(country)) => country.clone(),
            _ => "an unrecognized location".to_string(),
        };

        let subject = "New sign-in location for your account";
        let body = format!(
            "Hi {},\n\nYour account was just used from {} ({}, {}).\n\n\
            If this was you, no action is needed. If not, please sign out everywhere and change your password.",
            user.username,
            place,
            ip,
            user_agent.unwrap_or("unknown client"),
        );

        self.send_mail(&user.email, subject, &body).await
    }
}
