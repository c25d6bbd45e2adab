//! SMTP email service for QR delivery, attendance confirmations, and
//! password-reset links.

use anyhow::Result;
use chrono::{DateTime, Utc};
use lettre::{
    message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use crate::config::EmailConfig;

/// Service for sending system emails
pub struct EmailService {
    config: EmailConfig,
}

impl EmailService {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    /// Check if email sending is configured and enabled
    pub fn is_enabled(&self) -> bool {
        self.config.is_configured()
    }

    /// Send a freshly issued QR code, with the PNG embedded inline.
    pub async fn send_qr_code_email(
        &self,
        to_email: &str,
        user_name: &str,
        scan_url: &str,
        qr_png: Vec<u8>,
        expires_minutes: i64,
    ) -> Result<()> {
        if !self.is_enabled() {
            tracing::warn!("Email not configured, skipping QR code email to {}", to_email);
            return Ok(());
        }

        let subject = "Your Attendance QR Code";
        let text_body = render_qr_text(user_name, scan_url, expires_minutes);
        let html_body = render_qr_html(user_name, expires_minutes);

        let qr_part = Attachment::new_inline("qr-code".to_string())
            .body(qr_png, ContentType::parse("image/png")?);

        let body = MultiPart::alternative()
            .singlepart(
                SinglePart::builder()
                    .header(ContentType::TEXT_PLAIN)
                    .body(text_body),
            )
            .multipart(
                MultiPart::related()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html_body),
                    )
                    .singlepart(qr_part),
            );

        let message = self.message_builder(to_email)?.subject(subject).multipart(body)?;
        self.send(message, to_email, subject).await
    }

    /// Confirmation sent after an attendance scan succeeds.
    pub async fn send_attendance_confirmation(
        &self,
        to_email: &str,
        user_name: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        if !self.is_enabled() {
            tracing::warn!(
                "Email not configured, skipping attendance confirmation to {}",
                to_email
            );
            return Ok(());
        }

        let subject = "Attendance Confirmed";
        let clocked_in = timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string();
        let html_body = format!(
            "<p>Hi {}, you clocked in at <strong>{}</strong>.</p>",
            html_escape(user_name),
            clocked_in
        );
        let text_body = format!("Hi {user_name}, you clocked in at {clocked_in}.");

        self.send_alternative(to_email, subject, &html_body, &text_body)
            .await
    }

    /// Password reset link, valid for a limited window.
    pub async fn send_password_reset_email(
        &self,
        to_email: &str,
        reset_link: &str,
        expires_minutes: i64,
    ) -> Result<()> {
        if !self.is_enabled() {
            tracing::warn!("Email not configured, skipping reset email to {}", to_email);
            return Ok(());
        }

        let subject = "Password Reset Request";
        let text_body = format!(
            "Use this link to reset your password: {reset_link}\n\n\
             This link expires in {expires_minutes} minutes. If you didn't request this, ignore this message."
        );
        let html_body = format!(
            r#"<p>Use this link to reset your password:</p>
<p><a href="{reset_link}">{reset_link}</a></p>
<p>This link expires in {expires_minutes} minutes. If you didn't request this, ignore this message.</p>"#
        );

        self.send_alternative(to_email, subject, &html_body, &text_body)
            .await
    }

    /// Send an email with HTML and plain text versions
    async fn send_alternative(
        &self,
        to_email: &str,
        subject: &str,
        html_body: &str,
        text_body: &str,
    ) -> Result<()> {
        let message = self.message_builder(to_email)?.subject(subject).multipart(
            MultiPart::alternative()
                .singlepart(
                    SinglePart::builder()
                        .header(ContentType::TEXT_PLAIN)
                        .body(text_body.to_string()),
                )
                .singlepart(
                    SinglePart::builder()
                        .header(ContentType::TEXT_HTML)
                        .body(html_body.to_string()),
                ),
        )?;

        self.send(message, to_email, subject).await
    }

    fn message_builder(&self, to_email: &str) -> Result<lettre::message::MessageBuilder> {
        let from_address = self
            .config
            .from_address
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("From address not configured"))?;

        let from: Mailbox = format!("{} <{}>", self.config.from_name, from_address).parse()?;
        let to: Mailbox = to_email.parse()?;

        Ok(Message::builder().from(from).to(to))
    }

    async fn send(&self, message: Message, to_email: &str, subject: &str) -> Result<()> {
        let smtp_host = self
            .config
            .smtp_host
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("SMTP host not configured"))?;

        // Build SMTP transport
        let mailer = if self.config.smtp_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(smtp_host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(smtp_host)
        }
        .port(self.config.smtp_port);

        let mailer = if let (Some(username), Some(password)) =
            (&self.config.smtp_username, &self.config.smtp_password)
        {
            mailer.credentials(Credentials::new(username.clone(), password.clone()))
        } else {
            mailer
        };

        mailer.build().send(message).await?;

        tracing::info!(
            to = %to_email,
            subject = %subject,
            "Email sent successfully"
        );

        Ok(())
    }
}

/// Render the HTML version of the QR code email
fn render_qr_html(user_name: &str, expires_minutes: i64) -> String {
    format!(
        r#"<div style="font-family: Arial, sans-serif; max-width: 600px; margin: 0 auto;">
  <h2 style="color: #333;">Attendance QR Code</h2>
  <p>Hi {user_name}, here is your QR code for recording attendance.</p>
  <p>Scan this QR code to clock in:</p>

  <div style="text-align: center; margin: 20px 0; padding: 10px; background: #f5f5f5;">
    <img src="cid:qr-code" alt="Attendance QR code"
         style="width: 200px; height: 200px; display: block; margin: 0 auto;">
    <p style="font-size: 12px; color: #666;">
      This QR code expires in {expires_minutes} minutes.
    </p>
  </div>

  <p>If you have any questions, please contact support.</p>
  <p style="color: #888;"><em>&ndash; Clockit</em></p>
</div>"#,
        user_name = html_escape(user_name),
        expires_minutes = expires_minutes,
    )
}

/// Render the plain text version of the QR code email
fn render_qr_text(user_name: &str, scan_url: &str, expires_minutes: i64) -> String {
    format!(
        r#"Hi {user_name},

Here is your QR code for recording attendance. If your mail client hides
the image, open this link instead:

{scan_url}

The code expires in {expires_minutes} minutes.

---
Clockit"#
    )
}

/// Escape HTML special characters
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_html_escape() {
        assert_eq!(html_escape("<script>"), "&lt;script&gt;");
        assert_eq!(html_escape("Tom & Jerry"), "Tom &amp; Jerry");
        assert_eq!(html_escape("\"quoted\""), "&quot;quoted&quot;");
    }

    #[test]
    fn test_render_qr_html() {
        let html = render_qr_html("Alice <staff>", 60);
        assert!(html.contains("Alice &lt;staff&gt;"));
        assert!(html.contains("cid:qr-code"));
        assert!(html.contains("60 minutes"));
    }

    #[test]
    fn test_render_qr_text() {
        let text = render_qr_text("Alice", "https://x/scan?token=abc", 60);
        assert!(text.contains("Alice"));
        assert!(text.contains("https://x/scan?token=abc"));
        assert!(text.contains("60 minutes"));
    }

    #[tokio::test]
    async fn test_unconfigured_service_skips_sending() {
        let service = EmailService::new(EmailConfig::default());
        assert!(!service.is_enabled());

        // All senders short-circuit to Ok without a transport
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        service
            .send_attendance_confirmation("a@x.com", "Alice", ts)
            .await
            .unwrap();
        service
            .send_password_reset_email("a@x.com", "https://x/reset", 30)
            .await
            .unwrap();
        service
            .send_qr_code_email("a@x.com", "Alice", "https://x/scan", vec![1, 2, 3], 60)
            .await
            .unwrap();
    }
}
