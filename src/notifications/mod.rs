//! Outbound notifications.
//!
//! Email is the only out-of-band channel; delivery failures are logged by
//! callers and never abort the operation that triggered the mail.

mod email;

pub use email::EmailService;
