//! Database models split into domain-specific modules.

pub mod attendance;
pub mod notification;
pub mod qr_code;
pub mod user;

pub use attendance::*;
pub use notification::*;
pub use qr_code::*;
pub use user::*;
