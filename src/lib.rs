pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod notifications;
pub mod qr;
pub mod tokens;

pub use db::DbPool;

use std::sync::Arc;

use clock::{Clock, SystemClock};
use config::Config;
use notifications::EmailService;

pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    pub clock: Arc<dyn Clock>,
    pub mailer: Arc<EmailService>,
}

impl AppState {
    pub fn new(config: Config, db: DbPool) -> Self {
        let mailer = Arc::new(EmailService::new(config.email.clone()));
        Self {
            config,
            db,
            clock: Arc::new(SystemClock),
            mailer,
        }
    }

    /// Replace the time source (tests pin time through this).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}
