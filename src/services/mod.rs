use std::sync::Arc;

use crate::plugins::mailer::Mailer;
use crate::server::counter::ProcessCounter;
use crate::web::templates::Templates;

pub mod auth_service;
pub mod captcha;
pub mod encryption_service;
pub mod hash;
pub mod password_methods;

use auth_service::AuthService;
use captcha::Captcha;
use encryption_service::EncryptionService;

/// Process-wide collaborators shared by every tenant and plugin.
#[derive(Clone)]
pub struct AppServices {
    pub encryption: Arc<EncryptionService>,
    pub auth: Arc<AuthService>,
    pub captcha: Arc<dyn Captcha>,
    pub mailer: Arc<dyn Mailer>,
    pub templates: Arc<Templates>,
    pub counter: ProcessCounter,
    pub http: reqwest::Client,
}
