use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tera::Context;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::mailer::{OutgoingMail, SmtpSettings, parse_mailbox};
use super::{Plugin, PluginContext, PluginError, field};
use crate::db::Announcement;

pub const NAME: &str = "SimpleSendMail";

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleMailConfig {
    pub subject_prefix: String,
    pub from: String,
    pub to: Vec<String>,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_password: String,
}

impl SimpleMailConfig {
    fn is_complete(&self) -> bool {
        !self.from.is_empty()
            && !self.to.is_empty()
            && !self.smtp_server.is_empty()
            && self.smtp_port != 0
            && !self.smtp_user.is_empty()
            && !self.smtp_password.is_empty()
    }

    fn smtp(&self) -> SmtpSettings {
        SmtpSettings {
            server: self.smtp_server.clone(),
            port: self.smtp_port,
            user: self.smtp_user.clone(),
            password: self.smtp_password.clone(),
        }
    }
}

pub(crate) fn subject(prefix: &str, header: &str) -> String {
    if prefix.is_empty() {
        header.to_string()
    } else {
        format!("{prefix} {header}")
    }
}

/// Sends every announcement as one mail to a fixed recipient list.
pub struct SimpleSendMail {
    ctx: PluginContext,
    config: Mutex<SimpleMailConfig>,
}

pub async fn create(ctx: PluginContext) -> Result<Arc<dyn Plugin>, PluginError> {
    let config: SimpleMailConfig = ctx.store.load().await?;
    Ok(Arc::new(SimpleSendMail {
        ctx,
        config: Mutex::new(config),
    }))
}

fn invalid(key: &str, detail: impl std::fmt::Display) -> PluginError {
    PluginError::InvalidInput(format!("{}: {detail}", t!(key)))
}

#[async_trait]
impl Plugin for SimpleSendMail {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn config_panel(&self) -> Result<String, PluginError> {
        let config = self.config.lock().await;
        let mut context = Context::new();
        context.insert("config", &*config);
        context.insert("to", &config.to.join("\n"));
        context.insert("password_set", &!config.smtp_password.is_empty());
        Ok(self
            .ctx
            .services
            .templates
            .render("plugins/simple_mail.html", &context)?)
    }

    async fn process_config_change(&self, form: HashMap<String, String>) -> Result<(), PluginError> {
        let _guard = self.ctx.services.counter.start();
        let mut config = self.config.lock().await;

        let port = field(&form, "smtp_port").trim();
        let smtp_port = if port.is_empty() {
            0
        } else {
            port.parse::<u16>()
                .map_err(|e| invalid("mail.invalid_port", e))?
        };

        let from = field(&form, "from").trim().to_string();
        if !from.is_empty() {
            parse_mailbox(&from).map_err(|e| invalid("mail.invalid_address", e))?;
        }
        let to: Vec<String> = field(&form, "to")
            .split(['\n', ','])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        for address in &to {
            parse_mailbox(address).map_err(|e| invalid("mail.invalid_address", e))?;
        }

        let mut updated = SimpleMailConfig {
            subject_prefix: field(&form, "subject_prefix").trim().to_string(),
            from,
            to,
            smtp_server: field(&form, "smtp_server").trim().to_string(),
            smtp_port,
            smtp_user: field(&form, "smtp_user").trim().to_string(),
            smtp_password: config.smtp_password.clone(),
        };
        let password = field(&form, "smtp_password");
        if !password.is_empty() {
            updated.smtp_password = password.to_string();
        }

        let mut login_failure = None;
        if updated.is_complete() {
            if let Err(e) = self.ctx.services.mailer.check(&updated.smtp()).await {
                warn!(tenant = %self.ctx.key, error = %e, "SMTP login check failed; clearing password.");
                updated.smtp_password.clear();
                login_failure = Some(e);
            }
        }

        self.ctx.store.save(&updated).await?;
        *config = updated;
        match login_failure {
            Some(e) => Err(invalid("mail.login_failed", e)),
            None => Ok(()),
        }
    }

    async fn new_announcement(&self, announcement: Announcement, id: String) {
        let _guard = self.ctx.services.counter.start();
        let config = self.config.lock().await;
        if !config.is_complete() {
            self.ctx.errors.report(format!(
                "configuration incomplete, announcement {id} ({}) not sent",
                announcement.header
            ));
            return;
        }

        let mail = OutgoingMail {
            from: config.from.clone(),
            to: config.to.clone(),
            subject: subject(&config.subject_prefix, &announcement.header),
            text: announcement.message.clone(),
            unsubscribe_url: None,
        };
        match self.ctx.services.mailer.send(&config.smtp(), &mail).await {
            Ok(()) => info!(tenant = %self.ctx.key, id = %id, recipients = mail.to.len(), "Announcement mailed."),
            Err(e) => self.ctx.errors.report(format!(
                "error while sending announcement {id} ({}): {e}",
                announcement.header
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::mailer::testing::MockMailer;
    use crate::plugins::testing::{MemoryDataSafe, context};

    fn form(password: &str) -> HashMap<String, String> {
        HashMap::from([
            ("subject_prefix".to_string(), "[news]".to_string()),
            ("from".to_string(), "news@example.org".to_string()),
            ("to".to_string(), "a@example.org\nb@example.org, c@example.org".to_string()),
            ("smtp_server".to_string(), "smtp.example.org".to_string()),
            ("smtp_port".to_string(), "587".to_string()),
            ("smtp_user".to_string(), "news".to_string()),
            ("smtp_password".to_string(), password.to_string()),
        ])
    }

    #[tokio::test]
    async fn test_sends_one_mail_to_all_recipients() {
        let mailer = Arc::new(MockMailer::default());
        *mailer.check_ok.lock().unwrap() = true;
        let (ctx, _rx) = context("news", NAME, Arc::new(MemoryDataSafe::default()), mailer.clone());
        let plugin = create(ctx).await.unwrap();

        plugin.process_config_change(form("pw")).await.unwrap();
        plugin
            .new_announcement(Announcement::new("Hello", "World"), "1".to_string())
            .await;

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "[news] Hello");
        assert_eq!(sent[0].to.len(), 3);
        assert_eq!(sent[0].text, "World");
    }

    #[tokio::test]
    async fn test_failed_login_clears_password() {
        let mailer = Arc::new(MockMailer::default());
        let safe = Arc::new(MemoryDataSafe::default());
        let (ctx, mut rx) = context("news", NAME, safe.clone(), mailer.clone());
        let store = ctx.store.clone();
        let plugin = create(ctx).await.unwrap();

        let result = plugin.process_config_change(form("wrong")).await;
        assert!(matches!(result, Err(PluginError::InvalidInput(_))));
        let saved: SimpleMailConfig = store.load().await.unwrap();
        assert!(saved.smtp_password.is_empty());
        assert_eq!(saved.smtp_server, "smtp.example.org");

        // Incomplete now, so nothing goes out and the tenant log hears about it.
        plugin
            .new_announcement(Announcement::new("Hello", "World"), "1".to_string())
            .await;
        assert!(mailer.sent().is_empty());
        assert!(rx.recv().await.unwrap().contains("incomplete"));
    }

    #[tokio::test]
    async fn test_blank_password_keeps_existing_one() {
        let mailer = Arc::new(MockMailer::default());
        *mailer.check_ok.lock().unwrap() = true;
        let (ctx, _rx) = context("news", NAME, Arc::new(MemoryDataSafe::default()), mailer);
        let store = ctx.store.clone();
        let plugin = create(ctx).await.unwrap();

        plugin.process_config_change(form("pw")).await.unwrap();
        plugin.process_config_change(form("")).await.unwrap();
        let saved: SimpleMailConfig = store.load().await.unwrap();
        assert_eq!(saved.smtp_password, "pw");
    }

    #[tokio::test]
    async fn test_rejects_bad_recipient() {
        let (ctx, _rx) = context(
            "news",
            NAME,
            Arc::new(MemoryDataSafe::default()),
            Arc::new(MockMailer::default()),
        );
        let plugin = create(ctx).await.unwrap();
        let mut bad = form("pw");
        bad.insert("to".to_string(), "not-an-address".to_string());
        assert!(matches!(
            plugin.process_config_change(bad).await,
            Err(PluginError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_send_failure_is_reported() {
        let mailer = Arc::new(MockMailer::failing(false));
        *mailer.check_ok.lock().unwrap() = true;
        let (ctx, mut rx) = context("news", NAME, Arc::new(MemoryDataSafe::default()), mailer);
        let plugin = create(ctx).await.unwrap();
        plugin.process_config_change(form("pw")).await.unwrap();
        plugin
            .new_announcement(Announcement::new("Hello", "World"), "7".to_string())
            .await;
        assert!(rx.recv().await.unwrap().contains("announcement 7"));
    }
}
