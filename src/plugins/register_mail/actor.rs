//! The task owning a RegisterMail instance's state: commands from HTTP handlers and the
//! send tick are handled one after another, so no two mutations ever interleave.

use std::collections::HashMap;
use std::time::Duration;
use tera::Context;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info};

use super::RegisterError;
use super::state::{QueueItem, RegisterMailConfig, RegisterMailState, SubscribeRejection};
use crate::db::Announcement;
use crate::plugins::mailer::{Mailer, OutgoingMail, parse_mailbox};
use crate::plugins::simple_mail::subject;
use crate::plugins::{PluginContext, PluginError, field};
use crate::tenant::error_log::ErrorSink;

const SEND_INTERVAL: Duration = Duration::from_secs(60);

pub(super) type Reply<T> = oneshot::Sender<T>;

pub(super) enum Command {
    Panel(Reply<Result<String, PluginError>>),
    ConfigChange {
        form: HashMap<String, String>,
        reply: Reply<Result<(), PluginError>>,
    },
    Announcement {
        announcement: Announcement,
        reply: Reply<()>,
    },
    Status(Reply<Status>),
    Subscribe {
        address: String,
        register_password: String,
        reply: Reply<Result<(), RegisterError>>,
    },
    Verify {
        salt: String,
        address: String,
        reply: Reply<Result<(), RegisterError>>,
    },
    Unsubscribe {
        salt: String,
        address: String,
        reply: Reply<Result<(), RegisterError>>,
    },
    Delete {
        address: String,
        reply: Reply<Result<bool, RegisterError>>,
    },
    Ban {
        address: String,
        reply: Reply<Result<(), RegisterError>>,
    },
}

#[derive(Debug, Clone, Copy)]
pub(super) struct Status {
    pub complete: bool,
    pub password_required: bool,
}

/// Outcome of one pass over the queue.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub attempted: usize,
    pub sent: usize,
    pub requeued: usize,
    pub dropped: usize,
}

/// Sends the items due this tick. Does nothing while the configuration is incomplete.
pub async fn process_queue(
    state: &mut RegisterMailState,
    mailer: &dyn Mailer,
    errors: &ErrorSink,
) -> TickReport {
    let mut report = TickReport::default();
    if !state.config.is_complete() {
        return report;
    }

    let smtp = state.config.smtp();
    for item in state.take_batch() {
        report.attempted += 1;
        if item.to.hash {
            continue;
        }
        let mail = compose(&state.config, &item);
        match mailer.send(&smtp, &mail).await {
            Ok(()) => report.sent += 1,
            Err(e) if e.is_permanent() => {
                report.dropped += 1;
                errors.report(format!(
                    "error while sending announcement ({}), giving up: {e}",
                    item.announcement.header
                ));
            }
            Err(e) => {
                debug!(error = %e, errors = item.number_errors, "Transient send failure.");
                let header = item.announcement.header.clone();
                match state.retry(item) {
                    None => report.requeued += 1,
                    Some(_) => {
                        report.dropped += 1;
                        errors.report(format!(
                            "error while sending announcement ({header}), retries exhausted: {e}"
                        ));
                    }
                }
            }
        }
    }
    report
}

fn compose(config: &RegisterMailConfig, item: &QueueItem) -> OutgoingMail {
    OutgoingMail {
        from: config.from.clone(),
        to: vec![item.to.data.clone()],
        subject: subject(&config.subject_prefix, &item.announcement.header),
        text: item.announcement.message.clone(),
        unsubscribe_url: item.unsubscribe_url.clone(),
    }
}

pub(super) struct Worker {
    pub ctx: PluginContext,
    pub state: RegisterMailState,
}

impl Worker {
    async fn persist(&self) -> Result<(), PluginError> {
        self.ctx.store.save(&self.state).await
    }

    async fn persist_or_report(&self, what: &str) {
        if let Err(e) = self.persist().await {
            self.ctx
                .errors
                .report(format!("error while saving {what}: {e}"));
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut ticker = interval_at(Instant::now() + SEND_INTERVAL, SEND_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => {
                        let _guard = self.ctx.services.counter.start();
                        self.handle(command).await;
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    let _guard = self.ctx.services.counter.start();
                    self.tick().await;
                }
            }
        }
        debug!(tenant = %self.ctx.key, "RegisterMail worker stopped.");
    }

    async fn tick(&mut self) {
        if !self.state.config.is_complete() || self.state.queue.is_empty() {
            return;
        }
        let mailer = self.ctx.services.mailer.clone();
        let report = process_queue(&mut self.state, mailer.as_ref(), &self.ctx.errors).await;
        info!(tenant = %self.ctx.key, ?report, remaining = self.state.queue.len(), "Mail queue processed.");
        self.persist_or_report("queue").await;
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Panel(reply) => {
                let _ = reply.send(self.panel());
            }
            Command::ConfigChange { form, reply } => {
                let _ = reply.send(self.change_config(&form).await);
            }
            Command::Announcement {
                announcement,
                reply,
            } => {
                let queued = self.state.enqueue_announcement(&announcement);
                debug!(tenant = %self.ctx.key, queued, "Announcement queued for subscribers.");
                self.persist_or_report("queue").await;
                let _ = reply.send(());
            }
            Command::Status(reply) => {
                let _ = reply.send(Status {
                    complete: self.state.config.is_complete(),
                    password_required: !self.state.config.register_password.is_empty(),
                });
            }
            Command::Subscribe {
                address,
                register_password,
                reply,
            } => {
                let _ = reply.send(self.subscribe(&address, &register_password).await);
            }
            Command::Verify {
                salt,
                address,
                reply,
            } => {
                let _ = reply.send(self.verify(&salt, &address).await);
            }
            Command::Unsubscribe {
                salt,
                address,
                reply,
            } => {
                let _ = reply.send(self.unsubscribe(&salt, &address).await);
            }
            Command::Delete { address, reply } => {
                let removed = self.state.delete(address.trim());
                let result = if removed {
                    self.persist().await.map(|_| true).map_err(Into::into)
                } else {
                    Ok(false)
                };
                let _ = reply.send(result);
            }
            Command::Ban { address, reply } => {
                self.state.ban(address.trim());
                let _ = reply.send(self.persist().await.map_err(Into::into));
            }
        }
    }

    fn panel(&self) -> Result<String, PluginError> {
        let config = &self.state.config;
        let mut context = Context::new();
        context.insert("key", &self.ctx.key);
        context.insert("config", config);
        context.insert("password_set", &!config.smtp_password.is_empty());
        context.insert("complete", &config.is_complete());
        context.insert("confirmed", &self.state.confirmed());
        context.insert("pending", &self.state.subscribers.iter().filter(|s| s.hash).count());
        context.insert("queue_length", &self.state.queue.len());
        Ok(self
            .ctx
            .services
            .templates
            .render("plugins/register_mail.html", &context)?)
    }

    async fn change_config(&mut self, form: &HashMap<String, String>) -> Result<(), PluginError> {
        let parse_number = |name: &str| -> Result<usize, PluginError> {
            let raw = field(form, name).trim();
            if raw.is_empty() {
                return Ok(0);
            }
            raw.parse::<usize>().map_err(|_| {
                PluginError::InvalidInput(format!("{}: {name}", t!("mail.invalid_number")))
            })
        };
        let smtp_port = u16::try_from(parse_number("smtp_port")?).map_err(|_| {
            PluginError::InvalidInput(format!("{}: smtp_port", t!("mail.invalid_number")))
        })?;
        let rate_limit = parse_number("rate_limit")?;

        // Blank connection fields keep what is stored.
        let current = &self.state.config;
        let keep = |name: &str, old: &str| -> String {
            match field(form, name).trim() {
                "" => old.to_string(),
                value => value.to_string(),
            }
        };

        let from = keep("from", &current.from);
        if !from.is_empty() {
            parse_mailbox(&from).map_err(|e| {
                PluginError::InvalidInput(format!("{}: {e}", t!("mail.invalid_address")))
            })?;
        }
        let smtp_server = keep("smtp_server", &current.smtp_server);
        let smtp_user = keep("smtp_user", &current.smtp_user);
        let password = field(form, "smtp_password");
        let smtp_password = if password.is_empty() {
            current.smtp_password.clone()
        } else {
            password.to_string()
        };

        self.state.config = RegisterMailConfig {
            subject_prefix: field(form, "subject_prefix").trim().to_string(),
            from,
            smtp_server,
            smtp_port,
            smtp_user,
            smtp_password,
            rate_limit,
            register_mail_text: field(form, "register_mail_text").trim().to_string(),
            unregister_link_text: field(form, "unregister_link_text").trim().to_string(),
            register_password: field(form, "register_password").to_string(),
            server_name: field(form, "server_name").trim().to_string(),
        };
        self.persist().await
    }

    async fn subscribe(&mut self, address: &str, register_password: &str) -> Result<(), RegisterError> {
        if !self.state.config.is_complete() {
            return Err(RegisterError::Incomplete);
        }
        if register_password != self.state.config.register_password {
            return Err(RegisterError::Forbidden);
        }
        let mailbox = parse_mailbox(address).map_err(|_| RegisterError::InvalidAddress)?;
        let address = mailbox.email.to_string();

        self.state
            .subscribe(&address, &self.ctx.description)
            .map_err(|rejection| match rejection {
                SubscribeRejection::AlreadySubscribed | SubscribeRejection::Blocked => {
                    RegisterError::AlreadyRegistered
                }
            })?;
        if let Err(e) = self.persist().await {
            self.ctx
                .errors
                .report(format!("error while saving new registration: {e}"));
            return Err(e.into());
        }
        Ok(())
    }

    async fn verify(&mut self, salt: &str, address: &str) -> Result<(), RegisterError> {
        if !self.state.config.is_complete() {
            return Err(RegisterError::Incomplete);
        }
        if salt.is_empty() || address.is_empty() || !self.state.verify(salt, address) {
            return Err(RegisterError::Forbidden);
        }
        self.persist().await?;
        Ok(())
    }

    async fn unsubscribe(&mut self, salt: &str, address: &str) -> Result<(), RegisterError> {
        if !self.state.config.is_complete() {
            return Err(RegisterError::Incomplete);
        }
        if salt.is_empty() || address.is_empty() {
            return Err(RegisterError::Forbidden);
        }
        if self.state.unsubscribe(salt, address) {
            self.persist().await?;
        }
        Ok(())
    }
}
