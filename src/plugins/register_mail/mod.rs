//! Double opt-in mailing list with a rate limited, retrying send queue.

use async_trait::async_trait;
use axum::{
    Form, Router,
    extract::{Query, State},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tera::Context;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::{Plugin, PluginContext, PluginError};
use crate::db::Announcement;
use crate::web::error::{AppError, message_page};

mod actor;
pub mod state;

pub use actor::{TickReport, process_queue};
use actor::{Command, Reply, Worker};
use state::RegisterMailState;

pub const NAME: &str = "RegisterMail";

#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("configuration incomplete")]
    Incomplete,
    #[error("forbidden")]
    Forbidden,
    #[error("invalid mail address")]
    InvalidAddress,
    #[error("address already registered")]
    AlreadyRegistered,
    #[error(transparent)]
    Plugin(#[from] PluginError),
}

impl From<RegisterError> for AppError {
    fn from(err: RegisterError) -> Self {
        match err {
            RegisterError::Incomplete => AppError::Internal(format!("{NAME}: configuration incomplete")),
            RegisterError::Forbidden => AppError::forbidden(),
            RegisterError::InvalidAddress => {
                AppError::BadRequest(t!("register_mail.invalid_address").into_owned())
            }
            RegisterError::AlreadyRegistered => {
                AppError::BadRequest(t!("register_mail.already_registered").into_owned())
            }
            RegisterError::Plugin(e) => e.into(),
        }
    }
}

/// Handle to the RegisterMail actor of one tenant.
pub struct RegisterMail {
    ctx: PluginContext,
    tx: mpsc::Sender<Command>,
}

pub async fn create(ctx: PluginContext) -> Result<Arc<dyn Plugin>, PluginError> {
    let state: RegisterMailState = ctx.store.load().await?;
    let (tx, rx) = mpsc::channel(64);
    let worker = Worker {
        ctx: ctx.clone(),
        state,
    };
    tokio::spawn(worker.run(rx));
    Ok(Arc::new(RegisterMail { ctx, tx }))
}

impl RegisterMail {
    async fn ask<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, PluginError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| PluginError::WorkerGone)?;
        response.await.map_err(|_| PluginError::WorkerGone)
    }

    fn require_admin(&self, jar: &CookieJar) -> Result<(), AppError> {
        if self.ctx.services.auth.login_state(jar, &self.ctx.key).admin {
            Ok(())
        } else {
            Err(AppError::forbidden())
        }
    }

    fn render_page(&self, template: &str, mut context: Context) -> Result<Html<String>, AppError> {
        context.insert("key", &self.ctx.key);
        context.insert("description", &self.ctx.description);
        Ok(Html(self.ctx.services.templates.render(template, &context)?))
    }

    fn admin_redirect(&self, message: &str) -> Redirect {
        Redirect::to(&format!(
            "/{}/?message={}",
            self.ctx.key,
            urlencoding::encode(message)
        ))
    }
}

#[derive(Deserialize)]
struct SubscribeForm {
    #[serde(default)]
    dsgvo: String,
    #[serde(default)]
    captcha_id: String,
    #[serde(default)]
    captcha: String,
    #[serde(default)]
    rp: String,
    #[serde(default)]
    mail: String,
}

#[derive(Deserialize)]
struct SubscriptionParams {
    #[serde(default)]
    key: String,
    #[serde(default)]
    mail: String,
}

#[derive(Deserialize)]
struct AddressForm {
    #[serde(default)]
    mail: String,
}

async fn subscribe_page(State(plugin): State<Arc<RegisterMail>>) -> Result<Html<String>, AppError> {
    let status = plugin.ask(Command::Status).await?;
    if !status.complete {
        return Err(RegisterError::Incomplete.into());
    }
    let challenge = plugin.ctx.services.captcha.challenge();
    let mut context = Context::new();
    context.insert("captcha_id", &challenge.id);
    context.insert("captcha_question", &challenge.question);
    context.insert("password_required", &status.password_required);
    plugin.render_page("register_mail/subscribe.html", context)
}

async fn subscribe_submit(
    State(plugin): State<Arc<RegisterMail>>,
    Form(form): Form<SubscribeForm>,
) -> Result<Html<String>, AppError> {
    let status = plugin.ask(Command::Status).await?;
    if !status.complete {
        return Err(RegisterError::Incomplete.into());
    }
    if form.dsgvo.is_empty() {
        return Err(AppError::Forbidden(t!("error.consent_missing").into_owned()));
    }
    if !plugin.ctx.services.captcha.verify(&form.captcha_id, &form.captcha) {
        return Err(AppError::Forbidden(t!("register_mail.captcha_failed").into_owned()));
    }
    plugin
        .ask(|reply| Command::Subscribe {
            address: form.mail,
            register_password: form.rp,
            reply,
        })
        .await??;
    Ok(Html(message_page(
        &plugin.ctx.description,
        &t!("register_mail.subscribe_success"),
    )))
}

async fn verify_handler(
    State(plugin): State<Arc<RegisterMail>>,
    Query(params): Query<SubscriptionParams>,
) -> Result<Html<String>, AppError> {
    plugin
        .ask(|reply| Command::Verify {
            salt: params.key,
            address: params.mail,
            reply,
        })
        .await??;
    Ok(Html(message_page(
        &plugin.ctx.description,
        &t!("register_mail.verify_success"),
    )))
}

async fn unsubscribe_page(
    State(plugin): State<Arc<RegisterMail>>,
    Query(params): Query<SubscriptionParams>,
) -> Result<Html<String>, AppError> {
    let mut context = Context::new();
    context.insert("salt", &params.key);
    context.insert("mail", &params.mail);
    plugin.render_page("register_mail/unsubscribe.html", context)
}

async fn unsubscribe_submit(
    State(plugin): State<Arc<RegisterMail>>,
    Form(params): Form<SubscriptionParams>,
) -> Result<Html<String>, AppError> {
    plugin
        .ask(|reply| Command::Unsubscribe {
            salt: params.key,
            address: params.mail,
            reply,
        })
        .await??;
    Ok(Html(message_page(
        &plugin.ctx.description,
        &t!("register_mail.unsubscribe_success"),
    )))
}

async fn delete_handler(
    State(plugin): State<Arc<RegisterMail>>,
    jar: CookieJar,
    Form(form): Form<AddressForm>,
) -> Result<Response, AppError> {
    plugin.require_admin(&jar)?;
    let removed = plugin
        .ask(|reply| Command::Delete {
            address: form.mail,
            reply,
        })
        .await??;
    let message = if removed {
        t!("register_mail.deleted")
    } else {
        t!("register_mail.not_found")
    };
    Ok(plugin.admin_redirect(&message).into_response())
}

async fn ban_handler(
    State(plugin): State<Arc<RegisterMail>>,
    jar: CookieJar,
    Form(form): Form<AddressForm>,
) -> Result<Response, AppError> {
    plugin.require_admin(&jar)?;
    plugin
        .ask(|reply| Command::Ban {
            address: form.mail,
            reply,
        })
        .await??;
    Ok(plugin
        .admin_redirect(&t!("register_mail.banned"))
        .into_response())
}

#[async_trait]
impl Plugin for RegisterMail {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn config_panel(&self) -> Result<String, PluginError> {
        self.ask(Command::Panel).await?
    }

    async fn process_config_change(&self, form: HashMap<String, String>) -> Result<(), PluginError> {
        self.ask(|reply| Command::ConfigChange { form, reply }).await?
    }

    async fn new_announcement(&self, announcement: Announcement, id: String) {
        let result = self
            .ask(|reply| Command::Announcement {
                announcement,
                reply,
            })
            .await;
        if let Err(e) = result {
            self.ctx
                .errors
                .report(format!("could not queue announcement {id}: {e}"));
        }
    }

    fn routes(self: Arc<Self>) -> Option<Router> {
        Some(
            Router::new()
                .route("/subscribe.html", get(subscribe_page).post(subscribe_submit))
                .route("/verify.html", get(verify_handler))
                .route(
                    "/unsubscribe.html",
                    get(unsubscribe_page).post(unsubscribe_submit),
                )
                .route("/delete.html", post(delete_handler))
                .route("/ban.html", post(ban_handler))
                .with_state(self),
        )
    }
}
