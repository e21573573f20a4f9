//! Per-tenant pages: login, publishing, plugin configuration, history.

use axum::{
    Form, Router,
    extract::{Query, State},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tera::Context;
use tracing::{info, warn};

use crate::server::config::ServerConfig;
use crate::services::auth_service::AuthService;
use crate::tenant::Tenant;
use crate::web::error::AppError;

const CLEAR_ERRORS: &str = "clear_errors";
const PUBLISH: &str = "publish";

#[derive(Clone)]
struct TenantState {
    tenant: Arc<Tenant>,
    config: Arc<ServerConfig>,
}

/// Routes below `/{key}`, including every plugin's pages below `/{key}/{plugin}`.
pub fn router(tenant: Arc<Tenant>, config: Arc<ServerConfig>) -> Router {
    let base = format!("/{}", tenant.key);
    let mut router = Router::new()
        .route(&base, get(index).post(submit))
        .route(&format!("{base}/"), get(index).post(submit))
        .route(&format!("{base}/login"), post(login))
        .route(&format!("{base}/logout"), get(logout))
        .route(&format!("{base}/history.html"), get(history))
        .with_state(TenantState {
            tenant: tenant.clone(),
            config,
        });

    // Plugin routers carry their own state already.
    for plugin in tenant.plugins() {
        if let Some(routes) = plugin.clone().routes() {
            router = router.nest(&format!("{base}/{}", plugin.name()), routes);
        }
    }
    router
}

fn home(key: &str, message: &str) -> Redirect {
    Redirect::to(&format!("/{key}/?message={}", urlencoding::encode(message)))
}

#[derive(Deserialize)]
struct IndexQuery {
    #[serde(default)]
    message: String,
}

#[derive(Serialize)]
struct Panel {
    name: &'static str,
    html: String,
}

async fn index(
    State(state): State<TenantState>,
    jar: CookieJar,
    Query(query): Query<IndexQuery>,
) -> Result<Html<String>, AppError> {
    let tenant = &state.tenant;
    let services = tenant.services();
    let login = services.auth.login_state(&jar, &tenant.key);

    let mut context = Context::new();
    context.insert("key", &tenant.key);
    context.insert("description", &tenant.description);
    context.insert("message", &query.message);
    context.insert("logged_in", &login.any());
    context.insert("admin", &login.admin);

    if login.admin {
        let mut panels = Vec::new();
        for plugin in tenant.plugins() {
            let html = match plugin.config_panel().await {
                Ok(html) => html,
                Err(e) => {
                    warn!(tenant = %tenant.key, plugin = plugin.name(), error = %e, "Config panel failed.");
                    format!("<p class=\"error\">{}</p>", tera::escape_html(&e.to_string()))
                }
            };
            panels.push(Panel {
                name: plugin.name(),
                html,
            });
        }
        context.insert("panels", &panels);
        context.insert("errors", &tenant.error_entries().await);
    }

    Ok(Html(services.templates.render("index.html", &context)?))
}

async fn submit(
    State(state): State<TenantState>,
    jar: CookieJar,
    Form(form): Form<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let tenant = &state.tenant;
    let login = tenant.services().auth.login_state(&jar, &tenant.key);
    if !login.any() {
        return Err(AppError::forbidden());
    }

    let field = |name: &str| form.get(name).map(String::as_str).unwrap_or_default();
    let target = field("target").to_string();
    if !target.is_empty() && target != PUBLISH {
        if !login.admin {
            return Err(AppError::forbidden());
        }
        if target == CLEAR_ERRORS {
            tenant.clear_errors().await?;
            return Ok(home(&tenant.key, &t!("index.errors_cleared")).into_response());
        }
        let Some(plugin) = tenant.plugin(&target) else {
            return Err(AppError::BadRequest(format!("{}: {target}", t!("error.unknown_target"))));
        };
        let message = match plugin.process_config_change(form).await {
            Ok(()) => t!("index.config_saved").into_owned(),
            Err(e) => {
                warn!(tenant = %tenant.key, plugin = %target, error = %e, "Config change rejected.");
                e.to_string()
            }
        };
        return Ok(home(&tenant.key, &message).into_response());
    }

    if field("dsgvo").is_empty() {
        return Err(AppError::PreconditionFailed(t!("error.consent_missing").into_owned()));
    }
    let subject = field("subject").trim();
    let message = field("message").trim();
    if subject.is_empty() || message.is_empty() {
        return Err(AppError::BadRequest(t!("error.announcement_empty").into_owned()));
    }

    // Delivery continues on its own tasks; the response does not wait for plugins.
    let fan_out = tenant.publish(subject, message).await;
    info!(tenant = %tenant.key, id = ?fan_out.id, plugins = fan_out.deliveries.len(), "Fan-out started.");
    Ok(home(&tenant.key, &t!("index.published")).into_response())
}

#[derive(Deserialize)]
struct LoginForm {
    #[serde(default)]
    password: String,
}

async fn login(
    State(state): State<TenantState>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Result<(CookieJar, Redirect), AppError> {
    let tenant = &state.tenant;
    let Some(role) = tenant.login(&form.password) else {
        if state.config.log_failed_login {
            warn!(tenant = %tenant.key, "Failed login.");
        }
        return Err(AppError::Forbidden(t!("login.failed").into_owned()));
    };

    let cookie = tenant
        .services()
        .auth
        .issue(&tenant.key, role)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok((jar.add(cookie), Redirect::to(&format!("/{}/", tenant.key))))
}

async fn logout(State(state): State<TenantState>, jar: CookieJar) -> (CookieJar, Redirect) {
    let key = &state.tenant.key;
    let jar = AuthService::logout_cookies(key)
        .into_iter()
        .fold(jar, |jar, cookie| jar.add(cookie));
    (jar, Redirect::to(&format!("/{key}/")))
}

#[derive(Serialize)]
struct HistoryEntry {
    id: String,
    header: String,
    message: String,
    time: String,
}

async fn history(State(state): State<TenantState>, jar: CookieJar) -> Result<Html<String>, AppError> {
    let tenant = &state.tenant;
    if !tenant.services().auth.login_state(&jar, &tenant.key).any() {
        return Err(AppError::forbidden());
    }
    let entries: Vec<HistoryEntry> = tenant
        .history()
        .await?
        .into_iter()
        .rev()
        .map(|(id, a)| HistoryEntry {
            id,
            header: a.header,
            message: a.message,
            time: a.time.format("%Y-%m-%d %H:%M UTC").to_string(),
        })
        .collect();

    let mut context = Context::new();
    context.insert("key", &tenant.key);
    context.insert("description", &tenant.description);
    context.insert("announcements", &entries);
    Ok(Html(tenant.services().templates.render("history.html", &context)?))
}
