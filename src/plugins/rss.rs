use async_trait::async_trait;
use axum::{Router, extract::State, http::header, response::IntoResponse, routing::get};
use chrono::Utc;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tera::Context;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Plugin, PluginContext, PluginError, field};
use crate::db::Announcement;
use crate::version;

pub const NAME: &str = "RSS";
const RETRY_AFTER: Duration = Duration::from_secs(15 * 60);
const CONTENT_TYPE: &str = "application/rss+xml; charset=utf-8";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct RssState {
    /// 0 shows the whole history.
    number_shown: usize,
    link: String,
    cache: String,
}

/// Keeps a ready-made RSS 2.0 document of the latest announcements.
pub struct Rss {
    ctx: PluginContext,
    state: Mutex<RssState>,
    retry_pending: AtomicBool,
    me: Weak<Rss>,
}

pub async fn create(ctx: PluginContext) -> Result<Arc<dyn Plugin>, PluginError> {
    let state: RssState = ctx.store.load().await?;
    let rss = Arc::new_cyclic(|me| Rss {
        ctx,
        state: Mutex::new(state),
        retry_pending: AtomicBool::new(false),
        me: me.clone(),
    });
    rss.refresh().await;
    Ok(rss)
}

struct FeedItem<'a> {
    id: &'a str,
    announcement: &'a Announcement,
}

fn xml_error(e: impl std::fmt::Display) -> PluginError {
    PluginError::InvalidInput(format!("could not write feed: {e}"))
}

fn text_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<(), PluginError> {
    writer
        .create_element(name)
        .write_text_content(BytesText::new(text))
        .map_err(xml_error)?;
    Ok(())
}

fn render_feed(
    key: &str,
    description: &str,
    link: &str,
    items: &[FeedItem<'_>],
) -> Result<String, PluginError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_error)?;
    let mut rss = BytesStart::new("rss");
    rss.push_attribute(("version", "2.0"));
    writer.write_event(Event::Start(rss)).map_err(xml_error)?;
    writer
        .write_event(Event::Start(BytesStart::new("channel")))
        .map_err(xml_error)?;

    text_element(&mut writer, "title", description)?;
    text_element(&mut writer, "link", link)?;
    text_element(&mut writer, "description", description)?;
    text_element(&mut writer, "generator", &version::generator())?;
    text_element(&mut writer, "lastBuildDate", &Utc::now().to_rfc2822())?;

    for item in items {
        writer
            .write_event(Event::Start(BytesStart::new("item")))
            .map_err(xml_error)?;
        text_element(&mut writer, "title", &item.announcement.header)?;
        if !link.is_empty() {
            text_element(&mut writer, "link", link)?;
        }
        text_element(&mut writer, "description", &item.announcement.message)?;
        text_element(&mut writer, "pubDate", &item.announcement.time.to_rfc2822())?;
        let mut guid = BytesStart::new("guid");
        guid.push_attribute(("isPermaLink", "false"));
        writer.write_event(Event::Start(guid)).map_err(xml_error)?;
        writer
            .write_event(Event::Text(BytesText::new(&format!("{key}/{}", item.id))))
            .map_err(xml_error)?;
        writer
            .write_event(Event::End(BytesEnd::new("guid")))
            .map_err(xml_error)?;
        writer
            .write_event(Event::End(BytesEnd::new("item")))
            .map_err(xml_error)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("channel")))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesEnd::new("rss")))
        .map_err(xml_error)?;
    String::from_utf8(writer.into_inner()).map_err(xml_error)
}

impl Rss {
    async fn rebuild(&self, state: &mut RssState) -> Result<(), PluginError> {
        let safe = self.ctx.store.data_safe();
        let history = safe.get_all_announcements(&self.ctx.key).await?;
        let ids = safe.get_announcement_keys(&self.ctx.key).await?;

        let skip = match state.number_shown {
            0 => 0,
            n => history.len().saturating_sub(n),
        };
        // Newest first.
        let items: Vec<FeedItem<'_>> = ids
            .iter()
            .zip(history.iter())
            .skip(skip)
            .rev()
            .map(|(id, announcement)| FeedItem { id, announcement })
            .collect();

        state.cache = render_feed(&self.ctx.key, &self.ctx.description, &state.link, &items)?;
        self.ctx.store.save(&*state).await?;
        debug!(tenant = %self.ctx.key, items = items.len(), "RSS feed rebuilt.");
        Ok(())
    }

    /// Rebuilds the feed; on failure reports it and tries again later.
    async fn refresh(&self) {
        let _guard = self.ctx.services.counter.start();
        let mut state = self.state.lock().await;
        if let Err(e) = self.rebuild(&mut state).await {
            self.ctx
                .errors
                .report(format!("could not rebuild feed, retrying in 15 minutes: {e}"));
            self.schedule_retry();
        }
    }

    fn schedule_retry(&self) {
        if self.retry_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let me = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RETRY_AFTER).await;
            if let Some(rss) = me.upgrade() {
                rss.retry_pending.store(false, Ordering::SeqCst);
                info!(tenant = %rss.ctx.key, "Retrying RSS feed rebuild.");
                rss.refresh().await;
            }
        });
    }

    async fn feed(&self) -> String {
        self.state.lock().await.cache.clone()
    }
}

async fn feed_handler(State(rss): State<Arc<Rss>>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], rss.feed().await)
}

#[async_trait]
impl Plugin for Rss {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn config_panel(&self) -> Result<String, PluginError> {
        let state = self.state.lock().await;
        let mut context = Context::new();
        context.insert("key", &self.ctx.key);
        context.insert("number_shown", &state.number_shown);
        context.insert("link", &state.link);
        Ok(self
            .ctx
            .services
            .templates
            .render("plugins/rss.html", &context)?)
    }

    async fn process_config_change(&self, form: HashMap<String, String>) -> Result<(), PluginError> {
        let number_shown = field(&form, "number_shown")
            .trim()
            .parse::<usize>()
            .map_err(|_| PluginError::InvalidInput(t!("rss.invalid_number").into_owned()))?;

        let _guard = self.ctx.services.counter.start();
        let mut state = self.state.lock().await;
        state.number_shown = number_shown;
        state.link = field(&form, "link").trim().to_string();
        self.rebuild(&mut state).await
    }

    async fn new_announcement(&self, _announcement: Announcement, _id: String) {
        self.refresh().await;
    }

    fn routes(self: Arc<Self>) -> Option<Router> {
        Some(Router::new().route("/feed.rss", get(feed_handler)).with_state(self))
    }
}
