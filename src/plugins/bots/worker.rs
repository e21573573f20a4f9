//! Platform independent bot plugin: one actor per tenant and platform owning the target
//! list, the client connection and a send queue drained one segment per tick.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tera::Context;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use super::{BotClient, BotError, BotEvent, Connector, Delivery, split_message};
use crate::db::Announcement;
use crate::plugins::{Plugin, PluginContext, PluginError, field};

/// Platforms throttle bots hard; one message every two seconds stays well below every limit.
pub const SEND_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfig<T> {
    #[serde(default)]
    pub token: String,
    #[serde(default = "Vec::new")]
    pub targets: Vec<T>,
}

impl<T> Default for BotConfig<T> {
    fn default() -> Self {
        Self {
            token: String::new(),
            targets: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct Outgoing<T> {
    target: T,
    text: String,
    silent: bool,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Panel(Reply<Result<String, PluginError>>),
    ConfigChange {
        form: HashMap<String, String>,
        reply: Reply<Result<(), PluginError>>,
    },
    Announcement {
        announcement: Announcement,
        reply: Reply<()>,
    },
}

struct Connection<C> {
    client: Arc<C>,
    listener: JoinHandle<()>,
}

impl<C> Drop for Connection<C> {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

struct Worker<C: BotClient> {
    ctx: PluginContext,
    config: BotConfig<C::Target>,
    connector: Connector<C>,
    connection: Option<Connection<C>>,
    events: mpsc::Sender<BotEvent<C::Target>>,
    queue: VecDeque<Outgoing<C::Target>>,
}

impl<C: BotClient> Worker<C> {
    async fn connect(&self, token: &str) -> Result<Connection<C>, BotError> {
        let client = (self.connector)(token.to_string()).await?;
        let listener = client.clone();
        let events = self.events.clone();
        let errors = self.ctx.errors.clone();
        let listener = tokio::spawn(async move {
            if let Err(e) = listener.listen(events).await {
                errors.report(format!("listener stopped: {e}"));
            }
        });
        info!(tenant = %self.ctx.key, platform = C::PLATFORM, "Bot connected.");
        Ok(Connection { client, listener })
    }

    async fn persist(&self) -> Result<(), PluginError> {
        self.ctx.store.save(&self.config).await
    }

    async fn persist_or_report(&self) {
        if let Err(e) = self.persist().await {
            self.ctx.errors.report(format!("error while saving targets: {e}"));
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<BotEvent<C::Target>>,
        period: Duration,
    ) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        let _guard = self.ctx.services.counter.start();
                        self.handle(command).await;
                    }
                    None => break,
                },
                Some(event) = events.recv() => {
                    let _guard = self.ctx.services.counter.start();
                    self.on_event(event).await;
                }
                _ = ticker.tick() => {
                    if !self.queue.is_empty() {
                        let _guard = self.ctx.services.counter.start();
                        self.send_next().await;
                    }
                }
            }
        }
        debug!(tenant = %self.ctx.key, platform = C::PLATFORM, "Bot worker stopped.");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Panel(reply) => {
                let _ = reply.send(self.panel().await);
            }
            Command::ConfigChange { form, reply } => {
                let _ = reply.send(self.change_config(&form).await);
            }
            Command::Announcement {
                announcement,
                reply,
            } => {
                self.enqueue(&announcement);
                let _ = reply.send(());
            }
        }
    }

    fn enqueue(&mut self, announcement: &Announcement) {
        if self.connection.is_none() {
            debug!(tenant = %self.ctx.key, platform = C::PLATFORM, "No bot configured, announcement skipped.");
            return;
        }
        let text = format!("{}\n\n{}", announcement.header, announcement.message);
        let segments = split_message(&text, C::MESSAGE_LIMIT);
        for target in &self.config.targets {
            for (index, segment) in segments.iter().enumerate() {
                self.queue.push_back(Outgoing {
                    target: target.clone(),
                    text: segment.clone(),
                    silent: index > 0,
                });
            }
        }
    }

    fn remove_target(&mut self, target: &C::Target) -> bool {
        let before = self.config.targets.len();
        self.config.targets.retain(|t| t != target);
        self.queue.retain(|item| &item.target != target);
        before != self.config.targets.len()
    }

    fn migrate(&mut self, from: &C::Target, to: &C::Target) {
        if self.config.targets.contains(to) {
            self.config.targets.retain(|t| t != from);
        } else {
            for target in self.config.targets.iter_mut().filter(|t| *t == from) {
                *target = to.clone();
            }
        }
        for item in self.queue.iter_mut().filter(|item| &item.target == from) {
            item.target = to.clone();
        }
    }

    async fn send_next(&mut self) {
        let Some(client) = self.connection.as_ref().map(|c| c.client.clone()) else {
            return;
        };
        let Some(item) = self.queue.pop_front() else {
            return;
        };

        match client.send(&item.target, &item.text, item.silent).await {
            Delivery::Delivered => {}
            Delivery::Migrated(to) => {
                info!(tenant = %self.ctx.key, from = %item.target, to = %to, "Chat migrated.");
                self.migrate(&item.target, &to);
                self.queue.push_front(Outgoing { target: to, ..item });
                self.persist_or_report().await;
            }
            Delivery::Permanent(reason) => {
                self.remove_target(&item.target);
                self.ctx.errors.report(format!(
                    "removed unreachable target {}: {reason}",
                    item.target
                ));
                self.persist_or_report().await;
            }
            Delivery::Transient(reason) => {
                self.ctx
                    .errors
                    .report(format!("could not send to {}: {reason}", item.target));
            }
        }
    }

    async fn on_event(&mut self, event: BotEvent<C::Target>) {
        match event {
            BotEvent::Joined(target) => {
                if !self.config.targets.contains(&target) {
                    info!(tenant = %self.ctx.key, platform = C::PLATFORM, target = %target, "Target added.");
                    self.config.targets.push(target);
                    self.persist_or_report().await;
                }
            }
            BotEvent::Left(target) => {
                if self.remove_target(&target) {
                    info!(tenant = %self.ctx.key, platform = C::PLATFORM, target = %target, "Target removed.");
                    self.persist_or_report().await;
                }
            }
            BotEvent::Migrated { from, to } => {
                self.migrate(&from, &to);
                self.persist_or_report().await;
            }
            BotEvent::Greet(target) => {
                let Some(connection) = &self.connection else {
                    return;
                };
                if let Delivery::Permanent(reason) | Delivery::Transient(reason) =
                    connection.client.send(&target, &t!("bot.greeting"), false).await
                {
                    warn!(tenant = %self.ctx.key, platform = C::PLATFORM, %reason, "Greeting not delivered.");
                }
            }
        }
    }

    async fn panel(&self) -> Result<String, PluginError> {
        let invite_link = match &self.connection {
            Some(connection) => connection.client.invite_link().await,
            None => None,
        };
        let mut context = Context::new();
        context.insert("platform", C::PLATFORM);
        context.insert("connected", &self.connection.is_some());
        context.insert("token_set", &!self.config.token.is_empty());
        context.insert("target_count", &self.config.targets.len());
        context.insert("queue_length", &self.queue.len());
        context.insert("invite_link", &invite_link);
        Ok(self
            .ctx
            .services
            .templates
            .render("plugins/bot.html", &context)?)
    }

    /// An empty token field keeps the current token; `disconnect` forgets it.
    async fn change_config(&mut self, form: &HashMap<String, String>) -> Result<(), PluginError> {
        if !field(form, "disconnect").is_empty() {
            self.connection = None;
            self.queue.clear();
            self.config = BotConfig::default();
            return self.persist().await;
        }

        let token = field(form, "token").trim();
        if token.is_empty() || token == self.config.token {
            return Ok(());
        }

        let connection = self.connect(token).await?;
        self.connection = Some(connection);
        self.queue.clear();
        // Targets belong to the old bot account.
        self.config = BotConfig {
            token: token.to_string(),
            targets: Vec::new(),
        };
        self.persist().await
    }
}

/// Handle to the bot actor of one tenant.
pub struct BotPlugin<C: BotClient> {
    ctx: PluginContext,
    tx: mpsc::Sender<Command>,
    _client: std::marker::PhantomData<fn() -> C>,
}

pub async fn create<C: BotClient>(
    ctx: PluginContext,
    connector: Connector<C>,
) -> Result<Arc<dyn Plugin>, PluginError> {
    spawn(ctx, connector, SEND_INTERVAL).await
}

pub(crate) async fn spawn<C: BotClient>(
    ctx: PluginContext,
    connector: Connector<C>,
    period: Duration,
) -> Result<Arc<dyn Plugin>, PluginError> {
    let config: BotConfig<C::Target> = ctx.store.load().await?;
    let (events_tx, events_rx) = mpsc::channel(32);
    let (tx, rx) = mpsc::channel(32);

    let mut worker = Worker::<C> {
        ctx: ctx.clone(),
        config,
        connector,
        connection: None,
        events: events_tx,
        queue: VecDeque::new(),
    };
    if !worker.config.token.is_empty() {
        let token = worker.config.token.clone();
        match worker.connect(&token).await {
            Ok(connection) => worker.connection = Some(connection),
            Err(e) => ctx.errors.report(format!("could not connect: {e}")),
        }
    }
    tokio::spawn(worker.run(rx, events_rx, period));

    Ok(Arc::new(BotPlugin::<C> {
        ctx,
        tx,
        _client: std::marker::PhantomData,
    }))
}

impl<C: BotClient> BotPlugin<C> {
    async fn ask<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, PluginError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| PluginError::WorkerGone)?;
        response.await.map_err(|_| PluginError::WorkerGone)
    }
}

#[async_trait]
impl<C: BotClient> Plugin for BotPlugin<C> {
    fn name(&self) -> &'static str {
        C::PLATFORM
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::PluginStore;
    use crate::plugins::mailer::testing::MockMailer;
    use crate::plugins::testing::{MemoryDataSafe, context};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockBot {
        sent: Mutex<Vec<(i64, String, bool)>>,
        outcomes: Mutex<HashMap<i64, Delivery<i64>>>,
        events: Mutex<Vec<BotEvent<i64>>>,
    }

    #[async_trait]
    impl BotClient for MockBot {
        type Target = i64;
        const PLATFORM: &'static str = "MockBot";
        const MESSAGE_LIMIT: usize = 40;

        async fn send(&self, target: &i64, text: &str, silent: bool) -> Delivery<i64> {
            self.sent
                .lock()
                .unwrap()
                .push((*target, text.to_string(), silent));
            self.outcomes
                .lock()
                .unwrap()
                .remove(target)
                .unwrap_or(Delivery::Delivered)
        }

        async fn listen(&self, events: mpsc::Sender<BotEvent<i64>>) -> Result<(), BotError> {
            let pending: Vec<_> = self.events.lock().unwrap().drain(..).collect();
            for event in pending {
                if events.send(event).await.is_err() {
                    return Ok(());
                }
            }
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn connector(bot: Arc<MockBot>) -> Connector<MockBot> {
        Arc::new(move |token: String| {
            let bot = bot.clone();
            Box::pin(async move {
                if token == "bad" {
                    Err(BotError::Rejected("invalid token".to_string()))
                } else {
                    Ok(bot)
                }
            })
        })
    }

    async fn start(bot: Arc<MockBot>, targets: Vec<i64>) -> (Arc<dyn Plugin>, PluginStore) {
        let (ctx, _rx) = context(
            "news",
            "MockBot",
            Arc::new(MemoryDataSafe::default()),
            Arc::new(MockMailer::default()),
        );
        ctx.store
            .save(&BotConfig {
                token: "good".to_string(),
                targets,
            })
            .await
            .unwrap();
        let store = ctx.store.clone();
        let plugin = spawn(ctx, connector(bot), Duration::from_millis(5))
            .await
            .unwrap();
        (plugin, store)
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    const LONG: &str = "a fairly long message body that needs more than one part";

    fn segments() -> Vec<String> {
        split_message(&format!("Header\n\n{LONG}"), MockBot::MESSAGE_LIMIT)
    }

    #[tokio::test]
    async fn test_segments_are_sent_to_every_target() {
        let bot = Arc::new(MockBot::default());
        let (plugin, _store) = start(bot.clone(), vec![1, 2]).await;
        let segments = segments();
        assert!(segments.len() > 1);

        plugin
            .new_announcement(Announcement::new("Header", LONG), "1".to_string())
            .await;
        wait_for(|| bot.sent.lock().unwrap().len() >= 2 * segments.len()).await;

        let expected: Vec<(i64, String, bool)> = [1, 2]
            .into_iter()
            .flat_map(|target| {
                segments
                    .iter()
                    .enumerate()
                    .map(move |(i, segment)| (target, segment.clone(), i > 0))
            })
            .collect();
        assert_eq!(*bot.sent.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_permanent_failure_removes_target_and_its_queue() {
        let bot = Arc::new(MockBot::default());
        bot.outcomes
            .lock()
            .unwrap()
            .insert(1, Delivery::Permanent("blocked".to_string()));
        let (plugin, store) = start(bot.clone(), vec![1, 2]).await;
        let count = segments().len();

        plugin
            .new_announcement(Announcement::new("Header", LONG), "1".to_string())
            .await;
        wait_for(|| bot.sent.lock().unwrap().len() > count).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let targets: Vec<i64> = bot.sent.lock().unwrap().iter().map(|s| s.0).collect();
        let mut expected = vec![1];
        expected.extend(std::iter::repeat_n(2, count));
        assert_eq!(targets, expected);
        let saved: BotConfig<i64> = store.load().await.unwrap();
        assert_eq!(saved.targets, vec![2]);
    }

    #[tokio::test]
    async fn test_migration_replaces_target_and_resends() {
        let bot = Arc::new(MockBot::default());
        bot.outcomes.lock().unwrap().insert(1, Delivery::Migrated(-100));
        let (plugin, store) = start(bot.clone(), vec![1]).await;

        plugin
            .new_announcement(Announcement::new("Hi", "short"), "1".to_string())
            .await;
        wait_for(|| bot.sent.lock().unwrap().len() >= 2).await;

        let targets: Vec<i64> = bot.sent.lock().unwrap().iter().map(|s| s.0).collect();
        assert_eq!(targets, vec![1, -100]);
        let saved: BotConfig<i64> = store.load().await.unwrap();
        assert_eq!(saved.targets, vec![-100]);
    }

    #[tokio::test]
    async fn test_listener_events_update_targets() {
        let bot = Arc::new(MockBot::default());
        bot.events.lock().unwrap().extend([
            BotEvent::Joined(5),
            BotEvent::Joined(5),
            BotEvent::Left(1),
            BotEvent::Greet(7),
        ]);
        let (_plugin, store) = start(bot.clone(), vec![1]).await;

        wait_for(|| !bot.sent.lock().unwrap().is_empty()).await;
        let sent = bot.sent.lock().unwrap().clone();
        assert_eq!(sent[0].0, 7);
        assert!(!sent[0].2);

        let saved: BotConfig<i64> = store.load().await.unwrap();
        assert_eq!(saved.targets, vec![5]);
    }

    #[tokio::test]
    async fn test_bad_token_is_rejected_and_not_saved() {
        let bot = Arc::new(MockBot::default());
        let (plugin, store) = start(bot, vec![1]).await;

        let form = HashMap::from([("token".to_string(), "bad".to_string())]);
        let err = plugin.process_config_change(form).await.unwrap_err();
        assert!(matches!(err, PluginError::Bot(BotError::Rejected(_))));

        let saved: BotConfig<i64> = store.load().await.unwrap();
        assert_eq!(saved.token, "good");
        assert_eq!(saved.targets, vec![1]);
    }

    #[tokio::test]
    async fn test_token_change_resets_targets() {
        let bot = Arc::new(MockBot::default());
        let (plugin, store) = start(bot, vec![1]).await;

        let form = HashMap::from([("token".to_string(), "other".to_string())]);
        plugin.process_config_change(form).await.unwrap();
        let saved: BotConfig<i64> = store.load().await.unwrap();
        assert_eq!(saved.token, "other");
        assert!(saved.targets.is_empty());

        let panel = plugin.config_panel().await.unwrap();
        assert!(panel.contains("MockBot"));
    }
}
