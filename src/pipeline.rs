/*!
 * Pipeline assembly and lifecycle.
 *
 * `Pipeline::build` creates the event bus and one service per logical key:
 * ingest, translate and publish services per configured account, and a
 * single analyze service. `start` adds a periodic fallback timer per service
 * and runs every ingest once immediately. `shutdown` stops the timers; work
 * already running in the queues is not interrupted.
 */

use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::app_config::Config;
use crate::events::EventBus;
use crate::platform::{FeedSource, PublishTarget};
use crate::providers::TranslationProvider;
use crate::queue::{QueueStats, TaskQueue};
use crate::stages::translate::LanguagePair;
use crate::stages::{AnalyzeService, IngestService, PublishService, Stage, TranslateService};
use crate::store::PipelineStore;

/// External collaborators the pipeline is built on
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn PipelineStore>,
    pub feed: Arc<dyn FeedSource>,
    pub publisher: Arc<dyn PublishTarget>,
    pub translator: Arc<dyn TranslationProvider>,
}

/// One service instance per key. Account-scoped services are keyed by
/// account name.
pub struct ServiceRegistry {
    ingest: BTreeMap<String, Arc<IngestService>>,
    analyze: Arc<AnalyzeService>,
    translate: BTreeMap<String, Arc<TranslateService>>,
    publish: BTreeMap<String, Arc<PublishService>>,
}

impl ServiceRegistry {
    pub fn ingest(&self, account: &str) -> Option<&Arc<IngestService>> {
        self.ingest.get(account)
    }

    pub fn analyze(&self) -> &Arc<AnalyzeService> {
        &self.analyze
    }

    pub fn translate(&self, account: &str) -> Option<&Arc<TranslateService>> {
        self.translate.get(account)
    }

    pub fn publish(&self, account: &str) -> Option<&Arc<PublishService>> {
        self.publish.get(account)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &str> {
        self.ingest.keys().map(String::as_str)
    }

    /// Every task queue, in account order, translate before publish
    pub fn queues(&self) -> Vec<TaskQueue> {
        self.translate
            .values()
            .map(|s| s.queue().clone())
            .chain(self.publish.values().map(|s| s.queue().clone()))
            .collect()
    }
}

/// The assembled pipeline
pub struct Pipeline {
    config: Config,
    bus: Arc<EventBus>,
    registry: ServiceRegistry,
    shutdown_tx: watch::Sender<bool>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Create the bus and every service. Nothing runs until [`Pipeline::start`].
    pub fn build(config: Config, collaborators: Collaborators) -> Result<Self> {
        let Collaborators {
            store,
            feed,
            publisher,
            translator,
        } = collaborators;
        let bus = Arc::new(EventBus::new());
        let languages = LanguagePair {
            source: config.source_language.clone(),
            target: config.target_language.clone(),
        };
        let max_wait = Duration::from_secs(config.publish.max_rate_limit_wait_secs);

        let analyze = AnalyzeService::new(store.clone(), bus.clone());
        let mut ingest = BTreeMap::new();
        let mut translate = BTreeMap::new();
        let mut publish = BTreeMap::new();

        for account in &config.accounts {
            if ingest.contains_key(&account.name) {
                return Err(anyhow!("Duplicate account name: {}", account.name));
            }
            ingest.insert(
                account.name.clone(),
                IngestService::new(
                    account.clone(),
                    store.clone(),
                    feed.clone(),
                    bus.clone(),
                    config.ingest.max_posts_per_request,
                ),
            );
            translate.insert(
                account.name.clone(),
                TranslateService::new(
                    account.clone(),
                    store.clone(),
                    bus.clone(),
                    translator.clone(),
                    languages.clone(),
                    &config.translation.queue,
                )?,
            );
            publish.insert(
                account.name.clone(),
                PublishService::new(
                    account.clone(),
                    store.clone(),
                    bus.clone(),
                    publisher.clone(),
                    &config.publish.queue,
                    max_wait,
                )?,
            );
        }

        info!(
            "Pipeline built for {} account(s): {}",
            ingest.len(),
            ingest.keys().cloned().collect::<Vec<_>>().join(", ")
        );

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            bus,
            registry: ServiceRegistry {
                ingest,
                analyze,
                translate,
                publish,
            },
            shutdown_tx,
            timers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Start the periodic fallback timers. Ingest runs once immediately.
    pub fn start(&self) {
        let secs = Duration::from_secs;
        let mut timers = self.timers.lock();
        if !timers.is_empty() {
            warn!("Pipeline already started; ignoring start");
            return;
        }

        for service in self.registry.ingest.values() {
            let service = service.clone();
            timers.push(self.spawn_timer(
                format!("ingest:{}", service.account().name),
                secs(self.config.ingest.interval_secs),
                true,
                move || {
                    let service = service.clone();
                    async move {
                        service.scan().await;
                    }
                },
            ));
        }

        let analyze = self.registry.analyze.clone();
        timers.push(self.spawn_timer(
            "analyze".to_string(),
            secs(self.config.analyze.interval_secs),
            false,
            move || {
                let service = analyze.clone();
                async move {
                    service.scan().await;
                }
            },
        ));

        for service in self.registry.translate.values() {
            let service = service.clone();
            timers.push(self.spawn_timer(
                format!("translate:{}", service.account().name),
                secs(self.config.translation.scan_interval_secs),
                false,
                move || {
                    let service = service.clone();
                    async move {
                        service.scan().await;
                    }
                },
            ));
        }

        for service in self.registry.publish.values() {
            let service = service.clone();
            timers.push(self.spawn_timer(
                format!("publish:{}", service.account().name),
                secs(self.config.publish.scan_interval_secs),
                false,
                move || {
                    let service = service.clone();
                    async move {
                        service.scan().await;
                    }
                },
            ));
        }

        info!("Pipeline started with {} timer(s)", timers.len());
    }

    fn spawn_timer<F, Fut>(
        &self,
        name: String,
        period: Duration,
        immediate: bool,
        tick: F,
    ) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            if !immediate {
                // The first tick completes immediately
                interval.tick().await;
            }
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = interval.tick() => {
                        debug!("[{}] Timer fired", name);
                        tick().await;
                    }
                }
            }
            debug!("[{}] Timer stopped", name);
        })
    }

    /// Stop the timers and wait for them to finish their current tick
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let timers: Vec<JoinHandle<()>> = self.timers.lock().drain(..).collect();
        for timer in timers {
            let _ = timer.await;
        }
        info!("Pipeline timers stopped");
    }

    /// Run one scan of `stage`, for every account or only `account`
    pub async fn scan(&self, stage: Stage, account: Option<&str>) -> Result<()> {
        if let Some(name) = account {
            if self.registry.ingest(name).is_none() {
                return Err(anyhow!("Unknown account: {}", name));
            }
        }
        let selected = |name: &str| account.is_none_or(|wanted| wanted == name);

        match stage {
            Stage::Ingest => {
                for (name, service) in &self.registry.ingest {
                    if selected(name) {
                        service.scan().await;
                    }
                }
            }
            Stage::Analyze => {
                self.registry.analyze.scan().await;
            }
            Stage::Translate => {
                for (name, service) in &self.registry.translate {
                    if selected(name) {
                        service.scan().await;
                    }
                }
            }
            Stage::Publish => {
                for (name, service) in &self.registry.publish {
                    if selected(name) {
                        service.scan().await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Nothing left to do: no scan running or scheduled and every queue idle.
    ///
    /// Stages are checked upstream first, so work handed downstream during
    /// the check is still seen.
    pub fn is_idle(&self) -> bool {
        let registry = &self.registry;
        registry.ingest.values().all(|s| !s.is_scanning())
            && registry.analyze.is_idle()
            && registry.translate.values().all(|s| !s.is_scanning() && s.queue().is_idle())
            && registry.publish.values().all(|s| !s.is_scanning() && s.queue().is_idle())
    }

    /// Poll until [`Pipeline::is_idle`], including work started by events
    pub async fn wait_idle(&self, poll_interval: Duration) {
        while !self.is_idle() {
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Whether the periodic timers are running
    pub fn is_started(&self) -> bool {
        !self.timers.lock().is_empty()
    }

    /// Stats of every queue, keyed by queue name
    pub fn queue_stats(&self) -> Vec<(String, QueueStats)> {
        self.registry
            .queues()
            .into_iter()
            .map(|q| (q.name().to_string(), q.stats()))
            .collect()
    }
}
