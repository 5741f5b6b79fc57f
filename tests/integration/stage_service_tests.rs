/*!
 * Tests for the individual stage services
 */

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use threadrelay::app_config::{AccountConfig, QueueSettings};
use threadrelay::errors::ProviderError;
use threadrelay::events::{EventBus, EventKind, PipelineEvent};
use threadrelay::platform::{FeedSource, SpoolFeed};
use threadrelay::providers::MockProvider;
use threadrelay::stages::translate::LanguagePair;
use threadrelay::stages::{AnalyzeService, IngestService, PublishService, TranslateService};
use threadrelay::status::Status;
use threadrelay::store::{NewPost, PipelineStore};

use crate::common::gated_store::GatedStore;
use crate::common::mock_platform::{RecordingPublisher, ScriptedFeed};
use crate::common::{self, fetched_post};

const IDLE_POLL: Duration = Duration::from_millis(10);

fn news() -> AccountConfig {
    AccountConfig::new("news", "100")
}

fn languages() -> LanguagePair {
    LanguagePair {
        source: "en".to_string(),
        target: "zh".to_string(),
    }
}

fn queue_settings(concurrency: usize, max_retries: u32) -> QueueSettings {
    QueueSettings {
        concurrency,
        max_retries,
        retry_delay_ms: 10,
    }
}

/// Record every event of `kind`
fn capture(bus: &EventBus, kind: EventKind) -> Arc<Mutex<Vec<PipelineEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    bus.subscribe(
        kind,
        Arc::new(move |event: &PipelineEvent| {
            sink.lock().push(event.clone());
            Ok(())
        }),
    );
    events
}

/// Store a thread of `post_ids` (first one is the root) already moved to `status`
async fn seed_thread(store: &dyn PipelineStore, post_ids: &[&str], author: &str, status: Status) {
    let root = post_ids[0];
    let posts: Vec<NewPost> = post_ids
        .iter()
        .enumerate()
        .map(|(i, id)| NewPost::from(fetched_post(id, author, Some(root), i as i64)))
        .collect();
    store.insert_posts(posts).await.unwrap();
    store.ensure_thread(root, author).await.unwrap();

    let steps = [Status::Analyzed, Status::Translated];
    for id in post_ids {
        store.attach_post(id, root, *id == root).await.unwrap();
    }
    let mut current = Status::Pending;
    for next in steps {
        if current == status {
            break;
        }
        for id in post_ids {
            if next == Status::Translated {
                store
                    .save_translation(id, &format!("translated {}", id))
                    .await
                    .unwrap();
            } else {
                store.update_post_status(id, current, next).await.unwrap();
            }
        }
        store.update_thread_status(root, current, next).await.unwrap();
        current = next;
    }
}

// Ingest

#[tokio::test]
async fn test_ingestScan_shouldStoreNewPostsAndAdvanceCursor() {
    common::init_logging();
    let store = Arc::new(common::memory_store());
    let bus = Arc::new(EventBus::new());
    let events = capture(&bus, EventKind::IngestionCompleted);
    let feed = Arc::new(ScriptedFeed::new(vec![
        fetched_post("11", "100", None, 0),
        fetched_post("12", "100", None, 1),
        fetched_post("13", "100", None, 2),
        fetched_post("99", "200", None, 3),
    ]));
    let service = IngestService::new(news(), store.clone(), feed.clone(), bus.clone(), 2);

    assert!(service.scan().await);
    assert_eq!(store.ingest_cursor("news").await.unwrap().as_deref(), Some("12"));

    assert!(service.scan().await);
    assert_eq!(store.ingest_cursor("news").await.unwrap().as_deref(), Some("13"));

    // Nothing new: no event
    assert!(service.scan().await);

    assert_eq!(feed.calls(), vec![None, Some("12".to_string()), Some("13".to_string())]);
    assert_eq!(store.posts_by_status(Status::Pending).await.unwrap().len(), 3);
    assert!(store.get_post("99").await.unwrap().is_none());

    let events = events.lock();
    assert_eq!(events.len(), 2);
    assert_eq!(
        events[0],
        PipelineEvent::IngestionCompleted {
            account_id: "news".to_string(),
            outcome: Ok(2),
        }
    );
}

#[tokio::test]
async fn test_ingestScan_withRateLimit_shouldSkipSilently() {
    common::init_logging();
    let store = Arc::new(common::memory_store());
    let bus = Arc::new(EventBus::new());
    let events = capture(&bus, EventKind::IngestionCompleted);
    let feed = Arc::new(ScriptedFeed::failing(ProviderError::RateLimitExceeded {
        message: "quota".to_string(),
        retry_after_secs: Some(900),
    }));
    let service = IngestService::new(news(), store.clone(), feed, bus.clone(), 5);

    assert!(service.scan().await);
    assert!(events.lock().is_empty());
    assert!(store.ingest_cursor("news").await.unwrap().is_none());
}

#[tokio::test]
async fn test_ingestScan_withFeedError_shouldEmitFailure() {
    common::init_logging();
    let store = Arc::new(common::memory_store());
    let bus = Arc::new(EventBus::new());
    let events = capture(&bus, EventKind::IngestionCompleted);
    let feed = Arc::new(ScriptedFeed::failing(ProviderError::ConnectionError(
        "reset by peer".to_string(),
    )));
    let service = IngestService::new(news(), store, feed, bus.clone(), 5);

    service.scan().await;

    let events = events.lock();
    assert_eq!(events.len(), 1);
    match &events[0] {
        PipelineEvent::IngestionCompleted { outcome: Err(message), .. } => {
            assert!(message.contains("reset by peer"))
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_spoolFeed_shouldReadAccountFileAfterCursor() {
    let dir = common::create_temp_dir().unwrap();
    common::write_spool(
        dir.path(),
        "news",
        &[
            fetched_post("30", "100", None, 2),
            fetched_post("10", "100", None, 0),
            fetched_post("20", "100", Some("10"), 1),
        ],
    )
    .unwrap();
    let feed = SpoolFeed::new(dir.path());

    let all = feed.fetch_posts(&news(), None, 10).await.unwrap();
    let ids: Vec<&str> = all.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["10", "20", "30"]);

    let newer = feed.fetch_posts(&news(), Some("10"), 1).await.unwrap();
    assert_eq!(newer.len(), 1);
    assert_eq!(newer[0].id, "20");
    assert_eq!(newer[0].conversation_id.as_deref(), Some("10"));

    let missing = feed
        .fetch_posts(&AccountConfig::new("sports", "200"), None, 10)
        .await
        .unwrap();
    assert!(missing.is_empty());
}

// Analyze

#[tokio::test]
async fn test_analyzeScan_shouldGroupPostsIntoThreads() {
    common::init_logging();
    let store = Arc::new(common::memory_store());
    let bus = Arc::new(EventBus::new());
    let events = capture(&bus, EventKind::AnalysisCompleted);
    store
        .insert_posts(vec![
            NewPost::from(fetched_post("1", "100", Some("1"), 0)),
            NewPost::from(fetched_post("2", "100", Some("1"), 1)),
            NewPost::from(fetched_post("5", "200", None, 2)),
        ])
        .await
        .unwrap();
    let service = AnalyzeService::new(store.clone(), bus.clone());

    assert!(service.scan().await);

    let thread = store.get_thread("1").await.unwrap().unwrap();
    assert_eq!(thread.status, Status::Analyzed);
    assert_eq!(thread.author_id, "100");
    assert_eq!(
        store.get_thread("5").await.unwrap().unwrap().status,
        Status::Analyzed
    );

    let posts = store.thread_posts("1").await.unwrap();
    assert_eq!(posts.len(), 2);
    assert!(posts[0].is_root);
    assert_eq!(posts[0].id, "1");
    assert!(!posts[1].is_root);
    assert!(posts.iter().all(|p| p.status == Status::Analyzed));

    let events = events.lock();
    assert_eq!(events.len(), 2);
    assert!(events.contains(&PipelineEvent::AnalysisCompleted {
        thread_id: "5".to_string(),
        author_id: "200".to_string(),
    }));
}

#[tokio::test]
async fn test_analyzeScan_withLateReply_shouldNotReannounceThread() {
    common::init_logging();
    let store = Arc::new(common::memory_store());
    let bus = Arc::new(EventBus::new());
    let events = capture(&bus, EventKind::AnalysisCompleted);
    let service = AnalyzeService::new(store.clone(), bus.clone());

    store
        .insert_posts(vec![NewPost::from(fetched_post("1", "100", Some("1"), 0))])
        .await
        .unwrap();
    service.scan().await;

    store
        .insert_posts(vec![NewPost::from(fetched_post("3", "100", Some("1"), 5))])
        .await
        .unwrap();
    service.scan().await;

    let late = store.get_post("3").await.unwrap().unwrap();
    assert_eq!(late.status, Status::Analyzed);
    assert_eq!(late.thread_id.as_deref(), Some("1"));
    assert_eq!(events.lock().len(), 1);
}

#[tokio::test]
async fn test_analyzeService_shouldRunOnSuccessfulIngestion() {
    common::init_logging();
    let store = Arc::new(common::memory_store());
    let bus = Arc::new(EventBus::new());
    let _service = AnalyzeService::new(store.clone(), bus.clone());
    store
        .insert_posts(vec![NewPost::from(fetched_post("7", "100", None, 0))])
        .await
        .unwrap();

    bus.emit(&PipelineEvent::IngestionCompleted {
        account_id: "news".to_string(),
        outcome: Err("feed down".to_string()),
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.get_thread("7").await.unwrap().is_none());

    bus.emit(&PipelineEvent::IngestionCompleted {
        account_id: "news".to_string(),
        outcome: Ok(1),
    });
    let analyzed = common::eventually_async(Duration::from_secs(2), || {
        let store = store.clone();
        async move {
            store
                .get_thread("7")
                .await
                .unwrap()
                .is_some_and(|t| t.status == Status::Analyzed)
        }
    })
    .await;
    assert!(analyzed);
}

// Translate

#[tokio::test]
async fn test_translateService_shouldTranslateAnnouncedThreads() {
    common::init_logging();
    let store = Arc::new(common::memory_store());
    let bus = Arc::new(EventBus::new());
    let completed = capture(&bus, EventKind::TranslationCompleted);
    let provider = MockProvider::working();
    let service = TranslateService::new(
        news(),
        store.clone(),
        bus.clone(),
        Arc::new(provider.clone()),
        languages(),
        &queue_settings(2, 0),
    )
    .unwrap();
    seed_thread(store.as_ref(), &["1", "2"], "100", Status::Analyzed).await;

    bus.emit(&PipelineEvent::AnalysisCompleted {
        thread_id: "1".to_string(),
        author_id: "100".to_string(),
    });
    service.queue().wait_idle(IDLE_POLL).await;

    let thread = store.get_thread("1").await.unwrap().unwrap();
    assert_eq!(thread.status, Status::Translated);
    for post in store.thread_posts("1").await.unwrap() {
        assert_eq!(post.status, Status::Translated);
        assert_eq!(
            post.translated_text,
            Some(MockProvider::translated(&post.text, "zh"))
        );
    }
    assert_eq!(provider.request_count(), 2);
    assert_eq!(
        *completed.lock(),
        vec![PipelineEvent::TranslationCompleted {
            thread_id: "1".to_string(),
            author_id: "100".to_string(),
            outcome: Ok(()),
        }]
    );
}

#[tokio::test]
async fn test_translateService_shouldIgnoreOtherAuthors() {
    common::init_logging();
    let store = Arc::new(common::memory_store());
    let bus = Arc::new(EventBus::new());
    let service = TranslateService::new(
        news(),
        store.clone(),
        bus.clone(),
        Arc::new(MockProvider::working()),
        languages(),
        &queue_settings(1, 0),
    )
    .unwrap();
    seed_thread(store.as_ref(), &["8"], "200", Status::Analyzed).await;

    bus.emit(&PipelineEvent::AnalysisCompleted {
        thread_id: "8".to_string(),
        author_id: "200".to_string(),
    });
    assert!(service.scan().await);

    assert_eq!(service.queue().stats().pending, 0);
    assert_eq!(service.queue().stats().completed, 0);
    assert_eq!(
        store.get_thread("8").await.unwrap().unwrap().status,
        Status::Analyzed
    );
}

#[tokio::test]
async fn test_translateService_enqueue_shouldDeduplicateLiveTasks() {
    let store = Arc::new(common::memory_store());
    let bus = Arc::new(EventBus::new());
    let service = TranslateService::new(
        news(),
        store,
        bus,
        Arc::new(MockProvider::working()),
        languages(),
        &queue_settings(1, 0),
    )
    .unwrap();

    // Current-thread runtime: nothing runs until the test yields
    assert!(service.enqueue("t1").is_some());
    assert!(service.enqueue("t1").is_none());
    assert!(service.enqueue("t2").is_some());
    assert_eq!(service.queue().stats().pending, 2);
}

#[tokio::test]
async fn test_translateService_withTransientFailures_shouldRetryAndSucceed() {
    common::init_logging();
    let store = Arc::new(common::memory_store());
    let bus = Arc::new(EventBus::new());
    let provider = MockProvider::fail_first(1);
    let service = TranslateService::new(
        news(),
        store.clone(),
        bus.clone(),
        Arc::new(provider.clone()),
        languages(),
        &queue_settings(1, 2),
    )
    .unwrap();
    seed_thread(store.as_ref(), &["1", "2", "3"], "100", Status::Analyzed).await;

    assert!(service.scan().await);
    service.queue().wait_idle(IDLE_POLL).await;

    assert_eq!(
        store.get_thread("1").await.unwrap().unwrap().status,
        Status::Translated
    );
    // One failed call, then three successful ones on the retry
    assert_eq!(provider.request_count(), 4);
    let stats = service.queue().stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn test_translateService_exhaustedRetries_shouldMarkThreadFailed() {
    common::init_logging();
    let store = Arc::new(common::memory_store());
    let bus = Arc::new(EventBus::new());
    let completed = capture(&bus, EventKind::TranslationCompleted);
    let provider = MockProvider::failing();
    let service = TranslateService::new(
        news(),
        store.clone(),
        bus.clone(),
        Arc::new(provider.clone()),
        languages(),
        &queue_settings(1, 1),
    )
    .unwrap();
    seed_thread(store.as_ref(), &["1", "2"], "100", Status::Analyzed).await;

    service.enqueue("1");
    service.queue().wait_idle(IDLE_POLL).await;

    assert_eq!(provider.request_count(), 2);
    assert_eq!(service.queue().stats().failed, 1);
    assert_eq!(
        store.get_thread("1").await.unwrap().unwrap().status,
        Status::Failed
    );
    for post in store.thread_posts("1").await.unwrap() {
        assert_eq!(post.status, Status::Failed);
    }

    let completed = completed.lock();
    assert_eq!(completed.len(), 1);
    assert!(matches!(
        &completed[0],
        PipelineEvent::TranslationCompleted { outcome: Err(_), thread_id, .. } if thread_id == "1"
    ));
}

#[tokio::test]
async fn test_translateProcessor_withThreadAlreadyTranslated_shouldDoNothing() {
    common::init_logging();
    let store = Arc::new(common::memory_store());
    let bus = Arc::new(EventBus::new());
    let provider = MockProvider::working();
    let service = TranslateService::new(
        news(),
        store.clone(),
        bus,
        Arc::new(provider.clone()),
        languages(),
        &queue_settings(1, 0),
    )
    .unwrap();
    seed_thread(store.as_ref(), &["1"], "100", Status::Translated).await;

    service.enqueue("1");
    service.queue().wait_idle(IDLE_POLL).await;

    assert_eq!(provider.request_count(), 0);
    assert_eq!(service.queue().stats().completed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_translateService_scanTriggeredWhileRunning_shouldRunOneExtraPass() {
    common::init_logging();
    let store = Arc::new(GatedStore::new(common::memory_store()));
    let bus = Arc::new(EventBus::new());
    let service = TranslateService::new(
        news(),
        store.clone(),
        bus,
        Arc::new(MockProvider::working()),
        languages(),
        &queue_settings(1, 0),
    )
    .unwrap();
    seed_thread(store.as_ref(), &["1"], "100", Status::Analyzed).await;

    let running = tokio::spawn({
        let service = service.clone();
        async move { service.scan().await }
    });
    store.wait_entered().await;

    // Both triggers merge into a single re-scan
    assert!(!service.scan().await);
    assert!(!service.scan().await);
    assert!(service.is_scanning());

    store.release();
    assert!(running.await.unwrap());
    assert!(!service.is_scanning());
    assert_eq!(store.thread_queries(), 2);

    service.queue().wait_idle(IDLE_POLL).await;
    assert_eq!(service.queue().stats().completed, 1);
    assert_eq!(
        store.get_thread("1").await.unwrap().unwrap().status,
        Status::Translated
    );
}

// Publish

fn publish_service(
    store: Arc<dyn PipelineStore>,
    bus: Arc<EventBus>,
    publisher: &RecordingPublisher,
    max_wait: Duration,
) -> Arc<PublishService> {
    PublishService::new(
        news(),
        store,
        bus,
        Arc::new(publisher.clone()),
        &queue_settings(1, 0),
        max_wait,
    )
    .unwrap()
}

#[tokio::test]
async fn test_publishService_shouldPublishThreadAsReplyChain() {
    common::init_logging();
    let store = Arc::new(common::memory_store());
    let bus = Arc::new(EventBus::new());
    let publisher = RecordingPublisher::new();
    let service = publish_service(store.clone(), bus.clone(), &publisher, Duration::from_secs(1));
    seed_thread(store.as_ref(), &["1", "2", "3"], "100", Status::Translated).await;

    bus.emit(&PipelineEvent::TranslationCompleted {
        thread_id: "1".to_string(),
        author_id: "100".to_string(),
        outcome: Ok(()),
    });
    service.queue().wait_idle(IDLE_POLL).await;

    let published = publisher.published();
    assert_eq!(published.len(), 3);
    assert_eq!(published[0].text, "translated 1");
    assert_eq!(published[0].reply_to, None);
    assert_eq!(published[1].reply_to.as_deref(), Some("pub-1"));
    assert_eq!(published[2].reply_to.as_deref(), Some("pub-2"));
    assert!(published.iter().all(|p| p.account == "news"));

    assert_eq!(
        store.get_thread("1").await.unwrap().unwrap().status,
        Status::Published
    );
    let root = store.get_post("1").await.unwrap().unwrap();
    assert_eq!(root.status, Status::Published);
    assert_eq!(root.published_id.as_deref(), Some("pub-1"));
}

#[tokio::test]
async fn test_publishService_withFailedTranslation_shouldNotPublish() {
    common::init_logging();
    let store = Arc::new(common::memory_store());
    let bus = Arc::new(EventBus::new());
    let publisher = RecordingPublisher::new();
    let service = publish_service(store.clone(), bus.clone(), &publisher, Duration::from_secs(1));

    bus.emit(&PipelineEvent::TranslationCompleted {
        thread_id: "1".to_string(),
        author_id: "100".to_string(),
        outcome: Err("provider down".to_string()),
    });
    assert!(service.queue().is_idle());
    assert_eq!(publisher.attempts(), 0);
}

#[tokio::test]
async fn test_publishService_shouldResumeAfterPartialPublication() {
    common::init_logging();
    let store = Arc::new(common::memory_store());
    let bus = Arc::new(EventBus::new());
    let publisher = RecordingPublisher::new();
    let service = publish_service(store.clone(), bus, &publisher, Duration::from_secs(1));
    seed_thread(store.as_ref(), &["1", "2"], "100", Status::Translated).await;
    store.mark_published("1", "earlier-1").await.unwrap();

    assert!(service.scan().await);
    service.queue().wait_idle(IDLE_POLL).await;

    let published = publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].text, "translated 2");
    assert_eq!(published[0].reply_to.as_deref(), Some("earlier-1"));
    assert_eq!(
        store.get_thread("1").await.unwrap().unwrap().status,
        Status::Published
    );
}

#[tokio::test]
async fn test_publishService_withMissingTranslatedText_shouldPublishOriginalText() {
    common::init_logging();
    let store = Arc::new(common::memory_store());
    let bus = Arc::new(EventBus::new());
    let publisher = RecordingPublisher::new();
    let service = publish_service(store.clone(), bus, &publisher, Duration::from_secs(1));
    seed_thread(store.as_ref(), &["1", "2"], "100", Status::Analyzed).await;
    store.save_translation("1", "translated 1").await.unwrap();
    store
        .update_post_status("2", Status::Analyzed, Status::Translated)
        .await
        .unwrap();
    store
        .update_thread_status("1", Status::Analyzed, Status::Translated)
        .await
        .unwrap();

    assert!(service.scan().await);
    service.queue().wait_idle(IDLE_POLL).await;

    let published = publisher.published();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].text, "translated 1");
    assert_eq!(published[1].text, "post 2");
    assert_eq!(published[1].reply_to.as_deref(), Some("pub-1"));
    assert_eq!(
        store.get_post("2").await.unwrap().unwrap().status,
        Status::Published
    );
    assert_eq!(
        store.get_thread("1").await.unwrap().unwrap().status,
        Status::Published
    );
}

#[tokio::test]
async fn test_publishService_withShortRateLimit_shouldWaitAndContinue() {
    common::init_logging();
    let store = Arc::new(common::memory_store());
    let bus = Arc::new(EventBus::new());
    let publisher = RecordingPublisher::fail_with(vec![ProviderError::RateLimitExceeded {
        message: "wait a moment".to_string(),
        retry_after_secs: Some(0),
    }]);
    let service = publish_service(store.clone(), bus, &publisher, Duration::from_secs(1));
    seed_thread(store.as_ref(), &["1"], "100", Status::Translated).await;

    service.enqueue("1");
    service.queue().wait_idle(IDLE_POLL).await;

    assert_eq!(publisher.attempts(), 2);
    assert_eq!(publisher.published().len(), 1);
    assert_eq!(
        store.get_thread("1").await.unwrap().unwrap().status,
        Status::Published
    );
}

#[tokio::test]
async fn test_publishService_withLongRateLimit_shouldFailThread() {
    common::init_logging();
    let store = Arc::new(common::memory_store());
    let bus = Arc::new(EventBus::new());
    let publisher = RecordingPublisher::fail_with(vec![ProviderError::RateLimitExceeded {
        message: "come back tomorrow".to_string(),
        retry_after_secs: Some(86_400),
    }]);
    let service = publish_service(store.clone(), bus, &publisher, Duration::from_secs(60));
    seed_thread(store.as_ref(), &["1", "2"], "100", Status::Translated).await;

    service.enqueue("1");
    service.queue().wait_idle(IDLE_POLL).await;

    assert_eq!(publisher.attempts(), 1);
    assert_eq!(service.queue().stats().failed, 1);
    assert_eq!(
        store.get_thread("1").await.unwrap().unwrap().status,
        Status::Failed
    );
    for post in store.thread_posts("1").await.unwrap() {
        assert_eq!(post.status, Status::Failed);
    }
}
