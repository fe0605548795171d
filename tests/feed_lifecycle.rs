//! Integration tests for the channel lifecycle: subscribe, update through the
//! task registry, download an enclosure, and a scheduled update firing.
//!
//! Each test creates its own in-memory SQLite database and a wiremock server
//! standing in for the feed host.

use chrono::{DateTime, Local, TimeZone};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use feedline::error::ErrorCode;
use feedline::feed::Fetcher;
use feedline::schedule::{Alarm, ManualClock, ScheduleSettings, ScheduledUpdateController};
use feedline::storage::Database;
use feedline::task::{
    Action, ChannelListener, DownloadItemJob, Job, LockManager, NoticeKind, OwnerKey,
    QueueChange, QueueEvent, TaskKey, TaskNotice, TaskRegistry, TaskState, UpdateChannelJob,
    UpdateChannelJobFactory,
};
use feedline::util::HostPolicy;

const WAIT: Duration = Duration::from_secs(5);

fn podcast(base: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Weekly Show</title>
  <description>Talk</description>
  <item>
    <title>Episode 2</title>
    <link>https://example.com/ep2</link>
    <guid>ep2</guid>
    <enclosure url="{base}/media/ep2.mp3" length="11" type="audio/mpeg"/>
  </item>
  <item>
    <title>Episode 1</title>
    <link>https://example.com/ep1</link>
    <guid>ep1</guid>
  </item>
</channel></rss>"#
    )
}

async fn feed_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(podcast(&server.uri())))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/media/ep2.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello audio".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gone.xml"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    server
}

fn fetcher() -> Fetcher {
    Fetcher::with_client(reqwest::Client::new(), Duration::from_secs(5), 1024 * 1024)
        .with_host_policy(HostPolicy::AllowPrivate)
}

fn registry() -> TaskRegistry {
    TaskRegistry::spawn(Arc::new(LockManager::logging()))
}

async fn start_with_listener(
    registry: &TaskRegistry,
    key: TaskKey,
    job: Arc<dyn Job>,
) -> mpsc::UnboundedReceiver<TaskNotice> {
    let (listener, notices) = ChannelListener::new();
    registry.register(key, job).await.unwrap();
    registry
        .bind(key, OwnerKey::new("test"), listener, false)
        .await
        .unwrap()
        .expect("task is registered")
        .detach();
    assert!(registry.start(key).await.unwrap());
    notices
}

/// Waits for the terminal notice of a task, skipping pre-run and progress.
async fn finished(notices: &mut mpsc::UnboundedReceiver<TaskNotice>) -> NoticeKind {
    tokio::time::timeout(WAIT, async {
        loop {
            let notice = notices.recv().await.expect("listener channel open");
            match notice.kind {
                NoticeKind::PreRun | NoticeKind::Progress(_) => continue,
                kind => return kind,
            }
        }
    })
    .await
    .expect("task finished in time")
}

async fn drained(queue: &mut broadcast::Receiver<QueueEvent>, action: Action) {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = queue.recv().await.expect("queue open");
            if event.action == action
                && event.change == QueueChange::Dequeued
                && event.outstanding == 0
            {
                return;
            }
        }
    })
    .await
    .expect("queue drained in time")
}

// ============================================================================
// Manual updates
// ============================================================================

#[tokio::test]
async fn test_update_then_download_enclosure() {
    let server = feed_server().await;
    let db = Database::open(":memory:").await.unwrap();
    let channel_id = db
        .add_channel(&format!("{}/feed.xml", server.uri()), "", None)
        .await
        .unwrap();
    let registry = registry();
    let mut queue = registry.subscribe_queue();

    let key = TaskKey::update(channel_id);
    let job = Arc::new(UpdateChannelJob::new(channel_id, db.clone(), fetcher(), 80));
    let mut notices = start_with_listener(&registry, key, job).await;
    assert_eq!(finished(&mut notices).await, NoticeKind::PostRun(Ok(())));
    drained(&mut queue, Action::Update).await;
    assert_eq!(registry.state(key).await.unwrap(), TaskState::Idle);

    let channel = db.get_channel(channel_id).await.unwrap().unwrap();
    assert_eq!(channel.title, "Weekly Show");
    assert!(channel.action.is_some());
    assert!(channel.last_update.is_some());

    let items = db.get_items(channel_id).await.unwrap();
    let titles: Vec<&str> = items.iter().map(|i| i.title.as_str()).collect();
    assert_eq!(titles, vec!["Episode 2", "Episode 1"]);
    let episode = &items[0];
    assert_eq!(episode.enclosure.mime_type, "audio/mpeg");

    let dir = std::env::temp_dir().join(format!("feedline_lifecycle_{}", std::process::id()));
    let key = TaskKey::download(episode.id);
    let job = Arc::new(DownloadItemJob::new(episode.id, db.clone(), fetcher(), dir.clone()));
    let mut notices = start_with_listener(&registry, key, job).await;
    assert_eq!(finished(&mut notices).await, NoticeKind::PostRun(Ok(())));

    let stored = db.get_item(episode.id).await.unwrap().unwrap();
    let saved = stored.downloaded_path.expect("download recorded");
    assert_eq!(std::fs::read(&saved).unwrap(), b"hello audio");
    let _ = std::fs::remove_dir_all(&dir);

    assert!(db.delete_channel(channel_id).await.unwrap());
    assert!(db.get_items(channel_id).await.unwrap().is_empty());
    assert!(db.get_item(episode.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_update_is_reported_once() {
    let server = feed_server().await;
    let db = Database::open(":memory:").await.unwrap();
    let channel_id = db
        .add_channel(&format!("{}/gone.xml", server.uri()), "Gone", None)
        .await
        .unwrap();
    let registry = registry();

    let key = TaskKey::update(channel_id);
    let job = Arc::new(UpdateChannelJob::new(channel_id, db.clone(), fetcher(), 80));
    let mut notices = start_with_listener(&registry, key, job).await;
    assert_eq!(
        finished(&mut notices).await,
        NoticeKind::PostRun(Err(ErrorCode::IoOpenUrl))
    );

    assert_eq!(registry.state(key).await.unwrap(), TaskState::Failed);
    assert_eq!(
        registry.consume_result(key).await.unwrap(),
        Some(ErrorCode::IoOpenUrl)
    );
    assert_eq!(registry.consume_result(key).await.unwrap(), None);
    assert_eq!(registry.state(key).await.unwrap(), TaskState::Idle);
    assert!(db.get_items(channel_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_update_of_loopback_channel_is_refused_by_default() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(podcast(&server.uri())))
        .expect(0)
        .mount(&server)
        .await;
    let db = Database::open(":memory:").await.unwrap();
    let channel_id = db
        .add_channel(&format!("{}/feed.xml", server.uri()), "Local", None)
        .await
        .unwrap();
    let registry = registry();

    let strict = Fetcher::with_client(reqwest::Client::new(), Duration::from_secs(5), 1024);
    let key = TaskKey::update(channel_id);
    let job = Arc::new(UpdateChannelJob::new(channel_id, db.clone(), strict, 80));
    let mut notices = start_with_listener(&registry, key, job).await;
    assert_eq!(
        finished(&mut notices).await,
        NoticeKind::PostRun(Err(ErrorCode::IoOpenUrl))
    );
    assert!(db.get_items(channel_id).await.unwrap().is_empty());
    server.verify().await;
}

// ============================================================================
// Scheduled updates
// ============================================================================

#[derive(Default)]
struct LastArmed(Mutex<Option<(DateTime<Local>, i64)>>);

impl Alarm for LastArmed {
    fn arm(&self, fire_at: DateTime<Local>, scheduled_ms: i64) {
        *self.0.lock().unwrap() = Some((fire_at, scheduled_ms));
    }

    fn cancel(&self) {
        *self.0.lock().unwrap() = None;
    }
}

#[tokio::test]
async fn test_scheduled_firing_updates_due_channel_and_rearms() {
    let server = feed_server().await;
    let db = Database::open(":memory:").await.unwrap();
    // 10:00 daily.
    let due = db
        .add_channel(&format!("{}/feed.xml", server.uri()), "", Some("36000"))
        .await
        .unwrap();
    // 18:00 daily, not due at 10:00.
    let later = db
        .add_channel("https://later.example.com/rss", "Later", Some("64800"))
        .await
        .unwrap();

    let ten = Local.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(ten - chrono::Duration::hours(1)));
    let alarm = Arc::new(LastArmed::default());
    let registry = registry();
    let mut queue = registry.subscribe_queue();
    let controller = ScheduledUpdateController::new(
        Arc::new(db.clone()),
        registry.clone(),
        Arc::new(UpdateChannelJobFactory::new(db.clone(), fetcher(), 80)),
        alarm.clone(),
        clock.clone(),
        ScheduleSettings::default(),
    );

    assert_eq!(controller.reschedule().await, Some(ten));
    assert_eq!(*alarm.0.lock().unwrap(), Some((ten, ten.timestamp_millis())));

    clock.advance(chrono::Duration::seconds(3602));
    controller.handle_alarm(ten.timestamp_millis()).await;
    drained(&mut queue, Action::Update).await;

    assert_eq!(db.get_items(due).await.unwrap().len(), 2);
    assert!(db.get_items(later).await.unwrap().is_empty());
    assert_eq!(registry.state(TaskKey::update(later)).await.unwrap(), TaskState::Idle);

    let eighteen = Local.with_ymd_and_hms(2026, 1, 15, 18, 0, 0).unwrap();
    let armed = alarm.0.lock().unwrap().map(|(at, _)| at);
    assert_eq!(armed, Some(eighteen));
    assert!(controller.is_enabled());
}

#[tokio::test]
async fn test_repeated_launch_fetches_channel_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(podcast(&server.uri()))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;
    let db = Database::open(":memory:").await.unwrap();
    let channel_id = db
        .add_channel(&format!("{}/slow.xml", server.uri()), "", None)
        .await
        .unwrap();
    let registry = registry();
    let (listener, mut notices) = ChannelListener::new();
    let key = TaskKey::update(channel_id);

    let mut launched = 0;
    for _ in 0..3 {
        let job = Arc::new(UpdateChannelJob::new(channel_id, db.clone(), fetcher(), 80));
        if let Some(subscription) = registry
            .launch(key, job, OwnerKey::new("cli"), listener.clone(), false)
            .await
            .unwrap()
        {
            subscription.detach();
            launched += 1;
        }
    }
    assert_eq!(launched, 1);
    assert_eq!(finished(&mut notices).await, NoticeKind::PostRun(Ok(())));
    assert_eq!(db.get_items(channel_id).await.unwrap().len(), 2);
    server.verify().await;
}
