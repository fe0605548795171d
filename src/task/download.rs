//! Item DOWNLOAD job: stream an item's enclosure into the download directory.
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::background::{Job, TaskContext};
use super::locks::LockKinds;
use crate::error::ErrorCode;
use crate::feed::Fetcher;
use crate::storage::{Database, DatabaseError};

/// Minimum bytes between two progress reports.
const PROGRESS_STEP: u64 = 64 * 1024;

pub struct DownloadItemJob {
    item_id: i64,
    db: Database,
    fetcher: Fetcher,
    download_dir: PathBuf,
}

impl DownloadItemJob {
    pub fn new(item_id: i64, db: Database, fetcher: Fetcher, download_dir: PathBuf) -> Self {
        Self {
            item_id,
            db,
            fetcher,
            download_dir,
        }
    }
}

/// Local file name for an enclosure: `<item id>-<last URL segment>`, with
/// anything outside `[A-Za-z0-9._-]` replaced.
fn file_name_for(item_id: i64, url: &str) -> String {
    let segment = url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "enclosure".to_string());
    let sanitized: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = sanitized.trim_start_matches('.');
    format!("{}-{}", item_id, if trimmed.is_empty() { "enclosure" } else { trimmed })
}

async fn ensure_dir(dir: &Path) -> Result<(), ErrorCode> {
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        tracing::warn!(dir = %dir.display(), error = %e, "Cannot create download directory");
        ErrorCode::IoFile
    })
}

#[async_trait]
impl Job for DownloadItemJob {
    async fn run(&self, cx: &TaskContext) -> Result<(), ErrorCode> {
        let item = self
            .db
            .get_item(self.item_id)
            .await?
            .ok_or(DatabaseError::ItemNotFound(self.item_id))?;
        if item.enclosure.url.is_empty() {
            tracing::info!(item_id = self.item_id, "Item has no enclosure to download");
            return Err(ErrorCode::IoOpenUrl);
        }

        ensure_dir(&self.download_dir).await?;
        let dest = self
            .download_dir
            .join(file_name_for(self.item_id, &item.enclosure.url));

        let mut last_reported = 0u64;
        let written = self
            .fetcher
            .download(&item.enclosure.url, &dest, cx.cancel_token(), |received, total| {
                let done = total.is_some_and(|t| received >= t);
                if done || received - last_reported >= PROGRESS_STEP {
                    last_reported = received;
                    cx.report_progress(received, total);
                }
            })
            .await?;

        self.db
            .set_item_downloaded(self.item_id, &dest.to_string_lossy())
            .await?;
        tracing::info!(item_id = self.item_id, bytes = written, path = %dest.display(), "Enclosure downloaded");
        Ok(())
    }

    fn locks(&self) -> LockKinds {
        LockKinds::ALL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::parse_feed;
    use crate::util::HostPolicy;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> Fetcher {
        Fetcher::with_client(reqwest::Client::new(), Duration::from_secs(5), 1024 * 1024)
            .with_host_policy(HostPolicy::AllowPrivate)
    }

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("feedline_download_{}_{}", name, std::process::id()))
    }

    async fn item_with_enclosure(db: &Database, enclosure: &str) -> i64 {
        let xml = format!(
            r#"<rss version="2.0"><channel><title>Pod</title>
               <item><title>Episode</title><guid>ep1</guid>
               <enclosure url="{enclosure}" length="11" type="audio/mpeg"/></item>
               </channel></rss>"#
        );
        let parsed = parse_feed(xml.as_bytes(), None).unwrap();
        let channel = db.add_channel("https://pod.example/rss", "", None).await.unwrap();
        db.apply_parse_result(channel, &parsed, None).await.unwrap();
        db.get_items(channel).await.unwrap()[0].id
    }

    #[test]
    fn test_file_name_sanitized() {
        assert_eq!(file_name_for(3, "https://e.com/a/ep%201.mp3?x=1"), "3-ep_201.mp3");
        assert_eq!(file_name_for(4, "https://e.com/"), "4-enclosure");
        assert_eq!(file_name_for(5, "https://e.com/..."), "5-enclosure");
        assert_eq!(file_name_for(6, "not a url"), "6-enclosure");
    }

    #[tokio::test]
    async fn test_download_records_path_and_reports_progress() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ep1.mp3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello audio".to_vec()))
            .mount(&server)
            .await;
        let db = Database::open(":memory:").await.unwrap();
        let item_id = item_with_enclosure(&db, &format!("{}/ep1.mp3", server.uri())).await;
        let dir = temp_dir("ok");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cx = TaskContext::new("download/x".into(), 1, CancellationToken::new(), tx);
        let job = DownloadItemJob::new(item_id, db.clone(), fetcher(), dir.clone());
        job.run(&cx).await.unwrap();

        let item = db.get_item(item_id).await.unwrap().unwrap();
        let stored = PathBuf::from(item.downloaded_path.expect("downloaded path"));
        assert_eq!(stored, dir.join(format!("{}-ep1.mp3", item_id)));
        assert_eq!(std::fs::read(&stored).unwrap(), b"hello audio");
        assert!(rx.try_recv().is_ok(), "final progress reported");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_item_without_enclosure_fails() {
        let db = Database::open(":memory:").await.unwrap();
        let xml = r#"<rss version="2.0"><channel><title>Blog</title>
            <item><title>Post</title><link>https://e.com/p</link></item></channel></rss>"#;
        let parsed = parse_feed(xml.as_bytes(), None).unwrap();
        let channel = db.add_channel("https://e.com/rss", "", None).await.unwrap();
        db.apply_parse_result(channel, &parsed, None).await.unwrap();
        let item_id = db.get_items(channel).await.unwrap()[0].id;

        let (tx, _rx) = mpsc::unbounded_channel();
        let cx = TaskContext::new("download/y".into(), 1, CancellationToken::new(), tx);
        let job = DownloadItemJob::new(item_id, db, fetcher(), temp_dir("none"));
        assert_eq!(job.run(&cx).await, Err(ErrorCode::IoOpenUrl));
    }

    #[tokio::test]
    async fn test_cancelled_download_is_interrupted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"slow".to_vec())
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;
        let db = Database::open(":memory:").await.unwrap();
        let item_id = item_with_enclosure(&db, &format!("{}/slow.mp3", server.uri())).await;
        let dir = temp_dir("cancel");

        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let cx = TaskContext::new("download/z".into(), 1, cancel.clone(), tx);
        let job = DownloadItemJob::new(item_id, db.clone(), fetcher(), dir.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        assert_eq!(job.run(&cx).await, Err(ErrorCode::Interrupted));
        assert!(started.elapsed() < Duration::from_secs(5));
        canceller.await.unwrap();

        let item = db.get_item(item_id).await.unwrap().unwrap();
        assert!(item.downloaded_path.is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
