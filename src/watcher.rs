//! Incremental regeneration on filesystem changes.

use crate::{
    error::{Error, Result},
    pipeline::{Outcome, Pipeline},
};
use futures::{stream::FuturesUnordered, StreamExt};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::{
    collections::HashMap,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Tracks which paths are being generated and which need another pass.
#[derive(Debug, Default)]
struct ChangeScheduler {
    /// In-flight path -> changed again while running
    in_flight: HashMap<PathBuf, bool>,
}

impl ChangeScheduler {
    /// Registers a change; returns true if a generation should start now.
    fn request(&mut self, path: &Path) -> bool {
        match self.in_flight.get_mut(path) {
            Some(rerun) => {
                *rerun = true;
                false
            }
            None => {
                self.in_flight.insert(path.to_path_buf(), false);
                true
            }
        }
    }

    /// Marks a generation finished; returns true if it must run once more.
    fn complete(&mut self, path: &Path) -> bool {
        match self.in_flight.get_mut(path) {
            Some(rerun) if *rerun => {
                *rerun = false;
                true
            }
            _ => {
                self.in_flight.remove(path);
                false
            }
        }
    }
}

/// Root-relative paths touched by a create or modify event.
fn relative_event_paths(roots: &[PathBuf], event: &Event) -> Vec<PathBuf> {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return Vec::new();
    }

    event
        .paths
        .iter()
        .filter_map(|path| {
            roots
                .iter()
                .find_map(|root| path.strip_prefix(root).ok())
                .filter(|relative| !relative.as_os_str().is_empty())
                .map(Path::to_path_buf)
        })
        .collect()
}

async fn regenerate(pipeline: Arc<Pipeline>, path: PathBuf) -> PathBuf {
    match pipeline.handle_change(&path).await {
        Ok(Some(Outcome::Generated(_))) => info!("Regenerated {}", path.display()),
        Ok(Some(Outcome::Skipped)) => debug!("{} unchanged", path.display()),
        Ok(None) => {}
        Err(e) => error!("Generation failed for {}: {}", path.display(), e),
    }
    path
}

/// Watches the source folder and regenerates files as they change, until
/// `shutdown` resolves.
///
/// A path that changes while it is being generated is generated once more
/// afterwards. On shutdown no new events are accepted and in-flight
/// generations run to completion.
///
/// # Errors
///
/// Returns an error if the filesystem watcher cannot be started.
pub async fn watch<F>(pipeline: Arc<Pipeline>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let root = pipeline.config().root_dir.clone();
    let mut roots = vec![root.clone()];
    // Events carry canonical paths on some platforms.
    if let Ok(canonical) = std::fs::canonicalize(&root) {
        if canonical != root {
            roots.push(canonical);
        }
    }

    let (event_tx, mut event_rx) = mpsc::channel(1024);
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = event_tx.blocking_send(res);
        },
        NotifyConfig::default(),
    )?;
    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|e| Error::watch(format!("cannot watch {}: {e}", root.display())))?;

    info!("Watching {} for changes...", root.display());

    let mut scheduler = ChangeScheduler::default();
    let mut in_flight = FuturesUnordered::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Stopping watcher");
                break;
            }
            Some(event) = event_rx.recv() => {
                match event {
                    Ok(event) => {
                        for path in relative_event_paths(&roots, &event) {
                            if scheduler.request(&path) {
                                in_flight.push(regenerate(Arc::clone(&pipeline), path));
                            } else {
                                debug!("{} changed during generation, queued", path.display());
                            }
                        }
                    }
                    Err(e) => warn!("Watcher error: {}", e),
                }
            }
            Some(path) = in_flight.next(), if !in_flight.is_empty() => {
                if scheduler.complete(&path) {
                    in_flight.push(regenerate(Arc::clone(&pipeline), path));
                }
            }
        }
    }

    drop(watcher);

    if !in_flight.is_empty() {
        info!("Waiting for {} in-flight generation(s)", in_flight.len());
    }
    while in_flight.next().await.is_some() {}

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        completion::{FragmentStream, MockCompletionSource},
        config::Config,
    };
    use futures::stream;
    use notify::event::{AccessKind, CreateKind, ModifyKind, RemoveKind};
    use std::time::Duration;
    use tokio::{sync::oneshot, time::sleep};

    /// Streams a fenced page with a pause before every fragment.
    fn slow_page() -> FragmentStream {
        stream::iter(["```html\n", "<p>", "page", "</p>\n```"])
            .then(|fragment| async move {
                sleep(Duration::from_millis(150)).await;
                Ok(fragment.to_string())
            })
            .boxed()
    }

    #[test]
    fn test_scheduler_coalesces() {
        let mut scheduler = ChangeScheduler::default();
        let path = Path::new("index.html");

        assert!(scheduler.request(path));
        assert!(!scheduler.request(path));
        assert!(!scheduler.request(path));

        // One extra pass for any number of changes during the run.
        assert!(scheduler.complete(path));
        assert!(!scheduler.complete(path));

        assert!(scheduler.request(path));
    }

    #[test]
    fn test_scheduler_independent_paths() {
        let mut scheduler = ChangeScheduler::default();

        assert!(scheduler.request(Path::new("a.html")));
        assert!(scheduler.request(Path::new("b.html")));
        assert!(!scheduler.complete(Path::new("a.html")));
        assert!(!scheduler.request(Path::new("b.html")));
        assert!(scheduler.complete(Path::new("b.html")));
    }

    #[test]
    fn test_relative_event_paths() {
        let roots = vec![PathBuf::from("/site"), PathBuf::from("/private/site")];

        let created = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/site/blog/post.html"));
        assert_eq!(
            relative_event_paths(&roots, &created),
            vec![PathBuf::from("blog/post.html")]
        );

        let modified = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/private/site/index.html"))
            .add_path(PathBuf::from("/elsewhere/x.html"))
            .add_path(PathBuf::from("/site"));
        assert_eq!(
            relative_event_paths(&roots, &modified),
            vec![PathBuf::from("index.html")]
        );
    }

    #[test]
    fn test_ignored_event_kinds() {
        let roots = vec![PathBuf::from("/site")];

        for kind in [
            EventKind::Remove(RemoveKind::File),
            EventKind::Access(AccessKind::Any),
        ] {
            let event = Event::new(kind).add_path(PathBuf::from("/site/index.html"));
            assert!(relative_event_paths(&roots, &event).is_empty());
        }
    }

    #[tokio::test]
    async fn test_watch_stops_on_shutdown() {
        let temp = assert_fs::TempDir::new().unwrap();
        let config = Config::builder().root_dir(temp.path()).build().unwrap();

        let mut mock = MockCompletionSource::new();
        mock.expect_complete().never();
        let pipeline = Arc::new(Pipeline::new(config, Arc::new(mock)).await.unwrap());

        watch(pipeline, async {}).await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_missing_root() {
        let temp = assert_fs::TempDir::new().unwrap();
        let config = Config::builder().root_dir(temp.path()).build().unwrap();

        let mut mock = MockCompletionSource::new();
        mock.expect_complete().never();
        let pipeline = Arc::new(Pipeline::new(config, Arc::new(mock)).await.unwrap());
        temp.close().unwrap();

        let err = watch(pipeline, async {}).await.unwrap_err();
        assert!(err.to_string().contains("Watch error"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_change_regenerates_and_shutdown_drains() {
        let temp = assert_fs::TempDir::new().unwrap();
        let config = Config::builder().root_dir(temp.path()).build().unwrap();
        let output = config.dist_path().join("page.html");

        let mut mock = MockCompletionSource::new();
        mock.expect_complete()
            .times(1..)
            .returning(|_, _| Ok(slow_page()));
        let pipeline = Arc::new(Pipeline::new(config, Arc::new(mock)).await.unwrap());

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let source = temp.path().join("page.html");
        let output_seen = output.clone();

        let driver = async move {
            sleep(Duration::from_millis(200)).await;
            std::fs::write(&source, "[a page]").unwrap();

            // The sink creates the output before the first fragment arrives.
            for _ in 0..100 {
                if output_seen.exists() {
                    break;
                }
                sleep(Duration::from_millis(50)).await;
            }
            assert!(output_seen.exists(), "no generation started");

            stop_tx.send(()).unwrap();
        };

        let shutdown = async move {
            let _ = stop_rx.await;
        };

        let (watched, ()) = tokio::join!(watch(pipeline, shutdown), driver);
        watched.unwrap();

        assert_eq!(std::fs::read_to_string(&output).unwrap(), "<p>page</p>\n");
    }
}
