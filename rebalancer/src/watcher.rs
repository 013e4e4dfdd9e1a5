//! Config file watching with debounce.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::ConfigError;

/// Quiet period that ends a burst of file events.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Watches one config file and reports each debounced change as a fresh
/// load result. Dropping it stops watching.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Start watching `path`. Must be called inside a tokio runtime.
    pub fn spawn<F>(path: &Path, debounce: Duration, on_reload: F) -> notify::Result<Self>
    where
        F: Fn(Result<Config, ConfigError>) + Send + 'static,
    {
        let path = path.to_path_buf();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = path.file_name().map(OsString::from);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if touches(&event, file_name.as_deref()) => {
                let _ = tx.send(());
            }
            Ok(_) => {}
            Err(e) => warn!("config watch error: {e}"),
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        debug!("watching {} for config changes", path.display());

        let task = tokio::spawn(async move {
            while next_burst(&mut rx, debounce).await {
                on_reload(Config::load(&path));
            }
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn touches(event: &Event, file_name: Option<&std::ffi::OsStr>) -> bool {
    let relevant = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
    );
    relevant
        && event
            .paths
            .iter()
            .any(|p| p.file_name().is_some() && p.file_name() == file_name)
}

/// Wait for one signal, then swallow further signals until `quiet` passes
/// without any. Returns `false` once the channel is closed and drained.
pub async fn next_burst(rx: &mut mpsc::UnboundedReceiver<()>, quiet: Duration) -> bool {
    if rx.recv().await.is_none() {
        return false;
    }
    loop {
        match tokio::time::timeout(quiet, rx.recv()).await {
            Ok(Some(())) => continue,
            Ok(None) | Err(_) => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, ModifyKind};

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_to_one_signal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for _ in 0..5 {
            tx.send(()).unwrap();
        }
        let start = tokio::time::Instant::now();
        assert!(next_burst(&mut rx, Duration::from_millis(500)).await);
        assert_eq!(start.elapsed(), Duration::from_millis(500));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn separated_bursts_are_separate() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(()).unwrap();
        assert!(next_burst(&mut rx, Duration::from_millis(100)).await);
        tx.send(()).unwrap();
        assert!(next_burst(&mut rx, Duration::from_millis(100)).await);
        drop(tx);
        assert!(!next_burst(&mut rx, Duration::from_millis(100)).await);
    }

    #[test]
    fn only_changes_to_the_config_file_count() {
        let name = OsString::from("config.toml");
        let modify = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/etc/folio/config.toml"));
        let other = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/etc/folio/other.toml"));
        let read = Event::new(EventKind::Access(AccessKind::Any))
            .add_path(PathBuf::from("/etc/folio/config.toml"));

        assert!(touches(&modify, Some(&name)));
        assert!(!touches(&other, Some(&name)));
        assert!(!touches(&read, Some(&name)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_change_triggers_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "rolling_window_periods = 20\n").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = ConfigWatcher::spawn(&path, Duration::from_millis(50), move |res| {
            let _ = tx.send(res);
        })
        .unwrap();

        std::fs::write(&path, "rolling_window_periods = 30\n").unwrap();
        let seen = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(res) = rx.recv().await {
                if res.is_ok_and(|c| c.rolling_window_periods == 30) {
                    return true;
                }
            }
            false
        })
        .await;
        assert_eq!(seen, Ok(true));
    }
}
