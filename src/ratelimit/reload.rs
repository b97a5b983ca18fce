//! Periodic reload of the policy table from disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::policy::{RateLimitRules, RulesHandle};

/// Re-read `path` every `interval` and swap the table into `handle` when it
/// changed. A file that fails to load leaves the current table in place.
pub fn spawn_rules_reloader(
    handle: Arc<RulesHandle>,
    path: PathBuf,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the table was just loaded.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            reload_once(&handle, &path);
        }
    })
}

fn reload_once(handle: &RulesHandle, path: &Path) -> bool {
    match RateLimitRules::from_file(path) {
        Ok(rules) if *handle.snapshot() == rules => {
            debug!(path = %path.display(), "Rate limit rules unchanged");
            false
        }
        Ok(rules) => {
            info!(
                path = %path.display(),
                overrides = rules.paths.len(),
                "Rate limit rules reloaded"
            );
            handle.replace(rules);
            true
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Keeping previous rate limit rules");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_rules_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "tollgate-{}-{}.yaml",
            name,
            std::process::id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_reload_swaps_changed_rules() {
        let path = temp_rules_file("swap", "default_tokens: 3\n");
        let handle = RulesHandle::default();

        assert!(reload_once(&handle, &path));
        assert_eq!(handle.snapshot().default_tokens, 3.0);

        // Same contents again: nothing to do
        assert!(!reload_once(&handle, &path));

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_reload_keeps_rules_on_error() {
        let path = temp_rules_file("broken", "default_tokens: -4\n");
        let handle = RulesHandle::default();

        assert!(!reload_once(&handle, &path));
        assert_eq!(handle.snapshot().default_tokens, 10.0);

        std::fs::remove_file(&path).unwrap();
        assert!(!reload_once(&handle, &path));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reloader_task_picks_up_changes() {
        let path = temp_rules_file("task", "default_tokens: 10\n");
        let handle = Arc::new(RulesHandle::default());

        let task = spawn_rules_reloader(handle.clone(), path.clone(), Duration::from_secs(5));
        std::fs::write(&path, "default_tokens: 7\n").unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(handle.snapshot().default_tokens, 7.0);

        task.abort();
        std::fs::remove_file(path).unwrap();
    }
}
