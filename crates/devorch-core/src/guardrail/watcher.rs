//! Shared, hot-swappable access to the active guardrail policy.

use super::GuardrailPolicy;
use crate::config::GuardrailsConfig;
use crate::error::{OrchestratorError, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Cloneable handle to the active policy. Readers get an `Arc` to an
/// immutable policy; a reload replaces the whole policy at once.
#[derive(Debug, Clone)]
pub struct PolicyHandle {
    current: Arc<RwLock<Arc<GuardrailPolicy>>>,
}

impl PolicyHandle {
    pub fn new(policy: GuardrailPolicy) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(policy))),
        }
    }

    pub fn current(&self) -> Arc<GuardrailPolicy> {
        self.current.read().clone()
    }

    pub fn replace(&self, policy: GuardrailPolicy) {
        *self.current.write() = Arc::new(policy);
    }

    /// Re-read the policy file. On error the active policy is kept.
    pub fn reload(&self, path: &Path, config: &GuardrailsConfig) -> Result<()> {
        let policy = GuardrailPolicy::load_file(path, config)?;
        tracing::info!(
            "Guardrail policy reloaded from {} ({} rules)",
            path.display(),
            policy.rule_count()
        );
        self.replace(policy);
        Ok(())
    }

    /// Watch `path` and reload on every change. Malformed files are
    /// reported at WARN and leave the previous policy active.
    pub fn watch(&self, path: PathBuf, config: GuardrailsConfig) -> Result<PolicyWatcher> {
        let (event_tx, mut event_rx) = mpsc::channel::<()>(16);
        let file_name = path.file_name().map(|n| n.to_os_string());

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                    ) && event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if relevant {
                        let _ = event_tx.try_send(());
                    }
                }
                Err(err) => {
                    tracing::error!(%err, "policy watcher error");
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| OrchestratorError::InvalidConfig(format!("policy watcher: {}", e)))?;

        // Editors often replace the file, so watch the directory.
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                OrchestratorError::InvalidConfig(format!(
                    "cannot watch {}: {}",
                    dir.display(),
                    e
                ))
            })?;

        let handle = self.clone();
        let task = tokio::spawn(async move {
            let debounce = Duration::from_millis(200);
            let mut last_reload = Instant::now() - debounce;
            while event_rx.recv().await.is_some() {
                let elapsed = last_reload.elapsed();
                if elapsed < debounce {
                    tokio::time::sleep(debounce - elapsed).await;
                }
                // Coalesce the burst of events a single save produces.
                while event_rx.try_recv().is_ok() {}
                last_reload = Instant::now();

                let handle = handle.clone();
                let path = path.clone();
                let config = config.clone();
                let outcome =
                    tokio::task::spawn_blocking(move || handle.reload(&path, &config)).await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::warn!(%err, "rejected guardrail policy update, keeping previous policy");
                    }
                    Err(err) => {
                        tracing::warn!(%err, "policy reload task failed");
                    }
                }
            }
        });

        tracing::info!("Watching guardrail policy in {}", dir.display());
        Ok(PolicyWatcher {
            _watcher: watcher,
            task,
        })
    }
}

/// Keeps the file watcher alive; dropping it stops hot reload.
pub struct PolicyWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for PolicyWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyWatcher").finish_non_exhaustive()
    }
}

impl Drop for PolicyWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardrail::{resolve_directory, Verdict};

    fn write_policy(path: &Path, dir: &Path, pattern: &str) {
        let text = format!(
            "allowed_directories = [{:?}]\n\n[[rule]]\npattern = {:?}\naction = \"block\"\n",
            dir.display().to_string(),
            pattern
        );
        std::fs::write(path, text).unwrap();
    }

    #[test]
    fn test_replace_swaps_whole_policy() {
        let handle = PolicyHandle::new(GuardrailPolicy::new(vec![], &["/".to_string()]).unwrap());
        let before = handle.current();
        handle.replace(GuardrailPolicy::with_defaults().unwrap());
        assert_eq!(before.rule_count(), 0);
        assert!(handle.current().rule_count() > 0);
    }

    #[test]
    fn test_malformed_reload_keeps_previous_policy() {
        let dir = tempfile::tempdir().unwrap();
        let root = resolve_directory(dir.path());
        let path = root.join("guardrails.toml");
        write_policy(&path, &root, "terraform destroy");

        let config = GuardrailsConfig::default();
        let handle = PolicyHandle::new(GuardrailPolicy::load_file(&path, &config).unwrap());

        std::fs::write(&path, "[[rule]\npattern = ").unwrap();
        assert!(handle.reload(&path, &config).is_err());
        assert!(handle.current().evaluate("terraform destroy", &root).is_blocked());
    }

    #[tokio::test]
    async fn test_watcher_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let root = resolve_directory(dir.path());
        let path = root.join("guardrails.toml");
        write_policy(&path, &root, "terraform destroy");

        let config = GuardrailsConfig::default();
        let handle = PolicyHandle::new(GuardrailPolicy::load_file(&path, &config).unwrap());
        let _watcher = handle.watch(path.clone(), config).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        write_policy(&path, &root, "make deploy");

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let verdict = handle.current().evaluate("make deploy", &root);
            if matches!(verdict, Verdict::Blocked { .. }) {
                break;
            }
            assert!(Instant::now() < deadline, "policy was not reloaded");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(handle.current().evaluate("terraform destroy", &root).is_allowed());
    }
}
