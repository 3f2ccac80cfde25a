//! Serialized rebuilds of a virtual document tree.
//!
//! Two guards protect the tree: `update_in_progress` for the duration of a
//! rebuild and `update_lock` for callers that need a stable snapshot. Both
//! are awaited by bounded polling rather than blocking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use super::position::{EditorId, EditorPosition};
use super::virtual_document::{CodeBlock, DocumentEvent, VirtualDocument};
use crate::error::UpdateError;

const EVENT_CAPACITY: usize = 256;

/// How long to wait for the guards before giving up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Duration::from_millis(5),
        }
    }
}

/// Notification published by the update manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    UpdateBegan,
    BlockAdded { index: usize, editor: EditorId },
    UpdateFinished,
    /// Expired foreign documents have been swept.
    DocumentUpdated,
    /// Lifecycle event forwarded from the document tree.
    Document(DocumentEvent),
}

/// Releases a guard flag when dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the root of a document tree and rebuilds it on request.
#[derive(Debug)]
pub struct UpdateManager {
    root: Mutex<VirtualDocument>,
    update_in_progress: AtomicBool,
    update_lock: AtomicBool,
    retry: RetryPolicy,
    events: broadcast::Sender<UpdateEvent>,
}

impl UpdateManager {
    pub fn new(root: VirtualDocument, retry: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            root: Mutex::new(root),
            update_in_progress: AtomicBool::new(false),
            update_lock: AtomicBool::new(false),
            retry,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.events.subscribe()
    }

    pub fn is_update_in_progress(&self) -> bool {
        self.update_in_progress.load(Ordering::Acquire)
    }

    pub fn is_locked(&self) -> bool {
        self.update_lock.load(Ordering::Acquire)
    }

    fn emit(&self, event: UpdateEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Wait until neither guard is held, then take `flag`.
    async fn acquire<'a>(&'a self, flag: &'a AtomicBool) -> Result<FlagGuard<'a>, UpdateError> {
        for attempt in 0..self.retry.max_attempts {
            let idle = !self.update_in_progress.load(Ordering::Acquire)
                && !self.update_lock.load(Ordering::Acquire);
            if idle
                && flag
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return Ok(FlagGuard(flag));
            }
            debug!(attempt, "document tree busy, backing off");
            tokio::time::sleep(self.retry.backoff).await;
        }
        warn!(
            attempts = self.retry.max_attempts,
            "gave up waiting for document tree"
        );
        Err(UpdateError::Busy {
            attempts: self.retry.max_attempts,
        })
    }

    /// Rebuild the whole tree from `blocks`.
    pub async fn update_documents(&self, blocks: &[CodeBlock]) -> Result<(), UpdateError> {
        let _in_progress = self.acquire(&self.update_in_progress).await?;
        self.emit(UpdateEvent::UpdateBegan);

        let mut root = self.root.lock().await;
        let result = self.rebuild(&mut root, blocks);
        for event in root.take_events() {
            self.emit(UpdateEvent::Document(event));
        }
        result
    }

    fn rebuild(&self, root: &mut VirtualDocument, blocks: &[CodeBlock]) -> Result<(), UpdateError> {
        root.clear();
        for (index, block) in blocks.iter().enumerate() {
            self.emit(UpdateEvent::BlockAdded {
                index,
                editor: block.editor.clone(),
            });
            root.append_code_block(block, EditorPosition::default(), None)?;
        }
        self.emit(UpdateEvent::UpdateFinished);

        root.close_expired_documents();
        self.emit(UpdateEvent::DocumentUpdated);
        root.maybe_emit_changed();
        Ok(())
    }

    /// Run `f` on a snapshot that no rebuild can interleave with.
    pub async fn with_update_lock<R>(
        &self,
        f: impl FnOnce(&VirtualDocument) -> R,
    ) -> Result<R, UpdateError> {
        let _lock = self.acquire(&self.update_lock).await?;
        let root = self.root.lock().await;
        Ok(f(&root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tower_lsp::lsp_types::Url;

    use crate::document::extraction::{RegexExtractor, RegexExtractorOptions};
    use crate::document::virtual_document::CompositionContext;

    fn manager() -> UpdateManager {
        let mut context = CompositionContext::default();
        context
            .extractors
            .register(
                "python",
                Arc::new(
                    RegexExtractor::new(RegexExtractorOptions {
                        language: "cel".to_string(),
                        pattern: r"%cel (.*)".to_string(),
                        group: 1,
                        keep_in_host: false,
                        standalone: true,
                        file_extension: "cel".to_string(),
                        exclusive: false,
                    })
                    .unwrap(),
                ),
            )
            .unwrap();
        let root = VirtualDocument::root(
            "python",
            Url::parse("file:///nb.ipynb").unwrap(),
            "py",
            Arc::new(context),
        );
        UpdateManager::new(root, RetryPolicy::default())
    }

    fn blocks(cells: &[&str]) -> Vec<CodeBlock> {
        cells
            .iter()
            .enumerate()
            .map(|(i, text)| CodeBlock::new(*text, EditorId::new(format!("cell-{i}"))))
            .collect()
    }

    fn drain(rx: &mut broadcast::Receiver<UpdateEvent>) -> Vec<UpdateEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn rebuild_emits_lifecycle_in_order() {
        let manager = manager();
        let mut rx = manager.subscribe();
        manager
            .update_documents(&blocks(&["x = 1", "%cel this > 0"]))
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert_eq!(events[0], UpdateEvent::UpdateBegan);
        assert_eq!(
            events[1],
            UpdateEvent::BlockAdded {
                index: 0,
                editor: EditorId::new("cell-0")
            }
        );
        assert!(matches!(events[2], UpdateEvent::BlockAdded { index: 1, .. }));
        assert_eq!(events[3], UpdateEvent::UpdateFinished);
        assert_eq!(events[4], UpdateEvent::DocumentUpdated);
        assert!(events[5..].iter().any(|e| matches!(
            e,
            UpdateEvent::Document(DocumentEvent::ForeignDocumentOpened(_))
        )));
        let changed = events[5..]
            .iter()
            .filter(|e| matches!(e, UpdateEvent::Document(DocumentEvent::Changed(_))))
            .count();
        assert_eq!(changed, 2);
        assert!(!manager.is_update_in_progress());
    }

    #[tokio::test]
    async fn unchanged_content_emits_no_changed() {
        let manager = manager();
        let cells = blocks(&["x = 1"]);
        manager.update_documents(&cells).await.unwrap();

        let mut rx = manager.subscribe();
        manager.update_documents(&cells).await.unwrap();
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, UpdateEvent::Document(DocumentEvent::Changed(_)))));
    }

    #[tokio::test]
    async fn snapshot_under_lock() {
        let manager = manager();
        manager
            .update_documents(&blocks(&["a = 1", "b = 2"]))
            .await
            .unwrap();
        let value = manager
            .with_update_lock(|root| root.value())
            .await
            .unwrap();
        assert_eq!(value, "a = 1\n\n\nb = 2\n");
        assert!(!manager.is_locked());
    }

    #[tokio::test]
    async fn busy_tree_fails_after_budget() {
        let manager = UpdateManager {
            retry: RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(1),
            },
            ..manager()
        };
        manager.update_lock.store(true, Ordering::Release);

        let err = manager.update_documents(&blocks(&["x"])).await.unwrap_err();
        assert!(matches!(err, UpdateError::Busy { attempts: 3 }));
        // the failed attempt must not leave its own guard behind
        assert!(!manager.is_update_in_progress());

        manager.update_lock.store(false, Ordering::Release);
        manager.update_documents(&blocks(&["x"])).await.unwrap();
    }

    #[tokio::test]
    async fn failed_rebuild_releases_guard() {
        let manager = manager();
        {
            let mut root = manager.root.lock().await;
            root.dispose();
        }
        let err = manager.update_documents(&blocks(&["x"])).await.unwrap_err();
        assert!(matches!(err, UpdateError::Document(_)));
        assert!(!manager.is_update_in_progress());
        assert!(manager.with_update_lock(|_| ()).await.is_ok());
    }

    #[tokio::test]
    async fn lock_waits_for_running_update() {
        let manager = Arc::new(manager());
        manager.update_in_progress.store(true, Ordering::Release);

        let waiting = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.with_update_lock(|root| root.value()).await })
        };
        tokio::time::sleep(Duration::from_millis(12)).await;
        manager.update_in_progress.store(false, Ordering::Release);

        assert!(waiting.await.unwrap().is_ok());
    }
}
