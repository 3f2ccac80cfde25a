//! Per-file composition state for the language server.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use cel_core::Env;
use dashmap::DashMap;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, Mutex};
use tower_lsp::lsp_types::{Diagnostic, Url};
use tracing::{debug, warn};

use super::position::EditorId;
use super::update::{RetryPolicy, UpdateEvent, UpdateManager};
use super::virtual_document::{CodeBlock, CompositionContext, DocumentEvent, VirtualDocument};
use crate::error::UpdateError;
use crate::lsp::{
    analyze_tree, BatchOutcome, DiagnosticAggregator, DiagnosticTable, MarkerRenderer, MarkerStore,
};

/// Root language and virtual file extension for a file uri.
fn host_language(uri: &Url) -> (String, String) {
    let extension = uri
        .path()
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && !ext.contains('/'));
    match extension {
        Some(ext) => (ext.to_ascii_lowercase(), ext.to_string()),
        None => ("plaintext".to_string(), "txt".to_string()),
    }
}

/// One open file: its document tree, diagnostics and markers.
pub struct ComposedDocument {
    editor: EditorId,
    manager: UpdateManager,
    aggregator: Mutex<DiagnosticAggregator>,
    markers: Arc<MarkerStore>,
    events: Mutex<broadcast::Receiver<UpdateEvent>>,
    version: AtomicI32,
}

impl ComposedDocument {
    pub fn new(uri: &Url, context: Arc<CompositionContext>, retry: RetryPolicy) -> Self {
        let (language, extension) = host_language(uri);
        let root = VirtualDocument::root(&language, uri.clone(), &extension, context);
        let manager = UpdateManager::new(root, retry);
        let events = manager.subscribe();
        let markers = Arc::new(MarkerStore::new());
        let aggregator = DiagnosticAggregator::new(
            Arc::clone(&markers) as Arc<dyn MarkerRenderer>,
            Arc::new(DiagnosticTable::new()),
        );

        Self {
            // the whole file is a single block
            editor: EditorId::new(uri.as_str()),
            manager,
            aggregator: Mutex::new(aggregator),
            markers,
            events: Mutex::new(events),
            version: AtomicI32::new(0),
        }
    }

    pub fn editor(&self) -> &EditorId {
        &self.editor
    }

    pub fn manager(&self) -> &UpdateManager {
        &self.manager
    }

    pub fn markers(&self) -> &MarkerStore {
        &self.markers
    }

    pub fn version(&self) -> i32 {
        self.version.load(Ordering::Acquire)
    }

    /// Rebuild the tree from the full file text.
    pub async fn update(&self, text: String, version: i32) -> Result<(), UpdateError> {
        self.version.store(version, Ordering::Release);
        let block = CodeBlock::new(text, self.editor.clone());
        let result = self.manager.update_documents(std::slice::from_ref(&block)).await;
        self.forget_closed_documents().await;
        result
    }

    /// Drop diagnostics and markers of documents the last rebuild closed.
    async fn forget_closed_documents(&self) {
        let mut events = self.events.lock().await;
        let mut aggregator = self.aggregator.lock().await;
        loop {
            match events.try_recv() {
                Ok(UpdateEvent::Document(DocumentEvent::ForeignDocumentClosed(info))) => {
                    debug!(uri = %info.uri, "forgetting closed document");
                    aggregator.forget(&info.uri);
                }
                Ok(_) => {}
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "missed document events");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    /// Re-anchor a batch computed against the virtual document `target`.
    pub async fn handle_diagnostics(
        &self,
        target: &Url,
        diagnostics: &[Diagnostic],
    ) -> Result<BatchOutcome, UpdateError> {
        let mut aggregator = self.aggregator.lock().await;
        self.manager
            .with_update_lock(|root| aggregator.handle_diagnostics(root, target, diagnostics))
            .await
    }

    /// Analyze every CEL document of the tree and return the file's merged markers.
    pub async fn refresh_diagnostics(&self, env: &Env) -> Result<Vec<Diagnostic>, UpdateError> {
        {
            let mut aggregator = self.aggregator.lock().await;
            self.manager
                .with_update_lock(|root| aggregator.prune(root))
                .await?;
        }
        let batches = self
            .manager
            .with_update_lock(|root| analyze_tree(root, env))
            .await?;
        for (target, diagnostics) in batches {
            let outcome = self.handle_diagnostics(&target, &diagnostics).await?;
            debug!(
                uri = %target,
                accepted = outcome.accepted,
                discarded = outcome.discarded,
                "placed diagnostics"
            );
        }
        Ok(self.markers.to_diagnostics(&self.editor))
    }
}

impl std::fmt::Debug for ComposedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComposedDocument")
            .field("editor", &self.editor)
            .field("version", &self.version())
            .field("markers", &self.markers.len())
            .finish()
    }
}

/// Thread-safe storage for open files.
#[derive(Debug, Default)]
pub struct DocumentStore {
    documents: DashMap<Url, Arc<ComposedDocument>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The composed document for `uri`, created on first use.
    pub fn open(
        &self,
        uri: &Url,
        context: &Arc<CompositionContext>,
        retry: &RetryPolicy,
    ) -> Arc<ComposedDocument> {
        let entry = self.documents.entry(uri.clone()).or_insert_with(|| {
            Arc::new(ComposedDocument::new(uri, Arc::clone(context), retry.clone()))
        });
        Arc::clone(&entry)
    }

    pub fn get(&self, uri: &Url) -> Option<Arc<ComposedDocument>> {
        self.documents.get(uri).map(|r| Arc::clone(&r))
    }

    pub fn close(&self, uri: &Url) -> Option<Arc<ComposedDocument>> {
        self.documents.remove(uri).map(|(_, document)| document)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower_lsp::lsp_types::{DiagnosticSeverity, Position};

    use crate::protovalidate::{protovalidate_env, ProtovalidateExtractor};

    fn context() -> Arc<CompositionContext> {
        let mut context = CompositionContext::default();
        context
            .extractors
            .register("proto", Arc::new(ProtovalidateExtractor::new()))
            .unwrap();
        Arc::new(context)
    }

    fn uri(path: &str) -> Url {
        Url::parse(&format!("file:///{}", path)).unwrap()
    }

    #[test]
    fn host_language_from_extension() {
        assert_eq!(
            host_language(&uri("a/user.proto")),
            ("proto".to_string(), "proto".to_string())
        );
        assert_eq!(
            host_language(&uri("rule.cel")),
            ("cel".to_string(), "cel".to_string())
        );
        assert_eq!(
            host_language(&uri("dir.d/README")),
            ("plaintext".to_string(), "txt".to_string())
        );
    }

    #[test]
    fn store_reuses_open_documents() {
        let store = DocumentStore::new();
        let context = context();
        let retry = RetryPolicy::default();
        let a = store.open(&uri("a.cel"), &context, &retry);
        let again = store.open(&uri("a.cel"), &context, &retry);
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(store.len(), 1);

        assert!(store.close(&uri("a.cel")).is_some());
        assert!(store.get(&uri("a.cel")).is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn cel_file_diagnostics_are_published_in_place() {
        let document = ComposedDocument::new(&uri("rule.cel"), context(), RetryPolicy::default());
        document.update("size(this) > 0 && nope".to_string(), 3).await.unwrap();
        assert_eq!(document.version(), 3);

        let published = document.refresh_diagnostics(&protovalidate_env()).await.unwrap();
        assert!(!published.is_empty());
        assert!(published.iter().all(|d| d.range.start.line == 0));
        assert!(published.iter().all(|d| d.message.ends_with("(cel)")));
    }

    #[tokio::test]
    async fn proto_diagnostics_land_on_the_expression() {
        let document = ComposedDocument::new(&uri("user.proto"), context(), RetryPolicy::default());
        let proto = concat!(
            "message User {\n",
            "  string email = 1 [(buf.validate.field).cel = {\n",
            "    expression: \"this.isEmail() && nope\"\n",
            "  }];\n",
            "}\n",
        );
        document.update(proto.to_string(), 1).await.unwrap();

        let published = document.refresh_diagnostics(&protovalidate_env()).await.unwrap();
        assert!(!published.is_empty());
        for diagnostic in &published {
            assert_eq!(diagnostic.range.start.line, 2);
            // the literal starts after `    expression: "`
            assert!(diagnostic.range.start.character >= 17);
            assert_eq!(diagnostic.severity, Some(DiagnosticSeverity::ERROR));
        }

        // fixing the expression clears the marker
        document
            .update(proto.replace(" && nope", ""), 2)
            .await
            .unwrap();
        let published = document.refresh_diagnostics(&protovalidate_env()).await.unwrap();
        assert!(published.is_empty());
        assert!(document.markers().is_empty());
    }

    #[tokio::test]
    async fn markers_of_expired_documents_are_removed() {
        let document = ComposedDocument::new(&uri("user.proto"), context(), RetryPolicy::default());
        let with_rule =
            "message M { int32 a = 1 [(buf.validate.field).cel = { expression: \"nope\" }]; }\n";
        document.update(with_rule.to_string(), 1).await.unwrap();
        let published = document.refresh_diagnostics(&protovalidate_env()).await.unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].range.start, Position::new(0, 67));

        // without the rule the idle child is parked and its marker goes away
        for version in 2..10 {
            document
                .update("message M { int32 a = 1; }\n".to_string(), version)
                .await
                .unwrap();
            let published = document.refresh_diagnostics(&protovalidate_env()).await.unwrap();
            assert!(published.is_empty(), "version {version}");
            assert!(document.markers().is_empty());
        }
    }
}
