//! Polydoc language server.
//!
//! Every open file is composed into a tree of virtual documents: the host
//! file at the root and the embedded code blocks (CEL rules in protobuf
//! files, fenced blocks elsewhere) as children. Children are analyzed on
//! their own and the diagnostics are re-anchored onto the original file.

use std::sync::OnceLock;

use tower_lsp::jsonrpc::Result;
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer, LspService};
use tracing::{debug, info, warn};

pub mod document;
pub mod error;
pub mod lsp;
pub mod protovalidate;
pub mod settings;

pub use document::{
    CodeBlock, ComposedDocument, CompositionConfig, CompositionContext, DocumentStore, EditorId,
    UpdateManager, VirtualDocument,
};
pub use error::{DocumentError, MarkerError, OverrideError, RegistryError, UpdateError};
pub use lsp::{analyze_source, DiagnosticAggregator, MarkerRenderer, MarkerStore};
pub use settings::{discover_settings, load_settings, ServerConfig, Settings};

pub struct Backend {
    client: Client,
    documents: DocumentStore,
    config: OnceLock<ServerConfig>,
}

impl Backend {
    pub(crate) fn new(client: Client) -> Self {
        Self {
            client,
            documents: DocumentStore::new(),
            config: OnceLock::new(),
        }
    }

    fn config(&self) -> &ServerConfig {
        self.config.get_or_init(ServerConfig::default)
    }

    /// Recompose the file and publish its re-anchored diagnostics.
    async fn on_document_change(&self, uri: Url, text: String, version: i32) {
        let config = self.config();
        let document = self.documents.open(&uri, &config.context, &config.retry);

        if let Err(e) = document.update(text, version).await {
            warn!(uri = %uri, version, error = %e, "failed to update document");
            return;
        }

        let diagnostics = match document.refresh_diagnostics(&config.env).await {
            Ok(diagnostics) => diagnostics,
            Err(e) => {
                warn!(uri = %uri, version, error = %e, "failed to refresh diagnostics");
                return;
            }
        };

        // a newer change already published
        if document.version() != version {
            debug!(uri = %uri, version, latest = document.version(), "skipping stale publish");
            return;
        }

        self.client
            .publish_diagnostics(uri, diagnostics, Some(version))
            .await;
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        let workspace_root = params
            .workspace_folders
            .as_ref()
            .and_then(|folders| folders.first())
            .and_then(|f| f.uri.to_file_path().ok())
            .or_else(|| {
                #[allow(deprecated)]
                params.root_uri.as_ref()?.to_file_path().ok()
            });

        if let Some(root) = workspace_root {
            let (settings, settings_dir) = settings::discover_settings(&root);
            info!(root = %root.display(), settings = %settings_dir.display(), "workspace");
            let _ = self.config.set(ServerConfig::from_settings(&settings));
        }

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Kind(
                    TextDocumentSyncKind::FULL,
                )),
                ..Default::default()
            },
            server_info: Some(ServerInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        self.client
            .log_message(MessageType::INFO, "polydoc language server initialized")
            .await;
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        self.on_document_change(
            params.text_document.uri,
            params.text_document.text,
            params.text_document.version,
        )
        .await;
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        // FULL sync: the last change carries the whole text
        if let Some(change) = params.content_changes.into_iter().last() {
            self.on_document_change(
                params.text_document.uri,
                change.text,
                params.text_document.version,
            )
            .await;
        }
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        if self.documents.close(&params.text_document.uri).is_some() {
            debug!(uri = %params.text_document.uri, open = self.documents.len(), "closed");
        }
        self.client
            .publish_diagnostics(params.text_document.uri, vec![], None)
            .await;
    }
}

pub fn create_service() -> (LspService<Backend>, tower_lsp::ClientSocket) {
    LspService::new(Backend::new)
}
