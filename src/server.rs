use std::sync::Arc;
use std::time::Instant;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Implementation, ServerCapabilities, ServerInfo};
use rmcp::{ErrorData as McpError, ServerHandler, tool, tool_handler, tool_router};

use crate::address::normalize_url;
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::dispatch::registry::ProviderRegistry;
use crate::error::MirageError;
use crate::history::History;
use crate::orchestrator::{GenerationRequest, Orchestrator};
use crate::prompt::PagePromptBuilder;
use crate::response::{ToolMetadata, ToolResponse};
use crate::tools::browse::{self, BrowseRequest, BrowseResult};
use crate::tools::history::{HistoryRequest, HistoryResponse};
use crate::tools::providers::ListProvidersResponse;

#[derive(Clone)]
pub struct MirageServer {
    orchestrator: Arc<Orchestrator>,
    history: Arc<History>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl MirageServer {
    pub fn new(config: Config) -> Self {
        let settings = config.settings.clone();
        let registry = Arc::new(ProviderRegistry::from_config(&config));
        let cache = Arc::new(ResponseCache::new(settings.cache.capacity));
        let orchestrator = Arc::new(Orchestrator::new(
            registry,
            cache,
            Arc::new(PagePromptBuilder),
            settings.generation,
        ));
        Self {
            orchestrator,
            history: Arc::new(History::new(settings.history.capacity)),
            tool_router: Self::tool_router(),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    #[tool(
        name = "browse",
        description = "Visit a URL on the imaginary web. A model invents the page and the tool returns its HTML document plus the model's planning notes. Blocking calls are cached per URL, provider and options. Use `list_providers` for provider ids.",
        annotations(read_only_hint = true)
    )]
    pub async fn browse(
        &self,
        Parameters(req): Parameters<BrowseRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let requested = req.provider.clone().unwrap_or_else(|| "unknown".to_string());

        let response = match self.run_browse(&req).await {
            Ok(result) => {
                let metadata = ToolMetadata {
                    tool_name: "browse".to_string(),
                    provider_used: result.provider.clone(),
                    model_used: result.model.clone(),
                    duration_seconds: start.elapsed().as_secs_f64(),
                };
                ToolResponse::json(&result, metadata)
            }
            Err(e) => {
                tracing::warn!(url = %req.url, "browse failed: {e}");
                let provider = e.provider().unwrap_or(requested.as_str()).to_string();
                ToolResponse::error(
                    e.user_message(),
                    ToolMetadata {
                        tool_name: "browse".to_string(),
                        provider_used: provider,
                        model_used: "unknown".to_string(),
                        duration_seconds: start.elapsed().as_secs_f64(),
                    },
                )
            }
        };

        Ok(response.into_call_tool_result())
    }

    async fn run_browse(&self, req: &BrowseRequest) -> Result<BrowseResult, MirageError> {
        browse::validate_temperature(req.temperature).map_err(MirageError::Other)?;
        let url = normalize_url(&req.url)?;
        self.history.record(&url);

        let mut request = GenerationRequest::new(url.clone());
        request.provider = req.provider.clone().filter(|p| !p.trim().is_empty());
        request.options = req.options();

        if !req.wants_stream() {
            let response = self.orchestrator.generate(&request).await?;
            return Ok(BrowseResult::from_response(&url, response));
        }

        let provider = self.orchestrator.provider_for(&request)?;
        let chunks = self.orchestrator.stream(&request).await?;
        let model = self
            .orchestrator
            .registry()
            .get(&provider)
            .map(|e| e.model_id.clone())
            .unwrap_or_default();

        let outcome = browse::drain_stream(&url, chunks).await?;
        tracing::info!(
            url = %url,
            provider = %provider,
            updates = outcome.updates,
            "streamed page complete"
        );
        Ok(outcome.into_result(&url, &provider, &model))
    }

    #[tool(
        name = "list_providers",
        description = "List configured page generators, the default one, and the credential status of every known backend.",
        annotations(read_only_hint = true)
    )]
    pub async fn list_providers(&self) -> Result<CallToolResult, McpError> {
        let list = ListProvidersResponse::from_registry(self.orchestrator.registry());
        Ok(ToolResponse::json(&list, ToolMetadata::local("list_providers")).into_call_tool_result())
    }

    #[tool(
        name = "cache_stats",
        description = "Show how many generated pages are cached and the cache capacity.",
        annotations(read_only_hint = true)
    )]
    pub async fn cache_stats(&self) -> Result<CallToolResult, McpError> {
        let stats = self.orchestrator.cache().stats();
        Ok(ToolResponse::json(&stats, ToolMetadata::local("cache_stats")).into_call_tool_result())
    }

    #[tool(
        name = "clear_cache",
        description = "Drop every cached page so the next visit generates a fresh one."
    )]
    pub async fn clear_cache(&self) -> Result<CallToolResult, McpError> {
        let cache = self.orchestrator.cache();
        let dropped = cache.size();
        cache.clear();
        tracing::info!(dropped, "cache cleared");
        Ok(
            ToolResponse::json(&cache.stats(), ToolMetadata::local("clear_cache"))
                .into_call_tool_result(),
        )
    }

    #[tool(
        name = "history",
        description = "Recently visited URLs, newest first.",
        annotations(read_only_hint = true)
    )]
    pub async fn history(
        &self,
        Parameters(req): Parameters<HistoryRequest>,
    ) -> Result<CallToolResult, McpError> {
        let response = HistoryResponse {
            urls: self.history.recent(req.limit),
            capacity: self.history.capacity(),
        };
        Ok(ToolResponse::json(&response, ToolMetadata::local("history")).into_call_tool_result())
    }
}

#[tool_handler]
impl ServerHandler for MirageServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "mirage".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "Mirage: an imaginary web. Every page is invented by a language model on request.\n\n\
                 Workflow:\n\
                 1. Call `list_providers` to see which generators are configured.\n\
                 2. Call `browse` with any URL. The result holds the HTML `document` and the model's `reasoning`.\n\
                    - Set `stream: true` to generate incrementally (not cached).\n\
                    - Follow links in the document by browsing them in turn.\n\
                 3. `history` lists recent visits; `cache_stats` and `clear_cache` manage cached pages."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
