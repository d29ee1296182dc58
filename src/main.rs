use std::sync::Arc;

use rmcp::{
    handler::server::tool::ToolRouter, handler::server::wrapper::Parameters,
    model::*, tool, tool_handler, tool_router,
    transport::stdio, ErrorData as McpError, ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

mod cache;
mod config;
mod ids;
mod ingest;
mod project;
mod resolve;
mod search;
mod store;
mod title_index;
mod upstream;

use cache::HotCache;
use config::Config;
use ingest::RelationIngestor;
use project::FieldExpr;
use resolve::{PaperResolver, ResolveError};
use search::SearchCoordinator;
use store::GraphStore;
use title_index::TitleIndex;
use upstream::{client::GraphApiClient, PaperApi, RelationKind, SearchFilters};

// ── Parameter structs ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct PaperParams {
    #[schemars(description = "Canonical 40-hex paper id, or a prefixed external id \
        (DOI:, ARXIV:, CORPUS_ID:, MAG:, ACL:, PMID:, PMCID:, URL:)")]
    id: String,
    #[schemars(description = "Comma-separated field paths, e.g. \"title,year,authors.name\"")]
    fields: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RelationParams {
    #[schemars(description = "Paper id or prefixed external id")]
    id: String,
    #[schemars(description = "Pagination offset (default 0)")]
    offset: Option<u64>,
    #[schemars(description = "Page size (default 100, max 1000)")]
    limit: Option<u64>,
    #[schemars(description = "Comma-separated field paths for each neighbor")]
    fields: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct BatchParams {
    #[schemars(description = "Paper ids (canonical or prefixed), at most 500")]
    ids: Vec<String>,
    #[schemars(description = "Comma-separated field paths")]
    fields: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchParams {
    #[schemars(description = "Search query string")]
    query: String,
    #[schemars(description = "Pagination offset (default 0)")]
    offset: Option<u64>,
    #[schemars(description = "Maximum results (default 10, max 100)")]
    limit: Option<u64>,
    #[schemars(description = "Comma-separated field paths")]
    fields: Option<String>,
    #[schemars(description = "Publication year or range, e.g. \"2019\" or \"2016-2020\"")]
    year: Option<String>,
    #[schemars(description = "Restrict to venues")]
    venue: Option<Vec<String>>,
    #[schemars(description = "Restrict to fields of study")]
    fields_of_study: Option<Vec<String>>,
    #[schemars(description = "Restrict to publication types")]
    publication_types: Option<Vec<String>>,
    #[schemars(description = "Only papers with an open-access PDF")]
    open_access_pdf: Option<bool>,
    #[schemars(description = "Minimum citation count")]
    min_citation_count: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct TitleMatchParams {
    #[schemars(description = "Paper title to match")]
    query: String,
    #[schemars(description = "Comma-separated field paths")]
    fields: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CacheParams {
    #[schemars(description = "Paper id or prefixed external id")]
    id: String,
}

// ── Server ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ScholarProxyServer {
    tool_router: ToolRouter<Self>,
    resolver: PaperResolver,
    search: Arc<SearchCoordinator>,
}

fn parse_fields(fields: Option<&str>) -> Result<FieldExpr, McpError> {
    FieldExpr::parse(fields).map_err(|e| McpError::invalid_params(e.to_string(), None))
}

fn to_mcp_error(err: ResolveError) -> McpError {
    match err {
        ResolveError::BadRequest(m) => McpError::invalid_params(m, None),
        other => McpError::internal_error(other.to_string(), None),
    }
}

fn json_result(value: &serde_json::Value) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("{}", e), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

#[tool_router]
impl ScholarProxyServer {
    pub async fn create() -> anyhow::Result<Self> {
        let config = Arc::new(Config::from_env());

        let api: Arc<dyn PaperApi> = Arc::new(GraphApiClient::new(&config)?);
        let store = Arc::new(GraphStore::create_or_open(&config.data_dir.join("graph")).await?);
        let cache = Arc::new(HotCache::new(&config));

        let titles = match TitleIndex::create_or_open(&config.data_dir.join("titles")) {
            Ok(index) => Some(Arc::new(Mutex::new(index))),
            Err(e) => {
                tracing::warn!("Title index unavailable, prefer-local search disabled: {}", e);
                None
            }
        };

        let ingestor = Arc::new(RelationIngestor::new(
            Arc::clone(&api),
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&config),
        ));
        let resolver = PaperResolver::new(
            Arc::clone(&api),
            Arc::clone(&store),
            Arc::clone(&cache),
            ingestor,
            titles.clone(),
            Arc::clone(&config),
        );
        let search = Arc::new(SearchCoordinator::new(
            api,
            cache,
            store,
            titles,
            resolver.clone(),
            Arc::clone(&config),
        ));

        tracing::info!(
            "Proxying {} with data_dir={}",
            config.upstream_base_url,
            config.data_dir.display()
        );

        Ok(Self { tool_router: Self::tool_router(), resolver, search })
    }

    #[tool(description = "Get a paper by id (canonical 40-hex, DOI:, ARXIV:, CORPUS_ID:, MAG:, \
        ACL:, PMID:, PMCID:, URL:), served from cache when possible")]
    async fn get_paper(
        &self,
        Parameters(params): Parameters<PaperParams>,
    ) -> Result<CallToolResult, McpError> {
        let expr = parse_fields(params.fields.as_deref())?;
        match self.resolver.get_paper(&params.id, &expr).await {
            Ok(paper) => json_result(&paper),
            Err(ResolveError::NotFound) => Ok(CallToolResult::success(vec![Content::text(
                format!("Paper not found: {}", params.id),
            )])),
            Err(err) => Err(to_mcp_error(err)),
        }
    }

    #[tool(description = "Get papers citing a paper, paginated")]
    async fn get_citations(
        &self,
        Parameters(params): Parameters<RelationParams>,
    ) -> Result<CallToolResult, McpError> {
        self.relation_query(params, RelationKind::Citations).await
    }

    #[tool(description = "Get papers referenced by a paper, paginated")]
    async fn get_references(
        &self,
        Parameters(params): Parameters<RelationParams>,
    ) -> Result<CallToolResult, McpError> {
        self.relation_query(params, RelationKind::References).await
    }

    #[tool(description = "Resolve up to 500 paper ids in one call; result preserves input \
        order with null for unknown ids")]
    async fn batch_papers(
        &self,
        Parameters(params): Parameters<BatchParams>,
    ) -> Result<CallToolResult, McpError> {
        let expr = parse_fields(params.fields.as_deref())?;
        let papers = self
            .resolver
            .get_batch(&params.ids, &expr)
            .await
            .map_err(to_mcp_error)?;
        let out: Vec<serde_json::Value> = papers
            .into_iter()
            .map(|p| p.unwrap_or(serde_json::Value::Null))
            .collect();
        json_result(&serde_json::Value::Array(out))
    }

    #[tool(description = "Search papers by relevance; results are cached briefly")]
    async fn search_papers(
        &self,
        Parameters(params): Parameters<SearchParams>,
    ) -> Result<CallToolResult, McpError> {
        let expr = parse_fields(params.fields.as_deref())?;
        let filters = SearchFilters {
            year: params.year,
            venue: params.venue,
            fields_of_study: params.fields_of_study,
            publication_types: params.publication_types,
            open_access_pdf: params.open_access_pdf.unwrap_or(false),
            min_citation_count: params.min_citation_count,
        };
        let offset = params.offset.unwrap_or(0);
        let limit = params.limit.unwrap_or(10).min(100);
        let out = self
            .search
            .search(&params.query, &filters, offset, limit, &expr)
            .await
            .map_err(to_mcp_error)?;
        json_result(&out)
    }

    #[tool(description = "Find the single best paper for a title")]
    async fn match_title(
        &self,
        Parameters(params): Parameters<TitleMatchParams>,
    ) -> Result<CallToolResult, McpError> {
        let expr = parse_fields(params.fields.as_deref())?;
        match self.search.match_title(&params.query, &expr).await {
            Ok(paper) => json_result(&paper),
            Err(ResolveError::NotFound) => Ok(CallToolResult::success(vec![Content::text(
                format!("No match for title: {}", params.query),
            )])),
            Err(err) => Err(to_mcp_error(err)),
        }
    }

    #[tool(description = "Drop all cached entries for a paper; the durable store is untouched")]
    async fn invalidate_cache(
        &self,
        Parameters(params): Parameters<CacheParams>,
    ) -> Result<CallToolResult, McpError> {
        self.resolver.invalidate(&params.id).await.map_err(to_mcp_error)?;
        Ok(CallToolResult::success(vec![Content::text(format!(
            "Invalidated cache for {}",
            params.id
        ))]))
    }

    #[tool(description = "Fetch a paper if absent and populate the cache")]
    async fn warm_cache(
        &self,
        Parameters(params): Parameters<CacheParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.resolver.warm(&params.id).await {
            Ok(()) => Ok(CallToolResult::success(vec![Content::text(format!(
                "Warmed cache for {}",
                params.id
            ))])),
            Err(ResolveError::NotFound) => Ok(CallToolResult::success(vec![Content::text(
                format!("Paper not found: {}", params.id),
            )])),
            Err(err) => Err(to_mcp_error(err)),
        }
    }
}

impl ScholarProxyServer {
    async fn relation_query(
        &self,
        params: RelationParams,
        kind: RelationKind,
    ) -> Result<CallToolResult, McpError> {
        let expr = parse_fields(params.fields.as_deref())?;
        let offset = params.offset.unwrap_or(0);
        let limit = params.limit.unwrap_or(100).clamp(1, 1000);
        match self
            .resolver
            .get_relations(&params.id, kind, offset, limit, &expr)
            .await
        {
            Ok(out) => json_result(&out),
            Err(ResolveError::NotFound) => Ok(CallToolResult::success(vec![Content::text(
                format!("Paper not found: {}", params.id),
            )])),
            Err(err) => Err(to_mcp_error(err)),
        }
    }
}

#[tool_handler]
impl ServerHandler for ScholarProxyServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Caching proxy for the Semantic Scholar academic graph. Papers are \
                 addressable by canonical id or external ids (DOI, arXiv, Corpus ID, \
                 MAG, ACL, PMID, PMCID, URL); responses mirror the upstream JSON \
                 shapes and are served from a local cache when fresh."
                    .into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("Starting scholar-proxy MCP server");

    let server = ScholarProxyServer::create().await?;
    let service = server.serve(stdio()).await?;
    service.waiting().await?;

    Ok(())
}
