use std::sync::Arc;
use std::time::Instant;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Implementation, ServerCapabilities, ServerInfo};
use rmcp::{ErrorData as McpError, ServerHandler, tool, tool_handler, tool_router};

use crate::dispatcher::{DispatchResult, Dispatcher};
use crate::error::DispatchError;
use crate::response::{ToolMetadata, ToolResponse};
use crate::tools::circuit::{CircuitRequest, ResetCircuitRequest};
use crate::tools::dispatch::DispatchRequest;
use crate::tools::providers::{ListProvidersResponse, ProviderInfo};
use crate::tools::queue::{EnqueueRequest, PrioritizeRequest, RequestIdRequest};
use crate::tools::{validate_prompt, validate_temperature};

#[derive(Clone)]
pub struct PlumeServer {
    dispatcher: Arc<Dispatcher>,
    tool_router: ToolRouter<Self>,
}

fn dispatch_response(
    tool_name: &str,
    start: Instant,
    result: Result<DispatchResult, DispatchError>,
) -> ToolResponse {
    let elapsed = start.elapsed().as_secs_f64();
    match result {
        Ok(r) => {
            let mut metadata = ToolMetadata::new(tool_name, elapsed);
            metadata.provider_used = r.provider;
            metadata.category = Some(r.category.as_str().to_string());
            metadata.cached = Some(r.cached);
            metadata.chunks = Some(r.chunks);
            ToolResponse::success(r.content, metadata)
        }
        Err(e) => error_response(tool_name, start, &e),
    }
}

fn error_response(tool_name: &str, start: Instant, e: &DispatchError) -> ToolResponse {
    tracing::warn!(tool = tool_name, "tool call failed: {e}");
    let mut metadata = ToolMetadata::new(tool_name, start.elapsed().as_secs_f64());
    metadata.provider_used = e.provider().unwrap_or("unknown").to_string();
    metadata.reason = Some(e.reason());
    ToolResponse::error(e.user_message(), metadata)
}

fn validate(req: &DispatchRequest) -> Result<(), McpError> {
    validate_prompt(&req.prompt).map_err(|msg| McpError::invalid_params(msg, None))?;
    validate_temperature(req.temperature).map_err(|msg| McpError::invalid_params(msg, None))
}

#[tool_router]
impl PlumeServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        name = "dispatch",
        description = "Send a writing task to the best available model. The task is classified, routed by policy, served from cache when possible, and split into chunks when the prompt is very long."
    )]
    async fn dispatch(
        &self,
        Parameters(req): Parameters<DispatchRequest>,
    ) -> Result<CallToolResult, McpError> {
        validate(&req)?;
        let start = Instant::now();
        let task = req.to_task();

        let result = self.dispatcher.route_with_chunking(&task).await;

        Ok(dispatch_response("dispatch", start, result).into_call_tool_result())
    }

    #[tool(
        name = "enqueue",
        description = "Admit a writing task into the priority queue. Returns the request id, or the result when `wait` is true. Rejected when the queue is full."
    )]
    async fn enqueue(
        &self,
        Parameters(req): Parameters<EnqueueRequest>,
    ) -> Result<CallToolResult, McpError> {
        validate(&req.task)?;
        let start = Instant::now();

        let mut task = req.task.to_task();
        if let Some(ref p) = req.priority {
            task.options.priority =
                Some(p.resolve().map_err(|e| McpError::invalid_params(e.to_string(), None))?);
        }

        let handle = match self.dispatcher.submit(task) {
            Ok(h) => h,
            Err(e) => return Ok(error_response("enqueue", start, &e).into_call_tool_result()),
        };

        let response = if req.wait.unwrap_or(false) {
            dispatch_response("enqueue", start, handle.wait().await)
        } else {
            match self.dispatcher.status(handle.id) {
                Ok(snapshot) => ToolResponse::json(
                    &snapshot,
                    ToolMetadata::new("enqueue", start.elapsed().as_secs_f64()),
                ),
                Err(e) => error_response("enqueue", start, &e),
            }
        };

        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "request_status",
        description = "Status of a queued, running or recently finished request.",
        annotations(read_only_hint = true)
    )]
    async fn request_status(
        &self,
        Parameters(req): Parameters<RequestIdRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let response = match self.dispatcher.status(req.id) {
            Ok(snapshot) => ToolResponse::json(
                &snapshot,
                ToolMetadata::new("request_status", start.elapsed().as_secs_f64()),
            ),
            Err(e) => error_response("request_status", start, &e),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "cancel_request",
        description = "Cancel a request that is still waiting in the queue. Running requests cannot be cancelled."
    )]
    async fn cancel_request(
        &self,
        Parameters(req): Parameters<RequestIdRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let response = match self.dispatcher.cancel(req.id) {
            Ok(()) => ToolResponse::success(
                format!("cancelled {}", req.id),
                ToolMetadata::new("cancel_request", start.elapsed().as_secs_f64()),
            ),
            Err(e) => error_response("cancel_request", start, &e),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "prioritize_request",
        description = "Change the priority of a request that is still waiting in the queue."
    )]
    async fn prioritize_request(
        &self,
        Parameters(req): Parameters<PrioritizeRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let priority = req
            .priority
            .resolve()
            .map_err(|e| McpError::invalid_params(e.to_string(), None))?;

        let response = match self.dispatcher.prioritize(req.id, priority) {
            Ok(()) => ToolResponse::success(
                format!("{} now at priority {}", req.id, priority.value()),
                ToolMetadata::new("prioritize_request", start.elapsed().as_secs_f64()),
            ),
            Err(e) => error_response("prioritize_request", start, &e),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "queue_snapshot",
        description = "Waiting requests in dequeue order, running requests, recent completions and queue statistics.",
        annotations(read_only_hint = true)
    )]
    async fn queue_snapshot(&self) -> Result<CallToolResult, McpError> {
        let snapshot = self.dispatcher.queue_snapshot();
        Ok(ToolResponse::json(&snapshot, ToolMetadata::new("queue_snapshot", 0.0))
            .into_call_tool_result())
    }

    #[tool(
        name = "circuit_states",
        description = "Circuit breaker state, counters and recent outcome history per provider.",
        annotations(read_only_hint = true)
    )]
    async fn circuit_states(
        &self,
        Parameters(req): Parameters<CircuitRequest>,
    ) -> Result<CallToolResult, McpError> {
        let metadata = ToolMetadata::new("circuit_states", 0.0);
        let response = match req.name.as_deref() {
            Some(name) => match self.dispatcher.circuit_snapshot(name) {
                Some(snapshot) => ToolResponse::json(&snapshot, metadata),
                None => ToolResponse::success(
                    format!("{name}: closed (no calls recorded)"),
                    metadata,
                ),
            },
            None => ToolResponse::json(&self.dispatcher.circuit_states(), metadata),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "reset_circuit",
        description = "Force a provider's circuit breaker back to closed."
    )]
    async fn reset_circuit(
        &self,
        Parameters(req): Parameters<ResetCircuitRequest>,
    ) -> Result<CallToolResult, McpError> {
        if req.name.trim().is_empty() {
            return Err(McpError::invalid_params("name must not be empty", None));
        }
        let metadata = ToolMetadata::new("reset_circuit", 0.0);
        let response = if self.dispatcher.reset_circuit(&req.name) {
            tracing::info!(backend = %req.name, "circuit reset by caller");
            ToolResponse::success(format!("{} reset to closed", req.name), metadata)
        } else {
            ToolResponse::success(format!("{} has no recorded calls", req.name), metadata)
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "list_providers",
        description = "List configured providers with role, live availability and circuit state.",
        annotations(read_only_hint = true)
    )]
    async fn list_providers(&self) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let providers = self
            .dispatcher
            .providers()
            .await
            .into_iter()
            .map(|(id, role, available)| {
                let circuit = self.dispatcher.circuit_state(&id);
                ProviderInfo::new(id, role, available, circuit)
            })
            .collect();

        let list = ListProvidersResponse { providers };
        let response = ToolResponse::success(
            list.to_markdown(),
            ToolMetadata::new("list_providers", start.elapsed().as_secs_f64()),
        );
        Ok(response.into_call_tool_result())
    }
}

#[tool_handler]
impl ServerHandler for PlumeServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "plume".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "Plume: writing-task dispatch over several model providers.\n\n\
                 - `dispatch` for a direct call (classified, routed, cached, chunked when long).\n\
                 - `enqueue` to go through the priority queue; poll with `request_status`,\n\
                   adjust with `prioritize_request`, drop with `cancel_request`.\n\
                 - `list_providers` and `circuit_states` show backend health; `reset_circuit`\n\
                   forces a breaker closed."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
