use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{AgentError, AgentResult, ConnectionError, ToolError};
use crate::models::conversation::Conversation;
use crate::models::message::{Message, ToolResult};
use crate::models::tool::{Tool, ToolCall};
use crate::providers::base::{Completion, Provider, StopReason, Usage};
use crate::providers::errors::ProviderError;
use crate::providers::utils::{is_valid_tool_name, sanitize_tool_name};
use crate::retry::{RetryError, RetryPolicy};
use crate::systems::mcp::McpSystem;
use crate::systems::{normalize_tool_output, System, SystemConfig};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
pub const EMPTY_RESPONSE: &str = "Empty response from model";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub system_prompt: String,
    pub endpoint_retry: RetryPolicy,
    pub tool_retry: RetryPolicy,
    /// Limit for a single endpoint attempt
    pub endpoint_timeout: Option<Duration>,
    /// Limit for a single tool attempt
    pub tool_timeout: Option<Duration>,
    /// Opening and closing tag. When both appear in the final answer only the enclosed text
    /// is returned.
    pub response_tags: Option<(String, String)>,
    /// Returned when the final answer has no text at all
    pub empty_response: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            endpoint_retry: RetryPolicy::default(),
            tool_retry: RetryPolicy::default(),
            endpoint_timeout: None,
            tool_timeout: None,
            response_tags: None,
            empty_response: EMPTY_RESPONSE.to_string(),
        }
    }
}

/// Progress notifications for tool dispatch
#[derive(Debug, Clone, PartialEq)]
pub enum ToolEvent {
    Started { name: String, input: Value },
    Completed { name: String, elapsed: Duration },
    Failed { name: String, error: String },
}

pub type ToolEventHandler = Arc<dyn Fn(&ToolEvent) + Send + Sync>;

/// The outcome of one completed query
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    /// Endpoint calls made, including the final one
    pub rounds: usize,
    pub tool_calls: usize,
    pub usage: Usage,
}

/// Where a tool name exposed to the model actually lives
#[derive(Clone)]
struct Route {
    system: Arc<dyn System>,
    tool_name: String,
}

fn same_system(a: &Arc<dyn System>, b: &Arc<dyn System>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Agent drives a tool-calling conversation between a model endpoint and the systems
/// that provide its tools
pub struct Agent {
    provider: Box<dyn Provider>,
    config: AgentConfig,
    systems: RwLock<Vec<Arc<dyn System>>>,
    routes: RwLock<HashMap<String, Route>>,
    tool_events: Option<ToolEventHandler>,
}

impl Agent {
    pub fn new(provider: Box<dyn Provider>, config: AgentConfig) -> Self {
        Self {
            provider,
            config,
            systems: RwLock::new(Vec::new()),
            routes: RwLock::new(HashMap::new()),
            tool_events: None,
        }
    }

    pub fn with_tool_events(mut self, handler: ToolEventHandler) -> Self {
        self.tool_events = Some(handler);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Start an MCP system for every config and register it. Stops at the first failure,
    /// shutting down whatever this call had already started.
    pub async fn connect(&self, configs: Vec<SystemConfig>) -> Result<(), ConnectionError> {
        let mut started: Vec<Arc<dyn System>> = Vec::new();

        for config in configs {
            let result = match McpSystem::connect(config).await {
                Ok(system) => {
                    let system: Arc<dyn System> = Arc::new(system);
                    started.push(Arc::clone(&system));
                    self.add_system(system).await
                }
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                warn!(target: "agent", error = %e, "Failed to connect tool providers");
                for system in &started {
                    self.remove_system(system).await;
                    system.shutdown().await;
                }
                return Err(e);
            }
        }

        Ok(())
    }

    /// Register a system and the tools it currently offers. Tool names are claimed for
    /// the lifetime of the registration, whether or not the system is reachable later.
    pub async fn add_system(&self, system: Arc<dyn System>) -> Result<(), ConnectionError> {
        let tools = system
            .list_tools()
            .await
            .map_err(|e| ConnectionError::Discovery {
                system: system.name().to_string(),
                message: e.to_string(),
            })?;

        let mut routes = self.routes.write().await;
        let mut added: HashMap<String, Route> = HashMap::new();
        for tool in tools {
            let exposed = sanitize_tool_name(&tool.name);
            if !is_valid_tool_name(&exposed) {
                return Err(ConnectionError::InvalidToolName {
                    system: system.name().to_string(),
                    name: tool.name,
                });
            }
            let owner = routes
                .get(&exposed)
                .or_else(|| added.get(&exposed))
                .map(|route| route.system.name().to_string());
            if let Some(first) = owner {
                return Err(ConnectionError::DuplicateTool {
                    name: exposed,
                    first,
                    second: system.name().to_string(),
                });
            }
            added.insert(
                exposed,
                Route {
                    system: Arc::clone(&system),
                    tool_name: tool.name,
                },
            );
        }

        info!(
            target: "agent",
            system = %system.name(),
            tools = added.len(),
            "Registered system"
        );
        routes.extend(added);
        self.systems.write().await.push(system);
        Ok(())
    }

    async fn remove_system(&self, system: &Arc<dyn System>) {
        self.systems
            .write()
            .await
            .retain(|registered| !same_system(registered, system));
        self.routes
            .write()
            .await
            .retain(|_, route| !same_system(&route.system, system));
    }

    /// Current tools from every system, in registration order, under the names the model
    /// should use. Systems that fail to answer are left out of this listing only; their
    /// registered tools stay routable.
    pub async fn list_tools(&self) -> Vec<Tool> {
        let systems = self.systems.read().await.clone();

        let mut listings = Vec::with_capacity(systems.len());
        for system in systems {
            match system.list_tools().await {
                Ok(listed) => listings.push((system, listed)),
                Err(e) => warn!(
                    target: "agent",
                    system = %system.name(),
                    error = %e,
                    "Skipping system whose tools could not be listed"
                ),
            }
        }

        let mut routes = self.routes.write().await;
        let mut tools = Vec::new();
        for (system, listed) in listings {
            for tool in listed {
                let exposed = sanitize_tool_name(&tool.name);
                match routes.get(&exposed) {
                    Some(route) if same_system(&route.system, &system) => {}
                    Some(route) => {
                        warn!(
                            target: "agent",
                            tool = %exposed,
                            first = %route.system.name(),
                            second = %system.name(),
                            "Duplicate tool name, keeping the first system"
                        );
                        continue;
                    }
                    None if is_valid_tool_name(&exposed) => {
                        debug!(target: "agent", tool = %exposed, system = %system.name(), "New tool");
                        routes.insert(
                            exposed.clone(),
                            Route {
                                system: Arc::clone(&system),
                                tool_name: tool.name.clone(),
                            },
                        );
                    }
                    None => {
                        warn!(
                            target: "agent",
                            tool = %tool.name,
                            system = %system.name(),
                            "Skipping tool with an unusable name"
                        );
                        continue;
                    }
                }
                tools.push(Tool::new(exposed, tool.description, tool.input_schema));
            }
        }
        tools
    }

    /// Run one tool once and flatten its output to text
    pub async fn invoke_tool(&self, name: &str, arguments: Value) -> Result<String, ToolError> {
        let route = self
            .routes
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        let raw = route.system.call_tool(&route.tool_name, arguments).await?;
        Ok(normalize_tool_output(&raw))
    }

    pub async fn process_query(&self, query: &str, context: Option<&str>) -> AgentResult<String> {
        self.process_query_with_cancel(query, context, &CancellationToken::new())
            .await
    }

    #[tracing::instrument(skip(self, query, context, cancel), fields(query_len = query.len()))]
    pub async fn process_query_with_cancel(
        &self,
        query: &str,
        context: Option<&str>,
        cancel: &CancellationToken,
    ) -> AgentResult<String> {
        let mut message = Message::user().with_text(query);
        if let Some(context) = context {
            message = message.with_text(format!("Context: {}", context));
        }

        let mut conversation = Conversation::new();
        conversation.push(message);

        let reply = self.reply(&mut conversation, cancel).await?;
        info!(
            target: "agent",
            rounds = reply.rounds,
            tool_calls = reply.tool_calls,
            "Query complete"
        );
        Ok(reply.text)
    }

    /// Continue `conversation` until the model gives a final answer. On error the
    /// conversation is restored to what it was on entry.
    pub async fn reply(
        &self,
        conversation: &mut Conversation,
        cancel: &CancellationToken,
    ) -> AgentResult<Reply> {
        let entry_len = conversation.len();
        let result = self.run_rounds(conversation, cancel).await;
        if let Err(e) = &result {
            warn!(target: "agent", error = %e, "Reply failed");
            conversation.truncate_to(entry_len);
        }
        result
    }

    async fn run_rounds(
        &self,
        conversation: &mut Conversation,
        cancel: &CancellationToken,
    ) -> AgentResult<Reply> {
        let tools = self.list_tools().await;
        let mut rounds = 0;
        let mut tool_calls = 0;
        let mut usage = Usage::default();

        loop {
            rounds += 1;
            debug!(target: "agent", round = rounds, messages = conversation.len(), "Requesting completion");

            let completion = self.complete(conversation, &tools, cancel).await?;
            usage += &completion.usage;

            if completion.stop_reason != StopReason::ToolUse {
                if completion.stop_reason == StopReason::MaxTokens {
                    warn!(target: "agent", round = rounds, "Model stopped at its token limit");
                }

                let text = completion.message.joined_text();
                conversation.push(completion.message);
                let text = match text {
                    Some(text) => self.extract_tagged(text),
                    None => self.config.empty_response.clone(),
                };

                return Ok(Reply {
                    text,
                    rounds,
                    tool_calls,
                    usage,
                });
            }

            let calls = completion.message.tool_calls();
            if calls.is_empty() {
                return Err(AgentError::MalformedResponse(
                    "tool use was signalled but the message requests no tools".to_string(),
                ));
            }
            conversation.push(completion.message);

            let mut results = Message::user();
            for call in &calls {
                results = results.with_tool_result(self.dispatch(call, cancel).await?);
            }
            tool_calls += calls.len();
            conversation.push(results);
        }
    }

    async fn complete(
        &self,
        conversation: &Conversation,
        tools: &[Tool],
        cancel: &CancellationToken,
    ) -> AgentResult<Completion> {
        let provider = self.provider.as_ref();
        let system = self.config.system_prompt.as_str();
        let messages = conversation.messages();

        self.config
            .endpoint_retry
            .run("endpoint", self.config.endpoint_timeout, cancel, move || {
                provider.complete(system, messages, tools)
            })
            .await
            .map_err(|e| match e {
                RetryError::Cancelled { .. } => AgentError::Cancelled,
                RetryError::Fatal {
                    error: ProviderError::MalformedResponse(message),
                    ..
                } => AgentError::MalformedResponse(message),
                RetryError::Exhausted { attempts, error } | RetryError::Fatal { attempts, error } => {
                    AgentError::Endpoint {
                        attempts,
                        source: error,
                    }
                }
            })
    }

    /// Run one requested tool under the tool retry policy. Failures become an error result
    /// for the model to see; only cancellation aborts the query.
    async fn dispatch(&self, call: &ToolCall, cancel: &CancellationToken) -> AgentResult<ToolResult> {
        self.emit(ToolEvent::Started {
            name: call.name.clone(),
            input: call.arguments.clone(),
        });
        debug!(target: "agent", tool = %call.name, id = %call.id, "Dispatching tool");

        let started = Instant::now();
        let name = call.name.as_str();
        let arguments = &call.arguments;
        let outcome = self
            .config
            .tool_retry
            .run(name, self.config.tool_timeout, cancel, move || {
                self.invoke_tool(name, arguments.clone())
            })
            .await;

        match outcome {
            Ok(text) => {
                self.emit(ToolEvent::Completed {
                    name: call.name.clone(),
                    elapsed: started.elapsed(),
                });
                Ok(ToolResult::success(&call.id, text))
            }
            Err(RetryError::Cancelled { .. }) => Err(AgentError::Cancelled),
            Err(RetryError::Exhausted { attempts, error } | RetryError::Fatal { attempts, error }) => {
                warn!(
                    target: "agent",
                    tool = %call.name,
                    id = %call.id,
                    attempts,
                    error = %error,
                    "Tool failed"
                );
                self.emit(ToolEvent::Failed {
                    name: call.name.clone(),
                    error: error.to_string(),
                });
                Ok(ToolResult::error(
                    &call.id,
                    format!("Error executing tool: {}", error),
                ))
            }
        }
    }

    fn emit(&self, event: ToolEvent) {
        if let Some(handler) = &self.tool_events {
            handler(&event);
        }
    }

    fn extract_tagged(&self, text: String) -> String {
        let Some((open, close)) = &self.config.response_tags else {
            return text;
        };

        let pattern = format!(
            "(?s).*{}(.*?){}",
            regex::escape(open),
            regex::escape(close)
        );
        match Regex::new(&pattern) {
            Ok(re) => match re.captures(&text).and_then(|captures| captures.get(1)) {
                Some(inner) => inner.as_str().to_string(),
                None => text,
            },
            Err(e) => {
                warn!(target: "agent", error = %e, "Invalid response tags");
                text
            }
        }
    }

    /// Shut down every registered system. Calling it again does nothing.
    pub async fn shutdown(&self) {
        let systems: Vec<Arc<dyn System>> = self.systems.write().await.drain(..).collect();
        self.routes.write().await.clear();

        debug!(target: "agent", systems = systems.len(), "Shutting down systems");
        futures::future::join_all(systems.iter().map(|system| system.shutdown())).await;
    }
}
