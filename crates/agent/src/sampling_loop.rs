//! The sampling loop: call the model, run the tools it asks for, feed the
//! results back, repeat until it answers without tool calls.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tilt_config::{AppConfig, BrowserConfig};
use tilt_core::error::{LoopError, ProviderError};
use tilt_core::message::{CacheControl, ContentBlock, Message};
use tilt_core::observer::{ApiExchange, LoopObserver};
use tilt_core::provider::{Provider, ProviderRequest, ProviderResponse, ThinkingConfig};
use tilt_core::tool::ToolCollection;
use tilt_core::version::{PROMPT_CACHING_BETA_FLAG, TOKEN_EFFICIENT_TOOLS_BETA_FLAG, ToolVersion};
use tilt_telemetry::TimingCollector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::browser;
use crate::context;
use crate::interjection::InterjectionPoller;
use crate::prompt;

/// Per-invocation settings.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub model: String,
    pub system_prompt_suffix: String,
    pub max_tokens: u32,
    /// Screenshots to keep in tool results. Also the pruning chunk size.
    /// Ignored when the provider caches prompts.
    pub only_n_most_recent_images: Option<usize>,
    pub tool_version: ToolVersion,
    pub thinking_budget: Option<u32>,
    pub token_efficient_tools_beta: bool,
    /// Model calls allowed before giving up.
    pub max_iterations: usize,
    pub wall_clock_budget: Option<Duration>,
}

impl LoopConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt_suffix: String::new(),
            max_tokens: 4096,
            only_n_most_recent_images: None,
            tool_version: ToolVersion::default(),
            thinking_budget: None,
            token_efficient_tools_beta: false,
            max_iterations: 200,
            wall_clock_budget: None,
        }
    }

    /// Model and loop bounds from the application config.
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            max_iterations: config.agent.max_iterations,
            wall_clock_budget: config.agent.wall_clock_budget_secs.map(Duration::from_secs),
            ..Self::new(config.model.model.clone())
        }
    }

    /// The `anthropic-beta` flags: tool group, token efficiency, caching.
    pub fn betas(&self, caching: bool) -> Vec<String> {
        let mut betas: Vec<String> = self.tool_version.beta_flag().map(str::to_string).into_iter().collect();
        if self.token_efficient_tools_beta {
            betas.push(TOKEN_EFFICIENT_TOOLS_BETA_FLAG.into());
        }
        if caching {
            betas.push(PROMPT_CACHING_BETA_FLAG.into());
        }
        betas
    }
}

/// One loop invocation's collaborators.
pub struct SamplingLoop {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolCollection>,
    config: LoopConfig,
    interjections: Option<InterjectionPoller>,
    browser: Option<BrowserConfig>,
    timing: Arc<TimingCollector>,
    cancel: CancellationToken,
}

impl SamplingLoop {
    pub fn new(provider: Arc<dyn Provider>, tools: Arc<ToolCollection>, config: LoopConfig) -> Self {
        Self {
            provider,
            tools,
            config,
            interjections: None,
            browser: None,
            timing: Arc::new(TimingCollector::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Fold claimed interjections into the history before each model call.
    pub fn with_interjections(mut self, poller: InterjectionPoller) -> Self {
        self.interjections = Some(poller);
        self
    }

    /// Probe the browser and start network capture before the first call.
    pub fn with_browser(mut self, config: BrowserConfig) -> Self {
        self.browser = Some(config);
        self
    }

    /// Record step timings into a caller-owned collector.
    pub fn with_timing(mut self, timing: Arc<TimingCollector>) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn timing(&self) -> &Arc<TimingCollector> {
        &self.timing
    }

    /// Run to completion and return the full history.
    ///
    /// Tool failures become error results the model can read; only provider
    /// failures, fatal tool errors, the iteration and time bounds, and
    /// cancellation end the loop early.
    pub async fn run(
        &self,
        mut messages: Vec<Message>,
        observer: &dyn LoopObserver,
    ) -> Result<Vec<Message>, LoopError> {
        let started = Instant::now();
        let caching = self.provider.supports_prompt_caching();
        let betas = self.config.betas(caching);
        let tools = self.tools.definitions();

        let mut system = ContentBlock::text(prompt::system_text(&self.config.system_prompt_suffix));
        if caching {
            system.set_cache_control(Some(CacheControl::ephemeral()));
        }
        // Pruning would invalidate the cached prefix, which costs more than
        // the images it saves.
        let keep_images = if caching {
            0
        } else {
            self.config.only_n_most_recent_images.unwrap_or(0)
        };

        info!(
            tool_version = %self.config.tool_version,
            tools = ?self.tools.names(),
            provider = self.provider.name(),
            "Starting sampling loop"
        );

        if let Some(browser) = &self.browser {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Sampling loop cancelled while waiting for the browser");
                    return Err(LoopError::Cancelled);
                }
                _ = browser::prepare_network_monitoring(&self.tools, browser) => {}
            }
        }

        let mut iteration = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(LoopError::Cancelled);
            }
            if iteration >= self.config.max_iterations {
                warn!(iterations = iteration, "Iteration limit reached");
                return Err(LoopError::IterationLimit(self.config.max_iterations));
            }
            if let Some(budget) = self.config.wall_clock_budget {
                if iteration > 0 && started.elapsed() >= budget {
                    warn!(elapsed_ms = started.elapsed().as_millis() as u64, "Wall-clock budget exhausted");
                    return Err(LoopError::WallClockExceeded(budget.as_secs()));
                }
            }
            iteration += 1;
            self.timing.start_step(iteration);
            debug!(iteration, messages = messages.len(), "Sampling loop iteration");

            if let Some(poller) = &self.interjections {
                for text in poller.poll().await {
                    info!(message = %text, "Adding user chat message to conversation");
                    observer.on_content(&ContentBlock::text(format!("**User sent:** {text}")));
                    messages.push(Message::user(text));
                }
            }

            if caching {
                context::annotate_cache_breakpoints(&mut messages);
            }
            if keep_images > 0 {
                let removed = context::prune_images(&mut messages, keep_images, keep_images);
                if removed > 0 {
                    debug!(removed, "Pruned old screenshots");
                }
            }

            let request = ProviderRequest {
                model: self.config.model.clone(),
                max_tokens: self.config.max_tokens,
                system: vec![system.clone()],
                messages: messages.clone(),
                tools: tools.clone(),
                thinking: self.config.thinking_budget.map(ThinkingConfig::enabled),
                betas: betas.clone(),
            };

            let call_started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.timing.finish_step(Some("cancelled".into()));
                    info!(iteration, "Sampling loop cancelled during model call");
                    return Err(LoopError::Cancelled);
                }
                outcome = self.provider.complete(request.clone()) => outcome,
            };
            self.timing.record_anthropic_call(call_started.elapsed());
            observer.on_api_exchange(&self.exchange(&request, &outcome));

            let response = match outcome {
                Ok(response) => response,
                Err(e) => {
                    error!(error = %e, iteration, "Model call failed");
                    self.timing.finish_step(Some(e.to_string()));
                    return Err(LoopError::Provider(e));
                }
            };

            let parse_started = Instant::now();
            let content = response_to_blocks(response);
            self.timing.record_anthropic_response(parse_started.elapsed());
            messages.push(Message::assistant_blocks(content.clone()));

            let mut tool_results = Vec::new();
            for block in &content {
                observer.on_content(block);
                let ContentBlock::ToolUse { id, name, input, .. } = block else {
                    continue;
                };

                info!(tool = %name, tool_use_id = %id, "Tool call start");
                debug!(tool = %name, input = %input, "Tool input");
                let tool_started = Instant::now();
                let result = match self.tools.run(name, input.clone()).await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(tool = %name, tool_use_id = %id, error = %e, "Fatal tool error");
                        self.timing.finish_step(Some(e.to_string()));
                        return Err(LoopError::FatalTool(e));
                    }
                };
                self.timing.record_tool(name, tool_started.elapsed());

                match &result.error {
                    Some(e) => error!(tool = %name, tool_use_id = %id, error = %e, "Tool error"),
                    None => info!(
                        tool = %name,
                        tool_use_id = %id,
                        image = result.base64_image.is_some(),
                        "Tool call success"
                    ),
                }
                tool_results.push(result.to_content_block(id));
                observer.on_tool_result(&result, id);
            }
            self.timing.finish_step(None);

            if tool_results.is_empty() {
                info!(iterations = iteration, messages = messages.len(), "Sampling loop finished");
                return Ok(messages);
            }
            messages.push(Message::user_blocks(tool_results));
        }
    }

    fn exchange(
        &self,
        request: &ProviderRequest,
        outcome: &Result<ProviderResponse, ProviderError>,
    ) -> ApiExchange {
        let mut exchange = ApiExchange {
            provider: self.provider.name().to_string(),
            model: request.model.clone(),
            request: serde_json::to_value(request).unwrap_or_default(),
            betas: request.betas.clone(),
            ..ApiExchange::default()
        };
        match outcome {
            Ok(response) => {
                exchange.status = Some(response.status);
                exchange.response = Some(response.raw.clone());
            }
            Err(e) => {
                if let ProviderError::ApiError { status_code, .. } = e {
                    exchange.status = Some(*status_code);
                }
                exchange.error = Some(e.to_string());
            }
        }
        exchange
    }
}

/// The assistant turn to append: empty text blocks are dropped, thinking
/// and tool-use blocks are carried verbatim.
fn response_to_blocks(response: ProviderResponse) -> Vec<ContentBlock> {
    response
        .content
        .into_iter()
        .filter(|block| !matches!(block, ContentBlock::Text { text, .. } if text.is_empty()))
        .collect()
}
