//! BoxTool -- object-safe dynamic dispatch wrapper for Tool.
//!
//! 1. `ToolDyn` is the object-safe variant of `Tool` with boxed futures
//! 2. Blanket-impl `ToolDyn` for all `T: Tool`
//! 3. `BoxTool` wraps `Arc<dyn ToolDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use runloop_types::llm::ToolDefinition;
use runloop_types::message::{FunctionCallMessage, FunctionCallOutputMessage};

use super::{Tool, ToolContext, ToolError};

/// Object-safe version of [`Tool`] with boxed futures.
pub trait ToolDyn: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    fn needs_approval(&self) -> bool;

    fn execute_boxed<'a>(
        &'a self,
        call: &'a FunctionCallMessage,
        ctx: &'a ToolContext,
    ) -> Pin<Box<dyn Future<Output = Result<FunctionCallOutputMessage, ToolError>> + Send + 'a>>;
}

impl<T: Tool> ToolDyn for T {
    fn definition(&self) -> ToolDefinition {
        Tool::definition(self)
    }

    fn needs_approval(&self) -> bool {
        Tool::needs_approval(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        call: &'a FunctionCallMessage,
        ctx: &'a ToolContext,
    ) -> Pin<Box<dyn Future<Output = Result<FunctionCallOutputMessage, ToolError>> + Send + 'a>> {
        Box::pin(self.execute(call, ctx))
    }
}

/// Type-erased, cheaply cloneable tool.
#[derive(Clone)]
pub struct BoxTool {
    inner: Arc<dyn ToolDyn>,
}

impl BoxTool {
    pub fn new<T: Tool + 'static>(tool: T) -> Self {
        Self {
            inner: Arc::new(tool),
        }
    }

    /// The tool name from its definition.
    pub fn name(&self) -> String {
        self.inner.definition().name
    }

    pub fn definition(&self) -> ToolDefinition {
        self.inner.definition()
    }

    pub fn needs_approval(&self) -> bool {
        self.inner.needs_approval()
    }

    pub async fn execute(
        &self,
        call: &FunctionCallMessage,
        ctx: &ToolContext,
    ) -> Result<FunctionCallOutputMessage, ToolError> {
        self.inner.execute_boxed(call, ctx).await
    }
}

impl std::fmt::Debug for BoxTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxTool")
            .field("name", &self.name())
            .finish()
    }
}
