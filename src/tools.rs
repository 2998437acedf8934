//! Tool-call capture
//!
//! Agents call a `ToolCallListener` synchronously right before running a
//! tool. `ToolNotifier`, the listener the relay hands to each invocation,
//! numbers the calls and queues a `ToolNotification` on the Tool
//! Notification Channel without ever blocking or failing the tool call.

use crate::publisher::ChannelPublisher;
use crate::types::{ToolContext, ToolDescriptor, ToolNotification, ToolParameter};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};

/// Hook invoked before every tool call of one invocation
pub trait ToolCallListener: Send + Sync {
    fn before_tool_call(&self, call: &ToolDescriptor);
}

/// Listener that ignores every call
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl ToolCallListener for NoopListener {
    fn before_tool_call(&self, _call: &ToolDescriptor) {}
}

impl ToolDescriptor {
    /// Build a descriptor from a tool's JSON input object
    ///
    /// Object members become parameters in key order; any other input
    /// becomes a single `input` parameter.
    pub fn from_input(
        tool_name: impl Into<String>,
        tool_description: impl Into<String>,
        input: &Value,
    ) -> Self {
        let parameters = match input {
            Value::Object(members) => members
                .iter()
                .map(|(name, value)| ToolParameter {
                    name: name.clone(),
                    kind: None,
                    description: None,
                    value: value.clone(),
                })
                .collect(),
            Value::Null => Vec::new(),
            other => vec![ToolParameter {
                name: "input".to_string(),
                kind: None,
                description: None,
                value: other.clone(),
            }],
        };

        Self {
            tool_name: tool_name.into(),
            tool_description: tool_description.into(),
            parameters,
        }
    }
}

/// Per-invocation listener publishing tool descriptors
pub struct ToolNotifier {
    session_id: String,
    user_id: String,
    run_id: Option<String>,
    invocations: AtomicU32,
    publisher: ChannelPublisher,
}

impl ToolNotifier {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        publisher: ChannelPublisher,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            run_id: None,
            invocations: AtomicU32::new(0),
            publisher,
        }
    }

    /// Tag notifications with the invocation they belong to
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Tool calls seen so far
    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl ToolCallListener for ToolNotifier {
    fn before_tool_call(&self, call: &ToolDescriptor) {
        let invocation_number = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;

        let notification = ToolNotification {
            context: ToolContext {
                user_id: self.user_id.clone(),
                session_id: self.session_id.clone(),
                invocation_number,
                run_id: self.run_id.clone(),
            },
            data: call.clone(),
        };

        match self.publisher.publish(&notification) {
            Ok(()) => tracing::debug!(
                session_id = %self.session_id,
                tool = %call.tool_name,
                invocation_number,
                "Tool notification queued"
            ),
            Err(e) => tracing::warn!(
                session_id = %self.session_id,
                tool = %call.tool_name,
                invocation_number,
                error = %e,
                "Failed to queue tool notification"
            ),
        }
    }
}
