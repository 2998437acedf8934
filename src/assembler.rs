//! Client-side transcript reconstruction
//!
//! The relay only orders events within one delivery batch, and channels
//! may redeliver. `TranscriptAssembler` restores the full order on the
//! consuming side: tokens are keyed by sequence number, so late or
//! duplicate pushes land in the right place exactly once. Tool
//! annotations are keyed by invocation number and never interleave with
//! the text.
//!
//! Every event the driver publishes carries its invocation's `runId`. An
//! assembler is bound to one run, either explicitly with
//! [`TranscriptAssembler::for_run`] or by the first stamped event it
//! accepts. Runs left behind by [`TranscriptAssembler::reset`] are retired
//! and their redelivered events are ignored.

use crate::error::Result;
use crate::types::{Event, EventData, FinalResponse, SessionPush};
use std::collections::{BTreeMap, HashSet};
use std::ops::Range;

/// What applying one event did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Added,
    Duplicate,
    /// Not part of this transcript (other or retired run, heartbeat)
    Ignored,
}

/// How the invocation ended
#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    Final(FinalResponse),
    Error(String),
}

/// Reconstructs one invocation's output from pushed events
#[derive(Debug, Default)]
pub struct TranscriptAssembler {
    run_id: Option<String>,
    retired: HashSet<String>,
    tokens: BTreeMap<u64, String>,
    tool_actions: BTreeMap<u32, String>,
    terminal: Option<Terminal>,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assembler that only accepts events of `run_id`
    pub fn for_run(run_id: impl Into<String>) -> Self {
        Self {
            run_id: Some(run_id.into()),
            ..Self::default()
        }
    }

    /// Run this assembler is bound to, if any
    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    /// Apply a raw push from the delivery sink
    pub fn apply_push(&mut self, push: &SessionPush) -> Result<Applied> {
        let event: Event = serde_json::from_str(&push.data)?;
        Ok(self.apply(&event))
    }

    pub fn apply(&mut self, event: &Event) -> Applied {
        if let EventData::Heartbeat = event.data {
            return Applied::Ignored;
        }
        if !self.accepts(event.data.run_id()) {
            return Applied::Ignored;
        }

        match &event.data {
            EventData::Token(token) => {
                if self.tokens.contains_key(&token.sequence_number) {
                    return Applied::Duplicate;
                }
                self.tokens
                    .insert(token.sequence_number, token.value.clone());
                Applied::Added
            }
            EventData::ToolAction(action) => {
                if self.tool_actions.contains_key(&action.invocation_number) {
                    return Applied::Duplicate;
                }
                self.tool_actions
                    .insert(action.invocation_number, action.tool_action.clone());
                Applied::Added
            }
            EventData::FinalResponse(response) => {
                self.set_terminal(Terminal::Final(response.clone()))
            }
            EventData::Error(error) => self.set_terminal(Terminal::Error(error.message.clone())),
            EventData::Heartbeat => Applied::Ignored,
        }
    }

    /// Scope check; binds to the first stamped run that is not retired
    fn accepts(&mut self, run_id: Option<&str>) -> bool {
        let Some(run_id) = run_id else {
            // Unstamped events come from producers without run tracking
            return true;
        };
        match &self.run_id {
            Some(current) => current == run_id,
            None if self.retired.contains(run_id) => false,
            None => {
                self.run_id = Some(run_id.to_string());
                true
            }
        }
    }

    fn set_terminal(&mut self, terminal: Terminal) -> Applied {
        if self.terminal.is_some() {
            return Applied::Duplicate;
        }
        self.terminal = Some(terminal);
        Applied::Added
    }

    /// Concatenated tokens from sequence 1 up to the first gap
    pub fn text(&self) -> String {
        let mut text = String::new();
        for (expected, (sequence, value)) in (1u64..).zip(self.tokens.iter()) {
            if *sequence != expected {
                break;
            }
            text.push_str(value);
        }
        text
    }

    /// Missing sequence ranges below the highest one received
    pub fn gaps(&self) -> Vec<Range<u64>> {
        let mut gaps = Vec::new();
        let mut expected = 1;
        for &sequence in self.tokens.keys() {
            if sequence > expected {
                gaps.push(expected..sequence);
            }
            expected = sequence.saturating_add(1);
        }
        gaps
    }

    /// Tool annotations ordered by invocation number
    pub fn tool_actions(&self) -> impl Iterator<Item = (u32, &str)> {
        self.tool_actions
            .iter()
            .map(|(number, text)| (*number, text.as_str()))
    }

    pub fn terminal(&self) -> Option<&Terminal> {
        self.terminal.as_ref()
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// A final answer arrived and no token is missing
    pub fn is_complete(&self) -> bool {
        matches!(self.terminal, Some(Terminal::Final(_))) && self.is_contiguous()
    }

    /// Keys are distinct, so `1..=n` is gap-free iff it starts at 1 and ends at the count
    fn is_contiguous(&self) -> bool {
        match (self.tokens.keys().next(), self.tokens.keys().next_back()) {
            (Some(&lowest), Some(&highest)) => lowest == 1 && highest == self.tokens.len() as u64,
            _ => true,
        }
    }

    /// Forget everything, ready for the next invocation
    ///
    /// The current run is retired, so its redelivered events no longer apply.
    pub fn reset(&mut self) {
        let mut retired = std::mem::take(&mut self.retired);
        if let Some(run_id) = self.run_id.take() {
            retired.insert(run_id);
        }
        *self = Self {
            retired,
            ..Self::default()
        };
    }
}
