//! Structured selection trace for debugging.
//!
//! Recording is gated on construction: a disabled trace makes every call a
//! no-op, so hot paths pay nothing beyond a branch and callers cannot tell
//! from the outside whether collection happened until they ask for steps.

use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct TraceStep {
    pub label: String,
    /// Creatives surviving this step, in order.
    pub creative_ids: Vec<i64>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct SelectionTrace {
    enabled: bool,
    steps: Vec<TraceStep>,
}

impl SelectionTrace {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            steps: Vec::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn step(&mut self, label: &str, creative_ids: Vec<i64>) {
        if !self.enabled {
            return;
        }
        self.steps.push(TraceStep {
            label: label.to_string(),
            creative_ids,
            details: HashMap::new(),
        });
    }

    pub fn step_with(
        &mut self,
        label: &str,
        creative_ids: Vec<i64>,
        details: impl IntoIterator<Item = (&'static str, String)>,
    ) {
        if !self.enabled {
            return;
        }
        self.steps.push(TraceStep {
            label: label.to_string(),
            creative_ids,
            details: details
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        });
    }

    /// The collected steps; empty when tracing was off.
    pub fn into_steps(self) -> Option<Vec<TraceStep>> {
        self.enabled.then_some(self.steps)
    }
}
