//! Terminal rendering of operation progress events.

use crate::color::{paint, BLUE, CYAN, GRAY, GREEN, RED, YELLOW};
use crate::operations::{EventPayload, MessageLevel, OperationEvent, OperationState};

#[derive(Debug, Clone, Copy)]
pub struct ProgressRenderer {
    color: bool,
    show_stages: bool,
}

impl ProgressRenderer {
    pub fn new(color: bool, show_stages: bool) -> Self {
        Self { color, show_stages }
    }

    /// The line to print for `event`, if any.
    pub fn render(&self, event: &OperationEvent) -> Option<String> {
        match &event.payload {
            EventPayload::Started { description, .. } => {
                Some(paint(self.color, CYAN, description))
            }
            EventPayload::Stage(stage) if self.show_stages => {
                Some(paint(self.color, GRAY, &format!("  [{stage}]")))
            }
            EventPayload::Stage(_) => None,
            EventPayload::Message { level, text, indent } => {
                Some(self.message(*level, text, *indent))
            }
            EventPayload::Completed {
                state: OperationState::Failed,
                error: Some(error),
            } if error == "operation was interrupted" => {
                Some(paint(self.color, RED, &format!("✗ {error}")))
            }
            EventPayload::Completed { .. } => None,
        }
    }

    fn message(&self, level: MessageLevel, text: &str, indent: u8) -> String {
        let pad = "  ".repeat(usize::from(indent));
        let line = match level {
            MessageLevel::Info => text.to_string(),
            MessageLevel::Success => paint(self.color, GREEN, &format!("✓ {text}")),
            MessageLevel::Warning => paint(self.color, YELLOW, &format!("⚠ {text}")),
            MessageLevel::Error => paint(self.color, RED, &format!("✗ {text}")),
            MessageLevel::Dim => paint(self.color, GRAY, text),
            MessageLevel::Hint => paint(self.color, BLUE, &format!("→ {text}")),
        };
        format!("{pad}{line}")
    }

    pub fn print(&self, event: &OperationEvent) {
        if let Some(line) = self.render(event) {
            eprintln!("{line}");
        }
    }
}
