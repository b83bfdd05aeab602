//! Display model for a streaming turn: visible text, collapsible thinking,
//! and tool-call markers, folded from stream events.

use crate::stream::StreamEvent;

#[derive(Debug, Default)]
pub struct Display {
    text: String,
    thinking: String,
    tool_markers: Vec<String>,
    interrupted: bool,
}

/// Suffix appended when a turn is cancelled mid-stream.
pub const INTERRUPTED_SUFFIX: &str = "[interrupted]";

impl Display {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta { text } => self.text.push_str(text),
            StreamEvent::ThinkingDelta { text } => self.thinking.push_str(text),
            StreamEvent::ToolUse { name, .. } => self.tool_markers.push(name.clone()),
            StreamEvent::ServerToolResult { text } => {
                if !text.is_empty() {
                    self.tool_markers.push(format!("→ {text}"));
                }
            }
            // Signatures, block closes, stop, and errors don't render.
            _ => {}
        }
    }

    pub fn mark_interrupted(&mut self) {
        self.interrupted = true;
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn thinking(&self) -> &str {
        &self.thinking
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.thinking.is_empty() && self.tool_markers.is_empty()
    }

    /// Render the frontend view. Tool markers lead, then the visible text.
    /// While only thinking has arrived, a progress marker is shown so the
    /// draft has something to display.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for marker in &self.tool_markers {
            out.push_str("⚙ ");
            out.push_str(marker);
            out.push('\n');
        }
        if !self.text.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&self.text);
        } else if !self.thinking.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("💭 thinking…");
        }
        if self.interrupted {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(INTERRUPTED_SUFFIX);
        }
        if out.is_empty() {
            out.push('…');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_text_deltas() {
        let mut d = Display::new();
        d.apply(&StreamEvent::TextDelta { text: "Hello ".into() });
        d.apply(&StreamEvent::TextDelta { text: "world".into() });
        assert_eq!(d.render(), "Hello world");
    }

    #[test]
    fn thinking_only_shows_progress_marker() {
        let mut d = Display::new();
        d.apply(&StreamEvent::ThinkingDelta { text: "mulling".into() });
        assert_eq!(d.render(), "💭 thinking…");
        assert_eq!(d.thinking(), "mulling");
    }

    #[test]
    fn tool_markers_lead_the_text() {
        let mut d = Display::new();
        d.apply(&StreamEvent::ToolUse {
            id: "t".into(),
            name: "web_search".into(),
            input: serde_json::json!({}),
        });
        d.apply(&StreamEvent::TextDelta { text: "Done.".into() });
        assert_eq!(d.render(), "⚙ web_search\n\nDone.");
    }

    #[test]
    fn interrupted_suffix_appended() {
        let mut d = Display::new();
        d.apply(&StreamEvent::TextDelta { text: "partial".into() });
        d.mark_interrupted();
        assert_eq!(d.render(), format!("partial\n\n{INTERRUPTED_SUFFIX}"));
    }

    #[test]
    fn empty_display_renders_ellipsis() {
        assert_eq!(Display::new().render(), "…");
    }
}
