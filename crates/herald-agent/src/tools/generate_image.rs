//! Tool: generate_image — immediate-delivery image generation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::runtime::AgentContext;

use super::{required_str, OutFile, Tool, ToolOutcome};

pub struct GenerateImageTool {
    ctx: Arc<AgentContext>,
}

impl GenerateImageTool {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for GenerateImageTool {
    fn name(&self) -> &str {
        "generate_image"
    }

    fn description(&self) -> &str {
        "Generate an image from a text prompt. The image is delivered to \
         the user immediately."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "What to draw."
                },
                "aspect_ratio": {
                    "type": "string",
                    "enum": ["1:1", "16:9", "9:16", "4:3", "3:4"],
                    "description": "Defaults to 1:1."
                },
                "resolution": {
                    "type": "string",
                    "enum": ["standard", "high"],
                    "description": "Defaults to standard."
                }
            },
            "required": ["prompt"]
        })
    }

    fn is_paid(&self) -> bool {
        true
    }

    fn estimated_cost(&self) -> rust_decimal::Decimal {
        self.ctx.config.pricing.image_generation
    }

    async fn execute(&self, input: serde_json::Value) -> ToolOutcome {
        let prompt = match required_str(&input, "prompt") {
            Ok(v) => v,
            Err(outcome) => return outcome,
        };
        let aspect_ratio = input
            .get("aspect_ratio")
            .and_then(|v| v.as_str())
            .unwrap_or("1:1");
        let resolution = input
            .get("resolution")
            .and_then(|v| v.as_str())
            .unwrap_or("standard");

        match self.ctx.imagegen.generate(prompt, aspect_ratio, resolution).await {
            Ok(image) => {
                let ext = if image.mime == "image/jpeg" { "jpg" } else { "png" };
                let revised = if image.revised_prompt.is_empty() {
                    prompt.to_string()
                } else {
                    image.revised_prompt.clone()
                };
                let mut outcome = ToolOutcome::success(format!(
                    "Image generated and delivered to the user. Rendered prompt: {revised}"
                ))
                .with_cost(self.ctx.config.pricing.image_generation);
                outcome.file_contents.push(OutFile {
                    filename: format!("generated.{ext}"),
                    mime: image.mime,
                    bytes: image.bytes,
                    context: Some(format!("generated for: {prompt}")),
                });
                outcome
            }
            Err(e) => ToolOutcome::error(format!("image generation failed: {e}")),
        }
    }
}
