//! Tera engine for commit messages.

use tera::Tera;

use crate::context::CommitContext;
use crate::error::RenderError;

const DEFAULT_TEMPLATE_NAME: &str = "commit_message";
const CUSTOM_TEMPLATE_NAME: &str = "custom_commit_message";
const DEFAULT_TEMPLATE: &str = include_str!("templates/commit_message.tera");

/// Renders commit messages from the built-in template or a configured one.
///
/// Templates are parsed in [`CommitMessageRenderer::new`], so a broken custom
/// template is reported before any write happens.
pub struct CommitMessageRenderer {
    tera: Tera,
    template: &'static str,
}

impl CommitMessageRenderer {
    pub fn new(custom_template: Option<&str>) -> Result<Self, RenderError> {
        let mut tera = Tera::default();
        tera.add_raw_template(DEFAULT_TEMPLATE_NAME, DEFAULT_TEMPLATE)?;
        let template = match custom_template {
            Some(raw) => {
                tera.add_raw_template(CUSTOM_TEMPLATE_NAME, raw)?;
                CUSTOM_TEMPLATE_NAME
            }
            None => DEFAULT_TEMPLATE_NAME,
        };
        Ok(Self { tera, template })
    }

    /// Render the message, trimmed and terminated by a single newline.
    pub fn render(&self, ctx: &CommitContext) -> Result<String, RenderError> {
        let rendered = self.tera.render(self.template, &ctx.to_tera_context()?)?;
        let mut message = rendered.trim().to_string();
        message.push('\n');
        Ok(message)
    }
}

impl std::fmt::Debug for CommitMessageRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitMessageRenderer")
            .field("template", &self.template)
            .finish()
    }
}
