use anyhow::Result;
use serde::Serialize;
use tinytemplate::TinyTemplate;

#[derive(Serialize)]
struct MacroContext<'a> {
    char: &'a str,
    user: &'a str,
}

/// Renders {char}/{user} macros in card and prompt text. Callers fall back
/// to the raw text when rendering fails (e.g. stray braces in prose).
pub fn render_macros(text: &str, char_name: &str, user_name: &str) -> Result<String> {
    let mut tt = TinyTemplate::new();
    tt.set_default_formatter(&tinytemplate::format_unescaped);
    tt.add_template("text", text)?;
    let rendered = tt.render(
        "text",
        &MacroContext {
            char: char_name,
            user: user_name,
        },
    )?;
    Ok(rendered)
}

/// Render-or-keep convenience used across the prompt source.
pub fn render_or_raw(text: &str, char_name: &str, user_name: &str) -> String {
    render_macros(text, char_name, user_name).unwrap_or_else(|_| text.to_string())
}
