use once_cell::sync::Lazy;
use rust_embed::RustEmbed;
use std::collections::HashMap;
use std::sync::Arc;
use tera::{Context, Tera, Value};

#[derive(RustEmbed)]
#[folder = "templates/"]
struct TemplateAssets;

/// All HTML templates, compiled once from the embedded `templates/` directory.
pub struct Templates {
    tera: Tera,
}

static SHARED: Lazy<Result<Arc<Templates>, String>> =
    Lazy::new(|| Templates::load().map(Arc::new).map_err(|e| e.to_string()));

/// `{{ t(key="login.title") }}` looks a key up in the active locale.
fn translate(args: &HashMap<String, Value>) -> tera::Result<Value> {
    let key = args
        .get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| tera::Error::msg("t() requires a string `key` argument"))?;
    Ok(Value::String(t!(key).into_owned()))
}

impl Templates {
    pub fn load() -> Result<Self, tera::Error> {
        let mut sources = Vec::new();
        for name in TemplateAssets::iter() {
            let Some(file) = TemplateAssets::get(&name) else {
                continue;
            };
            let body = String::from_utf8(file.data.into_owned())
                .map_err(|e| tera::Error::msg(format!("template {name} is not UTF-8: {e}")))?;
            sources.push((name.to_string(), body));
        }

        let mut tera = Tera::default();
        tera.add_raw_templates(sources)?;
        tera.register_function("t", translate);
        Ok(Self { tera })
    }

    /// The process-wide instance, compiled on first use.
    pub fn shared() -> Result<Arc<Self>, String> {
        SHARED.clone()
    }

    pub fn render(&self, name: &str, context: &Context) -> Result<String, tera::Error> {
        self.tera.render(name, context)
    }

    /// The generic one-message page used for results and errors.
    pub fn render_message(&self, title: &str, text: &str) -> Result<String, tera::Error> {
        let mut context = Context::new();
        context.insert("title", title);
        context.insert("text", text);
        self.render("message.html", &context)
    }
}
