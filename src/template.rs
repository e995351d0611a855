//! Templated mock values.
//!
//! String fields of a [`crate::registry::MockValue::Template`] are rendered
//! with Handlebars against the intercepted request.

use crate::request::RequestView;
use handlebars::{
    Context, Handlebars, Helper, HelperResult, Output, RenderContext, RenderError,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Handlebars registry with the harness helpers installed.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

/// Variables visible to templates.
#[derive(Debug, Serialize)]
pub struct TemplateContext<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub path: String,
    pub query: &'a HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<&'a str>,
}

impl<'a> TemplateContext<'a> {
    pub fn from_request(req: &'a RequestView) -> Self {
        Self {
            method: req.method().as_str(),
            url: req.url(),
            path: req.path(),
            query: req.query(),
            body: req.body(),
            json: req.json(),
            instructions: req.instructions(),
        }
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        handlebars.register_helper("json", Box::new(json_helper));
        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));

        // Output is JSON, not HTML.
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars }
    }

    /// Render a single template string.
    pub fn render(&self, template: &str, req: &RequestView) -> Result<String, RenderError> {
        self.handlebars
            .render_template(template, &TemplateContext::from_request(req))
    }

    /// Render every templated string inside `value`.
    pub fn render_value(&self, value: &Value, req: &RequestView) -> Result<Value, RenderError> {
        let ctx = TemplateContext::from_request(req);
        self.render_node(value, &ctx)
    }

    fn render_node(&self, value: &Value, ctx: &TemplateContext<'_>) -> Result<Value, RenderError> {
        match value {
            Value::String(s) if s.contains("{{") => {
                Ok(Value::String(self.handlebars.render_template(s, ctx)?))
            }
            Value::Array(items) => items
                .iter()
                .map(|v| self.render_node(v, ctx))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(obj) => {
                let mut rendered = serde_json::Map::with_capacity(obj.len());
                for (k, v) in obj {
                    rendered.insert(k.clone(), self.render_node(v, ctx)?);
                }
                Ok(Value::Object(rendered))
            }
            _ => Ok(value.clone()),
        }
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn str_param<'a>(h: &'a Helper, idx: usize) -> &'a str {
    h.param(idx).and_then(|v| v.value().as_str()).unwrap_or("")
}

fn json_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    // Serialize whatever value was passed, objects included.
    let value = h.param(0).map(|v| v.value().clone()).unwrap_or(Value::Null);
    out.write(&value.to_string())?;
    Ok(())
}

fn uuid_helper(
    _: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    out.write(&random_uuid())?;
    Ok(())
}

/// Random v4-shaped identifier.
pub fn random_uuid() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    format!(
        "{:08x}-{:04x}-4{:03x}-{:04x}-{:012x}",
        rng.gen::<u32>(),
        rng.gen::<u16>(),
        rng.gen::<u16>() & 0x0fff,
        (rng.gen::<u16>() & 0x3fff) | 0x8000,
        rng.gen::<u64>() & 0xffff_ffff_ffff,
    )
}

fn now_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let format = match str_param(h, 0) {
        "" => "%Y-%m-%dT%H:%M:%S%.3fZ",
        f => f,
    };
    out.write(&chrono::Utc::now().format(format).to_string())?;
    Ok(())
}

fn default_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let fallback = str_param(h, 1);
    let rendered = match h.param(0).map(|v| v.value()) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Null) | Some(Value::String(_)) | None => fallback.to_string(),
        Some(other) => other.to_string(),
    };
    out.write(&rendered)?;
    Ok(())
}

fn upper_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    out.write(&str_param(h, 0).to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    out.write(&str_param(h, 0).to_lowercase())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{HttpMethod, InterceptedRequest};
    use serde_json::json;

    fn view(method: HttpMethod, url: &str, body: Option<Value>) -> RequestView {
        let mut req = InterceptedRequest::new(method, url);
        if let Some(b) = body {
            req = req.with_json(&b);
        }
        RequestView::new(req)
    }

    #[test]
    fn test_query_and_path() {
        let engine = TemplateEngine::new();
        let req = view(HttpMethod::Get, "https://d.test/rest/v1/words?id=eq.7", None);
        let out = engine.render("{{method}} {{path}} {{query.id}}", &req).unwrap();
        assert_eq!(out, "GET /rest/v1/words eq.7");
    }

    #[test]
    fn test_body_fields() {
        let engine = TemplateEngine::new();
        let req = view(
            HttpMethod::Post,
            "https://b.test/api/llm",
            Some(json!({"word": "casa", "messages": [{"content": "define casa"}]})),
        );
        let out = engine.render("{{upper json.word}} / {{instructions}}", &req).unwrap();
        assert_eq!(out, "CASA / define casa");
    }

    #[test]
    fn test_default_helper() {
        let engine = TemplateEngine::new();
        let req = view(HttpMethod::Get, "https://d.test/x", None);
        let out = engine
            .render("{{default query.missing \"fallback\"}}", &req)
            .unwrap();
        assert_eq!(out, "fallback");
    }

    #[test]
    fn test_uuid_helper_shape() {
        let engine = TemplateEngine::new();
        let req = view(HttpMethod::Get, "https://d.test/x", None);
        let out = engine.render("{{uuid}}", &req).unwrap();
        assert_eq!(out.len(), 36);
        assert_eq!(out.chars().nth(14), Some('4'));
    }

    #[test]
    fn test_render_value_nested() {
        let engine = TemplateEngine::new();
        let req = view(
            HttpMethod::Post,
            "https://d.test/rest/v1/words",
            Some(json!({"word": "perro"})),
        );
        let value = json!({
            "rows": [{"word": "{{json.word}}", "lower": "{{lower json.word}}"}],
            "count": 1,
            "static": "plain"
        });
        let out = engine.render_value(&value, &req).unwrap();
        assert_eq!(out["rows"][0]["word"], "perro");
        assert_eq!(out["count"], 1);
        assert_eq!(out["static"], "plain");
    }
}
