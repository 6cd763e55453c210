use crate::error::{Error, Result};
use minijinja::{AutoEscape, Environment};
use serde::{Deserialize, Serialize};

const BODY_TPL: &str = "body";
const SUBJECT_TPL: &str = "subject";

/// A stored template used for transactional messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub subject: String,
    pub body: String,
}

pub struct CompiledTemplate {
    template: Template,
    env: Environment<'static>,
}

impl CompiledTemplate {
    pub(crate) fn compile(mut env: Environment<'static>, template: Template) -> Result<Self> {
        env.set_auto_escape_callback(|name| match name {
            BODY_TPL => AutoEscape::Html,
            _ => AutoEscape::None,
        });
        env.add_template_owned(BODY_TPL, template.body.clone())
            .map_err(Error::Compile)?;
        if !template.subject.is_empty() {
            env.add_template_owned(SUBJECT_TPL, template.subject.clone())
                .map_err(Error::Compile)?;
        }
        Ok(Self { template, env })
    }

    pub fn id(&self) -> i64 {
        self.template.id
    }

    pub fn name(&self) -> &str {
        &self.template.name
    }

    pub fn render<S: Serialize>(&self, ctx: S) -> Result<String> {
        self.render_tpl(BODY_TPL, ctx)
    }

    pub fn render_subject<S: Serialize>(&self, ctx: S) -> Result<String> {
        if self.template.subject.is_empty() {
            return Ok(String::new());
        }
        self.render_tpl(SUBJECT_TPL, ctx)
    }

    fn render_tpl<S: Serialize>(&self, name: &str, ctx: S) -> Result<String> {
        self.env
            .get_template(name)
            .and_then(|tpl| tpl.render(ctx))
            .map_err(Error::Render)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funcs::add_generic_functions;
    use serde_json::json;

    fn compile(subject: &str, body: &str) -> Result<CompiledTemplate> {
        let mut env = Environment::new();
        add_generic_functions(&mut env);
        CompiledTemplate::compile(
            env,
            Template {
                id: 1,
                name: "welcome".to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
            },
        )
    }

    #[test]
    fn test_render_body_and_subject() {
        let tpl = compile("Welcome {{ name }}", "<p>Hi {{ name }}</p>").unwrap();
        let ctx = json!({"name": "<Ada>"});

        assert_eq!(tpl.render(&ctx).unwrap(), "<p>Hi &lt;Ada&gt;</p>");
        assert_eq!(tpl.render_subject(&ctx).unwrap(), "Welcome <Ada>");
        assert_eq!(tpl.id(), 1);
        assert_eq!(tpl.name(), "welcome");
    }

    #[test]
    fn test_empty_subject_renders_empty() {
        let tpl = compile("", "body").unwrap();
        assert_eq!(tpl.render_subject(json!({})).unwrap(), "");
    }

    #[test]
    fn test_syntax_error_fails_compile() {
        assert!(matches!(compile("", "{{ name"), Err(Error::Compile(_))));
    }
}
