// Copyright (c) 2026 The porter developers.
// Part of porter, released under the BSD 3-Clause License.

use log::trace;
use minijinja::{Environment, UndefinedBehavior};
use shell_quote::Quote;
use std::collections::HashMap;

use crate::Error;

/// Renders shell command lines from application templates.
///
/// Templates support variable substitution, conditionals, and loops. Every
/// substituted value must pass through the `q` filter, which quotes it for
/// `bash`. `verify_quoting` probes a template with hostile parameter values
/// at startup so that an unquoted substitution is a configuration error,
/// never a request-time one.
///
pub struct TemplateEngine {
    env: Environment<'static>,
}

/// Quote a substituted value for `bash`.
///
/// Undefined values (schema-optional parameters that were not supplied)
/// quote to the empty string so that rendering stays total.
fn bash_quote(value: Option<String>) -> String {
    let value = value.unwrap_or_default();
    <shell_quote::Bash as Quote<String>>::quote(value.as_str())
}

impl Default for TemplateEngine {
    fn default() -> Self {
        TemplateEngine::new()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Lenient);
        env.add_filter("q", bash_quote);
        TemplateEngine { env }
    }

    /// Register a template under `name`.
    ///
    /// # Errors
    /// Returns `Error::TemplateParse` when the template does not parse.
    pub fn add(&mut self, name: &str, source: &str) -> Result<(), Error> {
        self.env
            .add_template_owned(name.to_string(), source.to_string())
            .map_err(|e| Error::TemplateParse(name.to_string(), e))
    }

    /// Verify that every substitution of a parameter passes through `q`.
    ///
    /// Renders the template once with a distinct hostile probe value per
    /// parameter. A probe that survives into the output verbatim was
    /// substituted without quoting.
    ///
    /// # Errors
    /// Returns `Error::UnquotedSubstitution` naming the offending parameter,
    /// or `Error::TemplateRender` when the probe render itself fails.
    pub fn verify_quoting(&self, name: &str, parameters: &[String]) -> Result<(), Error> {
        let probes: HashMap<String, String> = parameters
            .iter()
            .enumerate()
            .map(|(i, parameter)| (parameter.clone(), probe_value(i)))
            .collect();

        let rendered = self.render(name, &probes)?;

        for (i, parameter) in parameters.iter().enumerate() {
            if rendered.contains(&probe_value(i)) {
                return Err(Error::UnquotedSubstitution(
                    name.to_string(),
                    parameter.clone(),
                ));
            }
        }

        trace!("Template '{name}' quotes all {} parameters.", parameters.len());
        Ok(())
    }

    /// Render a registered template to a single shell command line.
    ///
    /// Newlines in the template are collapsed to spaces. Parameter values
    /// must already be validated against the application's input schema;
    /// rendering a verified template with schema-conformant parameters
    /// cannot fail.
    ///
    /// # Errors
    /// Returns `Error::TemplateRender` when the template engine reports an
    /// error (possible only for unverified templates).
    pub fn render(
        &self,
        name: &str,
        parameters: &HashMap<String, String>,
    ) -> Result<String, Error> {
        let template = self
            .env
            .get_template(name)
            .map_err(|e| Error::TemplateRender(name.to_string(), e))?;

        let rendered = template
            .render(parameters)
            .map_err(|e| Error::TemplateRender(name.to_string(), e))?;

        Ok(rendered.replace(['\r', '\n'], " ").trim().to_string())
    }
}

/// A hostile value that `q` cannot leave intact: quotes, spaces, and shell
/// metacharacters. The index keeps probes distinct per parameter.
fn probe_value(index: usize) -> String {
    format!("p'o\"r{index} t&e;r")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::parallel;

    fn setup(source: &str) -> TemplateEngine {
        let mut engine = TemplateEngine::new();
        engine.add("command", source).expect("valid template");
        engine
    }

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    #[parallel]
    fn quoted_substitution_passes_verification() {
        let engine = setup("wc {{ file|q }}");
        engine
            .verify_quoting("command", &["file".to_string()])
            .expect("quoted template");
    }

    #[test]
    #[parallel]
    fn unquoted_substitution_is_rejected() {
        let engine = setup("echo {{ msg }}");
        let error = engine.verify_quoting("command", &["msg".to_string()]);
        assert!(matches!(
            error,
            Err(Error::UnquotedSubstitution(_, parameter)) if parameter == "msg"
        ));
    }

    #[test]
    #[parallel]
    fn unquoted_substitution_behind_conditional_is_rejected() {
        let engine = setup("run {% if verbose %}-v {{ verbose }}{% endif %}");
        let error = engine.verify_quoting("command", &["verbose".to_string()]);
        assert!(matches!(error, Err(Error::UnquotedSubstitution(_, _))));
    }

    #[test]
    #[parallel]
    fn offending_parameter_is_named() {
        let engine = setup("tool {{ good|q }} {{ bad }}");
        let error = engine.verify_quoting("command", &["good".to_string(), "bad".to_string()]);
        assert!(matches!(
            error,
            Err(Error::UnquotedSubstitution(_, parameter)) if parameter == "bad"
        ));
    }

    #[test]
    #[parallel]
    fn hostile_value_renders_quoted() {
        let engine = setup("echo {{ msg|q }}");
        let hostile = "; rm -rf /";
        let rendered = engine
            .render("command", &params(&[("msg", hostile)]))
            .unwrap();

        let quoted = <shell_quote::Bash as Quote<String>>::quote(hostile);
        assert_eq!(rendered, format!("echo {quoted}"));
        assert!(!rendered.contains("echo ; rm"));
    }

    #[test]
    #[parallel]
    fn rendering_is_total_without_optional_parameters() {
        let engine = setup("run {% if extra %}--extra {{ extra|q }}{% endif %} input");
        let rendered = engine.render("command", &HashMap::new()).unwrap();
        assert_eq!(rendered, "run  input");
    }

    #[test]
    #[parallel]
    fn newlines_collapse_to_spaces() {
        let engine = setup("tool\n  --flag {{ v|q }}\n  final");
        let rendered = engine.render("command", &params(&[("v", "x")])).unwrap();
        assert!(!rendered.contains('\n'));
        assert!(rendered.starts_with("tool"));
        assert!(rendered.ends_with("final"));
    }

    #[test]
    #[parallel]
    fn loop_constructs_render() {
        let engine = setup(
            "merge {% for f in files|split(',') %}{{ f|q }} {% endfor %}",
        );
        let rendered = engine
            .render("command", &params(&[("files", "a.txt,b.txt")]))
            .unwrap();
        assert!(rendered.contains("a.txt"));
        assert!(rendered.contains("b.txt"));
    }

    #[test]
    #[parallel]
    fn invalid_template_is_a_parse_error() {
        let mut engine = TemplateEngine::new();
        let error = engine.add("command", "echo {{ msg");
        assert!(matches!(error, Err(Error::TemplateParse(_, _))));
    }
}
