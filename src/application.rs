// Copyright (c) 2026 The porter developers.
// Part of porter, released under the BSD 3-Clause License.

use indexmap::IndexMap;
use log::{debug, trace};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

use crate::config::Configuration;
use crate::job::{Job, JobState};
use crate::template::TemplateEngine;
use crate::Error;

/// An authenticated identity, produced by the token boundary before any
/// core call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub roles: Vec<String>,
    pub issuer: String,
}

/// A compiled input schema.
///
/// Top-level properties are restricted to `string`, `number`, `integer`,
/// and `boolean`; non-string values are coerced to strings before they
/// reach the template engine.
struct InputSchema {
    validator: jsonschema::Validator,
    properties: Vec<String>,
    base64_properties: Vec<String>,
}

impl InputSchema {
    fn compile(owner: &str, schema: &Value) -> Result<Self, Error> {
        let object = schema
            .as_object()
            .ok_or_else(|| Error::SchemaNotObject(owner.to_string()))?;

        if object.get("type").and_then(Value::as_str) != Some("object") {
            return Err(Error::SchemaNotObject(owner.to_string()));
        }

        let mut properties = Vec::new();
        let mut base64_properties = Vec::new();

        if let Some(property_map) = object.get("properties").and_then(Value::as_object) {
            for (property, definition) in property_map {
                match definition.get("type").and_then(Value::as_str) {
                    Some("string" | "number" | "integer" | "boolean") => {}
                    _ => {
                        return Err(Error::NonStringProperty(
                            owner.to_string(),
                            property.clone(),
                        ));
                    }
                }

                if definition.get("contentEncoding").and_then(Value::as_str) == Some("base64") {
                    base64_properties.push(property.clone());
                }
                properties.push(property.clone());
            }
        }

        let validator = jsonschema::draft202012::new(schema)
            .map_err(|e| Error::SchemaCompile(owner.to_string(), e.to_string()))?;

        Ok(InputSchema {
            validator,
            properties,
            base64_properties,
        })
    }

    fn validate(&self, parameters: &Value) -> Result<(), Error> {
        if let Some(error) = self.validator.iter_errors(parameters).next() {
            return Err(Error::InvalidInput(format!(
                "{} at '{}'",
                error, error.instance_path
            )));
        }
        Ok(())
    }
}

/// A named shell-command template with its validation schema and required
/// uploads. Immutable; loaded at startup.
pub struct Application {
    pub name: String,
    pub upload_needs: Vec<String>,
    pub allowed_roles: Vec<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    schema: Option<InputSchema>,
}

impl Application {
    /// Enforce `allowed_roles`. An empty set admits any authorized user.
    pub fn check_roles(&self, principal: &Principal) -> Result<(), Error> {
        if self.allowed_roles.is_empty()
            || self
                .allowed_roles
                .iter()
                .any(|role| principal.roles.contains(role))
        {
            Ok(())
        } else {
            Err(Error::RoleDenied(
                principal.user_id.clone(),
                self.name.clone(),
            ))
        }
    }

    /// Enforce `upload_needs` against an unpacked archive directory.
    pub fn check_uploads(&self, upload_dir: &Path) -> Result<(), Error> {
        for needed in &self.upload_needs {
            if !upload_dir.join(needed).is_file() {
                return Err(Error::MissingUpload(self.name.clone(), needed.clone()));
            }
        }
        Ok(())
    }

    /// Validate parameters against the input schema and coerce them to the
    /// string values the template engine consumes.
    pub fn validate_input(&self, parameters: &Value) -> Result<HashMap<String, String>, Error> {
        validate_against(self.schema.as_ref(), &self.name, parameters)
    }
}

/// A short follow-up command executed in a completed job's directory.
pub struct InteractiveApplication {
    pub name: String,
    pub job_application: Option<String>,
    pub description: Option<String>,
    /// Wall-clock timeout in seconds.
    pub timeout: u64,
    schema: Option<InputSchema>,
}

impl InteractiveApplication {
    /// Enforce the preconditions on the target job.
    pub fn check_job(&self, job: &Job) -> Result<(), Error> {
        if job.state != JobState::Ok {
            return Err(Error::JobNotDone(job.id, job.state));
        }
        if let Some(expected) = &self.job_application {
            if expected != &job.application {
                return Err(Error::WrongJobApplication(
                    self.name.clone(),
                    expected.clone(),
                    job.id,
                    job.application.clone(),
                ));
            }
        }
        Ok(())
    }

    pub fn validate_input(&self, parameters: &Value) -> Result<HashMap<String, String>, Error> {
        validate_against(self.schema.as_ref(), &self.name, parameters)
    }

    /// Properties whose schema declares `contentEncoding: base64`.
    pub fn base64_properties(&self) -> &[String] {
        self.schema
            .as_ref()
            .map_or(&[], |schema| schema.base64_properties.as_slice())
    }
}

fn validate_against(
    schema: Option<&InputSchema>,
    owner: &str,
    parameters: &Value,
) -> Result<HashMap<String, String>, Error> {
    let Some(schema) = schema else {
        return match parameters {
            Value::Null => Ok(HashMap::new()),
            Value::Object(map) if map.is_empty() => Ok(HashMap::new()),
            _ => Err(Error::InvalidInput(format!(
                "'{owner}' accepts no parameters"
            ))),
        };
    };

    schema.validate(parameters)?;

    let Value::Object(map) = parameters else {
        return Err(Error::InvalidInput("parameters must be an object".into()));
    };

    let mut values = HashMap::with_capacity(map.len());
    for (key, value) in map {
        let coerced = match value {
            Value::String(text) => text.clone(),
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            _ => {
                return Err(Error::InvalidInput(format!(
                    "property '{key}' must be a string, number, or boolean"
                )));
            }
        };
        values.insert(key.clone(), coerced);
    }
    Ok(values)
}

fn template_name(application: &str) -> String {
    format!("application/{application}")
}

fn interactive_template_name(application: &str) -> String {
    format!("interactive/{application}")
}

/// The typed, validated view over the configured applications.
///
/// Construction performs every admin-time check: schema compilation,
/// template parsing, and quoting verification. A registry that constructed
/// successfully cannot raise a configuration error during a request.
///
pub struct ApplicationRegistry {
    engine: TemplateEngine,
    applications: IndexMap<String, Application>,
    interactive: IndexMap<String, InteractiveApplication>,
}

impl ApplicationRegistry {
    pub fn from_config(configuration: &Configuration) -> Result<Self, Error> {
        let mut engine = TemplateEngine::new();
        let mut applications = IndexMap::new();
        let mut interactive = IndexMap::new();

        for (name, application) in &configuration.applications {
            let schema = application
                .input_schema
                .as_ref()
                .map(|schema| InputSchema::compile(name, schema))
                .transpose()?;

            let template = template_name(name);
            engine.add(&template, &application.command_template)?;
            let properties = schema.as_ref().map_or(&[][..], |s| s.properties.as_slice());
            engine.verify_quoting(&template, properties)?;

            trace!("Registered application '{name}'.");
            applications.insert(
                name.clone(),
                Application {
                    name: name.clone(),
                    upload_needs: application.upload_needs.clone(),
                    allowed_roles: application.allowed_roles.clone(),
                    summary: application.summary.clone(),
                    description: application.description.clone(),
                    schema,
                },
            );
        }

        for (name, application) in &configuration.interactive_applications {
            let schema = application
                .input_schema
                .as_ref()
                .map(|schema| InputSchema::compile(name, schema))
                .transpose()?;

            let template = interactive_template_name(name);
            engine.add(&template, &application.command_template)?;
            let properties = schema.as_ref().map_or(&[][..], |s| s.properties.as_slice());
            engine.verify_quoting(&template, properties)?;

            trace!("Registered interactive application '{name}'.");
            interactive.insert(
                name.clone(),
                InteractiveApplication {
                    name: name.clone(),
                    job_application: application.job_application.clone(),
                    description: application.description.clone(),
                    timeout: application.timeout,
                    schema,
                },
            );
        }

        debug!(
            "Application registry holds {} application(s) and {} interactive application(s).",
            applications.len(),
            interactive.len()
        );

        Ok(ApplicationRegistry {
            engine,
            applications,
            interactive,
        })
    }

    pub fn get(&self, name: &str) -> Result<&Application, Error> {
        self.applications
            .get(name)
            .ok_or_else(|| Error::ApplicationNotFound(name.to_string()))
    }

    pub fn get_interactive(&self, name: &str) -> Result<&InteractiveApplication, Error> {
        self.interactive
            .get(name)
            .ok_or_else(|| Error::InteractiveApplicationNotFound(name.to_string()))
    }

    pub fn applications(&self) -> impl Iterator<Item = &Application> {
        self.applications.values()
    }

    pub fn interactive_applications(&self) -> impl Iterator<Item = &InteractiveApplication> {
        self.interactive.values()
    }

    /// Run the submission-time checks for one application and render its
    /// command.
    ///
    /// Checks run in order: roles, required uploads, schema validation.
    /// No job may be recorded when any of them fails.
    pub fn prepare_command(
        &self,
        application: &str,
        principal: &Principal,
        upload_dir: &Path,
        parameters: &Value,
    ) -> Result<String, Error> {
        let app = self.get(application)?;
        app.check_roles(principal)?;
        app.check_uploads(upload_dir)?;
        let values = app.validate_input(parameters)?;
        self.engine.render(&template_name(application), &values)
    }

    /// Render an interactive application's command from validated values.
    pub fn render_interactive(
        &self,
        application: &str,
        values: &HashMap<String, String>,
    ) -> Result<String, Error> {
        self.engine
            .render(&interactive_template_name(application), values)
    }
}
