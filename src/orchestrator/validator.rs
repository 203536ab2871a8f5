//! Structural validation of task deliverables with a bounded retry budget.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, info_span, Instrument};

use crate::models::validation::{OutputSchema, ValidatedOutput, ValidationResult};
use crate::{AppError, Result};

use super::auto_assign::{AutoAssignService, FailureDisposition};

/// Outcome of submitting a deliverable for a held task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    /// The task is `done`.
    Accepted {
        /// The stored deliverable.
        output: ValidatedOutput,
    },
    /// The deliverable was rejected; the agent may try again.
    Rejected {
        /// Validation errors in evaluation order.
        errors: Vec<String>,
        /// Failures recorded so far.
        retry_count: u32,
        /// Failures still allowed before the task is blocked.
        remaining: u32,
    },
    /// The deliverable was rejected and the retry budget is spent.
    Blocked {
        /// Validation errors in evaluation order.
        errors: Vec<String>,
    },
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.as_f64().is_some_and(|f| f.fract() != 0.0) => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Check `output` against `schema`.
///
/// Errors are reported in a fixed order: size, root type, missing required
/// fields (declared order), property types (key order), unexpected fields.
/// A size or root-type failure stops evaluation.
#[must_use]
pub fn validate(schema: &OutputSchema, output: &Value, default_max_bytes: usize) -> ValidationResult {
    let max_bytes = schema.max_bytes.unwrap_or(default_max_bytes);
    let size = serde_json::to_vec(output).map_or(usize::MAX, |bytes| bytes.len());
    if size > max_bytes {
        return ValidationResult::failed(vec![format!(
            "output is {size} bytes, exceeding the {max_bytes}-byte limit"
        )]);
    }

    let declares_fields = !schema.required.is_empty() || !schema.properties.is_empty();
    let Some(object) = output.as_object() else {
        if declares_fields {
            return ValidationResult::failed(vec![format!(
                "output must be a JSON object, got {}",
                json_kind(output)
            )]);
        }
        return ValidationResult::ok(Some(output.clone()));
    };

    let mut errors = Vec::new();
    for field in &schema.required {
        if !object.contains_key(field) {
            errors.push(format!("missing required field `{field}`"));
        }
    }
    for (name, spec) in &schema.properties {
        if let Some(value) = object.get(name) {
            if !spec.kind.accepts(value) {
                errors.push(format!(
                    "field `{name}` must be {}, got {}",
                    spec.kind,
                    json_kind(value)
                ));
            }
        }
    }
    if !schema.allow_additional {
        let mut unexpected: Vec<&String> = object
            .keys()
            .filter(|key| !schema.properties.contains_key(*key))
            .collect();
        unexpected.sort();
        for key in unexpected {
            errors.push(format!("unexpected field `{key}`"));
        }
    }

    if errors.is_empty() {
        ValidationResult::ok(Some(output.clone()))
    } else {
        ValidationResult::failed(errors)
    }
}

/// Validates deliverables and drives the resulting task transitions.
pub struct TaskOutputValidator {
    assign: Arc<AutoAssignService>,
    max_output_bytes: usize,
}

impl TaskOutputValidator {
    /// Create a validator over the task queue.
    #[must_use]
    pub fn new(assign: Arc<AutoAssignService>, max_output_bytes: usize) -> Self {
        Self {
            assign,
            max_output_bytes,
        }
    }

    /// Validate without touching any task.
    #[must_use]
    pub fn check(&self, schema: &OutputSchema, output: &Value) -> ValidationResult {
        validate(schema, output, self.max_output_bytes)
    }

    /// Validate `output` for the task `session` holds and apply the result.
    ///
    /// Tasks without a declared schema accept any JSON value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown task,
    /// `AppError::InvalidTransition` if `session` does not hold it, or
    /// `AppError::Store` if the transition cannot be persisted.
    pub async fn submit(&self, task_id: &str, session: &str, output: &Value) -> Result<SubmissionOutcome> {
        let span = info_span!("submit_output", task_id, session);
        async {
            let task = self
                .assign
                .get(task_id)
                .await
                .ok_or_else(|| AppError::NotFound(format!("task {task_id} not found")))?;
            if !task.is_held_by(session) {
                return Err(AppError::InvalidTransition(format!(
                    "task {task_id} is not held by {session}"
                )));
            }

            let result = match &task.output_schema {
                Some(schema) => self.check(schema, output),
                None => ValidationResult::ok(Some(output.clone())),
            };
            if result.valid {
                return self.accept(task_id, session, result.data).await;
            }

            self.reject(task_id, result.errors).await
        }
        .instrument(span)
        .await
    }

    /// Count a failed attempt for a task without validating anything.
    ///
    /// Used when the deliverable cannot be read at all.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown task,
    /// `AppError::InvalidTransition` if it is not in progress, or
    /// `AppError::Store` if the transition cannot be persisted.
    pub async fn reject(&self, task_id: &str, errors: Vec<String>) -> Result<SubmissionOutcome> {
        match self
            .assign
            .record_validation_failure(task_id, errors.clone())
            .await?
        {
            FailureDisposition::Retry {
                retry_count,
                remaining,
            } => {
                info!(task_id, retry_count, remaining, "output rejected");
                Ok(SubmissionOutcome::Rejected {
                    errors,
                    retry_count,
                    remaining,
                })
            }
            FailureDisposition::Blocked => {
                info!(task_id, "output rejected; task blocked");
                Ok(SubmissionOutcome::Blocked { errors })
            }
        }
    }

    /// Complete a held task with already-validated data.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if `session` does not hold the
    /// task, or `AppError::Store` if the transition cannot be persisted.
    pub async fn accept(&self, task_id: &str, session: &str, data: Option<Value>) -> Result<SubmissionOutcome> {
        let output = ValidatedOutput {
            data,
            produced_at: Utc::now(),
            session_name: session.to_owned(),
        };
        self.assign.complete(task_id, session, output.clone()).await?;
        info!(task_id, session, "output accepted");
        Ok(SubmissionOutcome::Accepted { output })
    }
}
