//! Ordered, named record steps with short-circuit and failure attribution.
//!
//! A step maps the current document to the next one, or to `None` when the
//! document cannot go further. A required step returning `None` rejects the
//! document; an optional one leaves it unchanged. Errors stop the pipeline
//! and carry the step name.

use std::fmt;

/// A step raised an error instead of producing a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepError {
    pub message: String,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for StepError {}

pub type StepResult<T> = Result<Option<T>, StepError>;

type StepFn<T, C> = Box<dyn Fn(&T, &C) -> StepResult<T> + Send + Sync>;

struct Step<T, C> {
    name: String,
    optional: bool,
    enabled: bool,
    run: StepFn<T, C>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome<T> {
    Completed(T),
    /// A required step returned `None`.
    Rejected { step: String },
    Failed { step: String, error: StepError },
}

impl<T> PipelineOutcome<T> {
    /// Step responsible for a rejection or failure.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::Completed(_) => None,
            Self::Rejected { step } | Self::Failed { step, .. } => Some(step),
        }
    }
}

pub struct Pipeline<T, C> {
    steps: Vec<Step<T, C>>,
}

impl<T, C> Default for Pipeline<T, C> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<T, C> Pipeline<T, C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a required step.
    pub fn step<F>(self, name: &str, f: F) -> Self
    where
        F: Fn(&T, &C) -> StepResult<T> + Send + Sync + 'static,
    {
        self.push(name, false, f)
    }

    /// Append a step whose `None` keeps the previous document.
    pub fn optional_step<F>(self, name: &str, f: F) -> Self
    where
        F: Fn(&T, &C) -> StepResult<T> + Send + Sync + 'static,
    {
        self.push(name, true, f)
    }

    fn push<F>(mut self, name: &str, optional: bool, f: F) -> Self
    where
        F: Fn(&T, &C) -> StepResult<T> + Send + Sync + 'static,
    {
        self.steps.push(Step {
            name: name.to_string(),
            optional,
            enabled: true,
            run: Box::new(f),
        });
        self
    }

    /// Enable or disable a step by name. Returns false if no such step exists.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.steps.iter_mut().find(|s| s.name == name) {
            Some(step) => {
                step.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Names of the steps that will run, in order.
    pub fn enabled_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.name.as_str())
            .collect()
    }

    pub fn run(&self, input: T, ctx: &C) -> PipelineOutcome<T> {
        let mut current = input;
        for step in self.steps.iter().filter(|s| s.enabled) {
            match (step.run)(&current, ctx) {
                Ok(Some(next)) => current = next,
                Ok(None) if step.optional => {}
                Ok(None) => {
                    return PipelineOutcome::Rejected {
                        step: step.name.clone(),
                    }
                }
                Err(error) => {
                    return PipelineOutcome::Failed {
                        step: step.name.clone(),
                        error,
                    }
                }
            }
        }
        PipelineOutcome::Completed(current)
    }
}
