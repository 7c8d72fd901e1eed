//! Operator interaction
//!
//! Prompts are an explicit capability handed to the components that may ask
//! questions. A non-interactive run gets [`NonInteractive`], which refuses
//! every prompt so callers fail with a usage error instead of blocking.

use crate::error::{DebugError, Result};
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Select};
use std::io::IsTerminal;

/// One entry in a selection prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub label: String,
    pub detail: String,
}

impl Choice {
    pub fn new(label: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            detail: detail.into(),
        }
    }

    fn render(&self) -> String {
        if self.detail.is_empty() {
            self.label.clone()
        } else {
            format!("{:<28} {}", self.label, self.detail)
        }
    }
}

/// Ability to ask the operator questions
pub trait InteractionCapability: Send + Sync {
    /// Whether prompts can be shown at all
    fn is_interactive(&self) -> bool;

    /// Pick one of `choices`, returning its index
    fn choose(&self, title: &str, choices: &[Choice]) -> Result<usize>;

    /// Ask a yes/no question
    fn confirm(&self, prompt: &str) -> Result<bool>;
}

/// Refuses all prompts
#[derive(Debug, Clone, Copy, Default)]
pub struct NonInteractive;

impl InteractionCapability for NonInteractive {
    fn is_interactive(&self) -> bool {
        false
    }

    fn choose(&self, title: &str, _choices: &[Choice]) -> Result<usize> {
        Err(DebugError::InvalidArgument(format!(
            "cannot prompt '{}' in non-interactive mode",
            title
        )))
    }

    fn confirm(&self, prompt: &str) -> Result<bool> {
        Err(DebugError::InvalidArgument(format!(
            "cannot confirm '{}' in non-interactive mode",
            prompt
        )))
    }
}

/// Prompts on the controlling terminal
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompt;

impl TerminalPrompt {
    /// Terminal prompts when attached to a terminal, otherwise none
    pub fn detect() -> Box<dyn InteractionCapability> {
        if TerminalPrompt.is_interactive() {
            Box::new(TerminalPrompt)
        } else {
            Box::new(NonInteractive)
        }
    }
}

impl InteractionCapability for TerminalPrompt {
    fn is_interactive(&self) -> bool {
        std::io::stdin().is_terminal() && std::io::stderr().is_terminal()
    }

    fn choose(&self, title: &str, choices: &[Choice]) -> Result<usize> {
        let items: Vec<String> = choices.iter().map(Choice::render).collect();
        Select::with_theme(&ColorfulTheme::default())
            .with_prompt(title)
            .items(&items)
            .default(0)
            .interact_opt()
            .map_err(prompt_error)?
            .ok_or_else(|| DebugError::Cancelled("selection aborted".to_string()))
    }

    fn confirm(&self, prompt: &str) -> Result<bool> {
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .default(false)
            .interact()
            .map_err(prompt_error)
    }
}

fn prompt_error(err: dialoguer::Error) -> DebugError {
    DebugError::Io(std::io::Error::other(err.to_string()))
}
