//! Operator confirmation gates.
//!
//! Every phase, every post-failure decision, and the prerequisite go/no-go pass
//! through a `ConfirmationGate`. Nothing proceeds until `confirm` resolves.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dialoguer::{Confirm, theme::ColorfulTheme};

#[async_trait]
pub trait ConfirmationGate: Send + Sync {
    /// Ask a yes/no question. Blocks the pipeline until answered.
    async fn confirm(&self, prompt: &str, default: bool) -> Result<bool>;

    /// Short label for logs and the report ("interactive", "auto-approve").
    fn mode(&self) -> &'static str;
}

/// Prompts on the controlling terminal.
#[derive(Debug, Default)]
pub struct InteractiveGate;

#[async_trait]
impl ConfirmationGate for InteractiveGate {
    async fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
        let prompt = prompt.to_string();
        // dialoguer blocks on terminal input; keep it off the async worker.
        let answer = tokio::task::spawn_blocking(move || {
            Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(prompt)
                .default(default)
                .interact()
        })
        .await
        .context("Confirmation prompt task panicked")?
        .context("Failed to read operator answer (use --yes for unattended runs)")?;
        tracing::info!(answer, "operator answered");
        Ok(answer)
    }

    fn mode(&self) -> &'static str {
        "interactive"
    }
}

/// Resolves every gate to its default answer without blocking.
#[derive(Debug, Default)]
pub struct AutoApproveGate;

#[async_trait]
impl ConfirmationGate for AutoApproveGate {
    async fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
        println!(
            "  {} {} -> {}",
            console::style("Auto-answered").dim(),
            prompt,
            if default { "yes" } else { "no" }
        );
        tracing::info!(prompt, answer = default, "auto-approve gate");
        Ok(default)
    }

    fn mode(&self) -> &'static str {
        "auto-approve"
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_auto_approve_returns_default_answer() {
        let gate = AutoApproveGate;
        assert!(gate.confirm("Run phase database?", true).await.unwrap());
        assert!(!gate.confirm("Continue anyway?", false).await.unwrap());
        assert_eq!(gate.mode(), "auto-approve");
    }

    #[tokio::test]
    async fn test_scripted_gate_matches_first_rule() {
        let gate = stub::ScriptedGate::always(true).answer("frontend", false);
        assert!(!gate.confirm("Run phase frontend?", true).await.unwrap());
        assert!(gate.confirm("Run phase api?", true).await.unwrap());
        assert_eq!(gate.prompts().len(), 2);
    }
}
