//! Sandbox that runs configured commands per action kind.
//!
//! Each action kind maps to an argv template such as
//! `["systemctl", "restart", "{service}"]`. Placeholders are filled from the
//! step parameters and the program is spawned directly, never through a
//! shell, so parameter values cannot inject extra commands.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::debug;

use super::{Sandbox, SandboxError, SandboxOutput};
use crate::broker::ActionKind;

pub struct CommandSandbox {
    templates: BTreeMap<ActionKind, Vec<String>>,
}

impl CommandSandbox {
    /// Build from config, where keys are action kind names.
    pub fn new(templates: &BTreeMap<String, Vec<String>>) -> Result<Self> {
        let mut parsed = BTreeMap::new();
        for (name, argv) in templates {
            let kind: ActionKind = name.parse().map_err(anyhow::Error::msg)?;
            if argv.first().map_or(true, |p| p.trim().is_empty()) {
                bail!("sandbox template for '{kind}' has no program");
            }
            parsed.insert(kind, argv.clone());
        }
        Ok(Self { templates: parsed })
    }

    pub fn kinds(&self) -> impl Iterator<Item = ActionKind> + '_ {
        self.templates.keys().copied()
    }
}

/// Fill every `{name}` in `arg` from `params`.
fn render(arg: &str, params: &BTreeMap<String, String>) -> Result<String, SandboxError> {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| SandboxError::Rejected(format!("unterminated placeholder in '{arg}'")))?;
        let name = &after[..close];
        let value = params
            .get(name)
            .ok_or_else(|| SandboxError::Rejected(format!("missing parameter '{name}'")))?;
        out.push_str(value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[async_trait::async_trait]
impl Sandbox for CommandSandbox {
    async fn run(
        &self,
        kind: ActionKind,
        parameters: &BTreeMap<String, String>,
        _timeout: Duration,
    ) -> Result<SandboxOutput, SandboxError> {
        let template = self
            .templates
            .get(&kind)
            .ok_or_else(|| SandboxError::Rejected(format!("no command configured for '{kind}'")))?;
        let argv = template
            .iter()
            .map(|a| render(a, parameters))
            .collect::<Result<Vec<_>, _>>()?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SandboxError::Rejected(format!("empty command for '{kind}'")))?;

        debug!(action = %kind, program = %program, ?args, "running sandbox command");

        // The executor drops this future on timeout; kill_on_drop reaps the child.
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    SandboxError::Rejected(format!("cannot run '{program}': {e}"))
                }
                _ => SandboxError::Unavailable(format!("spawning '{program}': {e}")),
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            text.push_str(&stderr);
        }
        Ok(SandboxOutput {
            // Killed by a signal has no code.
            exit_status: output.status.code().unwrap_or(-1),
            output: text,
        })
    }
}
