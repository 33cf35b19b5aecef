// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Status-file handshake.
//!
//! A wrapped container replaces its command with a shell loop that waits
//! for [`STATUS_PATH`] and exits with the code written there. The
//! controller runs the real command later and writes the sentinel when
//! it is done.

use k8s_openapi::api::core::v1::{Container, EnvVar};
use kubejob_wire::{status_code, AGENT_TOKEN_ENV, STATUS_PATH};

/// Agent process launched in front of the wait loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AgentLaunch {
    pub path: String,
    pub port: u16,
    pub token: String,
}

fn wait_script() -> String {
    format!("while [ ! -f {STATUS_PATH} ]\ndo\n    sleep 1;\ndone\n\nexit $(cat {STATUS_PATH})\n")
}

/// Replace the container's command with the wait loop.
///
/// Returns the original command followed by its args.
pub(crate) fn wrap_container(container: &mut Container, agent: Option<&AgentLaunch>) -> Vec<String> {
    let mut original = container.command.take().unwrap_or_default();
    original.extend(container.args.take().unwrap_or_default());

    let mut script = String::new();
    if let Some(agent) = agent {
        script.push_str(&format!(
            "{} serve --listen 0.0.0.0:{} --status-path {STATUS_PATH} &\n",
            shell_quote(&agent.path),
            agent.port,
        ));
        container.env.get_or_insert_with(Vec::new).push(EnvVar {
            name: AGENT_TOKEN_ENV.to_string(),
            value: Some(agent.token.clone()),
            ..EnvVar::default()
        });
    }
    script.push_str(&wait_script());

    container.command = Some(vec!["sh".to_string(), "-c".to_string()]);
    container.args = Some(vec![script]);
    original
}

/// Whether `container` runs the wait loop
pub(crate) fn is_wrapped(container: &Container) -> bool {
    container.args.iter().flatten().any(|arg| arg.contains(&wait_script()))
}

/// Command that writes `exit_code` to the sentinel atomically
pub(crate) fn status_command(exit_code: i32) -> Vec<String> {
    let code = status_code(exit_code);
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("echo {code} > {STATUS_PATH}.tmp && mv {STATUS_PATH}.tmp {STATUS_PATH}"),
    ]
}

/// Exit code carried by a [`status_command`], if `command` is one
#[cfg(any(test, feature = "test-support"))]
pub(crate) fn parse_status_command(command: &[String]) -> Option<i32> {
    let [shell, flag, script] = command else {
        return None;
    };
    if shell != "sh" || flag != "-c" {
        return None;
    }
    let rest = script.strip_prefix("echo ")?;
    let (code, tail) = rest.split_once(' ')?;
    if tail != format!("> {STATUS_PATH}.tmp && mv {STATUS_PATH}.tmp {STATUS_PATH}") {
        return None;
    }
    code.parse().ok()
}

/// Turn a container command into the argv executed remotely.
///
/// Commands already of the form `sh -c …` or `bash -c …` run as given;
/// anything else is joined with spaces and handed to `sh -c`.
pub(crate) fn shell_argv(command: &[String]) -> Vec<String> {
    if let [shell, flag, ..] = command {
        if (shell == "sh" || shell == "bash") && flag == "-c" {
            return command.to_vec();
        }
    }
    vec!["sh".to_string(), "-c".to_string(), command.join(" ")]
}

/// Single-quote `value` for a POSIX shell
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
#[path = "handshake_tests.rs"]
mod tests;
