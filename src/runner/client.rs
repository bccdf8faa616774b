//! Command construction per reviewer client kind. The runner owns the
//! subprocess; this module only decides what to exec.

use crate::error::{Result, ReviewError};
use crate::models::{AgentConfig, ClientKind};

/// A fully resolved subprocess invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Build the client invocation for one prompt. Reviewers are restricted to
/// the tools they need to call back into the API.
pub fn build_command(agent: &AgentConfig, prompt: &str) -> Result<ProcessSpec> {
    if prompt.is_empty() {
        return Err(ReviewError::Validation("empty prompt".into()));
    }
    let spec = match agent.client_kind {
        ClientKind::ClaudeCode => {
            let mut args = vec![
                "--print".to_string(),
                "--output-format".to_string(),
                "text".to_string(),
                "--allowedTools".to_string(),
                "Bash(curl:*) Bash(arv:*) Read".to_string(),
            ];
            if !agent.model_name.is_empty() {
                args.push("--model".to_string());
                args.push(agent.model_name.clone());
            }
            args.push("-p".to_string());
            args.push(prompt.to_string());
            ProcessSpec {
                program: "claude".to_string(),
                args,
            }
        }
        ClientKind::Codex => {
            let mut args = vec![
                "exec".to_string(),
                "--skip-git-repo-check".to_string(),
                "--full-auto".to_string(),
                "-c".to_string(),
                "sandbox_workspace_write.network_access=true".to_string(),
            ];
            if !agent.model_name.is_empty() {
                args.push("--model".to_string());
                args.push(agent.model_name.clone());
            }
            args.push(prompt.to_string());
            ProcessSpec {
                program: "codex".to_string(),
                args,
            }
        }
        ClientKind::Gemini => {
            let mut args = vec![
                "--approval-mode".to_string(),
                "yolo".to_string(),
                "--allowed-tools".to_string(),
                "run_shell_command(arv)".to_string(),
                "--allowed-tools".to_string(),
                "run_shell_command(curl)".to_string(),
            ];
            if !agent.model_name.is_empty() {
                args.push("--model".to_string());
                args.push(agent.model_name.clone());
            }
            args.push("-p".to_string());
            args.push(prompt.to_string());
            ProcessSpec {
                program: "gemini".to_string(),
                args,
            }
        }
        ClientKind::Opencode => {
            let mut args = vec!["run".to_string()];
            if !agent.provider.is_empty() && !agent.model_name.is_empty() {
                args.push("--model".to_string());
                args.push(format!("{}/{}", agent.provider, agent.model_name));
            }
            args.push(prompt.to_string());
            ProcessSpec {
                program: "opencode".to_string(),
                args,
            }
        }
    };
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(kind: ClientKind, model_name: &str) -> AgentConfig {
        AgentConfig {
            id: "m1".into(),
            client_kind: kind,
            model_name: model_name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_claude_command() {
        let spec = build_command(&agent(ClientKind::ClaudeCode, "claude-opus-4"), "hi").unwrap();
        assert_eq!(spec.program, "claude");
        assert!(spec.args.contains(&"--print".to_string()));
        assert!(spec.args.contains(&"claude-opus-4".to_string()));
        assert_eq!(spec.args.last().unwrap(), "hi");
    }

    #[test]
    fn test_claude_without_model_flag() {
        let spec = build_command(&agent(ClientKind::ClaudeCode, ""), "hi").unwrap();
        assert!(!spec.args.contains(&"--model".to_string()));
    }

    #[test]
    fn test_codex_command() {
        let spec = build_command(&agent(ClientKind::Codex, "o4"), "review this").unwrap();
        assert_eq!(spec.program, "codex");
        assert!(spec.args.contains(&"--full-auto".to_string()));
        assert!(spec.args.contains(&"--skip-git-repo-check".to_string()));
    }

    #[test]
    fn test_gemini_command() {
        let spec = build_command(&agent(ClientKind::Gemini, ""), "review").unwrap();
        assert_eq!(spec.program, "gemini");
        assert!(spec.args.contains(&"yolo".to_string()));
    }

    #[test]
    fn test_opencode_model_spec() {
        let mut a = agent(ClientKind::Opencode, "big-model");
        a.provider = "zai".into();
        let spec = build_command(&a, "go").unwrap();
        assert!(spec.args.contains(&"zai/big-model".to_string()));
    }

    #[test]
    fn test_empty_prompt_rejected() {
        assert!(build_command(&agent(ClientKind::ClaudeCode, ""), "").is_err());
    }
}
