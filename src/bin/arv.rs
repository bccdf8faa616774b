//! Agent-side CLI: a pure REST client over the orchestrator API.
//!
//! Environment: `ARV_BASE` (API root, default `$ARV_HOST` or
//! `http://localhost:3000`), `ARV_KEY` (agent access token), `ARV_MODEL`
//! (claimed model id). Exit codes: 0 success, 1 client error, 2 server
//! error, 3 unauthenticated, 4 conflict.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};

#[derive(Parser)]
#[command(name = "arv", about = "Review-orchestrator client for reviewer agents", version)]
struct Cli {
    /// API root; overrides $ARV_BASE / $ARV_HOST.
    #[arg(long, global = true)]
    base: Option<String>,

    /// Agent access key; overrides $ARV_KEY.
    #[arg(long, global = true)]
    key: Option<String>,

    /// Claimed model id; overrides $ARV_MODEL.
    #[arg(long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List sessions.
    Sessions,
    /// Create a review session.
    Create {
        #[arg(long)]
        repo: String,
        #[arg(long, default_value = "main")]
        base_rev: String,
        #[arg(long)]
        head: String,
        #[arg(long = "preset")]
        presets: Vec<String>,
    },
    /// Start collecting and reviewing.
    Start { session_id: String },
    /// Bind the "current" alias to a session.
    Activate { session_id: String },
    /// Finish the session (409 when fix-required issues remain).
    Finish {
        session_id: String,
        #[arg(long)]
        force: bool,
    },
    /// Advance the deliberation turn.
    Process { session_id: String },
    /// Record a fix commit and enter verification.
    FixComplete {
        session_id: String,
        #[arg(long)]
        commit: String,
        #[arg(long = "issue")]
        issues: Vec<String>,
    },
    /// Delete a session.
    Delete { session_id: String },
    /// Session status rollup.
    Status { session_id: String },
    /// Full issues snapshot.
    Issues { session_id: String },
    /// Context index (changed files and stats).
    Index { session_id: String },
    /// Unified diff for one file.
    Diff { session_id: String, path: String },
    /// Line-range read of a file at head.
    File {
        session_id: String,
        path: String,
        #[arg(long)]
        start: Option<u32>,
        #[arg(long)]
        end: Option<u32>,
    },
    /// Delta context for verification.
    Delta { session_id: String },
    /// Issues awaiting your opinion.
    Pending { session_id: String },
    /// Report one issue (buffered until `summary`).
    Report {
        session_id: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "medium")]
        severity: String,
        #[arg(long)]
        file: String,
        #[arg(long)]
        line_start: Option<u32>,
        #[arg(long)]
        line_end: Option<u32>,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "")]
        suggestion: String,
    },
    /// Finalize your review round with a summary.
    Summary {
        session_id: String,
        #[arg(long, default_value = "")]
        text: String,
    },
    /// Fetch an issue's opinion thread.
    Thread { issue_id: String },
    /// Submit an opinion on an issue.
    Opinion {
        issue_id: String,
        #[arg(long)]
        action: String,
        #[arg(long)]
        reasoning: String,
        #[arg(long)]
        severity: Option<String>,
        #[arg(long)]
        confidence: Option<f64>,
    },
    /// Respond to a fix as the raiser: accept, dispute, or partial.
    Respond {
        issue_id: String,
        #[arg(long)]
        action: String,
        #[arg(long, default_value = "")]
        reasoning: String,
    },
    /// Set author progress on an issue (fixed / wont_fix).
    SetStatus {
        issue_id: String,
        #[arg(long)]
        status: String,
        #[arg(long, default_value = "")]
        reasoning: String,
    },
    /// Dismiss a fix-required issue during fixing.
    Dismiss {
        issue_id: String,
        #[arg(long, default_value = "")]
        reasoning: String,
    },
    /// Record an activity event (file read, search, tool call).
    Activity {
        session_id: String,
        #[arg(long)]
        action: String,
        #[arg(long)]
        target: String,
    },
}

struct ApiClient {
    base: String,
    key: Option<String>,
    model: Option<String>,
    http: reqwest::Client,
}

impl ApiClient {
    fn from_cli(cli: &Cli) -> Self {
        let base = cli
            .base
            .clone()
            .or_else(|| std::env::var("ARV_BASE").ok())
            .or_else(|| std::env::var("ARV_HOST").ok())
            .unwrap_or_else(|| "http://localhost:3000".to_string());
        Self {
            base: base.trim_end_matches('/').to_string(),
            key: cli.key.clone().or_else(|| std::env::var("ARV_KEY").ok()),
            model: cli.model.clone().or_else(|| std::env::var("ARV_MODEL").ok()),
            http: reqwest::Client::new(),
        }
    }

    fn model_id(&self) -> Result<String, String> {
        self.model
            .clone()
            .ok_or_else(|| "model id required: set $ARV_MODEL or pass --model".to_string())
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, Value), String> {
        let url = format!("{}{}", self.base, path);
        let mut request = self.http.request(method, &url);
        if let Some(key) = &self.key {
            request = request.header("X-Agent-Key", key);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        let text = response.text().await.map_err(|e| e.to_string())?;
        let value = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok((status, value))
    }
}

fn exit_code_for(status: StatusCode) -> ExitCode {
    if status.is_success() {
        ExitCode::SUCCESS
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ExitCode::from(3)
    } else if status == StatusCode::CONFLICT {
        ExitCode::from(4)
    } else if status.is_server_error() {
        ExitCode::from(2)
    } else {
        ExitCode::from(1)
    }
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let client = ApiClient::from_cli(&cli);

    let result = run(&client, &cli.command).await;
    match result {
        Ok((status, body)) => {
            print_json(&body);
            exit_code_for(status)
        }
        Err(message) => {
            eprintln!("error: {}", message);
            ExitCode::from(2)
        }
    }
}

async fn run(client: &ApiClient, command: &Commands) -> Result<(StatusCode, Value), String> {
    match command {
        Commands::Sessions => client.send(Method::GET, "/api/sessions", None).await,
        Commands::Create {
            repo,
            base_rev,
            head,
            presets,
        } => {
            let mut body = json!({
                "repo_path": repo,
                "base": base_rev,
                "head": head,
            });
            if !presets.is_empty() {
                body["preset_ids"] = json!(presets);
            }
            client.send(Method::POST, "/api/sessions", Some(body)).await
        }
        Commands::Start { session_id } => {
            client
                .send(Method::POST, &format!("/api/sessions/{}/start", session_id), None)
                .await
        }
        Commands::Activate { session_id } => {
            client
                .send(
                    Method::POST,
                    &format!("/api/sessions/{}/activate", session_id),
                    None,
                )
                .await
        }
        Commands::Finish { session_id, force } => {
            let path = if *force {
                format!("/api/sessions/{}/finish?force", session_id)
            } else {
                format!("/api/sessions/{}/finish", session_id)
            };
            client.send(Method::POST, &path, None).await
        }
        Commands::Process { session_id } => {
            client
                .send(
                    Method::POST,
                    &format!("/api/sessions/{}/process", session_id),
                    None,
                )
                .await
        }
        Commands::FixComplete {
            session_id,
            commit,
            issues,
        } => {
            let mut body = json!({"commit": commit});
            if !issues.is_empty() {
                body["issue_ids"] = json!(issues);
            }
            if let Ok(model) = client.model_id() {
                body["submitted_by"] = json!(model);
            }
            client
                .send(
                    Method::POST,
                    &format!("/api/sessions/{}/fix-complete", session_id),
                    Some(body),
                )
                .await
        }
        Commands::Delete { session_id } => {
            client
                .send(Method::DELETE, &format!("/api/sessions/{}", session_id), None)
                .await
        }
        Commands::Status { session_id } => {
            client
                .send(Method::GET, &format!("/api/sessions/{}/status", session_id), None)
                .await
        }
        Commands::Issues { session_id } => {
            client
                .send(Method::GET, &format!("/api/sessions/{}/issues", session_id), None)
                .await
        }
        Commands::Index { session_id } => {
            client
                .send(Method::GET, &format!("/api/sessions/{}/index", session_id), None)
                .await
        }
        Commands::Diff { session_id, path } => {
            client
                .send(
                    Method::GET,
                    &format!("/api/sessions/{}/diff/{}", session_id, path),
                    None,
                )
                .await
        }
        Commands::File {
            session_id,
            path,
            start,
            end,
        } => {
            let mut query = Vec::new();
            if let Some(start) = start {
                query.push(format!("start={}", start));
            }
            if let Some(end) = end {
                query.push(format!("end={}", end));
            }
            let suffix = if query.is_empty() {
                String::new()
            } else {
                format!("?{}", query.join("&"))
            };
            client
                .send(
                    Method::GET,
                    &format!("/api/sessions/{}/files/{}{}", session_id, path, suffix),
                    None,
                )
                .await
        }
        Commands::Delta { session_id } => {
            client
                .send(Method::GET, &format!("/api/sessions/{}/delta", session_id), None)
                .await
        }
        Commands::Pending { session_id } => {
            let model = client.model_id()?;
            client
                .send(
                    Method::GET,
                    &format!("/api/sessions/{}/pending?model_id={}", session_id, model),
                    None,
                )
                .await
        }
        Commands::Report {
            session_id,
            title,
            severity,
            file,
            line_start,
            line_end,
            description,
            suggestion,
        } => {
            let model = client.model_id()?;
            let body = json!({
                "model_id": model,
                "issue": {
                    "title": title,
                    "severity": severity,
                    "file": file,
                    "line_start": line_start,
                    "line_end": line_end,
                    "description": description,
                    "suggestion": suggestion,
                },
            });
            client
                .send(
                    Method::POST,
                    &format!("/api/sessions/{}/report", session_id),
                    Some(body),
                )
                .await
        }
        Commands::Summary { session_id, text } => {
            let model = client.model_id()?;
            let body = json!({"model_id": model, "summary": text});
            client
                .send(
                    Method::POST,
                    &format!("/api/sessions/{}/summary", session_id),
                    Some(body),
                )
                .await
        }
        Commands::Thread { issue_id } => {
            client
                .send(Method::GET, &format!("/api/issues/{}/thread", issue_id), None)
                .await
        }
        Commands::Opinion {
            issue_id,
            action,
            reasoning,
            severity,
            confidence,
        } => {
            let model = client.model_id()?;
            let mut body = json!({
                "model_id": model,
                "action": action,
                "reasoning": reasoning,
            });
            if let Some(severity) = severity {
                body["suggested_severity"] = json!(severity);
            }
            if let Some(confidence) = confidence {
                body["confidence"] = json!(confidence);
            }
            client
                .send(
                    Method::POST,
                    &format!("/api/issues/{}/opinions", issue_id),
                    Some(body),
                )
                .await
        }
        Commands::Respond {
            issue_id,
            action,
            reasoning,
        } => {
            let mut body = json!({"action": action, "reasoning": reasoning});
            if let Ok(model) = client.model_id() {
                body["model_id"] = json!(model);
            }
            client
                .send(
                    Method::POST,
                    &format!("/api/issues/{}/respond", issue_id),
                    Some(body),
                )
                .await
        }
        Commands::SetStatus {
            issue_id,
            status,
            reasoning,
        } => {
            let body = json!({"status": status, "reasoning": reasoning});
            client
                .send(
                    Method::POST,
                    &format!("/api/issues/{}/status", issue_id),
                    Some(body),
                )
                .await
        }
        Commands::Dismiss { issue_id, reasoning } => {
            let body = json!({"reasoning": reasoning});
            client
                .send(
                    Method::POST,
                    &format!("/api/issues/{}/dismiss", issue_id),
                    Some(body),
                )
                .await
        }
        Commands::Activity {
            session_id,
            action,
            target,
        } => {
            let model = client.model_id()?;
            let body = json!({"model_id": model, "action": action, "target": target});
            client
                .send(
                    Method::POST,
                    &format!("/api/sessions/{}/activity", session_id),
                    Some(body),
                )
                .await
        }
    }
}
