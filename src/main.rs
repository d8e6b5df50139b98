// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;
mod output;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::EnvFilter, fmt};

use cli::{Cli, OutputFormat};
use knut_auth::{LoginFlow, OAuthConfig, TokenProvider};
use knut_config::PermissionMode;
use knut_core::{ConversationLoop, Handler, LoopConfig, Session, SessionStore, TurnStatus};
use knut_hooks::HookRunner;
use knut_mcp::{McpManager, SubscriptionStore};
use knut_model::ApiClient;
use knut_tools::{
    DenyAllHandler, PermissionGate, PermissionHandler, PermissionPrompt, PermissionReply,
    ToolRegistry,
};
use output::{JsonCollector, StreamJsonHandler, TextHandler};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            let auth_missing = e.chain().any(|c| {
                let text = c.to_string();
                text.contains("no credentials configured")
                    || text.contains("authentication not configured")
            });
            if auth_missing {
                match knut_auth::third_party_provider() {
                    Some(provider) => {
                        eprintln!("note: {provider} is declared via the environment; check that provider's credential chain")
                    }
                    None => eprintln!("note: run `knut --login` to authenticate"),
                }
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let mut cli = Cli::parse();
    init_logging(cli.verbose);

    // Process-level TLS provider for every reqwest client in the host.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config_dir = knut_config::config_dir();

    if cli.login {
        let oauth = OAuthConfig::from_env()?;
        LoginFlow::new(oauth)
            .run(&config_dir)
            .await
            .context("login failed")?;
        return Ok(());
    }

    let cwd = std::env::current_dir()?;
    let bundle = knut_config::load_settings(&config_dir, &cwd);
    for (key, value) in &bundle.settings.env {
        std::env::set_var(key, value);
    }

    let prompt = cli.gather_prompt();
    let print_mode = cli.is_print_mode();

    // Model client over the token provider.
    let oauth = OAuthConfig::from_env()?;
    let tokens = Arc::new(TokenProvider::new(config_dir.clone(), oauth));
    let model_name = cli
        .model
        .clone()
        .or_else(|| bundle.settings.model.clone())
        .unwrap_or_else(|| "claude-sonnet-4-5".to_string());
    let max_output_tokens = cli
        .max_tokens
        .or(bundle.settings.max_output_tokens)
        .unwrap_or(8192);
    let model = Arc::new(ApiClient::new(
        model_name.clone(),
        bundle.settings.api_base_url.clone(),
        tokens,
    ));

    // Tool registry, populated from configured MCP servers.
    let shutdown = CancellationToken::new();
    let mut registry = ToolRegistry::new();
    let mcp = McpManager::start(
        knut_config::load_mcp_servers(&cwd),
        &mut registry,
        &shutdown,
    )
    .await;
    let registry = Arc::new(RwLock::new(registry));
    let subscriptions = Arc::new(SubscriptionStore::new());

    // Permission gate: print mode has no terminal to ask on, so anything
    // the engine does not allow outright is denied there.
    let mode = if cli.dangerously_skip_permissions {
        PermissionMode::BypassPermissions
    } else {
        PermissionMode::Default
    };
    let permission_handler: Arc<dyn PermissionHandler> = if print_mode {
        Arc::new(DenyAllHandler)
    } else {
        Arc::new(TtyPermissionHandler)
    };
    let gate = Arc::new(PermissionGate::new(
        bundle.rules.clone(),
        mode,
        cli.dangerously_skip_permissions,
        permission_handler,
    ));

    let hooks = Arc::new(HookRunner::new(bundle.settings.hooks.clone()));

    let store = SessionStore::new(&config_dir);
    let session = if let Some(id) = &cli.resume {
        store
            .load(id)
            .with_context(|| format!("cannot resume session {id}"))?
    } else if cli.continue_last {
        store
            .most_recent()
            .unwrap_or_else(|| Session::new(&model_name, &cwd))
    } else {
        Session::new(&model_name, &cwd)
    };

    let skills = knut_config::skills::load_skills(&config_dir, &cwd);
    let instructions = knut_config::imports::load_project_instructions(&cwd);
    let system = knut_core::prompts::system_blocks(&skills, instructions.as_deref());

    let config = LoopConfig {
        max_output_tokens,
        ..Default::default()
    };

    let result = if print_mode {
        let prompt = prompt.context("no prompt given (pass one as arguments or on stdin)")?;
        run_print(
            cli.output_format,
            session,
            store,
            model,
            registry,
            hooks,
            gate,
            system,
            config,
            &prompt,
        )
        .await
    } else {
        run_interactive(
            session, store, model, registry, hooks, gate, system, config, prompt,
        )
        .await
    };

    subscriptions.shutdown();
    mcp.shutdown().await;
    shutdown.cancel();
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_print(
    format: OutputFormat,
    session: Session,
    store: SessionStore,
    model: Arc<knut_model::ApiClient>,
    registry: Arc<RwLock<ToolRegistry>>,
    hooks: Arc<HookRunner>,
    gate: Arc<PermissionGate>,
    system: Vec<String>,
    config: LoopConfig,
    prompt: &str,
) -> anyhow::Result<()> {
    let collector = Arc::new(JsonCollector::new());
    let handler: Arc<dyn Handler> = match format {
        OutputFormat::Text => Arc::new(TextHandler),
        OutputFormat::StreamJson => Arc::new(StreamJsonHandler),
        OutputFormat::Json => Arc::clone(&collector) as Arc<dyn Handler>,
    };

    let mut agent = ConversationLoop::new(
        session,
        Some(store),
        model,
        registry,
        hooks,
        gate,
        handler,
        system,
        config,
    );

    install_interrupt(agent.cancel_token());
    let outcome = agent.run_turn(prompt).await?;

    if format == OutputFormat::Json {
        let status = match outcome.status {
            TurnStatus::Complete => "complete",
            TurnStatus::Cancelled => "cancelled",
        };
        println!("{}", collector.finish(status, &outcome.usage));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_interactive(
    session: Session,
    store: SessionStore,
    model: Arc<knut_model::ApiClient>,
    registry: Arc<RwLock<ToolRegistry>>,
    hooks: Arc<HookRunner>,
    gate: Arc<PermissionGate>,
    system: Vec<String>,
    config: LoopConfig,
    initial_prompt: Option<String>,
) -> anyhow::Result<()> {
    let handler: Arc<dyn Handler> = Arc::new(TextHandler);
    let mut agent = ConversationLoop::new(
        session,
        Some(store),
        model,
        registry,
        hooks,
        Arc::clone(&gate),
        handler,
        system,
        config,
    );

    eprintln!(
        "knut {} — session {} (ctrl-c interrupts, /mode cycles permissions, /quit exits)",
        env!("CARGO_PKG_VERSION"),
        agent.session().id
    );

    let mut pending = initial_prompt;
    loop {
        let line = match pending.take() {
            Some(p) => p,
            None => match read_line("> ").await {
                Some(line) => line,
                None => break,
            },
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        match line.as_str() {
            "/quit" | "/exit" => break,
            "/mode" => {
                eprintln!("permission mode: {}", gate.cycle_mode());
                continue;
            }
            _ => {}
        }

        let token = agent.reset_cancel();
        let interrupt = install_interrupt(token);
        let result = agent.run_turn(&line).await;
        interrupt.abort();

        match result {
            Ok(outcome) => {
                if outcome.status == TurnStatus::Cancelled {
                    eprintln!("(interrupted)");
                }
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => eprintln!("error: {e}"),
        }
    }
    Ok(())
}

/// Cancel `token` on the next ctrl-c.
fn install_interrupt(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    })
}

async fn read_line(prompt: &str) -> Option<String> {
    use std::io::Write;
    eprint!("{prompt}");
    let _ = std::io::stderr().flush();
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(line),
            Err(_) => None,
        }
    })
    .await
    .ok()
    .flatten()
}

/// Interactive permission prompt on the controlling terminal.
struct TtyPermissionHandler;

#[async_trait]
impl PermissionHandler for TtyPermissionHandler {
    async fn request(&self, prompt: PermissionPrompt<'_>) -> PermissionReply {
        eprintln!(
            "\npermission required: {} {}",
            prompt.tool_name,
            serde_json::to_string(prompt.input).unwrap_or_default()
        );
        if let Some(message) = prompt.message {
            eprintln!("  note: {message}");
        }
        for (i, suggestion) in prompt.suggestions.iter().enumerate() {
            eprintln!("  [{}] allow {suggestion} for this session", i + 2);
        }
        let suggestions: Vec<String> = prompt.suggestions.to_vec();

        let line = read_line("allow? [y/N/number] ").await.unwrap_or_default();
        let line = line.trim();
        if line.eq_ignore_ascii_case("y") || line.eq_ignore_ascii_case("yes") {
            return PermissionReply::Allow;
        }
        if let Ok(n) = line.parse::<usize>() {
            if n >= 2 {
                if let Some(rule) = suggestions.get(n - 2) {
                    return PermissionReply::AllowWithRule(rule.clone());
                }
            }
        }
        PermissionReply::Deny
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
