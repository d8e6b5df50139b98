// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::io::IsTerminal;

use clap::{Parser, ValueEnum};

/// Output format for print-mode runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text (default).
    #[default]
    Text,
    /// A single JSON document summarizing the turn.
    Json,
    /// Newline-delimited JSON of each stream event.
    StreamJson,
}

#[derive(Parser, Debug)]
#[command(
    name = "knut",
    about = "A terminal coding-agent host",
    version,
    long_about = None,
)]
pub struct Cli {
    /// Initial prompt; multiple words are joined with spaces.
    #[arg(value_name = "PROMPT")]
    pub prompt: Vec<String>,

    /// Model to use, e.g. "claude-sonnet-4-5"
    #[arg(long)]
    pub model: Option<String>,

    /// Print mode: run one turn, write the result, exit.
    #[arg(long = "print", short = 'p')]
    pub print: bool,

    /// Continue the most recent session.
    #[arg(long = "continue", short = 'c')]
    pub continue_last: bool,

    /// Resume the session with the given id.
    #[arg(long = "resume", short = 'r', value_name = "ID")]
    pub resume: Option<String>,

    /// Maximum output tokens per completion.
    #[arg(long, value_name = "N")]
    pub max_tokens: Option<u32>,

    /// Run the OAuth login flow and exit.
    #[arg(long)]
    pub login: bool,

    /// Allow every tool call without prompting.  Dangerous.
    #[arg(long)]
    pub dangerously_skip_permissions: bool,

    /// Output format for print mode.
    #[arg(long, value_enum, default_value = "text")]
    pub output_format: OutputFormat,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// The prompt assembled from positional words plus piped stdin content.
    ///
    /// When stdin is not a TTY its content is read fully and concatenated
    /// after the CLI prompt, and print mode is forced on.
    pub fn gather_prompt(&mut self) -> Option<String> {
        let mut parts = Vec::new();
        if !self.prompt.is_empty() {
            parts.push(self.prompt.join(" "));
        }
        if !std::io::stdin().is_terminal() {
            use std::io::Read;
            let mut piped = String::new();
            if std::io::stdin().read_to_string(&mut piped).is_ok() && !piped.trim().is_empty() {
                parts.push(piped.trim_end().to_string());
            }
            self.print = true;
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    /// Print mode is explicit (`-p`) or forced by piped stdin/stdout.
    pub fn is_print_mode(&self) -> bool {
        self.print || !std::io::stdin().is_terminal() || !std::io::stdout().is_terminal()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
