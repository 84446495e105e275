//! Entry point for the `tether-askpass` helper.
//!
//! Every failure path exits non-zero without printing a secret, so git and
//! ssh treat an unreachable daemon the same as a denial.

use std::io::{Read, Write};
use std::process::ExitCode;

use tether_askpass::prompt::{classify_askpass, credential_from_description, parse_credential_description};
use tether_askpass::{AuthClient, ClientError};
use tether_core::protocol::{CredentialField, Decision, Prompt};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match credential_action(&args) {
        Some(action) => run_credential_helper(action),
        None => run_askpass(&args.join(" ")),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("tether-askpass: {err}");
            ExitCode::FAILURE
        }
    }
}

/// `get` / `store` / `erase`, optionally preceded by `credential`.
fn credential_action(args: &[String]) -> Option<&str> {
    let mut iter = args.iter().map(String::as_str);
    let first = iter.next()?;
    let action = if first == "credential" { iter.next()? } else { first };
    matches!(action, "get" | "store" | "erase").then_some(action)
}

fn context() -> Option<String> {
    std::env::current_dir()
        .ok()
        .map(|dir| dir.to_string_lossy().into_owned())
}

fn run_askpass(text: &str) -> Result<ExitCode, ClientError> {
    let prompt = classify_askpass(text);
    let client = AuthClient::from_env()?;
    let decision = client.request(&prompt, context())?;

    let mut out = std::io::stdout().lock();
    match &prompt {
        Prompt::HostKeyTrust(_) => {
            let answer = if decision.is_allow() { "yes" } else { "no" };
            writeln!(out, "{answer}")?;
            Ok(if decision.is_allow() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Prompt::Credential(cred) => {
            if !decision.is_allow() {
                return Ok(ExitCode::FAILURE);
            }
            let value = match cred.field {
                CredentialField::Username => decision.username.unwrap_or_default(),
                CredentialField::Password | CredentialField::Both => {
                    decision.password.unwrap_or_default()
                }
            };
            writeln!(out, "{value}")?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_credential_helper(action: &str) -> Result<ExitCode, ClientError> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;

    // Nothing is persisted on this side.
    if action != "get" {
        return Ok(ExitCode::SUCCESS);
    }

    let attrs = parse_credential_description(&input);
    let prompt = credential_from_description(&attrs);
    let client = AuthClient::from_env()?;
    let decision: Decision = client.request(&prompt, context())?;
    if !decision.is_allow() {
        return Ok(ExitCode::FAILURE);
    }

    let mut out = std::io::stdout().lock();
    let username = decision
        .username
        .or_else(|| attrs.get("username").cloned());
    if let Some(username) = username {
        writeln!(out, "username={username}")?;
    }
    if let Some(password) = decision.password {
        writeln!(out, "password={password}")?;
    }
    Ok(ExitCode::SUCCESS)
}
