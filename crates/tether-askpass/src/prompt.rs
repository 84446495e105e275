//! Turn raw prompt text from git and ssh into structured prompts.

use std::collections::BTreeMap;

use tether_core::protocol::{CredentialField, CredentialPrompt, HostKeyPrompt, Prompt};

/// Classify the single argument git or ssh passes to an askpass program.
pub fn classify_askpass(text: &str) -> Prompt {
    if let Some(host_key) = parse_host_key(text) {
        return Prompt::HostKeyTrust(host_key);
    }

    let trimmed = text.trim();
    if let Some(url) = quoted_after(trimmed, "Username for ") {
        return credential(url, None, CredentialField::Username, trimmed);
    }
    if let Some(url) = quoted_after(trimmed, "Password for ") {
        let username = userinfo(&url);
        return credential(url, username, CredentialField::Password, trimmed);
    }
    if let Some(key) = quoted_after(trimmed, "Enter passphrase for key ") {
        return credential(format!("ssh-key://{key}"), None, CredentialField::Password, trimmed);
    }
    // ssh password auth: "user@host's password: "
    if let Some(target) = trimmed.strip_suffix("'s password:") {
        let username = target.split_once('@').map(|(u, _)| u.to_string());
        return credential(
            format!("ssh://{target}"),
            username,
            CredentialField::Password,
            trimmed,
        );
    }

    let field = if trimmed.to_lowercase().contains("username") {
        CredentialField::Username
    } else {
        CredentialField::Password
    };
    credential("unknown".to_string(), None, field, trimmed)
}

fn credential(url: String, username: Option<String>, field: CredentialField, text: &str) -> Prompt {
    Prompt::Credential(CredentialPrompt {
        url,
        username,
        field,
        prompt: (!text.is_empty()).then(|| text.to_string()),
    })
}

/// ssh's first-contact confirmation.
fn parse_host_key(text: &str) -> Option<HostKeyPrompt> {
    let host_line = quoted_after(text, "authenticity of host ")?;
    // "github.com (140.82.112.3)" -> "github.com"
    let host = host_line
        .split_whitespace()
        .next()
        .unwrap_or(&host_line)
        .to_string();

    let mut key_type = None;
    let mut fingerprint = String::new();
    for line in text.lines() {
        if let Some(idx) = line.find(" key fingerprint is ") {
            key_type = Some(line[..idx].trim().to_string()).filter(|t| !t.is_empty());
            fingerprint = line[idx + " key fingerprint is ".len()..]
                .trim()
                .trim_end_matches('.')
                .to_string();
        }
    }
    if fingerprint.is_empty() {
        fingerprint = "unknown".to_string();
    }

    Some(HostKeyPrompt {
        host,
        fingerprint,
        key_type,
        prompt: Some(text.trim().to_string()),
    })
}

/// Text between the single quotes following `marker`.
fn quoted_after(text: &str, marker: &str) -> Option<String> {
    let start = text.find(marker)? + marker.len();
    let rest = text[start..].strip_prefix('\'')?;
    let end = rest.find('\'')?;
    Some(rest[..end].to_string())
}

fn userinfo(url: &str) -> Option<String> {
    let (_, after_scheme) = url.split_once("://")?;
    let authority = after_scheme.split('/').next()?;
    let (user, _) = authority.rsplit_once('@')?;
    let user = user.split(':').next().unwrap_or(user);
    (!user.is_empty()).then(|| user.to_string())
}

/// Parse a git credential description (`key=value` lines, blank line terminates).
pub fn parse_credential_description(input: &str) -> BTreeMap<String, String> {
    let mut attrs = BTreeMap::new();
    for line in input.lines() {
        if line.trim().is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once('=') {
            attrs.insert(key.trim().to_string(), value.to_string());
        }
    }
    attrs
}

/// Build the prompt for `git credential get`.
pub fn credential_from_description(attrs: &BTreeMap<String, String>) -> Prompt {
    let username = attrs.get("username").filter(|u| !u.is_empty()).cloned();
    let url = match attrs.get("url").filter(|u| !u.is_empty()) {
        Some(url) => url.clone(),
        None => {
            let protocol = attrs.get("protocol").map(String::as_str).unwrap_or("https");
            let host = attrs.get("host").map(String::as_str).unwrap_or("unknown");
            let user = username
                .as_deref()
                .map(|u| format!("{u}@"))
                .unwrap_or_default();
            match attrs.get("path").filter(|p| !p.is_empty()) {
                Some(path) => format!("{protocol}://{user}{host}/{}", path.trim_start_matches('/')),
                None => format!("{protocol}://{user}{host}"),
            }
        }
    };
    let field = if username.is_some() {
        CredentialField::Password
    } else {
        CredentialField::Both
    };
    Prompt::Credential(CredentialPrompt {
        url,
        username,
        field,
        prompt: None,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn as_credential(p: Prompt) -> CredentialPrompt {
        match p {
            Prompt::Credential(c) => c,
            other => panic!("expected credential, got {other:?}"),
        }
    }

    #[test]
    fn git_username_and_password_prompts() {
        let c = as_credential(classify_askpass("Username for 'https://github.com': "));
        assert_eq!(c.url, "https://github.com");
        assert_eq!(c.field, CredentialField::Username);

        let c = as_credential(classify_askpass(
            "Password for 'https://bob@github.com': ",
        ));
        assert_eq!(c.url, "https://bob@github.com");
        assert_eq!(c.username.as_deref(), Some("bob"));
        assert_eq!(c.field, CredentialField::Password);
    }

    #[test]
    fn ssh_host_key_prompt() {
        let text = "The authenticity of host 'github.com (140.82.112.3)' can't be established.\n\
                    ED25519 key fingerprint is SHA256:+DiY3wvvV6TuJJhbpZisF/zLDA0zPMSvHdkr4UvCOqU.\n\
                    This key is not known by any other names.\n\
                    Are you sure you want to continue connecting (yes/no/[fingerprint])? ";
        match classify_askpass(text) {
            Prompt::HostKeyTrust(h) => {
                assert_eq!(h.host, "github.com");
                assert_eq!(h.key_type.as_deref(), Some("ED25519"));
                assert_eq!(
                    h.fingerprint,
                    "SHA256:+DiY3wvvV6TuJJhbpZisF/zLDA0zPMSvHdkr4UvCOqU"
                );
            }
            other => panic!("expected host key prompt, got {other:?}"),
        }
    }

    #[test]
    fn ssh_passphrase_and_password() {
        let c = as_credential(classify_askpass(
            "Enter passphrase for key '/home/u/.ssh/id_ed25519': ",
        ));
        assert_eq!(c.url, "ssh-key:///home/u/.ssh/id_ed25519");

        let c = as_credential(classify_askpass("git@example.com's password: "));
        assert_eq!(c.url, "ssh://git@example.com");
        assert_eq!(c.username.as_deref(), Some("git"));
    }

    #[test]
    fn unknown_prompt_still_yields_valid_request() {
        let p = classify_askpass("Say the magic word: ");
        assert!(p.validate().is_ok());
    }

    #[test]
    fn credential_description_builds_url() {
        let attrs = parse_credential_description(
            "protocol=https\nhost=example.com\npath=org/repo.git\n\nignored=1\n",
        );
        assert!(!attrs.contains_key("ignored"));
        let c = as_credential(credential_from_description(&attrs));
        assert_eq!(c.url, "https://example.com/org/repo.git");
        assert_eq!(c.field, CredentialField::Both);

        let attrs = parse_credential_description("url=https://x.test\nusername=amy\n");
        let c = as_credential(credential_from_description(&attrs));
        assert_eq!(c.url, "https://x.test");
        assert_eq!(c.field, CredentialField::Password);
    }
}
