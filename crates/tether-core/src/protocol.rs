//! Wire protocol between helper programs and the daemon's IPC bridge.
//!
//! One request per connection, newline-delimited JSON:
//!
//! ```text
//! helper -> bridge  {"kind":"host_key_trust","payload":{"host":"example.com","fingerprint":"SHA256:..."}}
//! bridge -> helper  {"id":"<correlation id>","decision":"deny"}
//! ```
//!
//! The helper keeps its side of the connection open until the response
//! arrives; closing it early cancels the prompt.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::logging::redact;

/// Environment variable carrying the bridge socket path to helpers.
pub const SOCKET_ENV: &str = "TETHER_AUTH_SOCKET";

/// Optional helper-side read timeout in seconds. Unset means wait indefinitely.
pub const TIMEOUT_ENV: &str = "TETHER_ASKPASS_TIMEOUT_SECS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("bad request: {0}")]
    BadRequest(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    #[serde(alias = "Credential")]
    Credential,
    #[serde(alias = "HostKeyTrust")]
    HostKeyTrust,
}

impl PromptKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Credential => "credential",
            Self::HostKeyTrust => "host_key_trust",
        }
    }

    /// Decision delivered when nobody answers in time.
    pub fn fail_closed_decision(self) -> Decision {
        Decision::deny()
    }
}

impl fmt::Display for PromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which credential values the helper needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialField {
    Username,
    Password,
    #[default]
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPrompt {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub field: CredentialField,
    /// Raw prompt text as shown by git, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostKeyPrompt {
    pub host: String,
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// A structured prompt awaiting a human decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Prompt {
    Credential(CredentialPrompt),
    HostKeyTrust(HostKeyPrompt),
}

impl Prompt {
    pub fn kind(&self) -> PromptKind {
        match self {
            Self::Credential(_) => PromptKind::Credential,
            Self::HostKeyTrust(_) => PromptKind::HostKeyTrust,
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Self::Credential(p) if p.url.trim().is_empty() => Err(ProtocolError::BadRequest(
                "credential prompt requires a url".into(),
            )),
            Self::HostKeyTrust(p) if p.host.trim().is_empty() => Err(ProtocolError::BadRequest(
                "host key prompt requires a host".into(),
            )),
            Self::HostKeyTrust(p) if p.fingerprint.trim().is_empty() => Err(
                ProtocolError::BadRequest("host key prompt requires a fingerprint".into()),
            ),
            _ => Ok(()),
        }
    }

    /// One-line description safe for logs.
    pub fn summary(&self) -> String {
        match self {
            Self::Credential(p) => format!("credential for {}", redact(&p.url)),
            Self::HostKeyTrust(p) => format!("host key {} for {}", p.fingerprint, p.host),
        }
    }
}

/// Request line sent by a helper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelperRequest {
    pub kind: PromptKind,
    pub payload: Value,
    /// Context key (typically the working directory) the prompt belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl HelperRequest {
    pub fn new(prompt: &Prompt, context: Option<String>) -> Self {
        let payload = match prompt {
            Prompt::Credential(p) => serde_json::to_value(p),
            Prompt::HostKeyTrust(p) => serde_json::to_value(p),
        }
        .unwrap_or(Value::Null);
        Self {
            kind: prompt.kind(),
            payload,
            context,
        }
    }

    pub fn parse_line(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line.trim())
            .map_err(|e| ProtocolError::BadRequest(format!("invalid request: {e}")))
    }

    /// Decode and validate the payload for the declared kind.
    pub fn into_prompt(self) -> Result<(Prompt, Option<String>), ProtocolError> {
        let prompt = match self.kind {
            PromptKind::Credential => serde_json::from_value(self.payload)
                .map(Prompt::Credential)
                .map_err(|e| ProtocolError::BadRequest(format!("invalid credential payload: {e}")))?,
            PromptKind::HostKeyTrust => serde_json::from_value(self.payload)
                .map(Prompt::HostKeyTrust)
                .map_err(|e| ProtocolError::BadRequest(format!("invalid host key payload: {e}")))?,
        };
        prompt.validate()?;
        let context = self.context.filter(|c| !c.trim().is_empty());
        Ok((prompt, context))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

/// An operator's answer to a prompt.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub decision: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            decision: Verdict::Allow,
            username: None,
            password: None,
        }
    }

    pub fn deny() -> Self {
        Self {
            decision: Verdict::Deny,
            username: None,
            password: None,
        }
    }

    pub fn credentials(username: Option<String>, password: impl Into<String>) -> Self {
        Self {
            decision: Verdict::Allow,
            username,
            password: Some(password.into()),
        }
    }

    pub fn is_allow(&self) -> bool {
        self.decision == Verdict::Allow
    }
}

// Secrets stay out of Debug output.
impl fmt::Debug for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decision")
            .field("decision", &self.decision)
            .field("username", &self.username)
            .field(
                "password",
                &self.password.as_ref().map(|_| crate::logging::REDACTED_VALUE),
            )
            .finish()
    }
}

/// Response line sent by the bridge.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HelperResponse {
    pub fn decided(id: &str, decision: &Decision) -> Self {
        Self {
            id: Some(id.to_string()),
            decision: Some(decision.decision),
            username: decision.username.clone(),
            password: decision.password.clone(),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Serialize as one newline-terminated line.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"error":"failed to encode response"}"#.to_string());
        line.push('\n');
        line
    }

    /// Interpret the response from the helper's side.
    pub fn into_decision(self) -> Result<Decision, ProtocolError> {
        if let Some(error) = self.error {
            return Err(ProtocolError::BadRequest(error));
        }
        match self.decision {
            Some(decision) => Ok(Decision {
                decision,
                username: self.username,
                password: self.password,
            }),
            None => Err(ProtocolError::BadRequest(
                "response carried neither decision nor error".into(),
            )),
        }
    }
}

impl fmt::Debug for HelperResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelperResponse")
            .field("id", &self.id)
            .field("decision", &self.decision)
            .field("username", &self.username)
            .field(
                "password",
                &self.password.as_ref().map(|_| crate::logging::REDACTED_VALUE),
            )
            .field("error", &self.error)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_pascal_case_host_key_request() {
        let line = r#"{"kind":"HostKeyTrust","payload":{"host":"example.com","fingerprint":"SHA256:abc"}}"#;
        let (prompt, context) = HelperRequest::parse_line(line)
            .unwrap()
            .into_prompt()
            .unwrap();
        assert_eq!(prompt.kind(), PromptKind::HostKeyTrust);
        assert!(context.is_none());
        match prompt {
            Prompt::HostKeyTrust(p) => {
                assert_eq!(p.host, "example.com");
                assert_eq!(p.fingerprint, "SHA256:abc");
            }
            other => panic!("unexpected prompt {other:?}"),
        }
    }

    #[test]
    fn credential_request_defaults_field_to_both() {
        let line = r#"{"kind":"credential","payload":{"url":"https://example.com"},"context":"/repo"}"#;
        let (prompt, context) = HelperRequest::parse_line(line)
            .unwrap()
            .into_prompt()
            .unwrap();
        assert_eq!(context.as_deref(), Some("/repo"));
        match prompt {
            Prompt::Credential(p) => assert_eq!(p.field, CredentialField::Both),
            other => panic!("unexpected prompt {other:?}"),
        }
    }

    #[test]
    fn malformed_requests_are_bad_requests() {
        assert!(HelperRequest::parse_line("not json").is_err());
        assert!(HelperRequest::parse_line(r#"{"kind":"telepathy","payload":{}}"#).is_err());

        let missing_fingerprint = HelperRequest::parse_line(
            r#"{"kind":"host_key_trust","payload":{"host":"example.com","fingerprint":" "}}"#,
        )
        .unwrap();
        assert!(matches!(
            missing_fingerprint.into_prompt(),
            Err(ProtocolError::BadRequest(_))
        ));

        let wrong_shape =
            HelperRequest::parse_line(r#"{"kind":"credential","payload":{"host":"x"}}"#).unwrap();
        assert!(wrong_shape.into_prompt().is_err());
    }

    #[test]
    fn request_builder_matches_parser() {
        let prompt = Prompt::HostKeyTrust(HostKeyPrompt {
            host: "git.example.com".into(),
            fingerprint: "SHA256:xyz".into(),
            key_type: Some("ED25519".into()),
            prompt: None,
        });
        let line = serde_json::to_string(&HelperRequest::new(&prompt, None)).unwrap();
        assert!(line.contains(r#""kind":"host_key_trust""#));
        let (parsed, _) = HelperRequest::parse_line(&line)
            .unwrap()
            .into_prompt()
            .unwrap();
        assert_eq!(parsed, prompt);
    }

    #[test]
    fn deny_response_wire_shape() {
        let line = HelperResponse::decided("abc", &Decision::deny()).to_line();
        assert_eq!(line, "{\"id\":\"abc\",\"decision\":\"deny\"}\n");
    }

    #[test]
    fn response_into_decision() {
        let resp: HelperResponse = serde_json::from_str(
            r#"{"id":"1","decision":"allow","username":"bob","password":"pw"}"#,
        )
        .unwrap();
        let decision = resp.into_decision().unwrap();
        assert!(decision.is_allow());
        assert_eq!(decision.password.as_deref(), Some("pw"));

        let err = HelperResponse::error("bad request: nope").into_decision();
        assert!(err.is_err());
    }

    #[test]
    fn debug_output_hides_password() {
        let decision = Decision::credentials(Some("bob".into()), "hunter2");
        let rendered = format!("{decision:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn both_kinds_fail_closed() {
        assert_eq!(
            PromptKind::Credential.fail_closed_decision(),
            Decision::deny()
        );
        assert_eq!(
            PromptKind::HostKeyTrust.fail_closed_decision(),
            Decision::deny()
        );
    }
}
