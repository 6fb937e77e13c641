//! Host-local firewall backends driven by spawning their CLI as an argv
//! array, never through a shell. Every IP passed to a command is checked
//! with `Validator::validate_ip_or_cidr` first, the same defense used
//! before any other shell-adjacent operation in this codebase.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

use crate::error::{EngineError, Result};
use crate::validator::Validator;

use super::{BanProvider, Capabilities};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct FirewallCliProvider {
    kind: String,
    binary_path: String,
    chain_or_set: String,
}

impl FirewallCliProvider {
    pub fn new(kind: String, config: &HashMap<String, serde_json::Value>) -> Result<Self> {
        let default_binary = match kind.as_str() {
            "firewalld" => "firewall-cmd",
            "ufw" => "ufw",
            "ipset" => "ipset",
            "iptables" => "iptables",
            other => {
                return Err(EngineError::InvalidInput(format!(
                    "'{other}' is not a recognized firewall cli provider"
                )))
            }
        };
        let binary_path = config
            .get("binary_path")
            .and_then(|v| v.as_str())
            .unwrap_or(default_binary)
            .to_string();
        let chain_or_set = config
            .get("chain_or_set")
            .and_then(|v| v.as_str())
            .unwrap_or("control-plane-bans")
            .to_string();
        Validator::validate_identifier(&chain_or_set)?;
        Ok(Self {
            kind,
            binary_path,
            chain_or_set,
        })
    }

    fn ban_args(&self, ip: &str) -> Vec<String> {
        match self.kind.as_str() {
            "firewalld" => vec![
                "--permanent".into(),
                format!("--zone={}", self.chain_or_set),
                format!("--add-rich-rule=rule family='ipv4' source address='{ip}' drop"),
            ],
            "ufw" => vec!["insert".into(), "1".into(), "deny".into(), "from".into(), ip.into()],
            "ipset" => vec!["add".into(), self.chain_or_set.clone(), ip.into()],
            "iptables" => vec![
                "-I".into(),
                self.chain_or_set.clone(),
                "-s".into(),
                ip.into(),
                "-j".into(),
                "DROP".into(),
            ],
            _ => unreachable!("validated in FirewallCliProvider::new"),
        }
    }

    fn unban_args(&self, ip: &str) -> Vec<String> {
        match self.kind.as_str() {
            "firewalld" => vec![
                "--permanent".into(),
                format!("--zone={}", self.chain_or_set),
                format!("--remove-rich-rule=rule family='ipv4' source address='{ip}' drop"),
            ],
            "ufw" => vec!["delete".into(), "deny".into(), "from".into(), ip.into()],
            "ipset" => vec!["del".into(), self.chain_or_set.clone(), ip.into()],
            "iptables" => vec![
                "-D".into(),
                self.chain_or_set.clone(),
                "-s".into(),
                ip.into(),
                "-j".into(),
                "DROP".into(),
            ],
            _ => unreachable!("validated in FirewallCliProvider::new"),
        }
    }

    async fn run(&self, args: &[String]) -> Result<()> {
        Validator::sanitize_argv(args)?;
        let mut cmd = Command::new(&self.binary_path);
        cmd.args(args);
        let output = timeout(COMMAND_TIMEOUT, cmd.output())
            .await
            .map_err(|_| EngineError::TransientFailure(format!("{} timed out", self.binary_path)))?
            .map_err(|e| EngineError::ExternalFailure(format!("failed to spawn {}: {e}", self.binary_path)))?;
        if !output.status.success() {
            return Err(EngineError::ExternalFailure(format!(
                "{} exited with {}: {}",
                self.binary_path,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BanProvider for FirewallCliProvider {
    async fn test_connection(&self) -> Result<()> {
        self.run(&["--version".to_string()]).await
    }

    async fn ban(&self, ip: IpAddr, _reason: &str) -> Result<Option<String>> {
        Validator::validate_ip_or_cidr(&ip.to_string())?;
        self.run(&self.ban_args(&ip.to_string())).await?;
        Ok(None)
    }

    async fn unban(&self, ip: IpAddr) -> Result<()> {
        Validator::validate_ip_or_cidr(&ip.to_string())?;
        self.run(&self.unban_args(&ip.to_string())).await
    }

    async fn get_banned_ips(&self) -> Result<Vec<IpAddr>> {
        // Listing requires per-tool output parsing this provider does not
        // implement; BanSync falls back to store-only reconciliation for it.
        Ok(Vec::new())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_batch: false,
            supports_list: false,
        }
    }

    async fn batch_ban(&self, ops: &[(IpAddr, &str)]) -> Result<()> {
        if self.kind != "ipset" {
            return Err(EngineError::Internal(format!("{} does not support batch ban", self.kind)));
        }
        for (ip, _) in ops {
            Validator::validate_ip_or_cidr(&ip.to_string())?;
        }
        let restore_script: String = ops
            .iter()
            .map(|(ip, _)| format!("add {} {}\n", self.chain_or_set, ip))
            .collect();
        run_ipset_restore(&self.binary_path, &restore_script).await
    }
}

async fn run_ipset_restore(binary_path: &str, script: &str) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut child = Command::new(binary_path)
        .arg("restore")
        .stdin(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| EngineError::ExternalFailure(format!("failed to spawn {binary_path} restore: {e}")))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(script.as_bytes())
            .await
            .map_err(|e| EngineError::ExternalFailure(format!("failed to write ipset restore script: {e}")))?;
    }
    let status = timeout(COMMAND_TIMEOUT, child.wait())
        .await
        .map_err(|_| EngineError::TransientFailure("ipset restore timed out".into()))?
        .map_err(|e| EngineError::ExternalFailure(format!("ipset restore failed: {e}")))?;
    if !status.success() {
        return Err(EngineError::ExternalFailure(format!("ipset restore exited with {status}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kind_is_rejected_at_construction() {
        let config = HashMap::new();
        let err = FirewallCliProvider::new("nftables".into(), &config).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn ipset_ban_args_never_embed_shell_metacharacters() {
        let config = HashMap::new();
        let provider = FirewallCliProvider::new("ipset".into(), &config).unwrap();
        let args = provider.ban_args("203.0.113.9");
        assert!(Validator::sanitize_argv(&args).is_ok());
    }
}
