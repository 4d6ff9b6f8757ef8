use std::collections::HashMap;
use std::process::Stdio;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error};

use crate::errors::{DomainError, Result};

/// Domain states as virsh prints them. Anything unexpected maps to
/// `Undefined` instead of failing the listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmState {
    Running,
    Idle,
    Paused,
    InShutdown,
    ShutOff,
    Crashed,
    Pmsuspended,
    Undefined,
}

impl VmState {
    pub fn from_virsh(state: &str) -> VmState {
        match state {
            "running" => VmState::Running,
            "idle" => VmState::Idle,
            "paused" => VmState::Paused,
            "in shutdown" => VmState::InShutdown,
            "shut off" => VmState::ShutOff,
            "crashed" => VmState::Crashed,
            "pmsuspended" => VmState::Pmsuspended,
            _ => VmState::Undefined,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Numeric id virsh assigns to running domains; `-` for stopped ones.
    pub id: Option<String>,
    pub name: String,
    pub state: VmState,
}

/// Lists every domain known to the hypervisor, running or not.
pub async fn list_all() -> Result<Vec<Instance>> {
    let stdout = run_virsh(&["list", "--all"], None).await?;
    let mut instances = Vec::new();
    for row in parse_table(&stdout) {
        let Some(name) = row.get("Name") else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        let id = row
            .get("Id")
            .filter(|id| !id.is_empty() && *id != "-")
            .cloned();
        let state = row.get("State").map(String::as_str).unwrap_or("");
        instances.push(Instance {
            id,
            name: name.clone(),
            state: VmState::from_virsh(state),
        });
    }
    debug!("Found {} domains", instances.len());
    Ok(instances)
}

/// Fetches the authoritative domain XML for one VM.
pub async fn get_domain_xml(name: &str) -> Result<String> {
    run_virsh(&["dumpxml", name], None)
        .await
        .map_err(|err| match err {
            DomainError::VirshFailed(message) if message.contains("failed to get domain") => {
                DomainError::VmNotFound(name.to_string())
            }
            other => other,
        })
}

/// Redefines a domain from XML text fed through stdin.
pub async fn define_domain(xml: &str) -> Result<()> {
    run_virsh(&["define", "/dev/stdin"], Some(xml)).await?;
    Ok(())
}

async fn run_virsh(args: &[&str], stdin_data: Option<&str>) -> Result<String> {
    debug!("Running virsh {:?}", args);
    let mut command = Command::new("virsh");
    command
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if stdin_data.is_some() {
        command.stdin(Stdio::piped());
    } else {
        command.stdin(Stdio::null());
    }
    let mut child = command.spawn()?;
    if let Some(data) = stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(data.as_bytes()).await?;
        }
    }
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("virsh {:?} failed: {}", args, stderr.trim());
        return Err(DomainError::VirshFailed(stderr.trim().to_string()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

static SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s\s+").unwrap());

/// Parses virsh's column-aligned tables. The header line fixes each column's
/// start position; data rows are sliced at those positions, so names
/// containing single spaces survive.
pub fn parse_table(text: &str) -> Vec<HashMap<String, String>> {
    let mut rows = Vec::new();
    let mut columns: Vec<(String, usize)> = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if index == 0 {
            let mut last = 0;
            for found in SEPARATOR.find_iter(line) {
                let title = line[last..found.start()].trim();
                if !title.is_empty() {
                    columns.push((title.to_string(), last));
                }
                last = found.end();
            }
            let tail = line[last..].trim();
            if !tail.is_empty() {
                columns.push((tail.to_string(), last));
            }
            continue;
        }
        if index == 1 {
            // separator dashes
            continue;
        }
        let mut row = HashMap::new();
        for (position, (title, start)) in columns.iter().enumerate() {
            let end = columns
                .get(position + 1)
                .map(|next| next.1)
                .unwrap_or(line.len());
            let cell = line.get(*start..end).or_else(|| line.get(*start..)).unwrap_or("");
            let value = SEPARATOR.replace_all(cell, "").trim().to_string();
            row.insert(title.clone(), value);
        }
        rows.push(row);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = concat!(
        " Id   Name           State\n",
        "----------------------------------\n",
        " 1    web01          running\n",
        " 12   build agent    paused\n",
        " -    db01           shut off\n",
    );

    #[test]
    fn parses_header_positions() {
        let rows = parse_table(LISTING);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["Id"], "1");
        assert_eq!(rows[0]["Name"], "web01");
        assert_eq!(rows[0]["State"], "running");
        assert_eq!(rows[2]["Id"], "-");
        assert_eq!(rows[2]["State"], "shut off");
    }

    #[test]
    fn names_with_single_spaces_survive() {
        let rows = parse_table(LISTING);
        assert_eq!(rows[1]["Name"], "build agent");
        assert_eq!(rows[1]["State"], "paused");
    }

    #[test]
    fn empty_output_parses_to_nothing() {
        assert!(parse_table("").is_empty());
        assert!(parse_table(" Id   Name   State\n---------------\n").is_empty());
    }

    #[test]
    fn unknown_states_map_to_undefined() {
        assert_eq!(VmState::from_virsh("running"), VmState::Running);
        assert_eq!(VmState::from_virsh("shut off"), VmState::ShutOff);
        assert_eq!(VmState::from_virsh("weird"), VmState::Undefined);
    }
}
