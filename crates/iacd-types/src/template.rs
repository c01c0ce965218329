use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_TEMPLATE_TIMEOUT_SECS: u64 = 3600;

fn default_timeout_secs() -> u64 {
    DEFAULT_TEMPLATE_TIMEOUT_SECS
}

fn default_branch() -> String {
    "master".to_string()
}

/// A runnable template as resolved by the console. Variables and secrets
/// have already been expanded into `env`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Template {
    pub guid: String,
    pub org_guid: String,
    #[serde(default)]
    pub name: String,
    pub repo_addr: String,
    #[serde(default = "default_branch")]
    pub repo_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_token: Option<String>,
    #[serde(default)]
    pub workdir: String,
    #[serde(default)]
    pub save_state: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub varfile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playbook: Option<String>,
    #[serde(default)]
    pub extra: Value,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Template {
    pub fn new(
        guid: impl Into<String>,
        org_guid: impl Into<String>,
        repo_addr: impl Into<String>,
    ) -> Self {
        Self {
            guid: guid.into(),
            org_guid: org_guid.into(),
            name: String::new(),
            repo_addr: repo_addr.into(),
            repo_branch: default_branch(),
            repo_token: None,
            workdir: String::new(),
            save_state: false,
            timeout_secs: DEFAULT_TEMPLATE_TIMEOUT_SECS,
            varfile: None,
            playbook: None,
            extra: Value::Null,
            env: BTreeMap::new(),
        }
    }
}
