use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One request per line of the newline-delimited JSON protocol (spec
/// §6's operation surface; framing itself is out of scope per spec.md
/// §1, so this is the simplest shape that "delivers requests").
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Create(CreateRequest),
    Destroy { handle: String },
    Lookup { handle: String },
    Containers {
        #[serde(default)]
        filter: BTreeMap<String, String>,
    },
    Run(RunRequest),
    Attach { handle: String, exec_id: String },
    Wait { handle: String, exec_id: String },
    NetIn {
        handle: String,
        #[serde(default)]
        host_port: u16,
        #[serde(default)]
        container_port: u16,
    },
    NetOut { handle: String, rule: NetOutRuleDto },
    SetProperty { handle: String, name: String, value: String },
    Property { handle: String, name: String },
    Properties { handle: String },
    RemoveProperty { handle: String, name: String },
    Info { handle: String },
    Metrics { handle: String },
    StreamIn(StreamInRequest),
    StreamOut { handle: String, path: String, user: String },
}

#[derive(Debug, Deserialize)]
pub struct StreamInRequest {
    pub handle: String,
    pub path: String,
    pub user: String,
    /// Base64-encoded tar stream, following `RunRequest::stdin_base64`'s
    /// convention for carrying binary payloads over this line-delimited
    /// JSON transport.
    pub tar_base64: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct CreateRequest {
    #[serde(default)]
    pub handle: Option<String>,
    pub rootfs_path: String,
    #[serde(default)]
    pub network_spec: String,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub memory_bytes: Option<i64>,
    #[serde(default)]
    pub cpu_shares: Option<u64>,
    #[serde(default)]
    pub pid_max: Option<i64>,
    #[serde(default)]
    pub bind_mounts: Vec<BindMountDto>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub grace_time_secs: Option<u64>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct BindMountDto {
    pub src: String,
    pub dst: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub handle: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub rlimits: BTreeMap<String, u64>,
    /// Base64-encoded bytes piped to the process's stdin, if any.
    #[serde(default)]
    pub stdin_base64: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NetOutRuleDto {
    #[serde(default)]
    pub protocol: ProtocolDto,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortRangeDto>,
    #[serde(default)]
    pub log: bool,
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolDto {
    #[default]
    All,
    Tcp,
    Udp,
    Icmp,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct PortRangeDto {
    pub start: u16,
    pub end: u16,
}

/// The envelope every response line is wrapped in: `ok` true plus a
/// `body` payload, or `ok` false plus an `error` kind/message pair from
/// `common::Error`'s taxonomy (spec §7).
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl Envelope {
    pub fn ok(body: serde_json::Value) -> Self {
        Self { ok: true, error_kind: None, error: None, body: Some(body) }
    }

    pub fn err(err: &common::Error) -> Self {
        Self {
            ok: false,
            error_kind: Some(error_kind(err).to_string()),
            error: Some(err.to_string()),
            body: None,
        }
    }
}

fn error_kind(err: &common::Error) -> &'static str {
    match err {
        common::Error::NotFound(_) => "not_found",
        common::Error::Validation(_) => "validation",
        common::Error::CapacityExhausted(_) => "capacity_exhausted",
        common::Error::Runtime(_) => "runtime",
        common::Error::Network(_) => "network",
        common::Error::Io(_) => "io",
        common::Error::Transient(_) => "transient",
    }
}
