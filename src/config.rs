//! The benchmark configuration file and the identity of the local node within it.
//!
//! A single TOML file describes the whole cluster; every node reads the same file and finds
//! itself in the `servers` or `clients` list by host name, unless the command line names its role
//! and rank directly.
use std::ffi::CStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::handshake::bring_up::LinkParams;
use crate::ibverbs::device_context::Mtu;
use crate::ring::MemoryLayout;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
    #[error("failed to get the host name")]
    Hostname(#[source] io::Error),
    #[error("host {0} is neither a server nor a client, pass --role and --rank")]
    UnknownHost(String),
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }
}

/// Which data path moves the messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// Send / receive with immediate data.
    #[default]
    TwoSided,
    /// RDMA writes, arrival detected by polling the slot contents.
    OneSided,
}

/// Behaviors switched on by the topology and the configuration rather than by separate code
/// paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// More than one client: messages name their sender in the immediate data.
    pub multi_peer: bool,
    /// Receives go to one SRQ per lane instead of each QP's own receive queue.
    pub shared_receive_queue: bool,
    /// One-sided writes are posted as linked chains of `batch_size`.
    pub batched_signaling: bool,
}

/// Where this process sits in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeIdentity {
    pub role: Role,
    pub rank: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchConfig {
    /// Server hosts; the index is the server's rank.
    pub servers: Vec<String>,
    /// Client hosts; the index is the client's rank.
    pub clients: Vec<String>,
    pub msg_size: usize,
    /// Messages in flight per link, which is also the number of slots in every receive ring.
    pub num_concurr_msgs: usize,
    /// TCP port of the handshake.
    pub port: u16,
    pub engine: EngineKind,
    pub shared_receive_queue: bool,
    /// Writes per posted chain in one-sided mode, 1 for unbatched.
    pub batch_size: usize,
    /// Every n-th one-sided write of a link is signaled.
    pub signal_interval: u64,
    pub warmup_ops: u64,
    pub total_ops: u64,
    /// Worker threads, each driving a contiguous share of the peers.
    pub threads: usize,
    /// The first worker is pinned to this CPU, the next one to the CPU after it.
    pub first_cpu: usize,
    /// RDMA device name, the first device when absent.
    pub device: Option<String>,
    pub ib_port: u8,
    /// Path MTU in bytes.
    pub mtu: u32,
    pub service_level: u8,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            servers: Vec::new(),
            clients: Vec::new(),
            msg_size: 64,
            num_concurr_msgs: 8,
            port: 18515,
            engine: EngineKind::TwoSided,
            shared_receive_queue: false,
            batch_size: 1,
            signal_interval: 1000,
            warmup_ops: 500_000,
            total_ops: 10_000_000,
            threads: 1,
            first_cpu: 0,
            device: None,
            ib_port: 1,
            mtu: 4096,
            service_level: 0,
        }
    }
}

impl BenchConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Work out our role and rank. Explicit values win; otherwise the local host name is looked
    /// up in `servers` first, then in `clients`.
    pub fn identify(&self, role: Option<Role>, rank: Option<u32>) -> Result<NodeIdentity, ConfigError> {
        if let (Some(role), Some(rank)) = (role, rank) {
            return Ok(NodeIdentity { role, rank });
        }
        let host = hostname().map_err(ConfigError::Hostname)?;
        self.identify_host(&host, role, rank)
    }

    fn identify_host(&self, host: &str, role: Option<Role>, rank: Option<u32>) -> Result<NodeIdentity, ConfigError> {
        let roles = match role {
            Some(role) => vec![role],
            None => vec![Role::Server, Role::Client],
        };
        for role in roles {
            if let Some(index) = self.hosts(role).iter().position(|entry| entry == host) {
                return Ok(NodeIdentity {
                    role,
                    rank: rank.unwrap_or(index as u32),
                });
            }
        }
        Err(ConfigError::UnknownHost(host.to_string()))
    }

    /// Hosts listed for `role`.
    pub fn hosts(&self, role: Role) -> &[String] {
        match role {
            Role::Server => &self.servers,
            Role::Client => &self.clients,
        }
    }

    /// Hosts on the other end of our links.
    pub fn peers(&self, role: Role) -> &[String] {
        match role {
            Role::Server => &self.clients,
            Role::Client => &self.servers,
        }
    }

    /// Reject values that would break the buffer and counter arithmetic.
    pub fn validate(&self, id: &NodeIdentity) -> Result<(), ConfigError> {
        if self.peers(id.role).is_empty() {
            let field = match id.role {
                Role::Server => "clients",
                Role::Client => "servers",
            };
            return Err(invalid(field, format!("a {} needs at least one peer", id.role.as_str())));
        }
        let num_hosts = self.hosts(id.role).len();
        if num_hosts > 0 && id.rank as usize >= num_hosts {
            return Err(invalid("rank", format!("rank {} but only {num_hosts} {}s", id.rank, id.role.as_str())));
        }
        if self.msg_size == 0 {
            return Err(invalid("msg_size", "must be positive"));
        }
        if self.num_concurr_msgs == 0 {
            return Err(invalid("num_concurr_msgs", "must be positive"));
        }
        if self.batch_size == 0 || self.num_concurr_msgs % self.batch_size != 0 {
            return Err(invalid(
                "batch_size",
                format!("{} does not divide num_concurr_msgs {}", self.batch_size, self.num_concurr_msgs),
            ));
        }
        if self.signal_interval == 0 {
            return Err(invalid("signal_interval", "must be positive"));
        }
        if self.warmup_ops > self.total_ops {
            return Err(invalid(
                "warmup_ops",
                format!("{} exceeds total_ops {}", self.warmup_ops, self.total_ops),
            ));
        }
        if self.threads == 0 {
            return Err(invalid("threads", "must be positive"));
        }
        self.mtu()?;
        self.layout(id.role)?;
        Ok(())
    }

    pub fn capabilities(&self, role: Role) -> Capabilities {
        Capabilities {
            multi_peer: self.clients.len() > 1,
            shared_receive_queue: self.shared_receive_queue && role == Role::Server,
            batched_signaling: self.engine == EngineKind::OneSided && self.batch_size > 1,
        }
    }

    pub fn mtu(&self) -> Result<Mtu, ConfigError> {
        Mtu::from_bytes(self.mtu).ok_or_else(|| invalid("mtu", format!("{} is not 256, 512, 1024, 2048 or 4096", self.mtu)))
    }

    pub fn link_params(&self) -> Result<LinkParams, ConfigError> {
        Ok(LinkParams {
            ib_port: self.ib_port,
            mtu: self.mtu()?,
            service_level: self.service_level,
        })
    }

    /// Send work requests a QP may hold at once. Unsignaled writes stay queued until a later
    /// signaled one completes; two-sided sends are all signaled, plus start and stop.
    pub fn send_queue_depth(&self) -> u64 {
        let window = self.num_concurr_msgs as u64;
        match self.engine {
            EngineKind::TwoSided => window.saturating_add(2),
            EngineKind::OneSided => window.saturating_add(self.signal_interval),
        }
    }

    /// Buffer layout for a node of `role`: one ring per peer plus the staging area, which holds
    /// a whole ring's worth of payloads only for batched writes.
    pub fn layout(&self, role: Role) -> Result<MemoryLayout, ConfigError> {
        let staging_slots = if self.capabilities(role).batched_signaling {
            self.num_concurr_msgs
        } else {
            1
        };
        MemoryLayout::new(self.msg_size, self.num_concurr_msgs, self.peers(role).len(), staging_slots)
            .ok_or_else(|| invalid("msg_size", "the buffer does not fit in memory"))
    }
}

fn hostname() -> io::Result<String> {
    let mut buf = [0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    // not NUL-terminated when truncated
    let last = buf.len() - 1;
    buf[last] = 0;
    let name = CStr::from_bytes_until_nul(&buf).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(name.to_string_lossy().into_owned())
}
