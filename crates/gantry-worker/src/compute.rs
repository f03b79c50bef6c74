//! Compute-provisioning API seam.
//!
//! The controller talks to its cloud through this object-safe trait. The
//! mock implementation backs the standalone daemon and every test; it can
//! be scripted to delay activation, fail builds, or never bind an IP.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::ComputeError;

/// A provisioned compute instance as the provider reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerInfo {
    pub name: String,
    pub address: String,
    pub az: String,
    pub kind: String,
}

/// Provider-side lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Building,
    Active,
    Error,
}

/// Object-safe provisioning interface (sync methods; the controller owns
/// all waiting between calls).
pub trait ComputeApi: Send + Sync {
    fn create_server(&self, name: &str) -> Result<ServerInfo, ComputeError>;
    fn server_status(&self, name: &str) -> Result<ServerStatus, ComputeError>;
    fn delete_server(&self, name: &str) -> Result<(), ComputeError>;

    fn allocate_floating_ip(&self) -> Result<String, ComputeError>;
    fn assign_floating_ip(&self, ip: &str, server: &str) -> Result<(), ComputeError>;
    /// Which server the provider currently reports the IP bound to.
    fn floating_ip_owner(&self, ip: &str) -> Result<Option<String>, ComputeError>;
    /// Detach an IP from its server, keeping it allocated.
    fn release_floating_ip(&self, ip: &str) -> Result<(), ComputeError>;
    /// Deallocate an IP entirely.
    fn delete_floating_ip(&self, ip: &str) -> Result<(), ComputeError>;
}

struct MockServer {
    info: ServerInfo,
    /// Status polls remaining before the server reports Active.
    polls_until_active: u32,
    terminal: ServerStatus,
}

struct MockState {
    servers: HashMap<String, MockServer>,
    /// ip → owning server (None while unbound).
    ips: HashMap<String, Option<String>>,
    next_ip_octet: u8,
    deleted_servers: Vec<String>,
    fail_creates: bool,
    /// Owner polls to swallow before reporting a bind.
    bind_delay: u32,
    never_bind: bool,
}

/// Scriptable in-memory provider.
pub struct MockCompute {
    state: Mutex<MockState>,
    address: String,
    az: String,
    kind: String,
}

impl MockCompute {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                servers: HashMap::new(),
                ips: HashMap::new(),
                next_ip_octet: 1,
                deleted_servers: Vec::new(),
                fail_creates: false,
                bind_delay: 0,
                never_bind: false,
            }),
            address: "127.0.0.1".to_string(),
            az: "az-1".to_string(),
            kind: "standard".to_string(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock compute poisoned")
    }

    /// Every create_server call fails from now on.
    pub fn fail_creates(&self) {
        self.lock().fail_creates = true;
    }

    /// The next created server needs `polls` status polls to go Active.
    /// With `terminal` set to Error the server fails instead.
    pub fn script_next_build(&self, polls: u32, terminal: ServerStatus) {
        let mut state = self.lock();
        state.servers.insert(
            "__script__".to_string(),
            MockServer {
                info: ServerInfo {
                    name: String::new(),
                    address: String::new(),
                    az: String::new(),
                    kind: String::new(),
                },
                polls_until_active: polls,
                terminal,
            },
        );
    }

    /// Swallow `polls` floating-ip owner polls before reporting the bind.
    pub fn delay_ip_bind(&self, polls: u32) {
        self.lock().bind_delay = polls;
    }

    /// Floating IPs never report as bound.
    pub fn never_bind_ips(&self) {
        self.lock().never_bind = true;
    }

    /// Names of servers deleted so far (cleanup assertions).
    pub fn deleted_servers(&self) -> Vec<String> {
        self.lock().deleted_servers.clone()
    }

    /// Whether an IP is still allocated.
    pub fn ip_exists(&self, ip: &str) -> bool {
        self.lock().ips.contains_key(ip)
    }

    /// Current owner of an allocated IP.
    pub fn ip_owner(&self, ip: &str) -> Option<String> {
        self.lock().ips.get(ip).cloned().flatten()
    }
}

impl Default for MockCompute {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeApi for MockCompute {
    fn create_server(&self, name: &str) -> Result<ServerInfo, ComputeError> {
        let mut state = self.lock();
        if state.fail_creates {
            return Err(ComputeError::Request("create refused".to_string()));
        }
        let script = state.servers.remove("__script__");
        let (polls, terminal) = script
            .map(|s| (s.polls_until_active, s.terminal))
            .unwrap_or((0, ServerStatus::Active));
        let info = ServerInfo {
            name: name.to_string(),
            address: self.address.clone(),
            az: self.az.clone(),
            kind: self.kind.clone(),
        };
        state.servers.insert(
            name.to_string(),
            MockServer {
                info: info.clone(),
                polls_until_active: polls,
                terminal,
            },
        );
        Ok(info)
    }

    fn server_status(&self, name: &str) -> Result<ServerStatus, ComputeError> {
        let mut state = self.lock();
        let server = state
            .servers
            .get_mut(name)
            .ok_or_else(|| ComputeError::ServerNotFound(name.to_string()))?;
        if server.polls_until_active > 0 {
            server.polls_until_active -= 1;
            return Ok(ServerStatus::Building);
        }
        Ok(server.terminal)
    }

    fn delete_server(&self, name: &str) -> Result<(), ComputeError> {
        let mut state = self.lock();
        state
            .servers
            .remove(name)
            .ok_or_else(|| ComputeError::ServerNotFound(name.to_string()))?;
        state.deleted_servers.push(name.to_string());
        Ok(())
    }

    fn allocate_floating_ip(&self) -> Result<String, ComputeError> {
        let mut state = self.lock();
        let ip = format!("15.0.0.{}", state.next_ip_octet);
        state.next_ip_octet = state.next_ip_octet.wrapping_add(1);
        state.ips.insert(ip.clone(), None);
        Ok(ip)
    }

    fn assign_floating_ip(&self, ip: &str, server: &str) -> Result<(), ComputeError> {
        let mut state = self.lock();
        if !state.ips.contains_key(ip) {
            // Allow assigning addresses the mock never allocated; the
            // control plane tracks its own vip pool.
            state.ips.insert(ip.to_string(), None);
        }
        if !state.never_bind {
            state.ips.insert(ip.to_string(), Some(server.to_string()));
        }
        Ok(())
    }

    fn floating_ip_owner(&self, ip: &str) -> Result<Option<String>, ComputeError> {
        let mut state = self.lock();
        if state.bind_delay > 0 {
            state.bind_delay -= 1;
            return Ok(None);
        }
        state
            .ips
            .get(ip)
            .cloned()
            .ok_or_else(|| ComputeError::IpNotFound(ip.to_string()))
    }

    fn release_floating_ip(&self, ip: &str) -> Result<(), ComputeError> {
        let mut state = self.lock();
        match state.ips.get_mut(ip) {
            Some(owner) => {
                *owner = None;
                Ok(())
            }
            None => Err(ComputeError::IpNotFound(ip.to_string())),
        }
    }

    fn delete_floating_ip(&self, ip: &str) -> Result<(), ComputeError> {
        let mut state = self.lock();
        state
            .ips
            .remove(ip)
            .ok_or_else(|| ComputeError::IpNotFound(ip.to_string()))?;
        Ok(())
    }
}
