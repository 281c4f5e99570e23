//! Fluent construction of container creation requests.
//!
//! [`ContainerSpec`] collects the logical configuration of a container and
//! [`ContainerSpec::build`] turns it into a [`ContainerSnapshot`], the same
//! shape the orchestrator captures from a live container and hands back to
//! the runtime on recreate.

use std::collections::{HashMap, HashSet};
use std::fmt;

use bollard::models::{
    ContainerConfig, HostConfig, PortBinding, RestartPolicy as EngineRestartPolicy,
    RestartPolicyNameEnum,
};
use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;
use crate::types::ContainerSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        })
    }
}

/// One host side of a published port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostBinding {
    pub host_ip: Option<String>,
    pub host_port: String,
}

/// A container port, exposed and published on zero or more host bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub protocol: Protocol,
    pub bindings: Vec<HostBinding>,
}

impl PortMapping {
    pub fn new(container_port: u16, protocol: Protocol) -> Self {
        Self {
            container_port,
            protocol,
            bindings: Vec::new(),
        }
    }

    pub fn tcp(container_port: u16) -> Self {
        Self::new(container_port, Protocol::Tcp)
    }

    pub fn udp(container_port: u16) -> Self {
        Self::new(container_port, Protocol::Udp)
    }

    /// Publishes on `host_port` on all interfaces.
    pub fn with_host_port(mut self, host_port: u16) -> Self {
        self.bindings.push(HostBinding {
            host_ip: None,
            host_port: host_port.to_string(),
        });
        self
    }

    /// Publishes on `host_ip:host_port`.
    pub fn with_binding(mut self, host_ip: impl Into<String>, host_port: u16) -> Self {
        self.bindings.push(HostBinding {
            host_ip: Some(host_ip.into()),
            host_port: host_port.to_string(),
        });
        self
    }

    /// Engine key, `port/protocol`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }

    fn engine_bindings(&self) -> Vec<PortBinding> {
        self.bindings
            .iter()
            .map(|b| PortBinding {
                host_ip: b.host_ip.clone(),
                host_port: Some(b.host_port.clone()),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub host_path: String,
    pub container_path: String,
}

impl Volume {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host_path, self.container_path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl fmt::Display for EnvVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// `/etc/hosts` entry added to the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraHost {
    pub domain: String,
    pub ip: String,
}

impl fmt::Display for ExtraHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.domain, self.ip)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicyKind {
    No,
    Always,
    UnlessStopped,
    OnFailure,
}

impl From<RestartPolicyKind> for RestartPolicyNameEnum {
    fn from(kind: RestartPolicyKind) -> Self {
        match kind {
            RestartPolicyKind::No => RestartPolicyNameEnum::NO,
            RestartPolicyKind::Always => RestartPolicyNameEnum::ALWAYS,
            RestartPolicyKind::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
            RestartPolicyKind::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
        }
    }
}

/// Restart policy; an unset `kind` leaves the engine default untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub kind: Option<RestartPolicyKind>,
    pub max_retries: i64,
}

impl RestartPolicy {
    pub fn new(kind: RestartPolicyKind, max_retries: i64) -> Self {
        Self {
            kind: Some(kind),
            max_retries,
        }
    }

    pub fn on_failure(max_retries: i64) -> Self {
        Self::new(RestartPolicyKind::OnFailure, max_retries)
    }

    fn engine_policy(&self) -> Option<EngineRestartPolicy> {
        self.kind.map(|kind| EngineRestartPolicy {
            name: Some(kind.into()),
            maximum_retry_count: Some(self.max_retries),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Bytes.
    pub memory: Option<i64>,
    /// CPU quota in units of 1e-9 CPUs.
    pub nano_cpus: Option<i64>,
    pub cpu_shares: Option<i64>,
}

impl ResourceLimits {
    fn apply(&self, host: &mut HostConfig) {
        host.memory = self.memory;
        host.nano_cpus = self.nano_cpus;
        host.cpu_shares = self.cpu_shares;
    }
}

/// Host configuration fields callers may set beyond what [`ContainerSpec`]
/// models. Only the fields listed here can be overridden.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HostOverrides {
    pub privileged: Option<bool>,
    pub network_mode: Option<String>,
    pub cap_add: Option<Vec<String>>,
    pub dns: Option<Vec<String>>,
    pub auto_remove: Option<bool>,
}

impl HostOverrides {
    /// Overwrites every field of `host` that is set here, leaves the rest.
    pub fn merge_into(&self, host: &mut HostConfig) {
        if let Some(privileged) = self.privileged {
            host.privileged = Some(privileged);
        }
        if let Some(mode) = &self.network_mode {
            host.network_mode = Some(mode.clone());
        }
        if let Some(caps) = &self.cap_add {
            host.cap_add = Some(caps.clone());
        }
        if let Some(dns) = &self.dns {
            host.dns = Some(dns.clone());
        }
        if let Some(auto_remove) = self.auto_remove {
            host.auto_remove = Some(auto_remove);
        }
    }
}

/// Logical configuration of a container to create.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub ports: Vec<PortMapping>,
    pub volumes: Vec<Volume>,
    pub env: Vec<EnvVar>,
    pub extra_hosts: Vec<ExtraHost>,
    pub restart_policy: RestartPolicy,
    pub resources: ResourceLimits,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: PortMapping) -> Self {
        self.ports.push(port);
        self
    }

    pub fn with_volume(
        mut self,
        host_path: impl Into<String>,
        container_path: impl Into<String>,
    ) -> Self {
        self.volumes.push(Volume {
            host_path: host_path.into(),
            container_path: container_path.into(),
        });
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push(EnvVar {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn with_extra_host(mut self, domain: impl Into<String>, ip: impl Into<String>) -> Self {
        self.extra_hosts.push(ExtraHost {
            domain: domain.into(),
            ip: ip.into(),
        });
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn with_resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = resources;
        self
    }

    fn validate(&self) -> Result<(), RuntimeError> {
        let invalid = |msg: String| Err(RuntimeError::Validation(msg));
        if self.name.trim().is_empty() {
            return invalid("container name is empty".into());
        }
        if self.image.trim().is_empty() {
            return invalid(format!("container `{}` has no image", self.name));
        }
        let mut keys = HashSet::new();
        for port in &self.ports {
            if !keys.insert(port.key()) {
                return invalid(format!("port {} is mapped twice", port.key()));
            }
        }
        if let Some(v) = self
            .volumes
            .iter()
            .find(|v| v.host_path.is_empty() || v.container_path.is_empty())
        {
            return invalid(format!("volume `{}` has an empty path", v.bind()));
        }
        if let Some(e) = self
            .env
            .iter()
            .find(|e| e.name.is_empty() || e.name.contains('='))
        {
            return invalid(format!("invalid environment variable name `{}`", e.name));
        }
        Ok(())
    }

    /// Builds the creation request, applying `overrides` last.
    pub fn build(&self, overrides: Option<&HostOverrides>) -> Result<ContainerSnapshot, RuntimeError> {
        self.validate()?;

        let mut config = ContainerConfig::default();
        let mut host = HostConfig::default();

        if !self.ports.is_empty() {
            config.exposed_ports = Some(
                self.ports
                    .iter()
                    .map(|p| (p.key(), HashMap::new()))
                    .collect(),
            );
            host.port_bindings = Some(
                self.ports
                    .iter()
                    .map(|p| (p.key(), Some(p.engine_bindings())))
                    .collect(),
            );
        }
        if !self.volumes.is_empty() {
            host.binds = Some(self.volumes.iter().map(Volume::bind).collect());
        }
        if !self.env.is_empty() {
            config.env = Some(self.env.iter().map(ToString::to_string).collect());
        }
        if !self.extra_hosts.is_empty() {
            host.extra_hosts = Some(self.extra_hosts.iter().map(ToString::to_string).collect());
        }
        host.restart_policy = self.restart_policy.engine_policy();
        self.resources.apply(&mut host);

        if let Some(overrides) = overrides {
            overrides.merge_into(&mut host);
        }

        Ok(ContainerSnapshot::new(
            self.name.clone(),
            self.image.clone(),
            config,
            host,
        ))
    }
}
