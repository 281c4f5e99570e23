//! Data structures passed between the orchestrator and a container runtime.
//!
//! A [`ContainerSnapshot`] is the full creation configuration of a container
//! as captured by inspection. It doubles as the create request: recreating a
//! container means handing a snapshot (with a substituted image) back to the
//! runtime. References ([`ContainerRef`]) are only meaningful for the duration
//! of one call into the orchestrator.

use std::fmt;
use std::str::FromStr;

use bollard::models::{ContainerConfig, ContainerInspectResponse, HostConfig, RestartPolicy};
use serde::{Deserialize, Serialize};

use crate::error::{RuntimeError, UpdateError};

/// Handle on one container instance: engine id plus its name (without the
/// leading `/` the engine reports).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerRef {
    pub id: String,
    pub name: String,
}

impl ContainerRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Lifecycle states reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Restarting,
    Running,
    Removing,
    Paused,
    Exited,
    Dead,
}

impl ContainerState {
    /// Name used by the engine API, also the value of the `status` filter.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Created => "created",
            ContainerState::Restarting => "restarting",
            ContainerState::Running => "running",
            ContainerState::Removing => "removing",
            ContainerState::Paused => "paused",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
        }
    }

    pub const ALL: [ContainerState; 7] = [
        ContainerState::Created,
        ContainerState::Restarting,
        ContainerState::Running,
        ContainerState::Removing,
        ContainerState::Paused,
        ContainerState::Exited,
        ContainerState::Dead,
    ];
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerState {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        ContainerState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| RuntimeError::Validation(format!("unknown container state `{s}`")))
    }
}

/// `repository[:tag][@digest]`, compared structurally.
///
/// A `:` only separates a tag when it comes after the last `/`, so registry
/// ports (`localhost:5000/app`) stay part of the repository. No tag is
/// implied: `app` and `app:latest` are different references.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: Some(tag.into()),
            digest: None,
        }
    }

    /// Same image under `prefix/repository`, the form a registry push needs.
    pub fn with_repository_prefix(&self, prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        Self {
            repository: format!("{prefix}/{}", self.repository),
            ..self.clone()
        }
    }

    /// Repository without tag or digest.
    pub fn name_only(&self) -> String {
        self.repository.clone()
    }

    /// Tag, falling back to `latest` the way the engine resolves it.
    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl FromStr for ImageReference {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || UpdateError::InvalidImage(s.to_owned());
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(invalid());
        }

        let (named, digest) = match s.split_once('@') {
            Some((named, digest)) if !digest.is_empty() => (named, Some(digest.to_owned())),
            Some(_) => return Err(invalid()),
            None => (s, None),
        };

        let name_start = named.rfind('/').map_or(0, |i| i + 1);
        let (repository, tag) = match named[name_start..].rfind(':') {
            Some(i) => {
                let split = name_start + i;
                (&named[..split], Some(named[split + 1..].to_owned()))
            }
            None => (named, None),
        };

        if repository.is_empty() || repository.ends_with('/') || tag.as_deref() == Some("") {
            return Err(invalid());
        }

        Ok(Self {
            repository: repository.to_owned(),
            tag,
            digest,
        })
    }
}

/// Creation configuration of a container captured at one point in time.
///
/// Snapshots are never patched in place: [`with_image`](Self::with_image) and
/// [`with_host_config`](Self::with_host_config) produce new values, so the
/// copy held by an in-flight update is exactly what was inspected.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerSnapshot {
    name: String,
    image: String,
    config: ContainerConfig,
    host_config: HostConfig,
}

impl ContainerSnapshot {
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        mut config: ContainerConfig,
        host_config: HostConfig,
    ) -> Self {
        let image = image.into();
        config.image = Some(image.clone());
        Self {
            name: name.into(),
            image,
            config,
            host_config,
        }
    }

    /// Builds a snapshot from an engine inspect response.
    pub fn from_inspect(inspect: ContainerInspectResponse) -> Result<Self, RuntimeError> {
        let name = inspect
            .name
            .as_deref()
            .map(|n| n.trim_start_matches('/').to_owned())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| RuntimeError::Validation("inspect response has no name".into()))?;
        let config = inspect.config.ok_or_else(|| {
            RuntimeError::Validation(format!("inspect response for `{name}` has no config"))
        })?;
        // `config.image` is the reference the container was created from,
        // the top-level field is the resolved image id.
        let image = config
            .image
            .clone()
            .or(inspect.image)
            .ok_or_else(|| RuntimeError::Validation(format!("container `{name}` has no image")))?;

        Ok(Self::new(
            name,
            image,
            config,
            inspect.host_config.unwrap_or_default(),
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn image_reference(&self) -> Result<ImageReference, UpdateError> {
        self.image.parse()
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn host_config(&self) -> &HostConfig {
        &self.host_config
    }

    pub fn env(&self) -> &[String] {
        self.config.env.as_deref().unwrap_or_default()
    }

    /// Exposed `port/protocol` keys, sorted.
    pub fn exposed_ports(&self) -> Vec<&str> {
        let mut ports: Vec<&str> = self
            .config
            .exposed_ports
            .iter()
            .flat_map(|ports| ports.keys().map(String::as_str))
            .collect();
        ports.sort_unstable();
        ports
    }

    pub fn binds(&self) -> &[String] {
        self.host_config.binds.as_deref().unwrap_or_default()
    }

    pub fn restart_policy(&self) -> Option<&RestartPolicy> {
        self.host_config.restart_policy.as_ref()
    }

    /// Copy of this snapshot that creates the container from `image`.
    pub fn with_image(&self, image: &ImageReference) -> Self {
        let image = image.to_string();
        let mut config = self.config.clone();
        config.image = Some(image.clone());
        Self {
            name: self.name.clone(),
            image,
            config,
            host_config: self.host_config.clone(),
        }
    }

    pub fn with_host_config(self, host_config: HostConfig) -> Self {
        Self {
            host_config,
            ..self
        }
    }
}

/// Terminal state of one update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Succeeded,
    RolledBack,
    Failed,
}

/// Result of [`UpdateOrchestrator::update`](crate::orchestrator::UpdateOrchestrator::update).
///
/// `error` is set for every status except `Succeeded`; on `RolledBack` it is
/// the failure that triggered the rollback.
#[derive(Debug)]
pub struct UpdateOutcome {
    pub status: UpdateStatus,
    /// Image the container runs after the attempt, `None` when unknown.
    pub final_image: Option<ImageReference>,
    pub error: Option<UpdateError>,
}

impl UpdateOutcome {
    pub(crate) fn succeeded(image: ImageReference) -> Self {
        Self {
            status: UpdateStatus::Succeeded,
            final_image: Some(image),
            error: None,
        }
    }

    pub(crate) fn rolled_back(image: ImageReference, cause: UpdateError) -> Self {
        Self {
            status: UpdateStatus::RolledBack,
            final_image: Some(image),
            error: Some(cause),
        }
    }

    pub(crate) fn failed(error: UpdateError) -> Self {
        Self {
            status: UpdateStatus::Failed,
            final_image: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == UpdateStatus::Succeeded
    }

    /// `true` when the rollback failed and the container may be gone.
    pub fn needs_intervention(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(|e| e.kind() == crate::error::ErrorKind::RollbackFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_reference_parsing() {
        let plain: ImageReference = "nginx".parse().unwrap();
        assert_eq!(plain.repository, "nginx");
        assert_eq!(plain.tag, None);

        let tagged: ImageReference = "localhost:5000/team/app:1.4".parse().unwrap();
        assert_eq!(tagged.repository, "localhost:5000/team/app");
        assert_eq!(tagged.tag.as_deref(), Some("1.4"));
        assert_eq!(tagged.to_string(), "localhost:5000/team/app:1.4");
        assert_eq!(tagged.name_only(), "localhost:5000/team/app");

        let port_only: ImageReference = "localhost:5000/app".parse().unwrap();
        assert_eq!(port_only.repository, "localhost:5000/app");
        assert_eq!(port_only.tag_or_latest(), "latest");

        let pinned: ImageReference = "app:2@sha256:abcd".parse().unwrap();
        assert_eq!(pinned.digest.as_deref(), Some("sha256:abcd"));
        assert_eq!(pinned.to_string(), "app:2@sha256:abcd");

        for bad in ["", "app:", "app@", ":1", "with space:1", "registry/:1"] {
            assert!(bad.parse::<ImageReference>().is_err(), "{bad:?} parsed");
        }
    }

    #[test]
    fn image_equality_is_structural() {
        let a: ImageReference = "app".parse().unwrap();
        let b: ImageReference = "app:latest".parse().unwrap();
        assert_ne!(a, b);
        assert_eq!(b, ImageReference::new("app", "latest"));
        assert_eq!(
            b.with_repository_prefix("registry.local/").to_string(),
            "registry.local/app:latest"
        );
    }

    #[test]
    fn container_state_names() {
        assert_eq!("RUNNING".parse::<ContainerState>().unwrap(), ContainerState::Running);
        assert_eq!(ContainerState::Exited.to_string(), "exited");
        assert!("stopped".parse::<ContainerState>().is_err());
    }

    #[test]
    fn snapshot_from_inspect_prefers_configured_image() {
        let inspect = ContainerInspectResponse {
            name: Some("/web".into()),
            image: Some("sha256:0123".into()),
            config: Some(ContainerConfig {
                image: Some("app:1".into()),
                env: Some(vec!["A=1".into()]),
                ..Default::default()
            }),
            host_config: Some(HostConfig {
                binds: Some(vec!["/srv:/data".into()]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let snapshot = ContainerSnapshot::from_inspect(inspect).unwrap();
        assert_eq!(snapshot.name(), "web");
        assert_eq!(snapshot.image(), "app:1");
        assert_eq!(snapshot.env(), ["A=1".to_owned()]);
        assert_eq!(snapshot.binds(), ["/srv:/data".to_owned()]);

        let next = snapshot.with_image(&"app:2".parse().unwrap());
        assert_eq!(next.image(), "app:2");
        assert_eq!(next.config().image.as_deref(), Some("app:2"));
        assert_eq!(next.host_config(), snapshot.host_config());
        assert_eq!(snapshot.image(), "app:1");
    }

    #[test]
    fn snapshot_from_inspect_requires_name_and_config() {
        let no_config = ContainerInspectResponse {
            name: Some("/web".into()),
            ..Default::default()
        };
        assert!(matches!(
            ContainerSnapshot::from_inspect(no_config),
            Err(RuntimeError::Validation(_))
        ));
        assert!(ContainerSnapshot::from_inspect(ContainerInspectResponse::default()).is_err());
    }
}
