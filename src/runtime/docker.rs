use std::io::Read;
use std::time::Duration;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, ListContainersOptions,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, Stats, StatsOptions,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::CreateExecOptions;
use bollard::image::{
    CreateImageOptions, ListImagesOptions, PruneImagesOptions, PushImageOptions, TagImageOptions,
};
use bollard::models::{
    ContainerInspectResponse, ContainerSummary, ImageInspect, ImagePruneResponse, ImageSummary,
    SystemDataUsageResponse,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::stream::{BoxStream, StreamExt};
use log::{debug, info, warn};

use super::ContainerRuntime;
use crate::builder::{ContainerSpec, HostOverrides};
use crate::config::{Config as AppConfig, RegistryConfig};
use crate::error::RuntimeError;
use crate::filters::Filters;
use crate::types::{ContainerRef, ContainerSnapshot, ContainerState, ImageReference};

// 404 on a lookup means the container (or exec, or image) is gone.
fn map_lookup_error(e: BollardError) -> RuntimeError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        e => map_error(e),
    }
}

// 404 on create is the engine failing to resolve the image.
fn map_image_error(e: BollardError) -> RuntimeError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::ImageUnavailable(message),
        e => map_error(e),
    }
}

fn map_error(e: BollardError) -> RuntimeError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 400 | 409,
            message,
        } => RuntimeError::Validation(message),
        BollardError::DockerResponseServerError {
            status_code: 401 | 403,
            message,
        } => RuntimeError::PermissionDenied(message),
        e => RuntimeError::Unavailable(e.to_string()),
    }
}

fn create_config(snapshot: &ContainerSnapshot) -> Config<String> {
    let mut config = Config::from(snapshot.config().clone());
    config.image = Some(snapshot.image().to_owned());
    config.host_config = Some(snapshot.host_config().clone());
    config
}

/// The engine reports names with a leading `/`.
fn has_name(summary: &ContainerSummary, name: &str) -> bool {
    summary
        .names
        .iter()
        .flatten()
        .any(|n| n.trim_start_matches('/') == name)
}

fn container_ref(detail: &ContainerInspectResponse) -> Result<ContainerRef, RuntimeError> {
    let id = detail
        .id
        .clone()
        .ok_or_else(|| RuntimeError::Validation("inspect response has no id".into()))?;
    let name = detail
        .name
        .as_deref()
        .map(|n| n.trim_start_matches('/'))
        .filter(|n| !n.is_empty())
        .unwrap_or(&id)
        .to_owned();
    Ok(ContainerRef::new(id, name))
}

// The engine wraps the requested path in a tar archive; a single file comes
// back as its only entry.
fn extract_file(archive: &[u8], path: &str) -> Result<Vec<u8>, RuntimeError> {
    let unreadable =
        |e: std::io::Error| RuntimeError::Unavailable(format!("archive of `{path}`: {e}"));
    let mut archive = tar::Archive::new(archive);
    let mut entry = archive
        .entries()
        .map_err(unreadable)?
        .next()
        .ok_or_else(|| RuntimeError::NotFound(format!("`{path}` came back empty")))?
        .map_err(unreadable)?;
    if !entry.header().entry_type().is_file() {
        return Err(RuntimeError::Validation(format!(
            "`{path}` is not a regular file"
        )));
    }
    let mut content = Vec::new();
    entry.read_to_end(&mut content).map_err(unreadable)?;
    Ok(content)
}

/// Extra switches for [`DockerRuntime::remove_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    pub force: bool,
    pub volumes: bool,
    pub links: bool,
}

/// Image to pull, optionally from a registry other than the default one.
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub registry: Option<String>,
    pub image: ImageReference,
    pub credentials: Option<DockerCredentials>,
}

/// Image to push to `registry`; it must already be tagged for it
/// (see [`DockerRuntime::tag_for_push`]).
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub registry: String,
    pub image: ImageReference,
    pub credentials: Option<DockerCredentials>,
}

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub commands: Vec<String>,
    pub working_dir: Option<String>,
    pub privileged: bool,
}

impl ExecRequest {
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
            working_dir: None,
            privileged: true,
        }
    }
}

impl From<&RegistryConfig> for DockerCredentials {
    fn from(registry: &RegistryConfig) -> Self {
        DockerCredentials {
            username: registry.username.clone(),
            password: registry.password.clone(),
            serveraddress: Some(registry.server.clone()),
            ..Default::default()
        }
    }
}

/// [`ContainerRuntime`] backed by the Docker Engine API through bollard,
/// plus the convenience operations that compose engine calls.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connects to the engine named by `docker_host`, or to the local
    /// defaults (`DOCKER_HOST`, then the unix socket) when it is unset.
    pub fn connect(config: &AppConfig) -> Result<Self, RuntimeError> {
        let timeout = config.client_timeout_secs;
        let docker = match config.docker_host.as_deref() {
            None => Docker::connect_with_local_defaults()
                .map(|d| d.with_timeout(Duration::from_secs(timeout))),
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_unix(host, timeout, API_DEFAULT_VERSION)
            }
            Some(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
                Docker::connect_with_http(host, timeout, API_DEFAULT_VERSION)
            }
            Some(host) => {
                return Err(RuntimeError::Validation(format!(
                    "unsupported docker host `{host}`"
                )))
            }
        }
        .map_err(map_error)?;
        info!(
            "Connected to docker engine at {}",
            config.docker_host.as_deref().unwrap_or("local defaults")
        );
        Ok(Self { docker })
    }

    pub fn client(&self) -> &Docker {
        &self.docker
    }

    /// Creates and starts a container from `spec`. The flag is whether the
    /// engine actually started it.
    pub async fn container_up(
        &self,
        spec: &ContainerSpec,
        overrides: Option<&HostOverrides>,
    ) -> Result<(ContainerRef, bool), RuntimeError> {
        let snapshot = spec.build(overrides)?;
        let container = self.create(&snapshot).await?;
        let started = self.start(&container).await?;
        Ok((container, started))
    }

    pub async fn start_by_id(&self, id: &str) -> Result<bool, RuntimeError> {
        let container = ContainerRef::new(id, id);
        self.start(&container).await
    }

    /// Looks a container up by name, full id or unique id prefix.
    pub async fn find_container(
        &self,
        name_or_id: &str,
    ) -> Result<Option<ContainerRef>, RuntimeError> {
        match self.docker.inspect_container(name_or_id, None).await {
            Ok(detail) => container_ref(&detail).map(Some),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(map_error(e)),
        }
    }

    pub async fn inspect_raw(&self, name: &str) -> Result<ContainerInspectResponse, RuntimeError> {
        self.docker
            .inspect_container(name, None)
            .await
            .map_err(map_lookup_error)
    }

    /// Stops a container, killing it after `wait_secs`. `Ok(false)` when it
    /// was not running.
    pub async fn stop(
        &self,
        container: &ContainerRef,
        wait_secs: Option<i64>,
    ) -> Result<bool, RuntimeError> {
        let options = wait_secs.map(|t| StopContainerOptions { t });
        match self.docker.stop_container(&container.id, options).await {
            Ok(()) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(false),
            Err(e) => Err(map_lookup_error(e)),
        }
    }

    pub async fn restart(&self, container: &ContainerRef) -> Result<(), RuntimeError> {
        self.docker
            .restart_container(&container.id, None::<RestartContainerOptions>)
            .await
            .map_err(map_lookup_error)
    }

    pub async fn remove_with(
        &self,
        container: &ContainerRef,
        options: RemoveOptions,
    ) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                &container.id,
                Some(RemoveContainerOptions {
                    force: options.force,
                    v: options.volumes,
                    link: options.links,
                }),
            )
            .await
            .map_err(map_lookup_error)?;
        debug!("Removed container {} ({})", container.name, container.id);
        Ok(())
    }

    pub async fn list_containers(
        &self,
        all: bool,
        filters: &Filters,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all,
            filters: filters.to_map(),
            ..Default::default()
        };
        self.docker
            .list_containers(Some(options))
            .await
            .map_err(map_error)
    }

    pub async fn containers_by_image(
        &self,
        image: &ImageReference,
        all: bool,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.list_containers(all, &Filters::single("ancestor", image.to_string()))
            .await
    }

    pub async fn running_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.list_containers(
            false,
            &Filters::single("status", ContainerState::Running.as_str()),
        )
        .await
    }

    pub async fn container_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        Ok(self.find_by_name(name).await?.is_some())
    }

    pub async fn tag_image(
        &self,
        source: &ImageReference,
        target: &ImageReference,
    ) -> Result<(), RuntimeError> {
        let options = TagImageOptions {
            repo: target.repository.clone(),
            tag: target.tag_or_latest().to_owned(),
        };
        self.docker
            .tag_image(&source.to_string(), Some(options))
            .await
            .map_err(map_image_error)?;
        debug!("Tagged {} as {}", source, target);
        Ok(())
    }

    /// Tags `image` as `registry/image` and returns the new reference.
    pub async fn tag_for_push(
        &self,
        registry: &str,
        image: &ImageReference,
    ) -> Result<ImageReference, RuntimeError> {
        let target = image.with_repository_prefix(registry);
        self.tag_image(image, &target).await?;
        Ok(target)
    }

    /// Pulls an image, returning the reference that was pulled.
    pub async fn pull_image(&self, request: &PullRequest) -> Result<ImageReference, RuntimeError> {
        let image = match &request.registry {
            Some(registry) => request.image.with_repository_prefix(registry),
            None => request.image.clone(),
        };
        info!("Pulling image {}", image);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self
            .docker
            .create_image(Some(options), None, request.credentials.clone());
        while let Some(progress) = stream.next().await {
            let progress = progress.map_err(map_image_error)?;
            if let Some(error) = progress.error {
                return Err(RuntimeError::ImageUnavailable(format!("{image}: {error}")));
            }
            if let Some(status) = progress.status {
                debug!("Pull {}: {}", image, status);
            }
        }

        info!("Pulled image {}", image);
        Ok(image)
    }

    pub async fn push_image(&self, request: &PushRequest) -> Result<(), RuntimeError> {
        let target = request.image.with_repository_prefix(&request.registry);
        info!("Pushing image {}", target);

        let options = PushImageOptions {
            tag: target.tag_or_latest().to_owned(),
        };
        let mut stream = self.docker.push_image(
            &target.name_only(),
            Some(options),
            request.credentials.clone(),
        );
        while let Some(progress) = stream.next().await {
            let progress = progress.map_err(map_image_error)?;
            if let Some(error) = progress.error {
                return Err(RuntimeError::ImageUnavailable(format!("{target}: {error}")));
            }
            if let Some(status) = progress.status {
                debug!("Push {}: {}", target, status);
            }
        }

        info!("Pushed image {}", target);
        Ok(())
    }

    /// Looks an image up by name, id or digest.
    pub async fn get_image(&self, name_or_id: &str) -> Result<Option<ImageInspect>, RuntimeError> {
        match self.docker.inspect_image(name_or_id).await {
            Ok(image) => Ok(Some(image)),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(map_error(e)),
        }
    }

    pub async fn list_images(
        &self,
        all: bool,
        filters: &Filters,
    ) -> Result<Vec<ImageSummary>, RuntimeError> {
        let options = ListImagesOptions::<String> {
            all,
            filters: filters.to_map(),
            ..Default::default()
        };
        self.docker
            .list_images(Some(options))
            .await
            .map_err(map_error)
    }

    pub async fn dangling_images(&self) -> Result<Vec<ImageSummary>, RuntimeError> {
        self.list_images(true, &Filters::single("dangling", "true"))
            .await
    }

    pub async fn prune_images(&self) -> Result<ImagePruneResponse, RuntimeError> {
        self.docker
            .prune_images(None::<PruneImagesOptions<String>>)
            .await
            .map_err(map_error)
    }

    /// Creates an exec instance in the container and returns its id. The
    /// exec is not started.
    pub async fn exec(
        &self,
        container: &ContainerRef,
        request: &ExecRequest,
    ) -> Result<String, RuntimeError> {
        if request.commands.is_empty() {
            return Err(RuntimeError::Validation("exec without a command".into()));
        }
        let options = CreateExecOptions {
            cmd: Some(request.commands.clone()),
            privileged: Some(request.privileged),
            working_dir: request.working_dir.clone(),
            ..Default::default()
        };
        let created = self
            .docker
            .create_exec(&container.id, options)
            .await
            .map_err(map_lookup_error)?;
        debug!("Created exec {} in {}", created.id, container.name);
        Ok(created.id)
    }

    /// Tar archive of `path` inside the container, chunk by chunk as the
    /// engine sends it.
    pub fn file_stream(
        &self,
        container: &ContainerRef,
        path: &str,
    ) -> BoxStream<'static, Result<Vec<u8>, RuntimeError>> {
        self.docker
            .download_from_container(
                &container.id,
                Some(DownloadFromContainerOptions {
                    path: path.to_owned(),
                }),
            )
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(map_lookup_error))
            .boxed()
    }

    /// Contents of the regular file at `path` inside the container.
    pub async fn read_file(
        &self,
        container: &ContainerRef,
        path: &str,
    ) -> Result<Vec<u8>, RuntimeError> {
        let mut archive = Vec::new();
        let mut chunks = self.file_stream(container, path);
        while let Some(chunk) = chunks.next().await {
            archive.extend_from_slice(&chunk?);
        }
        debug!(
            "Downloaded {} ({} bytes of archive) from {}",
            path,
            archive.len(),
            container.name
        );
        extract_file(&archive, path)
    }

    pub async fn read_text_file(
        &self,
        container: &ContainerRef,
        path: &str,
    ) -> Result<String, RuntimeError> {
        String::from_utf8(self.read_file(container, path).await?)
            .map_err(|_| RuntimeError::Validation(format!("`{path}` is not UTF-8 text")))
    }

    /// Resource usage samples, one (`stream == false`) or continuous.
    pub fn stats(
        &self,
        container: &ContainerRef,
        stream: bool,
    ) -> BoxStream<'static, Result<Stats, RuntimeError>> {
        self.docker
            .stats(
                &container.id,
                Some(StatsOptions {
                    stream,
                    one_shot: !stream,
                }),
            )
            .map(|sample| sample.map_err(map_lookup_error))
            .boxed()
    }

    /// Disk usage of images, containers, volumes and build cache.
    pub async fn disk_usage(&self) -> Result<SystemDataUsageResponse, RuntimeError> {
        self.docker.df().await.map_err(map_error)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerRef>, RuntimeError> {
        // The engine's `name` filter is a substring match.
        let containers = self
            .list_containers(true, &Filters::single("name", name))
            .await?;
        Ok(containers
            .iter()
            .find(|c| has_name(c, name))
            .and_then(|c| c.id.clone())
            .map(|id| ContainerRef::new(id, name)))
    }

    async fn inspect(&self, container: &ContainerRef) -> Result<ContainerSnapshot, RuntimeError> {
        let detail = self.inspect_raw(&container.id).await?;
        ContainerSnapshot::from_inspect(detail)
    }

    async fn is_in_state(&self, name: &str, state: ContainerState) -> bool {
        let filters = Filters::single("name", name).with("status", state.as_str());
        match self.list_containers(true, &filters).await {
            Ok(containers) => containers.iter().any(|c| has_name(c, name)),
            Err(e) => {
                warn!("Failed to query state of {}: {}", name, e);
                false
            }
        }
    }

    async fn remove(&self, container: &ContainerRef, force: bool) -> Result<(), RuntimeError> {
        self.remove_with(
            container,
            RemoveOptions {
                force,
                ..Default::default()
            },
        )
        .await
    }

    async fn create(&self, snapshot: &ContainerSnapshot) -> Result<ContainerRef, RuntimeError> {
        let options = CreateContainerOptions {
            name: snapshot.name().to_owned(),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(Some(options), create_config(snapshot))
            .await
            .map_err(map_image_error)?;
        for warning in &created.warnings {
            warn!("Engine warning creating {}: {}", snapshot.name(), warning);
        }
        debug!(
            "Created container {} ({}) from {}",
            snapshot.name(),
            created.id,
            snapshot.image()
        );
        Ok(ContainerRef::new(created.id, snapshot.name()))
    }

    async fn start(&self, container: &ContainerRef) -> Result<bool, RuntimeError> {
        match self
            .docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {
                debug!("Started container {} ({})", container.name, container.id);
                Ok(true)
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(false),
            Err(e) => Err(map_lookup_error(e)),
        }
    }
}
