//! Swapping a container onto a new image with automatic rollback.
//!
//! An update walks an explicit state machine:
//!
//! ```text
//! Locating -> Recreating -> Verifying -> Succeeded
//!     |            |            |
//!     |            +------------+--> RollingBack -> RolledBack
//!     v                                   |
//!   Failed <------------------------------+ (RollbackFailed)
//! ```
//!
//! Forward and rollback paths share one recreate sequence (remove whatever
//! holds the name, create from the snapshot with a substituted image,
//! start), and the snapshot is captured once in `Locating`, so a rollback
//! recreates exactly the configuration that was running before.
//!
//! Updates of the same container name are serialized by a per-name lock.
//! Each update runs in its own task: dropping the future returned by
//! [`UpdateOrchestrator::update`] does not interrupt a remove/create/start
//! sequence, the task still runs to a terminal state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinError;
use tokio::time::{sleep, Instant};

use crate::error::{Step, UpdateError};
use crate::runtime::ContainerRuntime;
use crate::types::{ContainerRef, ContainerSnapshot, ContainerState, ImageReference, UpdateOutcome};

/// Default period between "is it running yet" checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

// Roughly 30 years, the cap for timeouts too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Default)]
struct NameLocks {
    held: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

struct NameGuard {
    locks: Arc<NameLocks>,
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl NameLocks {
    fn held(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn acquire(locks: &Arc<NameLocks>, name: &str) -> NameGuard {
        let lock = Arc::clone(locks.held().entry(name.to_owned()).or_default());
        let guard = lock.lock_owned().await;
        NameGuard {
            locks: Arc::clone(locks),
            name: name.to_owned(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.held().len()
    }
}

impl Drop for NameGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut held = self.locks.held();
        // Only the map itself still points at the lock: nobody is waiting.
        if held
            .get(&self.name)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            held.remove(&self.name);
        }
    }
}

struct UpdateRequest {
    name: String,
    image: ImageReference,
    force: bool,
    timeout: Duration,
}

enum UpdateState {
    Locating,
    Recreating {
        snapshot: ContainerSnapshot,
        old_image: ImageReference,
    },
    Verifying {
        snapshot: ContainerSnapshot,
        old_image: ImageReference,
    },
    RollingBack {
        snapshot: ContainerSnapshot,
        old_image: ImageReference,
        cause: UpdateError,
    },
    Done(UpdateOutcome),
}

pub struct UpdateOrchestrator<R> {
    runtime: Arc<R>,
    locks: Arc<NameLocks>,
    poll_interval: Duration,
}

impl<R> Clone for UpdateOrchestrator<R> {
    fn clone(&self) -> Self {
        Self {
            runtime: Arc::clone(&self.runtime),
            locks: Arc::clone(&self.locks),
            poll_interval: self.poll_interval,
        }
    }
}

impl<R: ContainerRuntime + 'static> UpdateOrchestrator<R> {
    pub fn new(runtime: R) -> Self {
        Self::from_arc(Arc::new(runtime))
    }

    pub fn from_arc(runtime: Arc<R>) -> Self {
        Self {
            runtime,
            locks: Arc::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    /// Recreates `container_name` from `new_image`, waits up to `timeout` for
    /// it to run, and recreates it from its previous image if anything on
    /// the way fails. Never returns an unclassified error: every failure is
    /// reported through the outcome.
    ///
    /// `force` removes containers without a graceful stop. Updating to the
    /// image already running still performs a full recreate.
    pub async fn update(
        &self,
        container_name: &str,
        new_image: &str,
        force: bool,
        timeout: Duration,
    ) -> UpdateOutcome {
        let image = match new_image.parse::<ImageReference>() {
            Ok(image) => image,
            Err(e) => {
                warn!("Refusing update of {}: {}", container_name, e);
                return UpdateOutcome::failed(e);
            }
        };
        let request = UpdateRequest {
            name: container_name.to_owned(),
            image,
            force,
            timeout,
        };

        let this = self.clone();
        let task = tokio::spawn(async move {
            let _guard = NameLocks::acquire(&this.locks, &request.name).await;
            this.run(&request).await
        });

        match task.await {
            Ok(outcome) => outcome,
            Err(e) => UpdateOutcome::failed(interrupted(container_name, e)),
        }
    }

    /// Plain recreate of `container_name` from `image`: no verification and
    /// no rollback. Runs in its own task under the name lock, like
    /// [`update`](Self::update).
    pub async fn recreate(
        &self,
        container_name: &str,
        image: &str,
        force: bool,
    ) -> Result<ContainerRef, UpdateError> {
        let image: ImageReference = image.parse()?;
        let name = container_name.to_owned();

        let this = self.clone();
        let task = tokio::spawn(async move {
            let _guard = NameLocks::acquire(&this.locks, &name).await;
            match this.locate(&name).await {
                Ok((snapshot, _)) => this.recreate_with(&snapshot, &image, force).await,
                Err(e) => Err(e),
            }
        });

        task.await.unwrap_or_else(|e| Err(interrupted(container_name, e)))
    }

    async fn run(&self, request: &UpdateRequest) -> UpdateOutcome {
        let mut state = UpdateState::Locating;
        loop {
            state = match self.step(request, state).await {
                UpdateState::Done(outcome) => return outcome,
                next => next,
            };
        }
    }

    async fn step(&self, request: &UpdateRequest, state: UpdateState) -> UpdateState {
        let name = request.name.as_str();
        match state {
            UpdateState::Locating => match self.locate(name).await {
                Ok((snapshot, old_image)) => {
                    debug!("{}: locating done, {} -> {}", name, old_image, request.image);
                    UpdateState::Recreating {
                        snapshot,
                        old_image,
                    }
                }
                Err(e) => {
                    warn!("Update of {} aborted: {}", name, e);
                    UpdateState::Done(UpdateOutcome::failed(e))
                }
            },

            UpdateState::Recreating {
                snapshot,
                old_image,
            } => match self.recreate_with(&snapshot, &request.image, request.force).await {
                Ok(container) => {
                    debug!("{}: recreated as {}", name, container.id);
                    UpdateState::Verifying {
                        snapshot,
                        old_image,
                    }
                }
                Err(cause) => UpdateState::RollingBack {
                    snapshot,
                    old_image,
                    cause,
                },
            },

            UpdateState::Verifying {
                snapshot,
                old_image,
            } => {
                if self.wait_running(name, request.timeout).await {
                    info!("Updated {} to {}", name, request.image);
                    UpdateState::Done(UpdateOutcome::succeeded(request.image.clone()))
                } else {
                    UpdateState::RollingBack {
                        snapshot,
                        old_image,
                        cause: UpdateError::NotRunning {
                            name: name.to_owned(),
                            timeout: request.timeout,
                        },
                    }
                }
            }

            UpdateState::RollingBack {
                snapshot,
                old_image,
                cause,
            } => {
                warn!("Rolling back {} to {}: {}", name, old_image, cause);
                match self.recreate_with(&snapshot, &old_image, request.force).await {
                    Ok(_) => {
                        info!("Rolled back {} to {}", name, old_image);
                        UpdateState::Done(UpdateOutcome::rolled_back(old_image, cause))
                    }
                    Err(rollback) => {
                        error!(
                            "Rollback of {} to {} failed: {} (update failure: {}); \
                             the container may not exist, manual intervention required",
                            name, old_image, rollback, cause
                        );
                        UpdateState::Done(UpdateOutcome::failed(UpdateError::RollbackFailed {
                            name: name.to_owned(),
                            original: Box::new(cause),
                            rollback: Box::new(rollback),
                        }))
                    }
                }
            }

            done @ UpdateState::Done(_) => done,
        }
    }

    async fn locate(&self, name: &str) -> Result<(ContainerSnapshot, ImageReference), UpdateError> {
        let container = self
            .runtime
            .find_by_name(name)
            .await
            .map_err(|e| UpdateError::runtime(name, Step::Locate, e))?
            .ok_or_else(|| UpdateError::NotFound(name.to_owned()))?;
        let snapshot = self
            .runtime
            .inspect(&container)
            .await
            .map_err(|e| UpdateError::runtime(name, Step::Inspect, e))?;
        let image = snapshot.image_reference()?;
        Ok((snapshot, image))
    }

    /// Removes whatever currently holds the snapshot's name, then creates and
    /// starts a container from `snapshot` with `image` substituted.
    async fn recreate_with(
        &self,
        snapshot: &ContainerSnapshot,
        image: &ImageReference,
        force: bool,
    ) -> Result<ContainerRef, UpdateError> {
        let name = snapshot.name();
        let current = self
            .runtime
            .find_by_name(name)
            .await
            .map_err(|e| UpdateError::runtime(name, Step::Locate, e))?;
        if let Some(current) = current {
            self.runtime
                .remove(&current, force)
                .await
                .map_err(|e| UpdateError::runtime(name, Step::Remove, e))?;
        }

        let container = self
            .runtime
            .create(&snapshot.with_image(image))
            .await
            .map_err(|e| UpdateError::runtime(name, Step::Create, e))?;
        let started = self
            .runtime
            .start(&container)
            .await
            .map_err(|e| UpdateError::runtime(name, Step::Start, e))?;
        if !started {
            return Err(UpdateError::NotStarted(name.to_owned()));
        }
        Ok(container)
    }

    async fn wait_running(&self, name: &str, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        loop {
            if self.runtime.is_in_state(name, ContainerState::Running).await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

fn interrupted(name: &str, e: JoinError) -> UpdateError {
    error!("Task for {} died: {}", name, e);
    UpdateError::Interrupted {
        name: name.to_owned(),
        reason: e.to_string(),
    }
}

/// `now + timeout`, saturating at [`FAR_FUTURE`] instead of overflowing.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}
