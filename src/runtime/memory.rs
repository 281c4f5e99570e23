//! In-memory [`ContainerRuntime`] with fault injection and a call log.
//!
//! Containers are plain records; "starting" one flips its state. Failures
//! are keyed by image so a test can make the new image fail while the old one
//! still recreates cleanly (or not).

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::ContainerRuntime;
use crate::error::RuntimeError;
use crate::types::{ContainerRef, ContainerSnapshot, ContainerState};

type CreateHook = Box<dyn Fn(ContainerSnapshot) -> ContainerSnapshot + Send + Sync>;

/// One call made against an [`InMemoryRuntime`], in order.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeCall {
    FindByName(String),
    Inspect(String),
    IsInState(String, ContainerState),
    Remove { id: String, force: bool },
    Create(ContainerSnapshot),
    Start(String),
}

struct Stored {
    id: String,
    snapshot: ContainerSnapshot,
    state: ContainerState,
    // state queries left before a started container counts as running
    warm_up: Option<usize>,
}

#[derive(Default)]
struct Faults {
    create: HashMap<String, RuntimeError>,
    start: HashMap<String, RuntimeError>,
    refuse_start: HashSet<String>,
    never_running: HashSet<String>,
    running_after: HashMap<String, usize>,
    remove: Option<RuntimeError>,
}

#[derive(Default)]
struct Inner {
    containers: Vec<Stored>,
    next_id: u64,
    calls: Vec<RuntimeCall>,
    faults: Faults,
    create_hook: Option<CreateHook>,
}

impl Inner {
    fn next_id(&mut self) -> String {
        self.next_id += 1;
        format!("mem-{:04}", self.next_id)
    }

    fn by_id(&self, id: &str) -> Option<&Stored> {
        self.containers.iter().find(|c| c.id == id)
    }
}

#[derive(Default)]
pub struct InMemoryRuntime {
    inner: Mutex<Inner>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an existing container without recording a call.
    pub fn insert(&self, snapshot: ContainerSnapshot, state: ContainerState) -> ContainerRef {
        let mut inner = self.lock();
        let id = inner.next_id();
        let container = ContainerRef::new(id.clone(), snapshot.name());
        inner.containers.push(Stored {
            id,
            snapshot,
            state,
            warm_up: None,
        });
        container
    }

    pub fn fail_create(&self, image: &str, error: RuntimeError) {
        self.lock().faults.create.insert(image.to_owned(), error);
    }

    pub fn fail_start(&self, image: &str, error: RuntimeError) {
        self.lock().faults.start.insert(image.to_owned(), error);
    }

    /// `start` answers `Ok(false)` for containers of `image`.
    pub fn refuse_start(&self, image: &str) {
        self.lock().faults.refuse_start.insert(image.to_owned());
    }

    /// Containers of `image` start but exit straight away.
    pub fn never_running(&self, image: &str) {
        self.lock().faults.never_running.insert(image.to_owned());
    }

    /// Containers of `image` start, but the first `queries` calls to
    /// `is_in_state` still see them as `Created`.
    pub fn running_after(&self, image: &str, queries: usize) {
        self.lock()
            .faults
            .running_after
            .insert(image.to_owned(), queries);
    }

    /// Every `remove` fails with `error`.
    pub fn fail_remove(&self, error: RuntimeError) {
        self.lock().faults.remove = Some(error);
    }

    /// Rewrites what gets stored on create, to simulate engine-side drift.
    pub fn on_create<F>(&self, hook: F)
    where
        F: Fn(ContainerSnapshot) -> ContainerSnapshot + Send + Sync + 'static,
    {
        self.lock().create_hook = Some(Box::new(hook));
    }

    pub fn set_state(&self, name: &str, state: ContainerState) {
        let mut inner = self.lock();
        for c in inner.containers.iter_mut().filter(|c| c.snapshot.name() == name) {
            c.state = state;
        }
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.lock().calls.clone()
    }

    /// Snapshots passed to `create`, in call order.
    pub fn created(&self) -> Vec<ContainerSnapshot> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                RuntimeCall::Create(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn remove_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, RuntimeCall::Remove { .. }))
            .count()
    }

    /// Stored configuration and state of every container called `name`.
    pub fn containers_named(&self, name: &str) -> Vec<(ContainerSnapshot, ContainerState)> {
        self.lock()
            .containers
            .iter()
            .filter(|c| c.snapshot.name() == name)
            .map(|c| (c.snapshot.clone(), c.state))
            .collect()
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerRef>, RuntimeError> {
        let mut inner = self.lock();
        inner.calls.push(RuntimeCall::FindByName(name.to_owned()));
        Ok(inner
            .containers
            .iter()
            .find(|c| c.snapshot.name() == name)
            .map(|c| ContainerRef::new(c.id.clone(), name)))
    }

    async fn inspect(&self, container: &ContainerRef) -> Result<ContainerSnapshot, RuntimeError> {
        let mut inner = self.lock();
        inner.calls.push(RuntimeCall::Inspect(container.id.clone()));
        inner
            .by_id(&container.id)
            .map(|c| c.snapshot.clone())
            .ok_or_else(|| RuntimeError::NotFound(container.id.clone()))
    }

    async fn is_in_state(&self, name: &str, state: ContainerState) -> bool {
        let mut inner = self.lock();
        inner
            .calls
            .push(RuntimeCall::IsInState(name.to_owned(), state));
        let mut found = false;
        for c in inner.containers.iter_mut().filter(|c| c.snapshot.name() == name) {
            match c.warm_up {
                Some(0) => {
                    c.state = ContainerState::Running;
                    c.warm_up = None;
                }
                Some(left) => c.warm_up = Some(left - 1),
                None => {}
            }
            found |= c.state == state;
        }
        found
    }

    async fn remove(&self, container: &ContainerRef, force: bool) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        inner.calls.push(RuntimeCall::Remove {
            id: container.id.clone(),
            force,
        });
        if let Some(err) = &inner.faults.remove {
            return Err(err.clone());
        }
        let before = inner.containers.len();
        inner.containers.retain(|c| c.id != container.id);
        if inner.containers.len() == before {
            return Err(RuntimeError::NotFound(container.id.clone()));
        }
        Ok(())
    }

    async fn create(&self, snapshot: &ContainerSnapshot) -> Result<ContainerRef, RuntimeError> {
        let mut inner = self.lock();
        inner.calls.push(RuntimeCall::Create(snapshot.clone()));
        if let Some(err) = inner.faults.create.get(snapshot.image()) {
            return Err(err.clone());
        }
        if inner
            .containers
            .iter()
            .any(|c| c.snapshot.name() == snapshot.name())
        {
            return Err(RuntimeError::Validation(format!(
                "container name `{}` is already in use",
                snapshot.name()
            )));
        }

        let stored = match &inner.create_hook {
            Some(hook) => hook(snapshot.clone()),
            None => snapshot.clone(),
        };
        let id = inner.next_id();
        inner.containers.push(Stored {
            id: id.clone(),
            snapshot: stored,
            state: ContainerState::Created,
            warm_up: None,
        });
        Ok(ContainerRef::new(id, snapshot.name()))
    }

    async fn start(&self, container: &ContainerRef) -> Result<bool, RuntimeError> {
        let mut inner = self.lock();
        inner.calls.push(RuntimeCall::Start(container.id.clone()));
        let image = inner
            .by_id(&container.id)
            .map(|c| c.snapshot.image().to_owned())
            .ok_or_else(|| RuntimeError::NotFound(container.id.clone()))?;

        if let Some(err) = inner.faults.start.get(&image) {
            return Err(err.clone());
        }
        if inner.faults.refuse_start.contains(&image) {
            return Ok(false);
        }
        let warm_up = inner.faults.running_after.get(&image).copied();
        let state = if inner.faults.never_running.contains(&image) {
            ContainerState::Exited
        } else if warm_up.is_some() {
            ContainerState::Created
        } else {
            ContainerState::Running
        };
        if let Some(c) = inner.containers.iter_mut().find(|c| c.id == container.id) {
            c.state = state;
            c.warm_up = warm_up;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ContainerSpec;

    fn snapshot(name: &str, image: &str) -> ContainerSnapshot {
        ContainerSpec::new(image, name).build(None).unwrap()
    }

    #[tokio::test]
    async fn create_start_remove_lifecycle() {
        let runtime = InMemoryRuntime::new();
        let web = runtime.create(&snapshot("web", "app:1")).await.unwrap();
        assert!(runtime.is_in_state("web", ContainerState::Created).await);

        assert!(runtime.start(&web).await.unwrap());
        assert!(runtime.is_in_state("web", ContainerState::Running).await);
        assert_eq!(runtime.find_by_name("web").await.unwrap(), Some(web.clone()));

        runtime.remove(&web, true).await.unwrap();
        assert_eq!(runtime.find_by_name("web").await.unwrap(), None);
        assert!(!runtime.is_in_state("web", ContainerState::Running).await);
        assert!(matches!(
            runtime.remove(&web, true).await,
            Err(RuntimeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn names_are_unique() {
        let runtime = InMemoryRuntime::new();
        runtime.insert(snapshot("web", "app:1"), ContainerState::Running);
        let err = runtime.create(&snapshot("web", "app:2")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Validation(_)));
        assert_eq!(runtime.containers_named("web").len(), 1);
    }

    #[tokio::test]
    async fn faults_are_keyed_by_image() {
        let runtime = InMemoryRuntime::new();
        runtime.refuse_start("app:2");
        runtime.never_running("app:3");

        let two = runtime.create(&snapshot("two", "app:2")).await.unwrap();
        assert!(!runtime.start(&two).await.unwrap());

        let three = runtime.create(&snapshot("three", "app:3")).await.unwrap();
        assert!(runtime.start(&three).await.unwrap());
        assert!(runtime.is_in_state("three", ContainerState::Exited).await);
        assert_eq!(runtime.created().len(), 2);
    }

    #[tokio::test]
    async fn running_after_delays_the_running_state() {
        let runtime = InMemoryRuntime::new();
        runtime.running_after("app:2", 2);

        let web = runtime.create(&snapshot("web", "app:2")).await.unwrap();
        assert!(runtime.start(&web).await.unwrap());
        assert!(!runtime.is_in_state("web", ContainerState::Running).await);
        assert!(!runtime.is_in_state("web", ContainerState::Running).await);
        assert!(runtime.is_in_state("web", ContainerState::Running).await);
        assert!(runtime.is_in_state("web", ContainerState::Running).await);
    }
}
