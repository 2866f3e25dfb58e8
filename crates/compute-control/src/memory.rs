use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::{
    ComputeControlPlane, ControlPlaneError, InstanceDescriptor, InstanceSpec, InstanceState,
    WaitPolicy,
};

const MEMORY_PUBLIC_ADDRESS: &str = "203.0.113.10";

/// What a freshly created instance does on subsequent `get` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateBehavior {
    /// Reports `Running` once `n` more `get` calls have observed it pending.
    ReadyAfter(u32),
    /// Reports `Failed` once `n` more `get` calls have observed it pending.
    FailAfter(u32),
    NeverReady,
}

impl Default for CreateBehavior {
    fn default() -> Self {
        Self::ReadyAfter(1)
    }
}

#[derive(Debug)]
struct MemoryInstance {
    descriptor: InstanceDescriptor,
    pending_polls: Option<u32>,
    behavior: CreateBehavior,
}

#[derive(Debug, Default)]
struct MemoryInner {
    instances: HashMap<String, MemoryInstance>,
    behavior: CreateBehavior,
    create_calls: u32,
    delete_calls: u32,
    get_calls: u32,
    failing_gets: u32,
    last_spec: Option<InstanceSpec>,
}

/// Scripted control plane. Used for local runs (`GATEWAY_CONTROL_PLANE=memory`) and tests.
#[derive(Debug, Default)]
pub struct InMemoryControlPlane {
    inner: Mutex<MemoryInner>,
}

impl InMemoryControlPlane {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_behavior(behavior: CreateBehavior) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                behavior,
                ..MemoryInner::default()
            }),
        }
    }

    /// Seeds an instance as if something else had created it.
    pub async fn insert(&self, descriptor: InstanceDescriptor) {
        let mut inner = self.inner.lock().await;
        let behavior = inner.behavior;
        inner.instances.insert(
            descriptor.name.clone(),
            MemoryInstance {
                descriptor,
                pending_polls: None,
                behavior,
            },
        );
    }

    /// The next `n` calls to `get` fail with a request error.
    pub async fn fail_next_gets(&self, n: u32) {
        self.inner.lock().await.failing_gets = n;
    }

    pub async fn create_calls(&self) -> u32 {
        self.inner.lock().await.create_calls
    }

    pub async fn delete_calls(&self) -> u32 {
        self.inner.lock().await.delete_calls
    }

    pub async fn get_calls(&self) -> u32 {
        self.inner.lock().await.get_calls
    }

    pub async fn last_spec(&self) -> Option<InstanceSpec> {
        self.inner.lock().await.last_spec.clone()
    }
}

#[async_trait]
impl ComputeControlPlane for InMemoryControlPlane {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn create_or_replace(
        &self,
        name: &str,
        spec: &InstanceSpec,
    ) -> Result<String, ControlPlaneError> {
        let mut inner = self.inner.lock().await;
        inner.create_calls = inner.create_calls.saturating_add(1);
        inner.last_spec = Some(spec.clone());

        let behavior = inner.behavior;
        let pending_polls = match behavior {
            CreateBehavior::ReadyAfter(polls) | CreateBehavior::FailAfter(polls) => Some(polls),
            CreateBehavior::NeverReady => None,
        };
        let mut descriptor = InstanceDescriptor::new(name, InstanceState::Waiting);
        descriptor.fqdn = spec
            .dns_name_label
            .as_ref()
            .map(|label| format!("{label}.memory.local"));
        inner.instances.insert(
            name.to_string(),
            MemoryInstance {
                descriptor,
                pending_polls,
                behavior,
            },
        );
        Ok(format!("memory/{name}"))
    }

    async fn get(&self, name: &str) -> Result<Option<InstanceDescriptor>, ControlPlaneError> {
        let mut inner = self.inner.lock().await;
        inner.get_calls = inner.get_calls.saturating_add(1);
        if inner.failing_gets > 0 {
            inner.failing_gets -= 1;
            return Err(ControlPlaneError::Request(
                "injected memory control plane failure".to_string(),
            ));
        }

        let Some(instance) = inner.instances.get_mut(name) else {
            return Ok(None);
        };
        match instance.pending_polls {
            Some(0) => {
                instance.pending_polls = None;
                match instance.behavior {
                    CreateBehavior::ReadyAfter(_) => {
                        instance.descriptor.state = InstanceState::Running;
                        instance.descriptor.started_at = Some(Utc::now());
                        instance.descriptor.public_address =
                            Some(MEMORY_PUBLIC_ADDRESS.to_string());
                    }
                    CreateBehavior::FailAfter(_) => {
                        instance.descriptor.state = InstanceState::Failed;
                    }
                    CreateBehavior::NeverReady => {}
                }
            }
            Some(remaining) => {
                instance.pending_polls = Some(remaining - 1);
                instance.descriptor.state = InstanceState::Starting;
            }
            None => {}
        }
        Ok(Some(instance.descriptor.clone()))
    }

    async fn delete(&self, name: &str, _wait: WaitPolicy) -> Result<(), ControlPlaneError> {
        let mut inner = self.inner.lock().await;
        inner.delete_calls = inner.delete_calls.saturating_add(1);
        inner.instances.remove(name);
        Ok(())
    }
}
