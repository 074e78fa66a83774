//! Process-wide runtime context.

use crate::interface::InterfaceId;
use crate::registry::InstanceTable;
use std::sync::{Arc, OnceLock};

/// State shared by every [`ServiceHost`](crate::host::ServiceHost) built on
/// the same runtime: the table behind `ShareWithin::Process`.
///
/// Hosts normally use [`RpcRuntime::global`]; tests build private runtimes
/// to keep process-shared instances apart.
#[derive(Default)]
pub struct RpcRuntime {
    process_instances: InstanceTable<InterfaceId>,
}

impl RpcRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The runtime shared by the whole process, created on first use.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<RpcRuntime>> = OnceLock::new();
        GLOBAL.get_or_init(RpcRuntime::new).clone()
    }

    pub fn process_instances(&self) -> &InstanceTable<InterfaceId> {
        &self.process_instances
    }

    pub fn process_instance_count(&self) -> usize {
        self.process_instances.len()
    }
}

impl std::fmt::Debug for RpcRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcRuntime")
            .field("process_instances", &self.process_instance_count())
            .finish()
    }
}
