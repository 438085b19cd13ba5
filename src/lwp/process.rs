/*!
 * Process Types
 * Process identity: credentials, limits, descriptor table, and address space
 */

use super::files::DescriptorTable;
use super::types::LwpId;
use super::vmspace::VmSpace;
use crate::core::limits::DEFAULT_MAX_DESCRIPTORS;
use crate::core::types::Pid;
use ahash::RandomState;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// How a new process obtains its descriptor table from its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForkMode {
    /// Share the parent's table
    ShareFds,
    /// Copy the parent's table
    CopyFds,
    /// Start with an empty table
    CleanFds,
}

/// Process credentials
///
/// Immutable once created; processes share them through an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<u32>,
}

impl Credentials {
    /// Superuser credentials held by proc0
    pub const fn root() -> Self {
        Self {
            uid: 0,
            gid: 0,
            euid: 0,
            egid: 0,
            groups: Vec::new(),
        }
    }

    pub fn user(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            euid: uid,
            egid: gid,
            groups: Vec::new(),
        }
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.euid == 0
    }
}

/// Per-process resource limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_descriptors: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_descriptors: DEFAULT_MAX_DESCRIPTORS,
        }
    }
}

/// Registry-owned process record
pub(crate) struct Process {
    pub pid: Pid,
    pub ppid: Pid,
    pub lwps: HashSet<LwpId, RandomState>,
    pub fds: Arc<DescriptorTable>,
    pub vmspace: VmSpace,
    pub cred: Arc<Credentials>,
    pub limits: Arc<ResourceLimits>,
    pub sigpend: u64,
    pub dead: bool,
}

impl Process {
    /// Derive a child record from `parent`
    pub fn fork(pid: Pid, parent: &Process, mode: ForkMode, vmspace: Option<VmSpace>) -> Self {
        let fds = match mode {
            ForkMode::ShareFds => Arc::clone(&parent.fds),
            ForkMode::CopyFds => Arc::new(parent.fds.duplicate()),
            ForkMode::CleanFds => Arc::new(DescriptorTable::new(parent.limits.max_descriptors)),
        };

        Self {
            pid,
            ppid: parent.pid,
            lwps: HashSet::default(),
            fds,
            vmspace: vmspace.unwrap_or_else(|| parent.vmspace.clone()),
            cred: Arc::clone(&parent.cred),
            limits: Arc::clone(&parent.limits),
            sigpend: 0,
            dead: false,
        }
    }

    pub fn context(&self) -> ProcessContext {
        ProcessContext {
            pid: self.pid,
            ppid: self.ppid,
            fds: Arc::clone(&self.fds),
            vmspace: self.vmspace.clone(),
            cred: Arc::clone(&self.cred),
        }
    }
}

/// Handles to a process's resources, usable without the registry lock
#[derive(Debug, Clone)]
pub struct ProcessContext {
    pub pid: Pid,
    pub ppid: Pid,
    pub fds: Arc<DescriptorTable>,
    pub vmspace: VmSpace,
    pub cred: Arc<Credentials>,
}

/// Serializable process snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub ppid: Pid,
    pub nlwps: usize,
    pub nfds: usize,
    pub vmspace: u64,
    pub dead: bool,
}

impl From<&Process> for ProcessInfo {
    fn from(p: &Process) -> Self {
        Self {
            pid: p.pid,
            ppid: p.ppid,
            nlwps: p.lwps.len(),
            nfds: p.fds.len(),
            vmspace: p.vmspace.id(),
            dead: p.dead,
        }
    }
}
