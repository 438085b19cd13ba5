/*!
 * LWP Module
 * Lightweight processes, process records, and their registry
 */

pub mod arena;
pub mod files;
pub mod process;
pub mod registry;
pub mod types;
pub mod vmspace;

pub use files::{DescriptorTable, KernelFile, MemFile};
pub use process::{Credentials, ForkMode, ProcessContext, ProcessInfo, ResourceLimits};
pub use registry::Registry;
pub use types::{Lwp, LwpFlags, LwpId, LwpInfo, LwpState};
pub use vmspace::{AddressSpace, GuestMemory, VmSpace};
