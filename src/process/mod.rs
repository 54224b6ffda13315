pub mod health;
pub mod restart;
pub mod spawner;
pub mod supervisor;
pub mod types;

pub use health::{HealthChecker, HealthProbe, HealthRecord, HealthStatus, PidProbe};
pub use restart::{DenyReason, RestartDecision, RestartHistory, RestartMode, RestartPolicy};
pub use spawner::{spawn_process, SpawnedProcess};
pub use supervisor::Supervisor;
pub use types::{ManagedProcess, ProcessState, ProcessStatus};
