//! Session orchestration: multi-turn conversations on top of the pool.

pub mod events;
pub mod model;
pub mod orchestrator;
pub mod skills;

pub use events::{SessionEvent, SessionSubscription};
pub use model::{LogEntry, PendingPermission, RunOptions, Session, SessionStatus};
pub use orchestrator::SessionOrchestrator;
pub use skills::{SkillCatalog, SkillInfo, StaticSkillCatalog, build_skill_prompt};
