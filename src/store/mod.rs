//! Persistence and the live rule store.

mod file;
mod repository;
mod rules;

pub use file::JsonFileRepository;
pub use repository::{MemoryRepository, PersistedState, Repository};
pub use rules::{RuleSet, RuleStore};
