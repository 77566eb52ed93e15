pub mod cache;
pub mod data;
pub mod error;
pub mod history;
pub mod integrate;
pub mod io;
pub mod mcmc;
pub mod model;
pub mod ode;
pub mod process;
pub mod progress;
pub mod simulate;
pub mod tree;
pub mod utils;

pub use data::{CharacterData, TipState};
pub use error::{SseError, SseResult};
pub use history::{AncestralStates, CharacterHistory};
pub use model::{CladogeneticEventMap, EpochRates, RateMatrix, RateModel, SpeciationRates};
pub use process::{Condition, ProcessAge, ProcessConfig, SseProcess};
pub use simulate::{ForwardSimulator, SimulatedTree, SimulationConfig, TipConditionedSimulator};
pub use tree::{Tree, TreeNode};
