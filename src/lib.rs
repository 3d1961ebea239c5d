//! Stochastic simulation of population trajectories and of the typed
//! genealogies they imply.
//!
//! Trajectories are simulated forward in time, either exactly (Gillespie) or
//! with a hybrid exact/tau-leaping scheme, and stored as a compact event list.
//! The genealogy of the sampled individuals is then reconstructed by
//! replaying that list backwards.

pub mod catalog;
pub mod condition;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod genealogy;
pub mod logger;
pub mod manager;
pub mod reaction;
pub mod reconstruct;
pub mod sampler;
pub mod state;
pub mod stats;

pub use config::Config;
pub use engine::{Engine, Settings};
pub use error::SimulationError;
pub use genealogy::Genealogy;
pub use manager::Manager;
pub use sampler::Sampler;
pub use state::State;
