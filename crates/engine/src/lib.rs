//! `fleetlink-engine` — multi-source correlation and attribution engine.
//!
//! Pure engine crate: receives pre-loaded, bounded candidate sets and
//! returns confidence-scored attributions and correlations.
//! No CLI or IO dependencies.

pub mod audit;
pub mod blend;
pub mod config;
pub mod delivery;
pub mod driver;
pub mod error;
pub mod model;
pub mod score;

pub use config::EngineConfig;
pub use driver::resolve_driver;
pub use blend::correlate_delivery;
pub use error::EngineError;
pub use model::{
    CorrelationKind, CorrelationRecord, DriverAttribution, MatchMethod, MatchOutcome,
    QualityTier, ReviewFlag,
};
