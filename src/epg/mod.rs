//! Electronic Program Guide: scan orchestration and transport-stream
//! table extraction.

pub mod atsc;
pub mod dvb;
pub mod orchestrator;
pub mod parser;
pub mod section;

pub use orchestrator::EpgOrchestrator;
