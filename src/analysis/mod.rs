pub mod behavior;
pub mod builder;
pub mod osi;
pub mod payload;
pub mod protocol;
pub mod record;
pub mod tcp_flags;
pub mod thresholds;

pub use builder::PacketRecordBuilder;
pub use record::{CaptureBatch, PacketRecord, RiskLevel};
pub use thresholds::AnalysisThresholds;
