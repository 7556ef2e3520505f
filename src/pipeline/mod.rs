pub mod decode;
pub mod metrics;
pub mod predictor;
pub mod reorder;
pub mod scheduler;

pub use decode::{DecodeEngine, Detection, DecoderVariant};
pub use metrics::{MetricsSnapshot, PerformanceMonitor, Phase};
pub use predictor::{PredictorStats, RegionPredictor};
pub use reorder::ReorderBuffer;
pub use scheduler::{ParallelismController, PipelineHandles, ScanReport, WorkerScheduler};
