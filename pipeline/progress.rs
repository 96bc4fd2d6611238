use std::fmt;

/// Stages reported while a pipeline runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    FirstLevelSubjects,
    GroupContrasts,
}

impl PipelineStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::FirstLevelSubjects => "first-level subject fits",
            Self::GroupContrasts => "group contrast maps",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress. Methods take `&self` because
/// first-level subjects report from worker threads.
pub trait ProgressObserver: Sync {
    fn on_stage_start(&self, stage: PipelineStage, total_items: usize) {
        let _ = (stage, total_items);
    }
    fn on_stage_advance(&self, stage: PipelineStage, processed_items: usize) {
        let _ = (stage, processed_items);
    }
    fn on_stage_finish(&self, stage: PipelineStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {}
