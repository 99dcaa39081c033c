//! Executor job sizing from recorded utilisation.

use convoy_config::{JobsConfig, ResourceBounds};
use convoy_core::{JobResources, ResourceUtilization};

/// Number of recent builds whose peak usage sizes the next job.
pub const UTILIZATION_LOOKBACK: i64 = 25;

/// Size a job from the pipeline's peak recorded usage, or fall back to the
/// configured defaults when nothing has been recorded yet.
pub fn size_resources(history: Option<ResourceUtilization>, jobs: &JobsConfig) -> JobResources {
    let (cpu_request, cpu_limit) = size(history.map(|h| h.cpu_max_usage), &jobs.cpu);
    let (memory_request, memory_limit) = size(history.map(|h| h.memory_max_usage), &jobs.memory);

    JobResources {
        cpu_request,
        cpu_limit,
        memory_request,
        memory_limit,
    }
}

fn size(max_usage: Option<f64>, bounds: &ResourceBounds) -> (f64, f64) {
    match max_usage.filter(|usage| *usage > 0.0) {
        Some(usage) => ((usage * bounds.request_ratio).clamp(bounds.min, bounds.max), bounds.max),
        None => (bounds.default_request, bounds.default_limit),
    }
}
