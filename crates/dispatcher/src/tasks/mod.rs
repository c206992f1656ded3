//! 具体任务

mod experiment_launcher;
mod experiment_scheduler;
mod heuristic_checker;
mod heuristic_debugger;
mod heuristic_ranker;
mod heuristics_clusterer;
mod server_identificator;
mod servers_checker;

pub use experiment_launcher::ExperimentLauncher;
pub use experiment_scheduler::ExperimentScheduler;
pub use heuristic_checker::HeuristicChecker;
pub use heuristic_debugger::HeuristicDebugger;
pub use heuristic_ranker::HeuristicRanker;
pub use heuristics_clusterer::HeuristicsClusterer;
pub use server_identificator::ServerIdentificator;
pub use servers_checker::ServersChecker;

use scheduler_core::SchedulerResult;
use scheduler_domain::{Heuristic, HeuristicVersion};

use crate::context::TaskContext;

/// 启发式版本连同所属的启发式
#[derive(Debug, Clone)]
pub(crate) struct VersionInfo {
    pub heuristic: Heuristic,
    pub version: HeuristicVersion,
    pub versions_count: usize,
}

impl VersionInfo {
    pub fn fullname(&self) -> String {
        self.version.fullname(&self.heuristic, self.versions_count)
    }

    pub fn absolutename(&self) -> String {
        self.version.absolutename(&self.heuristic)
    }
}

pub(crate) async fn load_version(ctx: &TaskContext, version_id: i64) -> SchedulerResult<Option<VersionInfo>> {
    let heuristics = &ctx.repositories.heuristics;
    let Some(version) = heuristics.find_version(version_id).await? else {
        return Ok(None);
    };
    let Some(heuristic) = heuristics.find_heuristic(version.heuristic_id).await? else {
        return Ok(None);
    };
    let versions_count = heuristics.versions_count(heuristic.id).await?;

    Ok(Some(VersionInfo {
        heuristic,
        version,
        versions_count,
    }))
}
