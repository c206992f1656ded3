//! 命令与事件
//!
//! 调度器内部使用封闭的 [`Command`] / [`Event`] 枚举；消息名称字符串只出现在
//! 线路协议边界，由 [`Command::from_message`] / [`Event::from_message`] 负责转换。

use scheduler_core::{Message, MessageSignature, ParamKind, SchedulerError, SchedulerResult};

const INT: &[ParamKind] = &[ParamKind::Int];
const STR: &[ParamKind] = &[ParamKind::Str];
const NONE: &[ParamKind] = &[];

/// 所有命令的签名
pub mod commands {
    use super::*;

    pub const CHECK_HEURISTIC: MessageSignature = MessageSignature::new("CHECK_HEURISTIC", INT);
    pub const RUN_EXPERIMENT: MessageSignature = MessageSignature::new("RUN_EXPERIMENT", INT);
    pub const CANCEL_EXPERIMENT: MessageSignature = MessageSignature::new("CANCEL_EXPERIMENT", INT);
    pub const SCHEDULE_PUBLIC_EXPERIMENTS: MessageSignature =
        MessageSignature::new("SCHEDULE_PUBLIC_EXPERIMENTS", NONE);
    pub const SCHEDULE_HEURISTIC_EVALUATION: MessageSignature =
        MessageSignature::new("SCHEDULE_HEURISTIC_EVALUATION", INT);
    pub const EVALUATE_ALL_HEURISTICS: MessageSignature =
        MessageSignature::new("EVALUATE_ALL_HEURISTICS", NONE);
    pub const SCHEDULE_HEURISTIC_SIGNATURE_RECORDING: MessageSignature =
        MessageSignature::new("SCHEDULE_HEURISTIC_SIGNATURE_RECORDING", INT);
    pub const RECORD_ALL_HEURISTIC_SIGNATURES: MessageSignature =
        MessageSignature::new("RECORD_ALL_HEURISTIC_SIGNATURES", NONE);
    pub const DEBUG_HEURISTIC: MessageSignature = MessageSignature::new("DEBUG_HEURISTIC", INT);
    pub const CLUSTER_HEURISTICS: MessageSignature = MessageSignature::new("CLUSTER_HEURISTICS", STR);
    pub const IDENTIFY_SERVER: MessageSignature = MessageSignature::new("IDENTIFY_SERVER", INT);
    pub const CHECK_SERVERS_STATUS: MessageSignature =
        MessageSignature::new("CHECK_SERVERS_STATUS", NONE);
    pub const RANK_HEURISTIC_VERSION: MessageSignature =
        MessageSignature::new("RANK_HEURISTIC_VERSION", INT);
    pub const RANK_EVALUATED_HEURISTICS: MessageSignature =
        MessageSignature::new("RANK_EVALUATED_HEURISTICS", NONE);

    pub const ALL: &[MessageSignature] = &[
        CHECK_HEURISTIC,
        RUN_EXPERIMENT,
        CANCEL_EXPERIMENT,
        SCHEDULE_PUBLIC_EXPERIMENTS,
        SCHEDULE_HEURISTIC_EVALUATION,
        EVALUATE_ALL_HEURISTICS,
        SCHEDULE_HEURISTIC_SIGNATURE_RECORDING,
        RECORD_ALL_HEURISTIC_SIGNATURES,
        DEBUG_HEURISTIC,
        CLUSTER_HEURISTICS,
        IDENTIFY_SERVER,
        CHECK_SERVERS_STATUS,
        RANK_HEURISTIC_VERSION,
        RANK_EVALUATED_HEURISTICS,
    ];
}

/// 所有事件的签名
pub mod events {
    use super::*;

    pub const HEURISTIC_CHECKED: MessageSignature = MessageSignature::new("EVT_HEURISTIC_CHECKED", INT);
    pub const PUBLIC_EXPERIMENT_DONE: MessageSignature =
        MessageSignature::new("EVT_PUBLIC_EXPERIMENT_DONE", INT);
    pub const PUBLIC_EXPERIMENT_FAILED: MessageSignature =
        MessageSignature::new("EVT_PUBLIC_EXPERIMENT_FAILED", INT);
    pub const EXPERIMENT_CANCELLED: MessageSignature =
        MessageSignature::new("EVT_EXPERIMENT_CANCELLED", INT);
    pub const HEURISTIC_SIGNATURE_RECORDED: MessageSignature =
        MessageSignature::new("EVT_HEURISTIC_SIGNATURE_RECORDED", INT);
    pub const HEURISTIC_EVALUATED: MessageSignature =
        MessageSignature::new("EVT_HEURISTIC_EVALUATED", INT);
    pub const HEURISTICS_CLUSTERING_DONE: MessageSignature =
        MessageSignature::new("EVT_HEURISTICS_CLUSTERING_DONE", STR);

    pub const ALL: &[MessageSignature] = &[
        HEURISTIC_CHECKED,
        PUBLIC_EXPERIMENT_DONE,
        PUBLIC_EXPERIMENT_FAILED,
        EXPERIMENT_CANCELLED,
        HEURISTIC_SIGNATURE_RECORDED,
        HEURISTIC_EVALUATED,
        HEURISTICS_CLUSTERING_DONE,
    ];
}

fn find_signature(all: &[MessageSignature], name: &str) -> Option<MessageSignature> {
    all.iter().copied().find(|s| s.name == name)
}

/// 调度器命令
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CheckHeuristic { heuristic_version_id: i64 },
    RunExperiment { experiment_id: i64 },
    CancelExperiment { experiment_id: i64 },
    SchedulePublicExperiments,
    ScheduleHeuristicEvaluation { heuristic_version_id: i64 },
    EvaluateAllHeuristics,
    ScheduleHeuristicSignatureRecording { heuristic_version_id: i64 },
    RecordAllHeuristicSignatures,
    DebugHeuristic { debugging_entry_id: i64 },
    ClusterHeuristics { algorithm: String },
    IdentifyServer { server_id: i64 },
    CheckServersStatus,
    RankHeuristicVersion { heuristic_version_id: i64 },
    RankEvaluatedHeuristics,
}

impl Command {
    pub fn signature(&self) -> MessageSignature {
        use commands::*;
        match self {
            Command::CheckHeuristic { .. } => CHECK_HEURISTIC,
            Command::RunExperiment { .. } => RUN_EXPERIMENT,
            Command::CancelExperiment { .. } => CANCEL_EXPERIMENT,
            Command::SchedulePublicExperiments => SCHEDULE_PUBLIC_EXPERIMENTS,
            Command::ScheduleHeuristicEvaluation { .. } => SCHEDULE_HEURISTIC_EVALUATION,
            Command::EvaluateAllHeuristics => EVALUATE_ALL_HEURISTICS,
            Command::ScheduleHeuristicSignatureRecording { .. } => SCHEDULE_HEURISTIC_SIGNATURE_RECORDING,
            Command::RecordAllHeuristicSignatures => RECORD_ALL_HEURISTIC_SIGNATURES,
            Command::DebugHeuristic { .. } => DEBUG_HEURISTIC,
            Command::ClusterHeuristics { .. } => CLUSTER_HEURISTICS,
            Command::IdentifyServer { .. } => IDENTIFY_SERVER,
            Command::CheckServersStatus => CHECK_SERVERS_STATUS,
            Command::RankHeuristicVersion { .. } => RANK_HEURISTIC_VERSION,
            Command::RankEvaluatedHeuristics => RANK_EVALUATED_HEURISTICS,
        }
    }

    /// 校验参数并转换为命令
    pub fn from_message(message: &Message) -> SchedulerResult<Command> {
        let signature = find_signature(commands::ALL, message.name())
            .ok_or_else(|| SchedulerError::InvalidMessage(format!("未知的命令: {message}")))?;
        let message = message.conform(signature.params)?;

        let command = match signature.name {
            "CHECK_HEURISTIC" => Command::CheckHeuristic {
                heuristic_version_id: message.int_param(0)?,
            },
            "RUN_EXPERIMENT" => Command::RunExperiment {
                experiment_id: message.int_param(0)?,
            },
            "CANCEL_EXPERIMENT" => Command::CancelExperiment {
                experiment_id: message.int_param(0)?,
            },
            "SCHEDULE_PUBLIC_EXPERIMENTS" => Command::SchedulePublicExperiments,
            "SCHEDULE_HEURISTIC_EVALUATION" => Command::ScheduleHeuristicEvaluation {
                heuristic_version_id: message.int_param(0)?,
            },
            "EVALUATE_ALL_HEURISTICS" => Command::EvaluateAllHeuristics,
            "SCHEDULE_HEURISTIC_SIGNATURE_RECORDING" => Command::ScheduleHeuristicSignatureRecording {
                heuristic_version_id: message.int_param(0)?,
            },
            "RECORD_ALL_HEURISTIC_SIGNATURES" => Command::RecordAllHeuristicSignatures,
            "DEBUG_HEURISTIC" => Command::DebugHeuristic {
                debugging_entry_id: message.int_param(0)?,
            },
            "CLUSTER_HEURISTICS" => Command::ClusterHeuristics {
                algorithm: message.str_param(0)?,
            },
            "IDENTIFY_SERVER" => Command::IdentifyServer {
                server_id: message.int_param(0)?,
            },
            "RANK_HEURISTIC_VERSION" => Command::RankHeuristicVersion {
                heuristic_version_id: message.int_param(0)?,
            },
            "RANK_EVALUATED_HEURISTICS" => Command::RankEvaluatedHeuristics,
            _ => Command::CheckServersStatus,
        };

        Ok(command)
    }

    pub fn to_message(&self) -> Message {
        let name = self.signature().name;
        match self {
            Command::CheckHeuristic { heuristic_version_id }
            | Command::ScheduleHeuristicEvaluation { heuristic_version_id }
            | Command::ScheduleHeuristicSignatureRecording { heuristic_version_id }
            | Command::RankHeuristicVersion { heuristic_version_id } => {
                Message::new(name, vec![(*heuristic_version_id).into()])
            }
            Command::RunExperiment { experiment_id } | Command::CancelExperiment { experiment_id } => {
                Message::new(name, vec![(*experiment_id).into()])
            }
            Command::DebugHeuristic { debugging_entry_id } => {
                Message::new(name, vec![(*debugging_entry_id).into()])
            }
            Command::ClusterHeuristics { algorithm } => Message::new(name, vec![algorithm.as_str().into()]),
            Command::IdentifyServer { server_id } => Message::new(name, vec![(*server_id).into()]),
            Command::SchedulePublicExperiments
            | Command::EvaluateAllHeuristics
            | Command::RecordAllHeuristicSignatures
            | Command::CheckServersStatus
            | Command::RankEvaluatedHeuristics => Message::named(name),
        }
    }
}

/// 任务之间传递的事件
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    HeuristicChecked { heuristic_version_id: i64 },
    PublicExperimentDone { experiment_id: i64 },
    PublicExperimentFailed { experiment_id: i64 },
    ExperimentCancelled { experiment_id: i64 },
    HeuristicSignatureRecorded { heuristic_version_id: i64 },
    HeuristicEvaluated { heuristic_version_id: i64 },
    HeuristicsClusteringDone { algorithm: String },
}

impl Event {
    pub fn signature(&self) -> MessageSignature {
        use events::*;
        match self {
            Event::HeuristicChecked { .. } => HEURISTIC_CHECKED,
            Event::PublicExperimentDone { .. } => PUBLIC_EXPERIMENT_DONE,
            Event::PublicExperimentFailed { .. } => PUBLIC_EXPERIMENT_FAILED,
            Event::ExperimentCancelled { .. } => EXPERIMENT_CANCELLED,
            Event::HeuristicSignatureRecorded { .. } => HEURISTIC_SIGNATURE_RECORDED,
            Event::HeuristicEvaluated { .. } => HEURISTIC_EVALUATED,
            Event::HeuristicsClusteringDone { .. } => HEURISTICS_CLUSTERING_DONE,
        }
    }

    pub fn from_message(message: &Message) -> SchedulerResult<Event> {
        let signature = find_signature(events::ALL, message.name())
            .ok_or_else(|| SchedulerError::InvalidMessage(format!("未知的事件: {message}")))?;
        let message = message.conform(signature.params)?;

        let event = match signature.name {
            "EVT_HEURISTIC_CHECKED" => Event::HeuristicChecked {
                heuristic_version_id: message.int_param(0)?,
            },
            "EVT_PUBLIC_EXPERIMENT_DONE" => Event::PublicExperimentDone {
                experiment_id: message.int_param(0)?,
            },
            "EVT_PUBLIC_EXPERIMENT_FAILED" => Event::PublicExperimentFailed {
                experiment_id: message.int_param(0)?,
            },
            "EVT_EXPERIMENT_CANCELLED" => Event::ExperimentCancelled {
                experiment_id: message.int_param(0)?,
            },
            "EVT_HEURISTIC_SIGNATURE_RECORDED" => Event::HeuristicSignatureRecorded {
                heuristic_version_id: message.int_param(0)?,
            },
            "EVT_HEURISTIC_EVALUATED" => Event::HeuristicEvaluated {
                heuristic_version_id: message.int_param(0)?,
            },
            _ => Event::HeuristicsClusteringDone {
                algorithm: message.str_param(0)?,
            },
        };

        Ok(event)
    }

    pub fn to_message(&self) -> Message {
        let name = self.signature().name;
        match self {
            Event::HeuristicChecked { heuristic_version_id }
            | Event::HeuristicSignatureRecorded { heuristic_version_id }
            | Event::HeuristicEvaluated { heuristic_version_id } => {
                Message::new(name, vec![(*heuristic_version_id).into()])
            }
            Event::PublicExperimentDone { experiment_id }
            | Event::PublicExperimentFailed { experiment_id }
            | Event::ExperimentCancelled { experiment_id } => Message::new(name, vec![(*experiment_id).into()]),
            Event::HeuristicsClusteringDone { algorithm } => Message::new(name, vec![algorithm.as_str().into()]),
        }
    }
}

/// 判断消息名称是否是事件
pub fn is_event(name: &str) -> bool {
    name.starts_with("EVT_")
}
