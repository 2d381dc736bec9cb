// CLI subcommand definitions using clap derive macros
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::SipFlowError;
use crate::reporter::{compare_results, load_json_result, ComparisonReport};
use crate::scenario::media::{media_report, MediaReport};
use crate::scenario::template::request_method;
use crate::scenario::{self, ScenarioModel, ScenarioStep};

/// SIPコールフロー実行ツール
#[derive(Parser, Debug, PartialEq)]
#[command(name = "sip-flow-runner")]
pub enum Cli {
    /// シナリオを実行する
    Run {
        /// JSON設定ファイルパス
        config: PathBuf,
        /// JSON結果出力先
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// シナリオ定義を検証する
    Validate {
        /// シナリオJSONファイル
        scenario: PathBuf,
    },
    /// シナリオのステップとメディア利用を表示する
    Inspect {
        /// シナリオJSONファイル
        scenario: PathBuf,
    },
    /// 結果を比較する
    Compare {
        /// 現在の結果JSONファイル
        current: PathBuf,
        /// 過去の結果JSONファイル
        previous: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepInfo {
    pub index: usize,
    pub kind: &'static str,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioInspection {
    pub name: String,
    pub steps: Vec<StepInfo>,
    pub media: MediaReport,
}

fn describe(step: &ScenarioStep) -> String {
    match step {
        ScenarioStep::Send { template } => match request_method(template) {
            Some(method) => method.to_string(),
            None => "response".to_string(),
        },
        ScenarioStep::ExpectRecv {
            rule,
            timeout_ms,
            optional,
        } => {
            let mut s = format!("{} within {}ms", rule, timeout_ms);
            if *optional {
                s.push_str(" (optional)");
            }
            s
        }
        ScenarioStep::Pause { duration_ms: Some(ms) } => format!("{}ms", ms),
        ScenarioStep::Pause { duration_ms: None } => "default".to_string(),
        ScenarioStep::LoopMarker { label } => label.clone(),
        ScenarioStep::Branch { target, .. } => format!("-> {}", target),
        ScenarioStep::PlayMedia { asset } => asset.clone(),
    }
}

pub fn inspect(model: &ScenarioModel) -> ScenarioInspection {
    ScenarioInspection {
        name: model.name().to_string(),
        steps: model
            .steps()
            .iter()
            .enumerate()
            .map(|(index, step)| StepInfo {
                index,
                kind: step.kind(),
                detail: describe(step),
            })
            .collect(),
        media: media_report(model),
    }
}

/// validateサブコマンドの実行
pub fn run_validate(path: &Path) -> Result<ScenarioModel, SipFlowError> {
    let model = scenario::load_from_file(path)?;
    println!("{}: ok ({} steps)", path.display(), model.len());
    Ok(model)
}

/// inspectサブコマンドの実行
///
/// ステップ一覧とメディア情報をJSON形式で標準出力に表示する。
pub fn run_inspect(path: &Path) -> Result<ScenarioInspection, SipFlowError> {
    let model = scenario::load_from_file(path)?;
    let inspection = inspect(&model);
    let json = serde_json::to_string_pretty(&inspection).map_err(|e| {
        SipFlowError::ConfigError(format!("Failed to serialize inspection: {}", e))
    })?;
    println!("{}", json);
    Ok(inspection)
}

/// compareサブコマンドの実行
///
/// 2つのJSON結果ファイルを読み込み、compare_resultsで比較し、
/// 比較レポートをJSON形式で標準出力に表示する。
pub fn run_compare(current_path: &Path, previous_path: &Path) -> Result<ComparisonReport, SipFlowError> {
    let current = load_json_result(current_path)
        .map_err(|e| SipFlowError::ConfigError(format!("{:#}", e)))?;
    let previous = load_json_result(previous_path)
        .map_err(|e| SipFlowError::ConfigError(format!("{:#}", e)))?;

    let report = compare_results(&current, &previous);
    let report_json = serde_json::to_string_pretty(&report).map_err(|e| {
        SipFlowError::ConfigError(format!("Failed to serialize comparison report: {}", e))
    })?;
    println!("{}", report_json);
    Ok(report)
}
