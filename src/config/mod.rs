// Configuration manager module
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::data_source::DataSourceOptions;
use crate::dialog::DialogContext;
use crate::error::SipFlowError;

/// 負荷パターン設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatternConfig {
    Constant,
    RampUp { duration_secs: u64 },
}

impl Default for PatternConfig {
    fn default() -> Self {
        PatternConfig::Constant
    }
}

/// 実行設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub target_address: String,
    pub scenario_file: String,
    pub data_file: Option<String>,
    pub total_calls: u64,
    pub concurrency_ceiling: usize,
    pub calls_per_second: f64,
    pub source_ip: String,
    pub source_port: u16,
    pub default_pause_ms: u64,
    pub cycling_enabled: bool,
    pub socket_count: u16,
    pub media_ip: Option<String>,
    pub media_port: u16,
    pub data_delimiter: String,
    pub data_has_header: bool,
    pub pattern: PatternConfig,
    pub report_interval_secs: u64,
    pub transport_error_limit: u32,
    pub max_step_executions: u64,
    pub shutdown_timeout: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            target_address: "127.0.0.1:5060".to_string(),
            scenario_file: "scenario.json".to_string(),
            data_file: None,
            total_calls: 100,
            concurrency_ceiling: 100,
            calls_per_second: 10.0,
            source_ip: "127.0.0.1".to_string(),
            source_port: 5070,
            default_pause_ms: 1000,
            cycling_enabled: false,
            socket_count: 1,
            media_ip: None,
            media_port: 6000,
            data_delimiter: ";".to_string(),
            data_has_header: false,
            pattern: PatternConfig::default(),
            report_interval_secs: 5,
            transport_error_limit: 3,
            max_step_executions: 10_000,
            shutdown_timeout: 10,
        }
    }
}

impl RunConfig {
    /// 設定値のバリデーション
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.target_address.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "target_address must be ip:port, got '{}'",
                self.target_address
            ));
        }
        if self.scenario_file.is_empty() {
            errors.push("scenario_file must not be empty".to_string());
        }
        if self.total_calls == 0 {
            errors.push("total_calls must be greater than 0".to_string());
        }
        if self.concurrency_ceiling == 0 {
            errors.push("concurrency_ceiling must be greater than 0".to_string());
        }
        if !(self.calls_per_second > 0.0) {
            errors.push("calls_per_second must be greater than 0".to_string());
        }
        if self.source_ip.parse::<IpAddr>().is_err() {
            errors.push(format!("source_ip is not an IP address: '{}'", self.source_ip));
        }
        if self.socket_count == 0 {
            errors.push("socket_count must be greater than 0".to_string());
        }
        if let Some(ip) = &self.media_ip {
            if ip.parse::<IpAddr>().is_err() {
                errors.push(format!("media_ip is not an IP address: '{}'", ip));
            }
        }
        if self.data_delimiter.chars().count() != 1 {
            errors.push("data_delimiter must be a single character".to_string());
        }
        if self.report_interval_secs == 0 {
            errors.push("report_interval_secs must be greater than 0".to_string());
        }
        if self.transport_error_limit == 0 {
            errors.push("transport_error_limit must be greater than 0".to_string());
        }
        if self.max_step_executions == 0 {
            errors.push("max_step_executions must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn target_addr(&self) -> Result<SocketAddr, SipFlowError> {
        self.target_address.parse().map_err(|_| {
            SipFlowError::ConfigError(format!("invalid target_address '{}'", self.target_address))
        })
    }

    pub fn source_addr(&self) -> Result<IpAddr, SipFlowError> {
        self.source_ip
            .parse()
            .map_err(|_| SipFlowError::ConfigError(format!("invalid source_ip '{}'", self.source_ip)))
    }

    /// Falls back to `;` when the delimiter is empty.
    pub fn delimiter(&self) -> char {
        self.data_delimiter.chars().next().unwrap_or(';')
    }

    pub fn data_source_options(&self) -> DataSourceOptions {
        DataSourceOptions {
            delimiter: self.delimiter(),
            has_header: self.data_has_header,
            cycling: self.cycling_enabled,
        }
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    /// Dialog settings for a transport bound at `local`.
    pub fn dialog_context(&self, local: SocketAddr) -> Result<DialogContext, SipFlowError> {
        let remote = self.target_addr()?;
        let media_ip = match &self.media_ip {
            Some(ip) => ip
                .parse()
                .map_err(|_| SipFlowError::ConfigError(format!("invalid media_ip '{}'", ip)))?,
            None => local.ip(),
        };

        let mut ctx = DialogContext::new(remote, local);
        ctx.media = SocketAddr::new(media_ip, self.media_port);
        ctx.default_pause = Duration::from_millis(self.default_pause_ms);
        ctx.transport_error_limit = self.transport_error_limit;
        ctx.max_step_executions = self.max_step_executions;
        Ok(ctx)
    }
}

/// JSON文字列から設定を読み込み、バリデーションを実行する
pub fn load_from_str(json: &str) -> Result<RunConfig, SipFlowError> {
    let config: RunConfig = serde_json::from_str(json)
        .map_err(|e| SipFlowError::ConfigError(format!("JSON parse error: {}", e)))?;

    config.validate().map_err(|errors| {
        SipFlowError::ConfigError(format!("Validation errors: {}", errors.join("; ")))
    })?;

    Ok(config)
}

/// JSONファイルから設定を読み込み、バリデーションを実行する
pub fn load_from_file(path: &Path) -> Result<RunConfig, SipFlowError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SipFlowError::ConfigError(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    load_from_str(&content)
}
