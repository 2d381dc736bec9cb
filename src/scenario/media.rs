// Media inspection: what audio a scenario plays and which RTP ports it announces.

use serde::Serialize;

use super::{ScenarioModel, ScenarioStep};

/// Port announced on an SDP `m=audio` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioPort {
    Literal(u16),
    Keyword(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MediaReport {
    pub assets: Vec<String>,
    pub audio_ports: Vec<AudioPort>,
    /// Whether any template references `[media_port]`.
    pub uses_media_port: bool,
}

fn audio_port(line: &str) -> Option<AudioPort> {
    let rest = line.trim_start().strip_prefix("m=audio")?;
    let token = rest.split_whitespace().next()?;
    if let Ok(port) = token.parse::<u16>() {
        return Some(AudioPort::Literal(port));
    }
    let name = token.strip_prefix('[')?.strip_suffix(']')?;
    Some(AudioPort::Keyword(name.to_string()))
}

/// Collect `PlayMedia` assets and `m=audio` ports from every `Send` template,
/// each listed once in order of first appearance.
pub fn media_report(model: &ScenarioModel) -> MediaReport {
    let mut report = MediaReport::default();
    for step in model.steps() {
        match step {
            ScenarioStep::PlayMedia { asset } => {
                if !report.assets.contains(asset) {
                    report.assets.push(asset.clone());
                }
            }
            ScenarioStep::Send { template } => {
                if template.contains("[media_port]") {
                    report.uses_media_port = true;
                }
                for port in template.lines().filter_map(audio_port) {
                    if !report.audio_ports.contains(&port) {
                        report.audio_ports.push(port);
                    }
                }
            }
            _ => {}
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::parse;

    #[test]
    fn test_media_report_collects_assets_and_ports() {
        let def = r#"{"steps": [
            {"send": {"template": "INVITE sip:x SIP/2.0\nContent-Length: [len]\n\nv=0\nm=audio [media_port] RTP/AVP 0\n"}},
            {"play_media": {"asset": "greeting.wav"}},
            {"send": {"template": "UPDATE sip:x SIP/2.0\n\nm=audio 6002 RTP/AVP 8\n"}},
            {"play_media": {"asset": "greeting.wav"}},
            {"play_media": {"asset": "bye.wav"}}
        ]}"#;
        let report = media_report(&parse(def).unwrap());
        assert_eq!(report.assets, vec!["greeting.wav", "bye.wav"]);
        assert_eq!(
            report.audio_ports,
            vec![
                AudioPort::Keyword("media_port".to_string()),
                AudioPort::Literal(6002)
            ]
        );
        assert!(report.uses_media_port);
    }

    #[test]
    fn test_media_report_empty_for_signalling_only_flow() {
        let def = r#"{"steps": [{"send": {"template": "OPTIONS sip:x SIP/2.0\n"}}]}"#;
        assert_eq!(media_report(&parse(def).unwrap()), MediaReport::default());
    }

    #[test]
    fn test_audio_port_line_parsing() {
        assert_eq!(audio_port("  m=audio 49170 RTP/AVP 0"), Some(AudioPort::Literal(49170)));
        assert_eq!(audio_port("m=video 49170 RTP/AVP 31"), None);
        assert_eq!(audio_port("m=audio"), None);
    }
}
