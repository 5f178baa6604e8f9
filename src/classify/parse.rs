//! Turning a model reply into a decision.
//!
//! Replies are expected as the JSON object the bundled prompt asks for, but
//! fenced JSON, JSON wrapped in prose and plain `INCLUDE: reason` text are all
//! accepted. Anything without a recognisable decision is `Unknown`.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::decisions::Decision;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedResponse {
    pub decision: Decision,
    /// 1..=5 when the model reported one.
    pub confidence: Option<u8>,
    pub rationale: String,
    pub organisation_name: Option<String>,
    pub organisation_type: Option<String>,
    pub evidence: Vec<String>,
    pub is_ongoing: Option<bool>,
    pub site_owner_is_initiative: Option<bool>,
    pub notes: String,
}

pub fn parse_response(raw: &str) -> ParsedResponse {
    let text = raw.trim();
    if text.is_empty() {
        return unknown("empty response");
    }
    // An object without a `decision` key does not settle it; the prose around it may.
    json_object(text)
        .filter(|obj| obj.contains_key("decision"))
        .map(|obj| from_json(&obj))
        .unwrap_or_else(|| from_text(text))
}

fn unknown(why: &str) -> ParsedResponse {
    ParsedResponse {
        rationale: why.to_string(),
        ..Default::default()
    }
}

/// The outermost `{...}` in `text`, if it parses as a JSON object.
fn json_object(text: &str) -> Option<Map<String, Value>> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(Value::Object(obj)) => Some(obj),
        _ => None,
    }
}

fn from_json(obj: &Map<String, Value>) -> ParsedResponse {
    let decision = obj
        .get("decision")
        .and_then(Value::as_str)
        .and_then(decision_word);
    let Some(decision) = decision else {
        return unknown("response has no recognisable decision");
    };

    let reasons = string_list(obj.get("reasons"));
    let notes = non_empty_str(obj.get("notes")).unwrap_or_default();
    let rationale = if !reasons.is_empty() {
        reasons.join(" | ")
    } else {
        ["rationale", "reason"]
            .iter()
            .find_map(|k| non_empty_str(obj.get(*k)))
            .unwrap_or_else(|| notes.clone())
    };

    ParsedResponse {
        decision,
        confidence: obj.get("confidence").and_then(confidence),
        rationale,
        organisation_name: non_empty_str(obj.get("organisation_name")),
        organisation_type: non_empty_str(obj.get("organisation_type")),
        evidence: string_list(obj.get("evidence_quotes")),
        is_ongoing: obj.get("is_ongoing").and_then(Value::as_bool),
        site_owner_is_initiative: obj.get("site_owner_is_initiative").and_then(Value::as_bool),
        notes,
    }
}

fn from_text(text: &str) -> ParsedResponse {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    let re = TOKEN.get_or_init(|| {
        Regex::new(r"(?i)\b(?:(not|never)\s+)?(include[ds]?|exclude[ds]?)\b").unwrap()
    });

    let Some(caps) = re.captures(text) else {
        return unknown("response has no recognisable decision");
    };
    let (Some(whole), Some(word)) = (caps.get(0), caps.get(2)) else {
        return unknown("response has no recognisable decision");
    };
    let Some(mut decision) = decision_word(word.as_str()) else {
        return unknown("response has no recognisable decision");
    };
    if caps.get(1).is_some() {
        decision = match decision {
            Decision::Include => Decision::Exclude,
            Decision::Exclude => Decision::Include,
            Decision::Unknown => Decision::Unknown,
        };
    }

    let rest = text[whole.end()..]
        .trim_start_matches(|c: char| c.is_whitespace() || "*_:;,.-–—)]>#`\"'".contains(c))
        .trim();
    ParsedResponse {
        decision,
        rationale: if rest.is_empty() { text.to_string() } else { rest.to_string() },
        ..Default::default()
    }
}

fn decision_word(word: &str) -> Option<Decision> {
    let w = word
        .trim()
        .trim_matches(|c: char| !c.is_alphabetic())
        .to_lowercase();
    match w.as_str() {
        "include" | "included" | "includes" => Some(Decision::Include),
        "exclude" | "excluded" | "excludes" => Some(Decision::Exclude),
        _ => None,
    }
}

fn confidence(v: &Value) -> Option<u8> {
    let n = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (1.0..=5.0).contains(&n).then(|| n.round() as u8)
}

fn non_empty_str(v: Option<&Value>) -> Option<String> {
    v.and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn string_list(v: Option<&Value>) -> Vec<String> {
    match v {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|i| i.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}
