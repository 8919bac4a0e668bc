//! Analyzer collaborators: the trait the pipeline calls, an OpenAI-backed
//! implementation, a deterministic mock and a disabled stand-in.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::config::ai::AiConfig;
use crate::error::EnrichmentError;
use crate::model::{Recommendation, RiskLevel, Sentiment};

/// Standardized output of one analysis call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub sentiment: Sentiment,
    pub recommendation: Recommendation,
    pub risk_level: RiskLevel,
    pub confidence_score: f32,
    pub extracted_symbol: Option<String>,
    pub tge_date: Option<String>,
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, text: &str) -> Result<Analysis, EnrichmentError>;
    /// Provider name for diagnostics.
    fn name(&self) -> &'static str;
}

pub type DynAnalyzer = Arc<dyn Analyzer>;

/// Factory honouring `AI_TEST_MODE=mock`, then `enabled`, then `provider`.
pub fn build_analyzer(cfg: &AiConfig) -> anyhow::Result<DynAnalyzer> {
    if std::env::var("AI_TEST_MODE")
        .map(|v| v == "mock")
        .unwrap_or(false)
    {
        return Ok(Arc::new(MockAnalyzer));
    }
    if !cfg.enabled {
        return Ok(Arc::new(DisabledAnalyzer));
    }
    match cfg.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiAnalyzer::new(cfg)?)),
        other => {
            tracing::warn!(target: "enrich", provider = other, "unsupported analyzer provider, analysis disabled");
            Ok(Arc::new(DisabledAnalyzer))
        }
    }
}

// ------------------------------------------------------------
// Response standardization
// ------------------------------------------------------------

/// Loosely-typed shape the model is asked to return.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAnalysis {
    sentiment: Option<String>,
    recommendation: Option<String>,
    risk_level: Option<String>,
    confidence_score: Option<serde_json::Value>,
    token_symbol: Option<String>,
    tge_date: Option<String>,
}

fn standardize(raw: RawAnalysis) -> Analysis {
    let confidence = match raw.confidence_score {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.5),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.5),
        _ => 0.5,
    };
    let confidence = if confidence.is_finite() {
        confidence.clamp(0.0, 1.0) as f32
    } else {
        0.5
    };
    Analysis {
        sentiment: raw
            .sentiment
            .as_deref()
            .map(Sentiment::from_label)
            .unwrap_or(Sentiment::Neutral),
        recommendation: raw
            .recommendation
            .as_deref()
            .map(Recommendation::from_label)
            .unwrap_or(Recommendation::Hold),
        risk_level: raw
            .risk_level
            .as_deref()
            .map(RiskLevel::from_label)
            .unwrap_or(RiskLevel::Medium),
        confidence_score: confidence,
        extracted_symbol: raw.token_symbol.as_deref().and_then(sanitize_symbol),
        tge_date: raw.tge_date.as_deref().and_then(validate_date),
    }
}

/// Parse model output into an [`Analysis`], tolerating code fences and prose
/// around the JSON object.
pub fn parse_analysis(content: &str) -> Result<Analysis, EnrichmentError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &content[s..=e],
        _ => {
            return Err(EnrichmentError::InvalidResponse(
                "no JSON object in analysis output".into(),
            ))
        }
    };
    let raw: RawAnalysis = serde_json::from_str(json)
        .map_err(|e| EnrichmentError::InvalidResponse(e.to_string()))?;
    Ok(standardize(raw))
}

/// ASCII alphanumerics only, uppercase, at most 20 chars. A leading `$` is dropped.
pub fn sanitize_symbol(input: &str) -> Option<String> {
    let out: String = input
        .trim()
        .trim_start_matches('$')
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(20)
        .collect::<String>()
        .to_ascii_uppercase();
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Keep `YYYY-MM-DD` dates that name a real day; anything else is dropped.
pub fn validate_date(input: &str) -> Option<String> {
    let head: String = input.trim().chars().take(10).collect();
    NaiveDate::parse_from_str(&head, "%Y-%m-%d")
        .ok()
        .map(|d| d.format("%Y-%m-%d").to_string())
}

/// Single line, whitespace collapsed, cut to `max_chars`.
fn prepare_input(input: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(input.len().min(max_chars * 4));
    let mut taken = 0usize;
    let mut prev_space = false;
    for ch in input.chars() {
        if taken >= max_chars {
            break;
        }
        if ch.is_whitespace() {
            if !prev_space && !out.is_empty() {
                out.push(' ');
                taken += 1;
            }
            prev_space = true;
        } else {
            out.push(ch);
            taken += 1;
            prev_space = false;
        }
    }
    out.trim_end().to_string()
}

// ------------------------------------------------------------
// OpenAI
// ------------------------------------------------------------

const SYSTEM_PROMPT: &str = "You analyze social media posts about crypto token generation events (TGE). \
Reply with ONE JSON object and nothing else, with keys: \
sentiment (positive|neutral|negative), recommendation (buy|watch|hold|avoid), \
risk_level (Low|Medium|High), confidence_score (0..1), \
token_symbol (string or null), tge_date (YYYY-MM-DD or null).";

/// Chat Completions client. Requires an API key in config (or `OPENAI_API_KEY`).
pub struct OpenAiAnalyzer {
    http: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
    max_input_chars: usize,
}

impl OpenAiAnalyzer {
    pub fn new(cfg: &AiConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("tge-batch-orchestrator/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            endpoint: cfg.endpoint.clone(),
            max_input_chars: cfg.max_input_chars,
        })
    }
}

#[async_trait]
impl Analyzer for OpenAiAnalyzer {
    async fn analyze(&self, text: &str) -> Result<Analysis, EnrichmentError> {
        if self.api_key.is_empty() {
            return Err(EnrichmentError::InvalidResponse("missing API key".into()));
        }

        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let input = prepare_input(text, self.max_input_chars);
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                Msg {
                    role: "user",
                    content: &input,
                },
            ],
            temperature: 0.1,
            max_tokens: 200,
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EnrichmentError::Timeout
                } else {
                    EnrichmentError::Unavailable(e.to_string())
                }
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(EnrichmentError::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(EnrichmentError::Unavailable(format!("http status {status}")));
        }
        if !status.is_success() {
            return Err(EnrichmentError::InvalidResponse(format!("http status {status}")));
        }

        let body: Resp = resp
            .json()
            .await
            .map_err(|e| EnrichmentError::InvalidResponse(e.to_string()))?;
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("");
        parse_analysis(content)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

// ------------------------------------------------------------
// Mock + disabled
// ------------------------------------------------------------

/// Deterministic keyword-driven analyzer for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct MockAnalyzer;

#[async_trait]
impl Analyzer for MockAnalyzer {
    async fn analyze(&self, text: &str) -> Result<Analysis, EnrichmentError> {
        static RE_SYMBOL: OnceCell<regex::Regex> = OnceCell::new();
        static RE_DATE: OnceCell<regex::Regex> = OnceCell::new();
        let re_symbol =
            RE_SYMBOL.get_or_init(|| regex::Regex::new(r"\$([A-Za-z][A-Za-z0-9]{1,19})").unwrap());
        let re_date = RE_DATE.get_or_init(|| regex::Regex::new(r"\d{4}-\d{2}-\d{2}").unwrap());

        let lower = text.to_lowercase();
        let (sentiment, recommendation, risk_level) =
            if ["scam", "rug", "骗局", "跑路"].iter().any(|k| lower.contains(k)) {
                (Sentiment::Negative, Recommendation::Avoid, RiskLevel::High)
            } else if ["airdrop", "launch", "listing", "空投", "上线"]
                .iter()
                .any(|k| lower.contains(k))
            {
                (Sentiment::Positive, Recommendation::Watch, RiskLevel::Medium)
            } else {
                (Sentiment::Neutral, Recommendation::Hold, RiskLevel::Medium)
            };

        Ok(Analysis {
            sentiment,
            recommendation,
            risk_level,
            confidence_score: 0.6,
            extracted_symbol: re_symbol
                .captures(text)
                .and_then(|c| sanitize_symbol(&c[1])),
            tge_date: re_date.find(text).and_then(|m| validate_date(m.as_str())),
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Used when analysis is turned off; every call fails without retry.
#[derive(Debug, Clone, Default)]
pub struct DisabledAnalyzer;

#[async_trait]
impl Analyzer for DisabledAnalyzer {
    async fn analyze(&self, _text: &str) -> Result<Analysis, EnrichmentError> {
        Err(EnrichmentError::InvalidResponse("analysis disabled".into()))
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}
