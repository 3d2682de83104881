//! Step plan generation.
//!
//! A user message is classified into a lane (single stock, sector, or
//! generic), then turned into an ordered step plan. The AI backend gets the
//! first shot at producing the plan; any failure, timeout, or malformed
//! reply falls back to deterministic per-lane templates so the caller
//! always receives at least one step.

use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::ai::TextGenerator;
use crate::storage::{ResourceKind, StepCategory, StepDescriptor};

/// What the user's message is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lane {
    /// A single listed stock, identified by a 6-digit code.
    Symbol(String),
    /// An industry sector mentioned by name.
    Sector(String),
    Generic,
}

const SECTOR_KEYWORDS: &[(&str, &str)] = &[
    ("半导体", "semiconductor"),
    ("新能源", "new energy"),
    ("白酒", "liquor"),
    ("医药", "pharmaceutical"),
    ("银行", "banking"),
    ("地产", "real estate"),
    ("军工", "defense"),
    ("汽车", "automotive"),
    ("semiconductor", "semiconductor"),
    ("energy", "energy"),
    ("pharma", "pharmaceutical"),
    ("bank", "banking"),
    ("real estate", "real estate"),
    ("automotive", "automotive"),
    ("technology", "technology"),
];

/// Classify a message into its analysis lane.
///
/// A 6-digit code anywhere in the message wins over a sector keyword.
pub fn classify(message: &str) -> Lane {
    // CJK characters count as word characters, so \b around the digits
    // would miss "分析600519"; bound by non-digits instead.
    let symbol = Regex::new(r"(?:^|\D)(\d{6})(?:\D|$)").ok().and_then(|re| {
        re.captures(message)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    });
    if let Some(code) = symbol {
        return Lane::Symbol(code);
    }

    let lower = message.to_lowercase();
    for (keyword, sector) in SECTOR_KEYWORDS {
        if lower.contains(keyword) {
            return Lane::Sector(sector.to_string());
        }
    }

    Lane::Generic
}

/// Decide how many steps a message deserves. Always within [2, 6].
pub fn target_step_count(message: &str) -> usize {
    let lower = message.to_lowercase();
    let mut count: i32 = 4;

    const DETAIL_MARKERS: &[&str] = &["detailed", "compare", "comprehensive", "详细", "对比", "全面"];
    const BRIEF_MARKERS: &[&str] = &["what is", "define", "briefly", "什么是", "简单"];

    if DETAIL_MARKERS.iter().any(|m| lower.contains(m)) {
        count += 2;
    }
    if BRIEF_MARKERS.iter().any(|m| lower.contains(m)) {
        count -= 2;
    }

    count.clamp(2, 6) as usize
}

/// Shape the AI is asked to produce, with aliases for the field names
/// different models tend to pick.
#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(alias = "description", alias = "text", alias = "step")]
    content: String,
    #[serde(default)]
    category: StepCategory,
    #[serde(default, alias = "kind", alias = "resource", alias = "tool")]
    resource_kind: ResourceKind,
}

/// Turns user messages into ordered step plans.
pub struct StepGenerator {
    ai: Arc<dyn TextGenerator>,
}

impl StepGenerator {
    pub fn new(ai: Arc<dyn TextGenerator>) -> Self {
        Self { ai }
    }

    /// Generate a step plan for a message and its free-form context.
    ///
    /// Never fails and never returns an empty plan.
    pub async fn generate(
        &self,
        message: &str,
        context: &serde_json::Value,
    ) -> Vec<StepDescriptor> {
        let lane = classify(message);
        let count = target_step_count(message);

        let steps = match self.plan_with_ai(message, context, &lane, count).await {
            Ok(steps) if !steps.is_empty() => steps,
            Ok(_) => {
                debug!("generation backend returned an empty plan, using templates");
                fallback_plan(&lane, count)
            }
            Err(e) => {
                warn!(error = %e, "step plan generation failed, using templates");
                fallback_plan(&lane, count)
            }
        };

        steps
            .into_iter()
            .take(count.max(1))
            .enumerate()
            .map(|(i, raw)| StepDescriptor {
                step_id: format!("step_{}", i + 1),
                step_number: (i + 1) as u32,
                content: raw.content,
                category: raw.category,
                resource_kind: raw.resource_kind,
                results: vec![],
                execution_details: serde_json::Value::Null,
                urls: vec![],
                files: vec![],
            })
            .collect()
    }

    async fn plan_with_ai(
        &self,
        message: &str,
        context: &serde_json::Value,
        lane: &Lane,
        count: usize,
    ) -> crate::Result<Vec<RawStep>> {
        let focus = match lane {
            Lane::Symbol(code) => format!("the stock with code {}", code),
            Lane::Sector(sector) => format!("the {} sector", sector),
            Lane::Generic => "the user's question".to_string(),
        };

        let mut prompt = format!(
            "Plan {} analysis steps for {}. The user asked: \"{}\".\n",
            count, focus, message
        );
        if !context.is_null() {
            prompt.push_str(&format!("Conversation context: {}\n", context));
        }
        prompt.push_str(
            "Reply with ONLY a JSON array of objects with fields \
             \"content\", \"category\" (analysis|strategy|general|result) and \
             \"resource_kind\" (browser|database|api|general).",
        );

        let reply = self.ai.generate(&prompt, 1000).await?;
        if reply.trim().is_empty() {
            return Err(crate::Error::Generation(
                "generation backend returned empty text".to_string(),
            ));
        }

        let json = extract_json_array(&reply).ok_or_else(|| {
            crate::Error::Generation("no JSON array found in generation reply".to_string())
        })?;
        let steps: Vec<RawStep> = serde_json::from_str(json)?;
        Ok(steps)
    }
}

/// Extract the first well-formed top-level JSON array from free-form text.
///
/// Models wrap their JSON in prose and code fences often enough that a
/// plain `serde_json::from_str` on the whole reply is hopeless. Tracks
/// string literals and escapes so brackets inside strings do not confuse
/// the depth count.
pub fn extract_json_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let bytes = text.as_bytes();

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn fallback_plan(lane: &Lane, count: usize) -> Vec<RawStep> {
    let templates: Vec<(String, StepCategory, ResourceKind)> = match lane {
        Lane::Symbol(code) => vec![
            (
                format!("Fetch the real-time quote and recent price history for {}", code),
                StepCategory::Analysis,
                ResourceKind::Database,
            ),
            (
                format!("Compute technical indicators (MA, MACD, RSI) for {}", code),
                StepCategory::Analysis,
                ResourceKind::Database,
            ),
            (
                format!("Scan recent news and announcements mentioning {}", code),
                StepCategory::Analysis,
                ResourceKind::Browser,
            ),
            (
                format!("Pull fundamentals and key ratios for {}", code),
                StepCategory::Analysis,
                ResourceKind::Api,
            ),
            (
                "Draft entry and risk levels based on the indicators".to_string(),
                StepCategory::Strategy,
                ResourceKind::General,
            ),
            (
                "Summarize the analysis into a recommendation".to_string(),
                StepCategory::Result,
                ResourceKind::General,
            ),
        ],
        Lane::Sector(sector) => vec![
            (
                format!("Collect performance data for leading {} stocks", sector),
                StepCategory::Analysis,
                ResourceKind::Database,
            ),
            (
                format!("Review policy and news flow affecting the {} sector", sector),
                StepCategory::Analysis,
                ResourceKind::Browser,
            ),
            (
                format!("Compare valuations across {} constituents", sector),
                StepCategory::Analysis,
                ResourceKind::Api,
            ),
            (
                format!("Identify momentum leaders and laggards in {}", sector),
                StepCategory::Analysis,
                ResourceKind::Database,
            ),
            (
                "Formulate a sector rotation view".to_string(),
                StepCategory::Strategy,
                ResourceKind::General,
            ),
            (
                "Summarize the sector findings".to_string(),
                StepCategory::Result,
                ResourceKind::General,
            ),
        ],
        Lane::Generic => vec![
            (
                "Clarify the question and gather context".to_string(),
                StepCategory::General,
                ResourceKind::General,
            ),
            (
                "Search for relevant market information".to_string(),
                StepCategory::Analysis,
                ResourceKind::Browser,
            ),
            (
                "Analyze the gathered data".to_string(),
                StepCategory::Analysis,
                ResourceKind::Database,
            ),
            (
                "Cross-check against historical patterns".to_string(),
                StepCategory::Analysis,
                ResourceKind::Database,
            ),
            (
                "Develop actionable suggestions".to_string(),
                StepCategory::Strategy,
                ResourceKind::General,
            ),
            (
                "Compose the final answer".to_string(),
                StepCategory::Result,
                ResourceKind::General,
            ),
        ],
    };

    templates
        .into_iter()
        .take(count.max(1))
        .map(|(content, category, resource_kind)| RawStep {
            content,
            category,
            resource_kind,
        })
        .collect()
}

/// Give steps without explicit links a default outbound URL based on their
/// resource kind: Database steps point at a market-data search, Api steps
/// at the AI provider console, everything else at a general web search
/// keyed on the user's message.
pub fn enrich_steps_with_urls(steps: &mut [StepDescriptor], message: &str) {
    let query = urlencoding::encode(message);

    for step in steps.iter_mut() {
        if !step.urls.is_empty() {
            continue;
        }
        let url = match step.resource_kind {
            ResourceKind::Database => {
                format!("https://data.eastmoney.com/search?keyword={}", query)
            }
            ResourceKind::Api => "https://platform.deepseek.com/console".to_string(),
            ResourceKind::Browser | ResourceKind::General => {
                format!("https://www.bing.com/search?q={}", query)
            }
        };
        step.urls.push(url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Scripted(std::result::Result<String, String>);

    #[async_trait]
    impl TextGenerator for Scripted {
        async fn generate(&self, _prompt: &str, _max_tokens: u32) -> crate::Result<String> {
            self.0
                .clone()
                .map_err(crate::Error::Generation)
        }
    }

    #[test]
    fn test_classify_symbol_beats_sector() {
        assert_eq!(
            classify("帮我分析一下 600519 白酒龙头"),
            Lane::Symbol("600519".to_string())
        );
        assert_eq!(classify("Analyze stock 000001 please"), Lane::Symbol("000001".to_string()));
        // No whitespace between CJK text and the code
        assert_eq!(classify("分析600519走势"), Lane::Symbol("600519".to_string()));
        // Longer digit runs are not stock codes
        assert_eq!(classify("order 12345678"), Lane::Generic);
    }

    #[test]
    fn test_classify_sector_and_generic() {
        assert_eq!(classify("半导体板块怎么样"), Lane::Sector("semiconductor".to_string()));
        assert_eq!(
            classify("Is the banking sector healthy?"),
            Lane::Sector("banking".to_string())
        );
        assert_eq!(classify("Should I rebalance monthly?"), Lane::Generic);
    }

    #[test]
    fn test_step_count_bounds() {
        assert_eq!(target_step_count("what is a P/E ratio"), 2);
        assert_eq!(target_step_count("analyze 600519"), 4);
        assert_eq!(target_step_count("detailed comparison of 600519 and 000858"), 6);
        // Mixed markers cancel out
        assert_eq!(target_step_count("what is a detailed DCF"), 4);
    }

    #[test]
    fn test_extract_json_array_from_chatty_reply() {
        let reply = r#"Sure! Here is the plan:
```json
[{"content": "Check [brackets] in strings", "category": "analysis"}]
```
Hope that helps."#;
        let json = extract_json_array(reply).unwrap();
        let steps: Vec<RawStep> = serde_json::from_str(json).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].content, "Check [brackets] in strings");
    }

    #[test]
    fn test_extract_json_array_unterminated() {
        assert!(extract_json_array("no array here").is_none());
        assert!(extract_json_array("[1, 2").is_none());
    }

    #[tokio::test]
    async fn test_ai_plan_is_used_when_well_formed() {
        let reply = r#"[
            {"content": "Pull quote", "category": "analysis", "resource_kind": "database"},
            {"content": "Summarize", "category": "result"}
        ]"#;
        let gen = StepGenerator::new(Arc::new(Scripted(Ok(reply.to_string()))));

        let steps = gen.generate("what is 600519 doing", &serde_json::Value::Null).await;
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].step_id, "step_1");
        assert_eq!(steps[0].content, "Pull quote");
        assert_eq!(steps[0].resource_kind, ResourceKind::Database);
        assert_eq!(steps[1].step_number, 2);
    }

    #[tokio::test]
    async fn test_fallback_on_ai_error() {
        let gen = StepGenerator::new(Arc::new(Scripted(Err("backend down".to_string()))));

        let steps = gen.generate("analyze 600519", &serde_json::Value::Null).await;
        assert_eq!(steps.len(), 4);
        assert!(steps[0].content.contains("600519"));
        assert_eq!(steps[3].step_id, "step_4");
    }

    #[tokio::test]
    async fn test_fallback_on_garbage_reply() {
        let gen = StepGenerator::new(Arc::new(Scripted(Ok("I cannot help with that".to_string()))));
        let steps = gen.generate("半导体板块详细分析", &serde_json::Value::Null).await;
        assert_eq!(steps.len(), 6);
        assert!(steps.iter().all(|s| !s.content.is_empty()));
    }

    struct CapturesPrompt {
        reply: String,
        seen: std::sync::Mutex<Option<String>>,
    }

    #[async_trait]
    impl TextGenerator for CapturesPrompt {
        async fn generate(&self, prompt: &str, _max_tokens: u32) -> crate::Result<String> {
            *self.seen.lock().unwrap() = Some(prompt.to_string());
            Ok(self.reply.clone())
        }
    }

    #[tokio::test]
    async fn test_context_is_included_in_plan_prompt() {
        let ai = Arc::new(CapturesPrompt {
            reply: r#"[{"content": "Check"}]"#.to_string(),
            seen: std::sync::Mutex::new(None),
        });
        let gen = StepGenerator::new(ai.clone());

        gen.generate("analyze 600519", &serde_json::json!({"horizon": "short"}))
            .await;

        let prompt = ai.seen.lock().unwrap().clone().unwrap();
        assert!(prompt.contains(r#""horizon":"short""#));

        // Null context leaves the prompt without a context line
        gen.generate("analyze 600519", &serde_json::Value::Null).await;
        let prompt = ai.seen.lock().unwrap().clone().unwrap();
        assert!(!prompt.contains("Conversation context"));
    }

    #[tokio::test]
    async fn test_empty_reply_falls_back() {
        let gen = StepGenerator::new(Arc::new(Scripted(Ok("   ".to_string()))));
        let steps = gen.generate("hello", &serde_json::Value::Null).await;
        assert!(!steps.is_empty());
    }

    fn bare_step(step_id: &str, number: u32, kind: ResourceKind) -> StepDescriptor {
        StepDescriptor {
            step_id: step_id.to_string(),
            step_number: number,
            content: format!("{} work", step_id),
            category: StepCategory::General,
            resource_kind: kind,
            results: vec![],
            execution_details: serde_json::Value::Null,
            urls: vec![],
            files: vec![],
        }
    }

    #[test]
    fn test_enrich_urls_by_kind() {
        let mut steps = vec![
            bare_step("step_1", 1, ResourceKind::Database),
            bare_step("step_2", 2, ResourceKind::Api),
            bare_step("step_3", 3, ResourceKind::Browser),
        ];

        enrich_steps_with_urls(&mut steps, "600519 走势 分析");

        assert_eq!(steps[0].urls.len(), 1);
        assert!(steps[0].urls[0].starts_with("https://data.eastmoney.com/search?keyword="));
        // Spaces and CJK must be percent-encoded
        assert!(!steps[0].urls[0].contains(' '));

        // Api steps link to the provider console
        assert_eq!(steps[1].urls, vec!["https://platform.deepseek.com/console"]);

        assert!(steps[2].urls[0].starts_with("https://www.bing.com/search?q="));
    }

    #[test]
    fn test_enrich_general_step_gets_search_link() {
        let mut steps = vec![bare_step("step_1", 1, ResourceKind::General)];
        enrich_steps_with_urls(&mut steps, "rebalance advice");

        // General falls through to the same search link Browser gets
        assert_eq!(steps[0].urls.len(), 1);
        assert!(steps[0].urls[0].starts_with("https://www.bing.com/search?q="));
    }

    #[test]
    fn test_enrich_keeps_existing_urls() {
        let mut steps = vec![bare_step("step_1", 1, ResourceKind::Browser)];
        steps[0].urls = vec!["https://example.com/existing".to_string()];

        enrich_steps_with_urls(&mut steps, "600519");
        assert_eq!(steps[0].urls, vec!["https://example.com/existing"]);
    }
}
