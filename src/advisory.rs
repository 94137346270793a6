//! Best-effort AI advisory.
//!
//! One `Advisory` value is built at startup: `Live` when an API key is
//! configured, `Degraded` otherwise. Every operation always answers. The
//! live variant calls a chat-completions endpoint under a hard timeout and
//! falls back to the same keyword heuristics the degraded variant uses, so
//! a slow or broken upstream can never fail a request.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::AppConfig;
use crate::models::{Issue, IssueSeverity, User};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub severity: IssueSeverity,
    pub tags: Vec<String>,
    pub confidence: f64,
    /// "live" or "degraded", so clients can badge the answer.
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssigneeSuggestion {
    pub assignee_id: Option<i64>,
    pub full_name: Option<String>,
    pub reason: String,
    pub confidence: f64,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionPrediction {
    pub estimated_hours: f64,
    pub low_hours: f64,
    pub high_hours: f64,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatReply {
    pub reply: String,
    pub suggestions: Vec<String>,
    pub source: String,
}

/// A candidate for assignment together with their current open workload.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub user: User,
    pub open_assigned: i64,
}

pub enum Advisory {
    Live(LiveClient),
    Degraded,
}

impl Advisory {
    pub fn from_config(config: &AppConfig) -> Self {
        match &config.ai_api_key {
            Some(key) => Advisory::Live(LiveClient {
                http: reqwest::Client::new(),
                api_key: key.clone(),
                base_url: config.ai_base_url.trim_end_matches('/').to_string(),
                model: config.ai_model.clone(),
                timeout: Duration::from_secs(config.ai_timeout_secs),
            }),
            None => {
                tracing::info!("no AI API key configured, advisory runs degraded");
                Advisory::Degraded
            }
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Advisory::Live(_) => "live",
            Advisory::Degraded => "degraded",
        }
    }

    /// Suggest a severity and tags for issue text.
    pub async fn classify(&self, title: &str, description: &str) -> Classification {
        if let Advisory::Live(client) = self {
            match client.classify(title, description).await {
                Ok(c) => return c,
                Err(e) => tracing::warn!(error = %e, "live classify failed, using heuristics"),
            }
        }
        // Answered by heuristics, so labeled degraded even in live mode.
        let mut c = heuristics::classify(title, description);
        c.source = "degraded".to_string();
        c
    }

    /// Pick the most suitable assignee from the given candidates.
    pub async fn suggest_assignee(&self, issue: &Issue, candidates: &[Candidate]) -> AssigneeSuggestion {
        if let Advisory::Live(client) = self {
            match client.suggest_assignee(issue, candidates).await {
                Ok(s) => return s,
                Err(e) => {
                    tracing::warn!(error = %e, "live assignee suggestion failed, using heuristics")
                }
            }
        }
        let mut s = heuristics::suggest_assignee(candidates);
        s.source = "degraded".to_string();
        s
    }

    /// Estimate hours to resolution for an issue.
    pub async fn predict_resolution(&self, issue: &Issue) -> ResolutionPrediction {
        if let Advisory::Live(client) = self {
            match client.predict_resolution(issue).await {
                Ok(p) => return p,
                Err(e) => tracing::warn!(error = %e, "live prediction failed, using heuristics"),
            }
        }
        let mut p = heuristics::predict_resolution(issue);
        p.source = "degraded".to_string();
        p
    }

    /// Answer a free-form question about using the tracker.
    pub async fn chat(&self, message: &str) -> ChatReply {
        if let Advisory::Live(client) = self {
            match client.chat(message).await {
                Ok(r) => return r,
                Err(e) => tracing::warn!(error = %e, "live chat failed, using canned replies"),
            }
        }
        let mut r = heuristics::chat(message);
        r.source = "degraded".to_string();
        r
    }
}

// ── Live client ──────────────────────────────────────────────────────

pub struct LiveClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl LiveClient {
    /// Single chat-completions round trip, bounded by the configured
    /// timeout. Returns the assistant message content.
    async fn complete(&self, system: &str, user: &str) -> anyhow::Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": 0.2,
        });

        let request = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();
        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| anyhow::anyhow!("AI request timed out"))??
            .error_for_status()?;

        let payload: serde_json::Value =
            tokio::time::timeout(self.timeout, response.json())
                .await
                .map_err(|_| anyhow::anyhow!("AI response read timed out"))??;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("AI response missing message content"))
    }

    async fn classify(&self, title: &str, description: &str) -> anyhow::Result<Classification> {
        let content = self
            .complete(
                "You triage bug reports. Reply with JSON only: \
                 {\"severity\": \"LOW|MEDIUM|HIGH|CRITICAL\", \"tags\": [\"...\"], \
                 \"confidence\": <0..1>}",
                &format!("Title: {}\n\nDescription: {}", title, description),
            )
            .await?;
        let parsed: serde_json::Value = serde_json::from_str(extract_json(&content))?;
        let severity: IssueSeverity = parsed["severity"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing severity"))?
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let tags = parsed["tags"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Classification {
            severity,
            tags,
            confidence: parsed["confidence"].as_f64().unwrap_or(0.7).clamp(0.0, 1.0),
            source: "live".to_string(),
        })
    }

    async fn suggest_assignee(
        &self,
        issue: &Issue,
        candidates: &[Candidate],
    ) -> anyhow::Result<AssigneeSuggestion> {
        if candidates.is_empty() {
            anyhow::bail!("no candidates to choose from");
        }
        let roster = candidates
            .iter()
            .map(|c| {
                format!(
                    "id={} name={} open_assigned={}",
                    c.user.id, c.user.full_name, c.open_assigned
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let content = self
            .complete(
                "You assign issues to team members. Reply with JSON only: \
                 {\"assignee_id\": <id from the roster>, \"reason\": \"...\", \
                 \"confidence\": <0..1>}",
                &format!(
                    "Issue: {} ({})\n{}\n\nRoster:\n{}",
                    issue.title, issue.severity, issue.description, roster
                ),
            )
            .await?;
        let parsed: serde_json::Value = serde_json::from_str(extract_json(&content))?;
        let id = parsed["assignee_id"]
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("missing assignee_id"))?;
        let chosen = candidates
            .iter()
            .find(|c| c.user.id == id)
            .ok_or_else(|| anyhow::anyhow!("suggested id {} is not a candidate", id))?;
        Ok(AssigneeSuggestion {
            assignee_id: Some(chosen.user.id),
            full_name: Some(chosen.user.full_name.clone()),
            reason: parsed["reason"].as_str().unwrap_or("model pick").to_string(),
            confidence: parsed["confidence"].as_f64().unwrap_or(0.7).clamp(0.0, 1.0),
            source: "live".to_string(),
        })
    }

    async fn predict_resolution(&self, issue: &Issue) -> anyhow::Result<ResolutionPrediction> {
        let content = self
            .complete(
                "You estimate time to resolve issues. Reply with JSON only: \
                 {\"estimated_hours\": <number>}",
                &format!(
                    "Severity: {}\nTags: {}\nTitle: {}\n\n{}",
                    issue.severity,
                    issue.tags.as_deref().unwrap_or(""),
                    issue.title,
                    issue.description
                ),
            )
            .await?;
        let parsed: serde_json::Value = serde_json::from_str(extract_json(&content))?;
        let hours = parsed["estimated_hours"]
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("missing estimated_hours"))?;
        Ok(ResolutionPrediction {
            estimated_hours: hours,
            low_hours: hours * 0.5,
            high_hours: hours * 2.0,
            source: "live".to_string(),
        })
    }

    async fn chat(&self, message: &str) -> anyhow::Result<ChatReply> {
        let reply = self
            .complete(
                "You are the help assistant for an issue tracker. Be brief and concrete.",
                message,
            )
            .await?;
        Ok(ChatReply {
            reply,
            suggestions: heuristics::default_chat_suggestions(),
            source: "live".to_string(),
        })
    }
}

/// Models often wrap JSON in markdown fences; strip them before parsing.
fn extract_json(content: &str) -> &str {
    let trimmed = content.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

// ── Keyword heuristics ───────────────────────────────────────────────

mod heuristics {
    use super::*;

    const CRITICAL_KEYWORDS: &[&str] = &[
        "crash", "data loss", "security", "urgent", "production", "outage", "critical",
    ];
    const HIGH_KEYWORDS: &[&str] = &["error", "broken", "fail", "blocked", "regression", "cannot"];
    const LOW_KEYWORDS: &[&str] = &["typo", "cosmetic", "minor", "suggestion", "nice to have"];

    const TAG_CATEGORIES: &[(&str, &[&str])] = &[
        ("bug", &["bug", "crash", "error", "broken", "fail", "regression"]),
        ("feature", &["feature", "add", "new", "implement", "support", "request"]),
        ("ui", &["ui", "ux", "design", "layout", "style", "button", "css"]),
        ("performance", &["slow", "performance", "lag", "timeout", "memory", "leak"]),
        ("security", &["security", "vulnerability", "auth", "injection", "xss"]),
    ];

    pub fn classify(title: &str, description: &str) -> Classification {
        let text = format!("{} {}", title, description).to_lowercase();

        // Keyword hits carry more confidence than the MEDIUM default.
        let (severity, confidence) = if CRITICAL_KEYWORDS.iter().any(|k| text.contains(k)) {
            (IssueSeverity::Critical, 0.8)
        } else if HIGH_KEYWORDS.iter().any(|k| text.contains(k)) {
            (IssueSeverity::High, 0.8)
        } else if LOW_KEYWORDS.iter().any(|k| text.contains(k)) {
            (IssueSeverity::Low, 0.8)
        } else {
            (IssueSeverity::Medium, 0.5)
        };

        let tags = TAG_CATEGORIES
            .iter()
            .filter(|(_, keywords)| keywords.iter().any(|k| text.contains(k)))
            .map(|(tag, _)| tag.to_string())
            .collect();

        Classification {
            severity,
            tags,
            confidence,
            source: String::new(),
        }
    }

    /// Least-loaded candidate wins; ties break on the lower id so the
    /// answer is deterministic.
    pub fn suggest_assignee(candidates: &[Candidate]) -> AssigneeSuggestion {
        let chosen = candidates
            .iter()
            .min_by_key(|c| (c.open_assigned, c.user.id));
        match chosen {
            Some(c) => AssigneeSuggestion {
                assignee_id: Some(c.user.id),
                full_name: Some(c.user.full_name.clone()),
                reason: format!(
                    "{} has the lightest workload ({} open assigned)",
                    c.user.full_name, c.open_assigned
                ),
                confidence: if candidates.len() == 1 { 0.9 } else { 0.7 },
                source: String::new(),
            },
            None => AssigneeSuggestion {
                assignee_id: None,
                full_name: None,
                reason: "No active maintainers or admins available".to_string(),
                confidence: 0.0,
                source: String::new(),
            },
        }
    }

    pub fn predict_resolution(issue: &Issue) -> ResolutionPrediction {
        let base_hours = match issue.severity {
            IssueSeverity::Low => 24.0,
            IssueSeverity::Medium => 8.0,
            IssueSeverity::High => 4.0,
            IssueSeverity::Critical => 2.0,
        };

        let tags = issue.tags.as_deref().unwrap_or("").to_lowercase();
        let mut multiplier = 1.0;
        if tags.contains("ui") {
            multiplier *= 0.7;
        }
        if tags.contains("backend") || tags.contains("database") {
            multiplier *= 1.5;
        }
        if tags.contains("security") {
            multiplier *= 2.0;
        }

        let estimated = base_hours * multiplier;
        ResolutionPrediction {
            estimated_hours: estimated,
            low_hours: estimated * 0.5,
            high_hours: estimated * 2.0,
            source: String::new(),
        }
    }

    pub fn default_chat_suggestions() -> Vec<String> {
        [
            "What does each severity mean?",
            "How does the issue workflow work?",
            "Who can assign issues?",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    pub fn chat(message: &str) -> ChatReply {
        let text = message.to_lowercase();
        let (reply, suggestions): (&str, &[&str]) = if text.contains("severity") {
            (
                "Severity ranks impact: LOW for polish, MEDIUM for everyday bugs, \
                 HIGH for broken functionality, CRITICAL for outages or data loss. \
                 Maintainers can adjust it after triage.",
                &["How does the issue workflow work?", "Who can change severity?"],
            )
        } else if text.contains("status") || text.contains("workflow") {
            (
                "Issues move through OPEN, TRIAGED, IN_PROGRESS and DONE. \
                 Maintainers and admins change the status; reporters can edit the \
                 title and description of their own issue while it is still OPEN.",
                &["Who can assign issues?", "What does each severity mean?"],
            )
        } else if text.contains("assign") {
            (
                "Only maintainers and admins can assign issues, and only to active \
                 maintainers or admins. Try the suggest-assignee endpoint for a \
                 workload-based recommendation.",
                &["How does the issue workflow work?"],
            )
        } else if text.contains("upload") || text.contains("attach") || text.contains("file") {
            (
                "You can attach one file per issue at creation time. Allowed types: \
                 pdf, jpg, jpeg, png, gif, doc, docx and txt, up to 10 MB.",
                &["How do I report an issue?"],
            )
        } else if text.contains("hello") || text.contains("hi") {
            (
                "Hello! Ask me about severities, statuses, assignments or attachments.",
                &[],
            )
        } else {
            (
                "I can explain severities, the issue workflow, assignment rules and \
                 file attachments. What would you like to know?",
                &[],
            )
        };
        let suggestions = if suggestions.is_empty() {
            default_chat_suggestions()
        } else {
            suggestions.iter().map(|s| s.to_string()).collect()
        };
        ChatReply {
            reply: reply.to_string(),
            suggestions,
            source: String::new(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
