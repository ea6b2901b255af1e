use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Context as _;
use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct OpenAiStubConfig {
    /// Answer drafting requests for this chapter order with HTTP 500.
    pub fail_draft_for_chapter: Option<u64>,
}

pub struct OpenAiStub {
    pub base_url: String,
    requests: Arc<AtomicUsize>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl OpenAiStub {
    pub fn spawn(config: OpenAiStubConfig) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start openai stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}/v1");
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&requests);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let mut request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };
                counter.fetch_add(1, Ordering::SeqCst);

                let path = request.url().to_string();
                if request.method() != &tiny_http::Method::Post || path != "/v1/responses" {
                    let _ = request.respond(
                        tiny_http::Response::from_string("not found").with_status_code(404),
                    );
                    continue;
                }

                let mut body = String::new();
                if request.as_reader().read_to_string(&mut body).is_err() {
                    let _ = request.respond(
                        tiny_http::Response::from_string("invalid request body")
                            .with_status_code(400),
                    );
                    continue;
                }

                let parsed: Value = match serde_json::from_str(&body) {
                    Ok(value) => value,
                    Err(_) => {
                        let _ = request.respond(
                            tiny_http::Response::from_string("invalid json").with_status_code(400),
                        );
                        continue;
                    }
                };

                let prompt = prompt_text(&parsed);
                let output_text = match respond_to(&prompt, &config) {
                    Ok(Reply::Text(text)) => text,
                    Ok(Reply::ServerError) => {
                        let _ = request.respond(
                            tiny_http::Response::from_string(
                                r#"{"error":{"message":"stub upstream failure"}}"#,
                            )
                            .with_status_code(500),
                        );
                        continue;
                    }
                    Err(err) => {
                        let _ = request.respond(
                            tiny_http::Response::from_string(format!(
                                "failed to build stub response: {err:#}"
                            ))
                            .with_status_code(400),
                        );
                        continue;
                    }
                };

                let response_body = serde_json::json!({
                    "id": "resp_stub",
                    "object": "response",
                    "model": parsed.get("model").cloned().unwrap_or(Value::String("stub-model".to_owned())),
                    "output": [
                        {
                            "type": "message",
                            "role": "assistant",
                            "content": [
                                { "type": "output_text", "text": output_text }
                            ]
                        }
                    ]
                });

                let mut response = tiny_http::Response::from_string(response_body.to_string())
                    .with_status_code(200);
                let header =
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                        .expect("build header");
                response = response.with_header(header);
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            requests,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for OpenAiStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

enum Reply {
    Text(String),
    ServerError,
}

/// `instructions` plus every input message, joined.
fn prompt_text(request: &Value) -> String {
    let mut parts = Vec::new();
    if let Some(instructions) = request.get("instructions").and_then(|v| v.as_str()) {
        parts.push(instructions.to_owned());
    }
    if let Some(items) = request.get("input").and_then(|v| v.as_array()) {
        for item in items {
            if let Some(content) = item.get("content").and_then(|v| v.as_str()) {
                parts.push(content.to_owned());
            }
        }
    }
    parts.join("\n")
}

fn respond_to(prompt: &str, config: &OpenAiStubConfig) -> anyhow::Result<Reply> {
    if let Some(input) = marked_json(prompt, "ANALYST")? {
        return analyst_response(&input).map(Reply::Text);
    }
    if marked_json(prompt, "BONUS")?.is_some() {
        return Ok(Reply::Text(r#"{"topics":[]}"#.to_owned()));
    }
    if let Some(input) = marked_json(prompt, "PLAN")? {
        return plan_response(&input).map(Reply::Text);
    }
    if let Some(input) = marked_json(prompt, "BRIEF")? {
        return brief_response(&input).map(Reply::Text);
    }
    if let Some(input) = marked_json(prompt, "DRAFT")? {
        let order = input
            .pointer("/brief/chapter_order")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if config.fail_draft_for_chapter == Some(order) {
            return Ok(Reply::ServerError);
        }
        return draft_response(&input).map(Reply::Text);
    }
    anyhow::bail!("unknown prompt mode")
}

fn marked_json(prompt: &str, mode: &str) -> anyhow::Result<Option<Value>> {
    let begin = format!("BEGIN_{mode}_INPUT_JSON\n");
    let end = format!("\nEND_{mode}_INPUT_JSON");
    let Some(raw) = extract_between(prompt, &begin, &end) else {
        return Ok(None);
    };
    let value = serde_json::from_str(raw).with_context(|| format!("parse {mode} input json"))?;
    Ok(Some(value))
}

fn extract_between<'a>(text: &'a str, begin: &str, end: &str) -> Option<&'a str> {
    let start = text.find(begin)? + begin.len();
    let rest = &text[start..];
    let end_rel = rest.find(end)?;
    Some(&rest[..end_rel])
}

/// One `event` fact per utterance, quoted verbatim so it is grounded.
fn analyst_response(input: &Value) -> anyhow::Result<String> {
    let utterances = input
        .get("utterances")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("missing utterances array"))?;
    let facts = utterances
        .iter()
        .filter_map(|u| u.as_str())
        .map(|text| serde_json::json!({ "category": "event", "value": text, "context": "stub" }))
        .collect::<Vec<_>>();

    // Fenced on purpose: the decoder must accept both forms.
    Ok(format!(
        "```json\n{}\n```",
        serde_json::json!({
            "facts": facts,
            "summary": format!("{} new utterance(s).", utterances.len()),
            "density_score": 0.6,
        })
    ))
}

/// One chapter per session, in session order.
fn plan_response(input: &Value) -> anyhow::Result<String> {
    let sessions = input
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("plan input is not an array"))?;
    let ids = sessions
        .iter()
        .filter_map(|s| s.get("session_id").and_then(|v| v.as_str()))
        .collect::<Vec<_>>();
    if ids.is_empty() {
        anyhow::bail!("no sessions in plan input");
    }

    let chapters = ids
        .iter()
        .enumerate()
        .map(|(idx, id)| {
            serde_json::json!({
                "order": idx + 1,
                "title": format!("Chapter {}", idx + 1),
                "age_range": "unknown",
                "narrative_goal": "Tell what happened.",
                "key_themes": ["memory"],
                "source_sessions": [id],
            })
        })
        .collect::<Vec<_>>();
    let mut transitions = serde_json::Map::new();
    for order in 1..ids.len() {
        transitions.insert(
            format!("{order}->{}", order + 1),
            Value::String("Time moved on.".to_owned()),
        );
    }

    Ok(serde_json::json!({
        "narrative_arc": "A life told in order.",
        "themes": ["memory"],
        "tone": "warm",
        "chapters_outline": chapters,
        "transitions_map": transitions,
        "anachronisms": [],
        "quality_scores": { "chronological_coherence": 1.0, "narrative_potential": 0.7 },
    })
    .to_string())
}

fn brief_response(input: &Value) -> anyhow::Result<String> {
    let title = input
        .pointer("/chapter/title")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing chapter title"))?;
    let facts = input
        .get("facts")
        .and_then(|v| v.as_array())
        .map(|facts| {
            facts
                .iter()
                .filter_map(|f| f.get("value").and_then(|v| v.as_str()))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Ok(serde_json::json!({
        "title": title,
        "narrative_instructions": "Open with a sensory detail.",
        "style_notes": "Short sentences.",
        "facts_to_integrate": facts,
        "structure_suggestion": "Three scenes.",
        "target_length": 600,
        "emotional_tone": "tender",
    })
    .to_string())
}

fn draft_response(input: &Value) -> anyhow::Result<String> {
    let brief = input
        .get("brief")
        .ok_or_else(|| anyhow::anyhow!("missing brief"))?;
    let order = brief
        .get("chapter_order")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| anyhow::anyhow!("missing chapter_order"))?;
    let facts = brief
        .get("facts_to_integrate")
        .and_then(|v| v.as_array())
        .map(|facts| facts.iter().filter_map(|f| f.as_str()).collect::<Vec<_>>())
        .unwrap_or_default();

    let content = format!("Chapter {order}. I remember this. {}", facts.join(" "));
    Ok(serde_json::json!({
        "content": content,
        "word_count": content.split_whitespace().count(),
        "facts_integrated_count": facts.len(),
    })
    .to_string())
}
