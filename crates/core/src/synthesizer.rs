use crate::context::AssembledContext;
use crate::embeddings::join_endpoint;
use crate::error::QueryError;
use crate::models::{Citation, ConversationTurn};
use crate::traits::Synthesizer;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use url::Url;

/// Returned verbatim when synthesis retries are exhausted.
pub const DEGRADED_ANSWER: &str =
    "Unable to generate an answer right now, please retry in a moment.";

/// Returned when retrieval found nothing relevant and the policy is to decline.
pub const DECLINE_ANSWER: &str =
    "I couldn't find any relevant information in your documents to answer this question.";

/// Everything the answer backend needs for one generation call.
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub prompt: String,
    pub question: String,
    pub context: AssembledContext,
}

impl SynthesisRequest {
    pub fn new(
        question: &str,
        context: AssembledContext,
        history: &[ConversationTurn],
    ) -> Self {
        Self {
            prompt: build_prompt(question, &context, history),
            question: question.to_string(),
            context,
        }
    }
}

/// Prompt template: grounding rules, retrieved context, recent conversation,
/// then the question. With no context the instructions switch to
/// general-knowledge mode and say so.
pub fn build_prompt(
    question: &str,
    context: &AssembledContext,
    history: &[ConversationTurn],
) -> String {
    let mut prompt = String::new();

    if context.is_empty() {
        prompt.push_str(
            "You are a helpful assistant. No document context was retrieved for this \
             question, so answer from general knowledge and say that the answer does \
             not come from the uploaded documents.\n\n",
        );
    } else {
        prompt.push_str(
            "You are a helpful assistant that answers questions based ONLY on the \
             provided context.\n\n\
             IMPORTANT RULES:\n\
             1. Answer ONLY using information from the context below\n\
             2. If the context doesn't contain relevant information, say \"I don't \
             have information about that in the uploaded documents\"\n\
             3. Cite sources as [Source: <document>, Page <n>]\n\
             4. Be concise but thorough\n\n",
        );
        prompt.push_str("CONTEXT:\n");
        prompt.push_str(&context.rendered);
        prompt.push_str("\n\n");
    }

    if !history.is_empty() {
        prompt.push_str("PREVIOUS CONVERSATION:\n");
        for turn in history {
            prompt.push_str(&format!("USER: {}\n", turn.question));
            prompt.push_str(&format!("ASSISTANT: {}\n", turn.answer));
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!("QUESTION: {question}\n\nANSWER:"));
    prompt
}

/// Cross-check `[Source: ...]` markers in a synthesized answer against the
/// context that was actually provided. Markers naming documents absent from
/// the context are hallucinated: they are stripped from the answer and never
/// reported to the caller. Returns the cleaned answer and the citations that
/// were actually referenced (all provided citations when the answer carries no
/// explicit markers).
pub fn validate_citations(answer: &str, provided: &[Citation]) -> (String, Vec<Citation>) {
    let marker =
        Regex::new(r"\[Source:\s*([^,\]]+?)\s*(?:,\s*Page\s*(\d+)\s*)?\]").expect("marker regex");

    let mut referenced: Vec<Citation> = Vec::new();
    let mut saw_marker = false;

    let mut cleaned = String::with_capacity(answer.len());
    let mut last_end = 0;

    for caps in marker.captures_iter(answer) {
        let Some(whole) = caps.get(0) else { continue };
        saw_marker = true;

        let document = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        let page: Option<u32> = caps.get(2).and_then(|m| m.as_str().parse().ok());

        match find_citation(provided, document, page) {
            Some(citation) => {
                if !referenced
                    .iter()
                    .any(|c| c.document == citation.document && c.page == citation.page)
                {
                    referenced.push(citation.clone());
                }
                cleaned.push_str(&answer[last_end..whole.end()]);
            }
            // Hallucinated marker: splice it out, collapsing the whitespace
            // gap it leaves without touching spacing elsewhere in the answer.
            None => {
                let mut kept = &answer[last_end..whole.start()];
                if answer[whole.end()..].starts_with(char::is_whitespace) {
                    kept = kept.trim_end();
                }
                cleaned.push_str(kept);
            }
        }

        last_end = whole.end();
    }
    cleaned.push_str(&answer[last_end..]);

    let citations = if saw_marker && !referenced.is_empty() {
        referenced
    } else {
        provided.to_vec()
    };

    (cleaned.trim().to_string(), citations)
}

fn find_citation<'a>(
    provided: &'a [Citation],
    document: &str,
    page: Option<u32>,
) -> Option<&'a Citation> {
    let lowered = document.to_lowercase();

    provided
        .iter()
        .find(|citation| {
            citation.document.to_lowercase() == lowered
                && page.map_or(true, |p| citation.page == p)
        })
        .or_else(|| {
            provided
                .iter()
                .find(|citation| citation.document.to_lowercase() == lowered)
        })
}

/// Remote synthesizer speaking the OpenAI-compatible chat completions
/// protocol (Groq, OpenAI, or any proxy of the same shape).
pub struct HttpSynthesizer {
    endpoint: Url,
    model: String,
    api_key: Option<String>,
    temperature: f64,
    max_tokens: u32,
    client: Client,
}

impl HttpSynthesizer {
    pub fn new(
        endpoint: &str,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, QueryError> {
        Ok(Self {
            endpoint: join_endpoint(endpoint, "chat/completions")?,
            model: model.into(),
            api_key,
            temperature: 0.1,
            max_tokens: 1024,
            client: Client::new(),
        })
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<String, QueryError> {
        let mut http_request = self.client.post(self.endpoint.clone()).json(&json!({
            "model": self.model,
            "messages": [{"role": "user", "content": request.prompt}],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        }));

        if let Some(api_key) = &self.api_key {
            http_request = http_request.bearer_auth(api_key);
        }

        let response = http_request.send().await?;
        if !response.status().is_success() {
            return Err(QueryError::SynthesisUnavailable(format!(
                "synthesis backend returned {}",
                response.status()
            )));
        }

        let payload: Value = response.json().await?;
        let answer = payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(|text| text.trim().to_string())
            .ok_or_else(|| {
                QueryError::SynthesisUnavailable("synthesis response missing content".to_string())
            })?;

        if answer.is_empty() {
            return Err(QueryError::SynthesisUnavailable(
                "synthesis response was empty".to_string(),
            ));
        }

        Ok(answer)
    }
}

/// Offline synthesizer for the `Local` backend: answers with the
/// highest-scoring retrieved passages verbatim, each tagged with its source.
/// No network, deterministic, and honest about being extractive.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractiveSynthesizer;

#[async_trait]
impl Synthesizer for ExtractiveSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<String, QueryError> {
        if request.context.is_empty() {
            return Ok(DECLINE_ANSWER.to_string());
        }

        let mut answer = String::from("Most relevant passages from your documents:\n");
        for block in request.context.blocks.iter().take(3) {
            answer.push_str(&format!(
                "\n- \"{}\" [Source: {}, Page {}]",
                block.text, block.citation.document, block.citation.page
            ));
        }

        Ok(answer)
    }
}
