use serde::Deserialize;
use serde_json::{json, Value};

use crate::pipeline::{DialogueContext, Generation};
use crate::session::{FeedbackCategory, FeedbackItem, Role};

/// System prompt for one role-play scenario
pub fn system_prompt(context: &DialogueContext) -> String {
    let scenario = &context.scenario;
    let language = if scenario.language.is_empty() {
        "English"
    } else {
        scenario.language.as_str()
    };

    format!(
        r#"You are role-playing to help a learner practice spoken {language}.
Scenario: {title}
{description}
You play the {ai_role}. The learner plays the {user_role}.

Reply in {language} with one or two short, natural sentences and stay in character.
The learner's words were transcribed from speech, so ignore punctuation and casing.
Point out mistakes in the learner's last message. Number the words of that message by
splitting on whitespace, starting at 0. Use the categories "grammar", "spelling" and
"word" for a single word and "style" (with a null index) for the whole sentence.
Set "finished" to true only when the scenario has reached a natural end.

Respond as STRICT JSON:
{{"reply": "<text>", "feedback": [{{"index": <number or null>, "category": "<category>", "suggestion": "<text>", "explanation": "<text>"}}], "finished": <true|false>}}"#,
        language = language,
        title = scenario.title,
        description = scenario.description,
        ai_role = scenario.ai_role,
        user_role = scenario.user_role,
    )
}

/// Chat messages: system prompt, history oldest first, then the new utterance
pub fn chat_messages(context: &DialogueContext) -> Vec<Value> {
    let mut messages = Vec::with_capacity(context.history.len() + 2);
    messages.push(json!({ "role": "system", "content": system_prompt(context) }));

    for message in &context.history {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        messages.push(json!({ "role": role, "content": message.content }));
    }

    messages.push(json!({ "role": "user", "content": context.user_text }));
    messages
}

#[derive(Debug, Deserialize)]
struct RawGeneration {
    reply: String,
    #[serde(default)]
    feedback: Vec<RawFeedback>,
    #[serde(default)]
    finished: bool,
}

#[derive(Debug, Deserialize)]
struct RawFeedback {
    index: Option<usize>,
    category: FeedbackCategory,
    suggestion: String,
    explanation: Option<String>,
}

/// Parse the model's JSON answer
pub fn parse_generation(content: &str) -> anyhow::Result<Generation> {
    let raw: RawGeneration = serde_json::from_str(content.trim())?;

    Ok(Generation {
        reply_text: raw.reply,
        feedback: raw
            .feedback
            .into_iter()
            .map(|f| FeedbackItem {
                word_index: f.index,
                category: f.category,
                suggestion: f.suggestion,
                explanation: f.explanation.filter(|e| !e.is_empty()),
            })
            .collect(),
        is_finished: raw.finished,
    })
}
