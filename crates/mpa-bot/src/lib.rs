//! Conversational advisor: per-session state machine, grounded prompt
//! assembly, and the chat-model seam.
//!
//! Each end-user session is an independent finite-state dialogue; the only
//! shared data is the read-only program corpus, re-read from the store on
//! every completed flow so a running bot picks up fresh ingests without a
//! restart. The transport (bot framework, terminal, test harness) translates
//! its own affordances into [`UserEvent`]s and renders [`Reply`]s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use mpa_core::ProgramRecord;
use mpa_storage::ProgramRepository;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{error, warn};

pub const CRATE_NAME: &str = "mpa-bot";

/// Maximum number of study-plan characters included per program block in a
/// recommendation prompt. The front of the text is kept (the head of a study
/// plan carries the curriculum outline) and a marker is appended whenever
/// anything was cut, so the model does not mistake the cut for the end of the
/// document.
pub const PLAN_TEXT_MAX_CHARS: usize = 4_000;

const PLAN_TRUNCATION_MARKER: &str = " [study plan text truncated]";

const RECOMMENDATION_SYSTEM_PROMPT: &str =
    "You are an expert on ITMO University master's degree programs.";
const QUESTION_SYSTEM_PROMPT: &str = "You are an expert on ITMO University master's degree \
     programs. If the question is not related to these programs, say so.";
const CLOSING_INSTRUCTION: &str = "Recommend a program and propose its key electives.";

pub const MENU_RECOMMEND: &str = "Recommend a program";
pub const MENU_ASK: &str = "Ask about a program";

const GREETING: &str = "Hi! Choose an action:";
const CHOOSE_AGAIN: &str = "Choose an action:";
const PROMPT_BACKGROUND: &str = "Please tell me about your academic background:";
const PROMPT_INTERESTS: &str =
    "Which topics and directions interest you, and what are your goals after the degree?";
const PROMPT_QUESTION: &str = "Enter your question about the programs:";
const RECOMMENDATION_FAILED: &str =
    "Sorry, the recommendation could not be prepared. Please try again later.";
const QUESTION_FAILED: &str =
    "Sorry, your question could not be processed. Please try again later.";
const GOODBYE: &str = "Take care!";

#[derive(Debug, Error)]
pub enum ModelInvocationError {
    #[error("model invocation failed: {0}")]
    Provider(String),
    #[error("model invocation timed out after {0}s")]
    TimedOut(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
}

/// One role-tagged block of an assembled prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Flow-specific user input handed to the prompt assembler.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptInput<'a> {
    Recommendation {
        background: &'a str,
        interests: &'a str,
    },
    Question {
        question: &'a str,
    },
}

/// Assemble the grounded prompt for one flow.
///
/// Order: system instruction, the labelled user input, one block per program
/// (in the iteration order of `records`; the store returns them sorted by
/// slug), and a closing instruction for the recommendation flow. An empty
/// record set still yields a valid, if under-informed, prompt.
pub fn build_prompt(records: &[ProgramRecord], input: &PromptInput<'_>) -> Vec<PromptMessage> {
    let mut messages = Vec::with_capacity(records.len() + 3);

    match input {
        PromptInput::Recommendation {
            background,
            interests,
        } => {
            messages.push(PromptMessage::system(RECOMMENDATION_SYSTEM_PROMPT));
            messages.push(PromptMessage::user(format!(
                "Applicant background: {background}\nInterests and goals: {interests}"
            )));
            for record in records {
                messages.push(PromptMessage::user(render_program_block(record, true)));
            }
            messages.push(PromptMessage::user(CLOSING_INSTRUCTION));
        }
        PromptInput::Question { question } => {
            messages.push(PromptMessage::system(QUESTION_SYSTEM_PROMPT));
            messages.push(PromptMessage::user(format!("Question: {question}")));
            for record in records {
                messages.push(PromptMessage::user(render_program_block(record, false)));
            }
        }
    }

    messages
}

/// Render one program as `label: value` lines in a fixed field order.
///
/// The recommendation flow carries the (bounded) study-plan text; the
/// question flow carries the plan's source URL instead.
fn render_program_block(record: &ProgramRecord, include_plan_text: bool) -> String {
    let mut lines = vec![
        format!("slug: {}", record.slug),
        format!("program_id: {}", record.program_id),
        format!("title: {}", record.title),
        format!("exam_dates: {}", record.exam_dates),
        format!("admission_quotas: {}", record.admission_quotas),
    ];
    if include_plan_text {
        lines.push(format!(
            "document_text: {}",
            truncate_plan_text(&record.document_text, PLAN_TEXT_MAX_CHARS)
        ));
    } else {
        lines.push(format!("document_url: {}", record.document_url));
    }
    lines.join("\n")
}

fn truncate_plan_text(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => {
            let mut out = text[..cut].to_string();
            out.push_str(PLAN_TRUNCATION_MARKER);
            out
        }
    }
}

/// Text-completion seam; implemented over edgequake-llm in production and by
/// mocks under test.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[PromptMessage]) -> Result<String, ModelInvocationError>;
}

/// [`ChatModel`] over an edgequake-llm provider with a bounded call timeout.
pub struct LlmChatModel {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
    timeout_secs: u64,
}

impl LlmChatModel {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            options: CompletionOptions {
                temperature: Some(0.2),
                max_tokens: Some(1024),
                ..Default::default()
            },
            timeout_secs: 60,
        }
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

#[async_trait]
impl ChatModel for LlmChatModel {
    async fn complete(&self, messages: &[PromptMessage]) -> Result<String, ModelInvocationError> {
        let chat_messages: Vec<ChatMessage> = messages
            .iter()
            .map(|m| match m.role {
                Role::System => ChatMessage::system(m.content.as_str()),
                Role::User => ChatMessage::user(m.content.as_str()),
            })
            .collect();

        let response = timeout(
            Duration::from_secs(self.timeout_secs),
            self.provider.chat(&chat_messages, Some(&self.options)),
        )
        .await
        .map_err(|_| ModelInvocationError::TimedOut(self.timeout_secs))?
        .map_err(|e| ModelInvocationError::Provider(e.to_string()))?;

        Ok(response.content.trim().to_string())
    }
}

/// OpenAI-backed model; the provider reads `OPENAI_API_KEY` from the
/// environment.
pub fn openai_chat_model(model: &str) -> Result<LlmChatModel, ModelInvocationError> {
    let provider = ProviderFactory::create_llm_provider("openai", model)
        .map_err(|e| ModelInvocationError::Provider(e.to_string()))?;
    Ok(LlmChatModel::new(provider))
}

/// Per-flow answers collected from one user. Cleared on flow entry and on
/// completion or cancellation; never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationContext {
    pub background: Option<String>,
    pub interests: Option<String>,
    pub question: Option<String>,
}

impl ConversationContext {
    fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Choosing,
    Background,
    Interests,
    Ask,
    Cancelled,
}

/// Inbound transport events. The transport maps its own affordances (menu
/// taps, commands, free text) onto these; the machine never parses free text
/// for intent.
#[derive(Debug, Clone, PartialEq)]
pub enum UserEvent {
    Start,
    ChooseRecommendation,
    ChooseQuestion,
    Message(String),
    Cancel,
}

/// Outbound replies; `Menu` is the fixed two-choice affordance offered after
/// each completed flow.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    Menu { text: String, options: Vec<String> },
}

fn menu(text: &str) -> Reply {
    Reply::Menu {
        text: text.to_string(),
        options: vec![MENU_RECOMMEND.to_string(), MENU_ASK.to_string()],
    }
}

#[derive(Debug)]
struct Session {
    state: FlowState,
    context: ConversationContext,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: FlowState::Choosing,
            context: ConversationContext::default(),
        }
    }
}

enum Step {
    Replies(Vec<Reply>),
    Invoke(PendingFlow),
}

enum PendingFlow {
    Recommendation { background: String, interests: String },
    Question { question: String },
}

/// The per-user dialogue engine.
///
/// Collaborators are injected so tests can substitute doubles; sessions are
/// independent and the model call runs outside the session lock, so
/// concurrent sessions interleave freely.
pub struct Dialogue {
    programs: Arc<dyn ProgramRepository>,
    model: Arc<dyn ChatModel>,
    slugs: Vec<String>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl Dialogue {
    pub fn new(
        programs: Arc<dyn ProgramRepository>,
        model: Arc<dyn ChatModel>,
        slugs: Vec<String>,
    ) -> Self {
        Self {
            programs,
            model,
            slugs,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Feed one event into a session's state machine and collect the replies
    /// the transport should deliver.
    pub async fn handle(&self, session_id: &str, event: UserEvent) -> Vec<Reply> {
        let pending = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.entry(session_id.to_string()).or_default();
            match Self::step(session, event) {
                Step::Replies(replies) => return replies,
                Step::Invoke(flow) => flow,
            }
        };

        let (replies, next_state) = self.run_flow(pending).await;

        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.state = next_state;
            session.context.clear();
        }
        replies
    }

    fn step(session: &mut Session, event: UserEvent) -> Step {
        // Start and cancel apply regardless of the current state.
        match event {
            UserEvent::Start => {
                session.state = FlowState::Choosing;
                session.context.clear();
                return Step::Replies(vec![menu(GREETING)]);
            }
            UserEvent::Cancel => {
                session.state = FlowState::Cancelled;
                session.context.clear();
                return Step::Replies(vec![Reply::Text(GOODBYE.to_string())]);
            }
            _ => {}
        }

        match session.state {
            FlowState::Choosing => match event {
                UserEvent::ChooseRecommendation => {
                    session.context.clear();
                    session.state = FlowState::Background;
                    Step::Replies(vec![Reply::Text(PROMPT_BACKGROUND.to_string())])
                }
                UserEvent::ChooseQuestion => {
                    session.context.clear();
                    session.state = FlowState::Ask;
                    Step::Replies(vec![Reply::Text(PROMPT_QUESTION.to_string())])
                }
                // Unrecognised input keeps the menu state.
                _ => Step::Replies(Vec::new()),
            },
            FlowState::Background => match event {
                UserEvent::Message(text) => {
                    session.context.background = Some(text);
                    session.state = FlowState::Interests;
                    Step::Replies(vec![Reply::Text(PROMPT_INTERESTS.to_string())])
                }
                _ => Step::Replies(Vec::new()),
            },
            FlowState::Interests => match event {
                UserEvent::Message(text) => {
                    session.context.interests = Some(text.clone());
                    Step::Invoke(PendingFlow::Recommendation {
                        background: session.context.background.clone().unwrap_or_default(),
                        interests: text,
                    })
                }
                _ => Step::Replies(Vec::new()),
            },
            FlowState::Ask => match event {
                UserEvent::Message(text) => {
                    session.context.question = Some(text.clone());
                    Step::Invoke(PendingFlow::Question { question: text })
                }
                _ => Step::Replies(Vec::new()),
            },
            // Terminal until the next start signal.
            FlowState::Cancelled => Step::Replies(Vec::new()),
        }
    }

    async fn run_flow(&self, flow: PendingFlow) -> (Vec<Reply>, FlowState) {
        let records = match self.programs.fetch_by_slugs(&self.slugs).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "program corpus unavailable; answering ungrounded");
                Vec::new()
            }
        };

        let (messages, failure_text) = match &flow {
            PendingFlow::Recommendation {
                background,
                interests,
            } => (
                build_prompt(
                    &records,
                    &PromptInput::Recommendation {
                        background: background.as_str(),
                        interests: interests.as_str(),
                    },
                ),
                RECOMMENDATION_FAILED,
            ),
            PendingFlow::Question { question } => (
                build_prompt(
                    &records,
                    &PromptInput::Question {
                        question: question.as_str(),
                    },
                ),
                QUESTION_FAILED,
            ),
        };

        match self.model.complete(&messages).await {
            Ok(answer) => (
                vec![Reply::Text(answer), menu(CHOOSE_AGAIN)],
                FlowState::Choosing,
            ),
            Err(err) => {
                error!(error = %err, "model invocation failed");
                (vec![Reply::Text(failure_text.to_string())], FlowState::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpa_storage::{MemoryProgramRepository, PersistenceError};
    use serde_json::json;

    fn ai_record() -> ProgramRecord {
        ProgramRecord {
            slug: "ai".into(),
            program_id: 1,
            title: "AI".into(),
            exam_dates: json!([{ "date": "2026-07-15" }]),
            admission_quotas: json!({ "budget": 50 }),
            document_url: "https://api.test/programs/1/plan/abit/pdf".into(),
            document_path: "/tmp/1_study_plan.pdf".into(),
            document_text: "elective: NLP".into(),
        }
    }

    struct MockModel {
        reply: Option<String>,
        captured: Mutex<Vec<Vec<PromptMessage>>>,
    }

    impl MockModel {
        fn answering(reply: &str) -> Self {
            Self {
                reply: Some(reply.to_string()),
                captured: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                reply: None,
                captured: Mutex::new(Vec::new()),
            }
        }

        async fn last_prompt(&self) -> Vec<PromptMessage> {
            self.captured.lock().await.last().cloned().expect("model was invoked")
        }
    }

    #[async_trait]
    impl ChatModel for MockModel {
        async fn complete(
            &self,
            messages: &[PromptMessage],
        ) -> Result<String, ModelInvocationError> {
            self.captured.lock().await.push(messages.to_vec());
            match &self.reply {
                Some(reply) => Ok(reply.clone()),
                None => Err(ModelInvocationError::Provider("rate limited".into())),
            }
        }
    }

    struct FailingRepository;

    #[async_trait]
    impl ProgramRepository for FailingRepository {
        async fn upsert(&self, _record: &ProgramRecord) -> Result<(), PersistenceError> {
            Err(PersistenceError::Unavailable("down".into()))
        }

        async fn fetch_by_slugs(
            &self,
            _slugs: &[String],
        ) -> Result<Vec<ProgramRecord>, PersistenceError> {
            Err(PersistenceError::Unavailable("down".into()))
        }
    }

    async fn seeded_repository() -> Arc<MemoryProgramRepository> {
        let repo = Arc::new(MemoryProgramRepository::new());
        repo.upsert(&ai_record()).await.unwrap();
        repo
    }

    fn dialogue(model: Arc<MockModel>, repo: Arc<dyn ProgramRepository>) -> Dialogue {
        Dialogue::new(repo, model, vec!["ai".to_string()])
    }

    #[tokio::test]
    async fn recommendation_flow_assembles_prompt_in_order() {
        let model = Arc::new(MockModel::answering("Take the AI program."));
        let bot = dialogue(model.clone(), seeded_repository().await);

        bot.handle("u1", UserEvent::Start).await;
        bot.handle("u1", UserEvent::ChooseRecommendation).await;
        bot.handle("u1", UserEvent::Message("CS degree".into())).await;
        let replies = bot
            .handle("u1", UserEvent::Message("machine learning".into()))
            .await;

        assert_eq!(replies[0], Reply::Text("Take the AI program.".to_string()));
        assert!(matches!(replies[1], Reply::Menu { .. }));

        let prompt = model.last_prompt().await;
        assert_eq!(prompt.len(), 4);
        assert_eq!(prompt[0].role, Role::System);
        assert!(prompt[1].content.contains("CS degree"));
        assert!(prompt[1].content.contains("machine learning"));
        assert!(prompt[2].content.contains("slug: ai"));
        assert!(prompt[2].content.contains("title: AI"));
        assert!(prompt[2].content.contains("document_text: elective: NLP"));
        assert_eq!(prompt[3].content, CLOSING_INSTRUCTION);
    }

    #[tokio::test]
    async fn question_flow_carries_url_instead_of_plan_text() {
        let model = Arc::new(MockModel::answering("Exams are in July."));
        let bot = dialogue(model.clone(), seeded_repository().await);

        bot.handle("u1", UserEvent::Start).await;
        bot.handle("u1", UserEvent::ChooseQuestion).await;
        bot.handle("u1", UserEvent::Message("When are exams?".into()))
            .await;

        let prompt = model.last_prompt().await;
        assert_eq!(prompt.len(), 3);
        assert!(prompt[0].content.contains("not related"));
        assert!(prompt[1].content.contains("When are exams?"));
        assert!(prompt[2]
            .content
            .contains("document_url: https://api.test/programs/1/plan/abit/pdf"));
        assert!(!prompt[2].content.contains("document_text:"));
        assert!(!prompt[2].content.contains("elective: NLP"));
    }

    #[tokio::test]
    async fn unrecognised_input_keeps_the_menu_state() {
        let model = Arc::new(MockModel::answering("ok"));
        let bot = dialogue(model.clone(), seeded_repository().await);

        bot.handle("u1", UserEvent::Start).await;
        let ignored = bot.handle("u1", UserEvent::Message("hello?".into())).await;
        assert!(ignored.is_empty());

        let replies = bot.handle("u1", UserEvent::ChooseRecommendation).await;
        assert_eq!(replies.len(), 1);
    }

    #[tokio::test]
    async fn cancel_is_terminal_and_start_clears_the_context() {
        let model = Arc::new(MockModel::answering("ok"));
        let bot = dialogue(model.clone(), seeded_repository().await);

        bot.handle("u1", UserEvent::Start).await;
        bot.handle("u1", UserEvent::ChooseRecommendation).await;
        bot.handle("u1", UserEvent::Message("CS degree".into())).await;

        let replies = bot.handle("u1", UserEvent::Cancel).await;
        assert_eq!(replies, vec![Reply::Text(GOODBYE.to_string())]);

        // Terminal: a menu choice no longer does anything.
        assert!(bot.handle("u1", UserEvent::ChooseRecommendation).await.is_empty());

        // A fresh start re-enters the menu with a cleared context.
        bot.handle("u1", UserEvent::Start).await;
        bot.handle("u1", UserEvent::ChooseRecommendation).await;
        bot.handle("u1", UserEvent::Message("physics".into())).await;
        bot.handle("u1", UserEvent::Message("optics".into())).await;

        let prompt = model.last_prompt().await;
        assert!(prompt[1].content.contains("physics"));
        assert!(!prompt[1].content.contains("CS degree"));
    }

    #[tokio::test]
    async fn model_failure_terminates_the_flow() {
        let model = Arc::new(MockModel::failing());
        let bot = dialogue(model.clone(), seeded_repository().await);

        bot.handle("u1", UserEvent::Start).await;
        bot.handle("u1", UserEvent::ChooseQuestion).await;
        let replies = bot
            .handle("u1", UserEvent::Message("When are exams?".into()))
            .await;

        assert_eq!(replies, vec![Reply::Text(QUESTION_FAILED.to_string())]);

        // No retry, no menu: the session is over until the next start.
        assert!(bot.handle("u1", UserEvent::ChooseQuestion).await.is_empty());
        let restarted = bot.handle("u1", UserEvent::Start).await;
        assert!(matches!(restarted[0], Reply::Menu { .. }));
    }

    #[tokio::test]
    async fn unavailable_store_degrades_to_an_ungrounded_prompt() {
        let model = Arc::new(MockModel::answering("ok"));
        let bot = dialogue(model.clone(), Arc::new(FailingRepository));

        bot.handle("u1", UserEvent::Start).await;
        bot.handle("u1", UserEvent::ChooseQuestion).await;
        let replies = bot
            .handle("u1", UserEvent::Message("When are exams?".into()))
            .await;

        assert_eq!(replies[0], Reply::Text("ok".to_string()));
        let prompt = model.last_prompt().await;
        assert_eq!(prompt.len(), 2);
    }

    #[test]
    fn empty_record_set_still_builds_a_valid_prompt() {
        let messages = build_prompt(
            &[],
            &PromptInput::Recommendation {
                background: "CS degree",
                interests: "machine learning",
            },
        );
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[2].content, CLOSING_INSTRUCTION);
    }

    #[test]
    fn plan_text_is_cut_at_the_budget_keeping_the_front() {
        let long = "x".repeat(PLAN_TEXT_MAX_CHARS + 500);
        let cut = truncate_plan_text(&long, PLAN_TEXT_MAX_CHARS);
        assert!(cut.starts_with("xxxx"));
        assert!(cut.ends_with(PLAN_TRUNCATION_MARKER));
        assert_eq!(
            cut.len(),
            PLAN_TEXT_MAX_CHARS + PLAN_TRUNCATION_MARKER.len()
        );

        let short = "short plan";
        assert_eq!(truncate_plan_text(short, PLAN_TEXT_MAX_CHARS), short);
    }

    #[test]
    fn plan_text_cut_lands_on_a_char_boundary() {
        let long = "é".repeat(PLAN_TEXT_MAX_CHARS + 10);
        let cut = truncate_plan_text(&long, PLAN_TEXT_MAX_CHARS);
        assert_eq!(cut.chars().count(), PLAN_TEXT_MAX_CHARS + PLAN_TRUNCATION_MARKER.chars().count());
    }
}
