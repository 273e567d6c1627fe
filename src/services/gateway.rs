//! The chat gateway: question in, persisted assistant turn out.
//!
//! Every question runs the same sequential pipeline: resolve the provider, generate SQL,
//! extract it from the completion, validate it, execute it read-only and compose a Markdown
//! answer. Guard rejections and execution failures are answered with fixed messages; provider
//! failures become a generic error turn in `ask` and an error for the caller in `ask_stream`.

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::conversation::{NewTurn, Turn, TurnMetadata};
use crate::models::query::{QueryResultSet, RejectionKind};
use crate::services::composer::{
    canned_rejection, fallback_summary, ResponseComposer, GENERIC_QUERY_ERROR, QUERY_NOT_GENERABLE,
};
use crate::services::error::GatewayError;
use crate::services::llm::{CompletionRequest, LlmProvider, ProviderFactory};
use crate::services::query_executor::{QueryExecutor, ReadOnlyDatabase};
use crate::services::query_guard::QueryGuard;
use crate::services::sql_extractor;
use crate::services::transcript::{LlmTranscriptBuilder, FALLBACK_SQL};
use crate::services::{ChatStoreTrait, SettingsProviderTrait};

pub const SQL_MAX_TOKENS: u32 = 1000;
pub const SQL_TEMPERATURE: f32 = 0.1;

/// One item of a streamed answer
#[derive(Debug)]
pub enum StreamChunk {
    Delta(String),
    /// Last item: the persisted assistant turn
    Done(Turn),
}

pub type AnswerStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, GatewayError>> + Send>>;

#[derive(Debug, Clone, Copy)]
enum Stage {
    ValidatingConfig,
    GeneratingSql,
    ExtractingSql,
    Guarding,
    Executing,
    ComposingAnswer,
    Persisted,
    PersistedError,
}

/// Where the pipeline stands once the query has been dealt with
enum Prepared {
    /// Fixed reply, nothing left to compose
    Reply(NewTurn),
    Answer {
        sql: String,
        results: QueryResultSet,
        metadata: TurnMetadata,
    },
}

pub struct ChatGateway<S, C, D>
where
    S: ChatStoreTrait + Clone,
    C: SettingsProviderTrait,
    D: ReadOnlyDatabase,
{
    store: S,
    settings: C,
    providers: Arc<dyn ProviderFactory>,
    guard: QueryGuard,
    transcript: LlmTranscriptBuilder,
    composer: ResponseComposer,
    executor: QueryExecutor<D>,
}

impl<S, C, D> ChatGateway<S, C, D>
where
    S: ChatStoreTrait + Clone,
    C: SettingsProviderTrait,
    D: ReadOnlyDatabase,
{
    pub fn new(store: S, settings: C, database: D, providers: Arc<dyn ProviderFactory>, guard: QueryGuard) -> Self {
        let transcript = LlmTranscriptBuilder::new(guard.allowed_tables());
        Self {
            store,
            settings,
            providers,
            composer: ResponseComposer::new(transcript.clone()),
            transcript,
            guard,
            executor: QueryExecutor::new(database),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn stage(&self, thread_id: Uuid, stage: Stage) {
        debug!("[thread {}] {:?}", thread_id, stage);
    }

    /// Resolve the provider and load the history. Nothing is persisted and nothing touches
    /// the network when this fails.
    async fn open(&self, thread_id: Uuid) -> Result<(Box<dyn LlmProvider>, Vec<Turn>), GatewayError> {
        self.stage(thread_id, Stage::ValidatingConfig);
        let config = self.settings.provider_configuration()?;
        let provider = self.providers.build(&config).map_err(|e| {
            warn!("[thread {}] AI chat unavailable: {}", thread_id, e);
            e
        })?;

        if self.store.get_thread(thread_id).await?.is_none() {
            return Err(GatewayError::ThreadNotFound(thread_id));
        }
        let history = self.store.list_turns(thread_id).await?;
        Ok((provider, history))
    }

    /// Answer a question and persist the exchange. On success exactly one user turn and one
    /// assistant turn are appended.
    pub async fn ask(&self, thread_id: Uuid, question: &str) -> Result<Turn, GatewayError> {
        let question = question.trim();
        let (provider, history) = self.open(thread_id).await?;
        info!("[thread {}] Question via {} ({})", thread_id, provider.display_name(), provider.model());

        self.store.append_turn(thread_id, NewTurn::user(question)).await?;

        let reply = match self.answer(provider.as_ref(), thread_id, &history, question).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("[thread {}] Answering failed: {}", thread_id, e);
                self.stage(thread_id, Stage::PersistedError);
                error_turn(provider.as_ref(), &e)
            }
        };

        let turn = self.store.append_turn(thread_id, reply).await?;
        self.stage(thread_id, Stage::Persisted);
        Ok(turn)
    }

    /// Like [`ask`](Self::ask) but the answer text arrives as deltas.
    ///
    /// SQL generation, validation and execution happen before the stream is returned; a
    /// provider failure there is returned as an error. Both turns are persisted only when the
    /// stream ends normally, so an aborted or abandoned stream leaves the thread untouched and
    /// the caller may retry with `ask`.
    pub async fn ask_stream(&self, thread_id: Uuid, question: &str) -> Result<AnswerStream, GatewayError> {
        let question = question.trim().to_string();
        let (provider, history) = self.open(thread_id).await?;
        info!("[thread {}] Streaming question via {}", thread_id, provider.display_name());

        let prepared = self.prepare(provider.as_ref(), thread_id, &history, &question).await?;
        let store = self.store.clone();

        match prepared {
            Prepared::Reply(reply) => Ok(Box::pin(async_stream::stream! {
                yield Ok(StreamChunk::Delta(reply.content.clone()));
                match persist_exchange(&store, thread_id, question, reply).await {
                    Ok(turn) => yield Ok(StreamChunk::Done(turn)),
                    Err(e) => yield Err(e),
                }
            })),
            Prepared::Answer { sql, results, metadata } => {
                self.stage(thread_id, Stage::ComposingAnswer);
                let mut deltas = self
                    .composer
                    .compose_stream(provider.as_ref(), &question, &sql, &results)
                    .await?;

                Ok(Box::pin(async_stream::stream! {
                    let mut text = String::new();
                    while let Some(delta) = deltas.next().await {
                        match delta {
                            Ok(delta) => {
                                text.push_str(&delta);
                                yield Ok(StreamChunk::Delta(delta));
                            }
                            Err(e) => {
                                warn!("[thread {}] Answer stream aborted after {} chars: {}", thread_id, text.len(), e);
                                yield Err(e);
                                return;
                            }
                        }
                    }

                    if text.trim().is_empty() {
                        text = fallback_summary(&results);
                        yield Ok(StreamChunk::Delta(text.clone()));
                    }

                    let reply = NewTurn::assistant(text.trim())
                        .with_query(sql, results.rows)
                        .with_metadata(metadata);
                    match persist_exchange(&store, thread_id, question, reply).await {
                        Ok(turn) => {
                            debug!("[thread {}] {:?}", thread_id, Stage::Persisted);
                            yield Ok(StreamChunk::Done(turn));
                        }
                        Err(e) => yield Err(e),
                    }
                }))
            }
        }
    }

    async fn answer(
        &self,
        provider: &dyn LlmProvider,
        thread_id: Uuid,
        history: &[Turn],
        question: &str,
    ) -> Result<NewTurn, GatewayError> {
        match self.prepare(provider, thread_id, history, question).await? {
            Prepared::Reply(reply) => Ok(reply),
            Prepared::Answer { sql, results, metadata } => {
                self.stage(thread_id, Stage::ComposingAnswer);
                let answer = self.composer.compose(provider, question, &sql, &results).await?;
                Ok(NewTurn::assistant(answer)
                    .with_query(sql, results.rows)
                    .with_metadata(metadata))
            }
        }
    }

    async fn prepare(
        &self,
        provider: &dyn LlmProvider,
        thread_id: Uuid,
        history: &[Turn],
        question: &str,
    ) -> Result<Prepared, GatewayError> {
        let mut metadata = TurnMetadata::for_provider(provider.provider_id(), provider.model());

        self.stage(thread_id, Stage::GeneratingSql);
        let request = CompletionRequest::new(
            self.transcript.build_sql_generation_prompt(history, question),
            SQL_MAX_TOKENS,
            SQL_TEMPERATURE,
        );
        let raw = provider.complete(&request).await?;

        self.stage(thread_id, Stage::ExtractingSql);
        let sql = sql_extractor::extract(&raw)?;
        debug!("[thread {}] Generated SQL: {}", thread_id, sql);
        if is_fallback_query(&sql) {
            info!("[thread {}] Model could not map the question to a query", thread_id);
            return Ok(Prepared::Reply(NewTurn::assistant(QUERY_NOT_GENERABLE).with_metadata(metadata)));
        }

        self.stage(thread_id, Stage::Guarding);
        let decision = self.guard.validate(&sql);
        if !decision.accepted {
            let kind = decision.rejection_kind.unwrap_or(RejectionKind::NotSelect);
            let rejection = GatewayError::QueryRejected {
                kind,
                detail: decision.rejection_reason.unwrap_or_default(),
            };
            warn!("[thread {}] {}", thread_id, rejection);
            metadata.rejection = Some(kind.as_str().to_string());
            return Ok(Prepared::Reply(
                NewTurn::assistant(canned_rejection(kind)).with_metadata(metadata),
            ));
        }

        self.stage(thread_id, Stage::Executing);
        match self.executor.execute(&decision.normalized_sql).await {
            Ok(results) => {
                metadata.results_count = Some(results.count);
                if results.truncated {
                    metadata.truncated = Some(true);
                }
                Ok(Prepared::Answer {
                    sql: decision.normalized_sql,
                    results,
                    metadata,
                })
            }
            Err(e) => {
                warn!("[thread {}] {}", thread_id, e);
                metadata.error = Some(true);
                metadata.error_message = Some(e.summary());
                let mut reply = NewTurn::assistant(GENERIC_QUERY_ERROR).with_metadata(metadata);
                reply.query_generated = Some(decision.normalized_sql);
                Ok(Prepared::Reply(reply))
            }
        }
    }
}

fn is_fallback_query(sql: &str) -> bool {
    let collapsed = sql
        .trim()
        .trim_end_matches(';')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    collapsed.eq_ignore_ascii_case(FALLBACK_SQL)
}

fn error_turn(provider: &dyn LlmProvider, error: &GatewayError) -> NewTurn {
    let mut metadata = TurnMetadata::for_provider(provider.provider_id(), provider.model());
    metadata.error = Some(true);
    metadata.error_message = Some(error.summary());
    NewTurn::assistant(GENERIC_QUERY_ERROR).with_metadata(metadata)
}

async fn persist_exchange<S: ChatStoreTrait>(
    store: &S,
    thread_id: Uuid,
    question: String,
    reply: NewTurn,
) -> Result<Turn, GatewayError> {
    store.append_turn(thread_id, NewTurn::user(question)).await?;
    Ok(store.append_turn(thread_id, reply).await?)
}
