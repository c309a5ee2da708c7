//! Per-conversation request state machine.
//!
//! Each (channel, user) key is Idle, or Pending while exactly one
//! completion round-trip is in flight. A second event for a Pending key is
//! answered with a busy notice and dropped, which is the worker's own
//! backpressure: one outstanding call per conversation, and no interleaved
//! memory writes. Nothing is persisted until a call fully succeeds, so
//! killing the process mid-flight never leaves a partial turn behind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aviary_instance::InstanceConfig;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::completion::{ChatTurn, CompletionApi, CompletionError, CompletionRequest};
use crate::gateway::Gateway;
use crate::memory::MemoryStore;

/// Transport hard limit on one outbound message, in characters.
pub const MAX_MESSAGE_CHARS: usize = 2000;

pub const BUSY_REPLY: &str = "I'm still working on your last message, give me a moment.";
pub const FAILURE_REPLY: &str = "Something went wrong, try again later.";

const RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub channel_id: u64,
    pub user_id: u64,
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel_id: u64,
    pub message_id: u64,
    pub author_id: u64,
    pub author_name: String,
    pub content: String,
}

impl InboundMessage {
    fn key(&self) -> RequestKey {
        RequestKey {
            channel_id: self.channel_id,
            user_id: self.author_id,
        }
    }
}

/// Terminal observation of one inbound event, for callers and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Completed,
    Failed,
    Busy,
    CoolingDown,
    Ignored,
}

pub struct Runtime<C> {
    config: InstanceConfig,
    memory: MemoryStore,
    completion: C,
    // Pending requests, keyed per conversation. The value is the typing
    // task, aborted when the request leaves Pending.
    pending: Mutex<HashMap<RequestKey, JoinHandle<()>>>,
    // Per-key finish timestamps backing the cooldown window.
    cooldowns: Mutex<HashMap<RequestKey, Instant>>,
}

impl<C: CompletionApi> Runtime<C> {
    pub fn new(config: InstanceConfig, memory: MemoryStore, completion: C) -> Self {
        Self {
            config,
            memory,
            completion,
            pending: Mutex::new(HashMap::new()),
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub async fn handle_event<G: Gateway>(
        &self,
        gateway: &Arc<G>,
        msg: InboundMessage,
    ) -> EventOutcome {
        if msg.content.trim().is_empty() {
            return EventOutcome::Ignored;
        }
        let key = msg.key();

        let cooldown = Duration::from_millis(self.config.limits.cooldown_ms);
        {
            let mut cooldowns = self.cooldowns.lock().await;
            if let Some(finished_at) = cooldowns.get(&key) {
                if finished_at.elapsed() < cooldown {
                    return EventOutcome::CoolingDown;
                }
                cooldowns.remove(&key);
            }
        }

        {
            let mut pending = self.pending.lock().await;
            if pending.contains_key(&key) {
                drop(pending);
                gateway
                    .send_message(msg.channel_id, Some(msg.message_id), BUSY_REPLY)
                    .await;
                return EventOutcome::Busy;
            }
            pending.insert(key, self.spawn_typing(gateway, key));
        }

        let outcome = self.process(gateway, &msg).await;
        self.finish(key).await;
        outcome
    }

    fn spawn_typing<G: Gateway>(&self, gateway: &Arc<G>, key: RequestKey) -> JoinHandle<()> {
        let gateway = gateway.clone();
        let interval = Duration::from_millis(self.config.limits.typing_interval_ms);
        tokio::spawn(async move {
            loop {
                gateway.send_typing(key.channel_id).await;
                tokio::time::sleep(interval).await;
            }
        })
    }

    async fn finish(&self, key: RequestKey) {
        if let Some(typing) = self.pending.lock().await.remove(&key) {
            typing.abort();
        }
        self.cooldowns.lock().await.insert(key, Instant::now());
    }

    async fn process<G: Gateway>(&self, gateway: &Arc<G>, msg: &InboundMessage) -> EventOutcome {
        let mut turns = self.memory.get(msg.author_id).await;
        // Label the turn with the sender so multi-user channels stay
        // disambiguated in the model's context.
        let user_turn = ChatTurn::user(format!("{}: {}", msg.author_name, msg.content.trim()));

        let mut messages = Vec::with_capacity(turns.len() + 2);
        messages.push(ChatTurn::system(self.config.system_instruction.clone()));
        messages.extend(turns.iter().cloned());
        messages.push(user_turn.clone());

        let request = CompletionRequest::new(&self.config.model_id, messages, &self.config.generation);

        match self.call_with_retries(&request).await {
            Ok(reply) => {
                let reply = truncate_chars(&reply, self.config.generation.max_response_chars);
                turns.push(user_turn);
                turns.push(ChatTurn::assistant(reply.clone()));
                if let Err(err) = self.memory.put(msg.author_id, turns).await {
                    // Fail open: the reply still goes out, only persistence
                    // of this turn is lost.
                    tracing::warn!(user = msg.author_id, error = %err, "failed to persist memory");
                }

                let mut reply_to = Some(msg.message_id);
                for chunk in chunk_message(&reply, MAX_MESSAGE_CHARS) {
                    gateway
                        .send_message(msg.channel_id, reply_to.take(), &chunk)
                        .await;
                }
                EventOutcome::Completed
            }
            Err(err) => {
                tracing::warn!(
                    channel = msg.channel_id,
                    user = msg.author_id,
                    error = %err,
                    "completion failed after retries"
                );
                gateway
                    .send_message(msg.channel_id, Some(msg.message_id), FAILURE_REPLY)
                    .await;
                EventOutcome::Failed
            }
        }
    }

    /// One hard-timeout attempt, then up to `max_retries` retries with
    /// linear backoff (attempt index times a fixed delay).
    async fn call_with_retries(
        &self,
        request: &CompletionRequest,
    ) -> Result<String, CompletionError> {
        let per_attempt = Duration::from_millis(self.config.limits.request_timeout_ms);
        let max_retries = self.config.limits.max_retries;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(per_attempt, self.completion.complete(request))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(CompletionError::TimedOut),
            };

            match result {
                Ok(reply) => return Ok(reply),
                Err(err) if attempt <= max_retries => {
                    tracing::debug!(attempt, error = %err, "completion attempt failed, retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for c in text.chars() {
        if count == max_chars {
            out.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(c);
        count += 1;
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use aviary_instance::{CompletionSettings, InstanceId, NewInstance, ResourceLimits};
    use serenity::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct MockGateway {
        sent: Mutex<Vec<(u64, Option<u64>, String)>>,
        typing: AtomicUsize,
    }

    impl MockGateway {
        async fn sent(&self) -> Vec<(u64, Option<u64>, String)> {
            self.sent.lock().await.clone()
        }
    }

    #[async_trait]
    impl Gateway for MockGateway {
        async fn send_typing(&self, _channel_id: u64) {
            self.typing.fetch_add(1, Ordering::SeqCst);
        }

        async fn send_message(&self, channel_id: u64, reply_to: Option<u64>, content: &str) {
            self.sent
                .lock()
                .await
                .push((channel_id, reply_to, content.to_string()));
        }
    }

    /// Pops scripted results in order; repeats the last one when drained.
    struct ScriptedCompletion {
        script: Mutex<VecDeque<Result<String, u16>>>,
        last: Result<String, u16>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedCompletion {
        fn always_ok(reply: &str) -> Self {
            Self::new(Ok(reply.to_string()), Duration::ZERO)
        }

        fn always_err(status: u16) -> Self {
            Self::new(Err(status), Duration::ZERO)
        }

        fn new(last: Result<String, u16>, delay: Duration) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                last,
                delay,
                calls: AtomicUsize::new(0),
            }
        }

        async fn push(&self, step: Result<String, u16>) {
            self.script.lock().await.push_back(step);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionApi for ScriptedCompletion {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            let step = self
                .script
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| self.last.clone());
            step.map_err(CompletionError::Status)
        }
    }

    fn config(limits: ResourceLimits) -> InstanceConfig {
        let mut config = NewInstance {
            display_name: "Mora".to_string(),
            credential: "token".to_string(),
            system_instruction: "You are Mora.".to_string(),
            completion: CompletionSettings {
                url: "https://api.example.test/v1/chat/completions".to_string(),
                api_key: "sk-test".to_string(),
            },
            limits: Some(limits),
            ..Default::default()
        }
        .into_config("owner-1")
        .unwrap();
        config.id = InstanceId("inst".to_string());
        config
    }

    fn quick_limits() -> ResourceLimits {
        ResourceLimits {
            history_limit: 10,
            request_timeout_ms: 1_000,
            max_retries: 2,
            cooldown_ms: 0,
            typing_interval_ms: 1_000,
        }
    }

    fn runtime(
        dir: &TempDir,
        limits: ResourceLimits,
        completion: ScriptedCompletion,
    ) -> Arc<Runtime<ScriptedCompletion>> {
        runtime_with_config(dir, config(limits), completion)
    }

    fn runtime_with_config(
        dir: &TempDir,
        config: InstanceConfig,
        completion: ScriptedCompletion,
    ) -> Arc<Runtime<ScriptedCompletion>> {
        let memory = MemoryStore::new(dir.path(), config.id.clone(), config.limits.history_limit);
        Arc::new(Runtime::new(config, memory, completion))
    }

    fn event(content: &str) -> InboundMessage {
        InboundMessage {
            channel_id: 100,
            message_id: 555,
            author_id: 7,
            author_name: "alice".to_string(),
            content: content.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_replies_and_appends_one_pair() {
        let dir = TempDir::new().unwrap();
        let rt = runtime(&dir, quick_limits(), ScriptedCompletion::always_ok("hello alice"));
        let gw = Arc::new(MockGateway::default());

        let outcome = rt.handle_event(&gw, event("hi")).await;
        assert_eq!(outcome, EventOutcome::Completed);

        let sent = gw.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], (100, Some(555), "hello alice".to_string()));

        let turns = rt.memory.get(7).await;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "alice: hi");
        assert_eq!(turns[1].content, "hello alice");
    }

    #[tokio::test(start_paused = true)]
    async fn second_event_while_pending_is_rejected_busy() {
        let dir = TempDir::new().unwrap();
        let completion = ScriptedCompletion::new(Ok("done".to_string()), Duration::from_millis(200));
        let rt = runtime(&dir, quick_limits(), completion);
        let gw = Arc::new(MockGateway::default());

        let first = {
            let rt = rt.clone();
            let gw = gw.clone();
            tokio::spawn(async move { rt.handle_event(&gw, event("one")).await })
        };
        // Let the first event reach Pending without advancing past its delay.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert!(rt.pending.lock().await.len() == 1);

        let second = rt.handle_event(&gw, event("two")).await;
        assert_eq!(second, EventOutcome::Busy);

        // The first request is unaffected by the rejection.
        assert_eq!(first.await.unwrap(), EventOutcome::Completed);

        let sent = gw.sent().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].2, BUSY_REPLY);
        assert_eq!(sent[1].2, "done");
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_may_be_pending_concurrently() {
        let dir = TempDir::new().unwrap();
        let completion = ScriptedCompletion::new(Ok("done".to_string()), Duration::from_millis(200));
        let rt = runtime(&dir, quick_limits(), completion);
        let gw = Arc::new(MockGateway::default());

        let mut other = event("from bob");
        other.author_id = 8;
        other.author_name = "bob".to_string();

        let first = {
            let rt = rt.clone();
            let gw = gw.clone();
            tokio::spawn(async move { rt.handle_event(&gw, event("one")).await })
        };
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        let second = rt.handle_event(&gw, other).await;
        assert_eq!(second, EventOutcome::Completed);
        assert_eq!(first.await.unwrap(), EventOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_fails_once_and_leaves_history_unchanged() {
        let dir = TempDir::new().unwrap();
        let rt = runtime(&dir, quick_limits(), ScriptedCompletion::always_err(500));
        let gw = Arc::new(MockGateway::default());

        let outcome = rt.handle_event(&gw, event("hi")).await;
        assert_eq!(outcome, EventOutcome::Failed);

        // One initial attempt plus max_retries.
        assert_eq!(rt.completion.calls(), 3);

        let sent = gw.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].2, FAILURE_REPLY);
        assert!(rt.memory.get(7).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_then_success_completes() {
        let dir = TempDir::new().unwrap();
        let completion = ScriptedCompletion::always_ok("recovered");
        completion.push(Err(502)).await;
        let rt = runtime(&dir, quick_limits(), completion);
        let gw = Arc::new(MockGateway::default());

        let outcome = rt.handle_event(&gw, event("hi")).await;
        assert_eq!(outcome, EventOutcome::Completed);
        assert_eq!(rt.completion.calls(), 2);
        assert_eq!(gw.sent().await[0].2, "recovered");
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded_by_the_hard_timeout() {
        let dir = TempDir::new().unwrap();
        // Each attempt sleeps far past the 1s per-attempt timeout.
        let completion =
            ScriptedCompletion::new(Ok("too late".to_string()), Duration::from_secs(3600));
        let rt = runtime(&dir, quick_limits(), completion);
        let gw = Arc::new(MockGateway::default());

        let outcome = rt.handle_event(&gw, event("hi")).await;
        assert_eq!(outcome, EventOutcome::Failed);
        assert_eq!(rt.completion.calls(), 3);
        assert_eq!(gw.sent().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_suppresses_immediate_follow_ups() {
        let dir = TempDir::new().unwrap();
        let mut limits = quick_limits();
        limits.cooldown_ms = 3_000;
        let rt = runtime(&dir, limits, ScriptedCompletion::always_ok("ok"));
        let gw = Arc::new(MockGateway::default());

        assert_eq!(rt.handle_event(&gw, event("one")).await, EventOutcome::Completed);
        assert_eq!(
            rt.handle_event(&gw, event("two")).await,
            EventOutcome::CoolingDown
        );

        tokio::time::sleep(Duration::from_millis(3_100)).await;
        assert_eq!(
            rt.handle_event(&gw, event("three")).await,
            EventOutcome::Completed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn long_replies_are_chunked_with_only_the_first_as_reply() {
        let dir = TempDir::new().unwrap();
        let long = "x".repeat(4500);
        let rt = runtime(&dir, quick_limits(), ScriptedCompletion::always_ok(&long));
        let gw = Arc::new(MockGateway::default());

        rt.handle_event(&gw, event("hi")).await;
        let sent = gw.sent().await;
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].1, Some(555));
        assert_eq!(sent[1].1, None);
        assert_eq!(sent[2].1, None);
        assert!(sent.iter().all(|(_, _, c)| c.chars().count() <= MAX_MESSAGE_CHARS));
    }

    #[tokio::test(start_paused = true)]
    async fn replies_are_capped_at_the_configured_length() {
        let dir = TempDir::new().unwrap();
        let mut config = config(quick_limits());
        config.generation.max_response_chars = 10;
        let rt = runtime_with_config(&dir, config, ScriptedCompletion::always_ok(&"y".repeat(500)));
        let gw = Arc::new(MockGateway::default());

        rt.handle_event(&gw, event("hi")).await;
        assert_eq!(gw.sent().await[0].2, "y".repeat(10));
        assert_eq!(rt.memory.get(7).await[1].content, "y".repeat(10));
    }

    #[tokio::test(start_paused = true)]
    async fn blank_content_is_ignored() {
        let dir = TempDir::new().unwrap();
        let rt = runtime(&dir, quick_limits(), ScriptedCompletion::always_ok("ok"));
        let gw = Arc::new(MockGateway::default());

        assert_eq!(rt.handle_event(&gw, event("   ")).await, EventOutcome::Ignored);
        assert!(gw.sent().await.is_empty());
        assert_eq!(rt.completion.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_runs_while_pending_and_stops_after() {
        let dir = TempDir::new().unwrap();
        let completion = ScriptedCompletion::new(Ok("ok".to_string()), Duration::from_millis(3_500));
        let rt = runtime(&dir, quick_limits(), completion);
        let gw = Arc::new(MockGateway::default());

        rt.handle_event(&gw, event("hi")).await;
        // 3.5s pending at a 1s interval: the first beat plus three more.
        let beats = gw.typing.load(Ordering::SeqCst);
        assert!(beats >= 3, "expected several typing beats, got {beats}");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(gw.typing.load(Ordering::SeqCst), beats);
    }

    #[tokio::test(start_paused = true)]
    async fn history_feeds_the_next_request_in_order() {
        let dir = TempDir::new().unwrap();
        let mut limits = quick_limits();
        limits.history_limit = 3;
        let completion = ScriptedCompletion::always_ok("r");
        let rt = runtime(&dir, limits, completion);
        let gw = Arc::new(MockGateway::default());

        for n in 1..=5 {
            let outcome = rt.handle_event(&gw, event(&format!("u{n}"))).await;
            assert_eq!(outcome, EventOutcome::Completed);
        }

        let turns = rt.memory.get(7).await;
        assert_eq!(turns.len(), 6);
        assert_eq!(turns[0].content, "alice: u3");
        assert_eq!(turns[2].content, "alice: u4");
        assert_eq!(turns[4].content, "alice: u5");
    }
}
