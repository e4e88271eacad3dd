use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::{Error, LlmError, Result};
use crate::llm::{Evaluation, GeneratedQuestion, LlmService};
use crate::models::Note;

pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Lower runs first.
    pub fn value(self) -> u8 {
        match self {
            Priority::High => 1,
            Priority::Normal => 5,
            Priority::Low => 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    GenerateQuestion,
    EvaluateAnswer,
    GenerateHint,
    PreGenerate,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::GenerateQuestion => "generate-question",
            JobKind::EvaluateAnswer => "evaluate-answer",
            JobKind::GenerateHint => "generate-hint",
            JobKind::PreGenerate => "pre-generate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTimeouts {
    pub generate_question: Duration,
    pub evaluate_answer: Duration,
    pub generate_hint: Duration,
    pub pre_generate: Duration,
}

impl Default for JobTimeouts {
    fn default() -> Self {
        Self {
            generate_question: Duration::from_secs(30),
            evaluate_answer: Duration::from_secs(20),
            generate_hint: Duration::from_secs(15),
            pre_generate: Duration::from_secs(60),
        }
    }
}

impl JobTimeouts {
    pub fn for_kind(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::GenerateQuestion => self.generate_question,
            JobKind::EvaluateAnswer => self.evaluate_answer,
            JobKind::GenerateHint => self.generate_hint,
            JobKind::PreGenerate => self.pre_generate,
        }
    }
}

#[derive(Debug, Clone)]
pub enum AiJob {
    GenerateQuestion(Note),
    EvaluateAnswer {
        question: String,
        answer: String,
        context: String,
    },
    GenerateHint(Note),
    PreGenerate(Note),
}

impl AiJob {
    pub fn kind(&self) -> JobKind {
        match self {
            AiJob::GenerateQuestion(_) => JobKind::GenerateQuestion,
            AiJob::EvaluateAnswer { .. } => JobKind::EvaluateAnswer,
            AiJob::GenerateHint(_) => JobKind::GenerateHint,
            AiJob::PreGenerate(_) => JobKind::PreGenerate,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AiOutput {
    Question(GeneratedQuestion),
    Evaluation(Evaluation),
    Hint(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_time_ms: u64,
    pub average_time_ms: f64,
    pub queue_size: usize,
    pub current_job: Option<CurrentJob>,
}

#[derive(Default)]
struct QueueState {
    pending: usize,
    total_processed: u64,
    total_failed: u64,
    total_time: Duration,
    current: Option<CurrentJob>,
}

struct QueuedJob {
    id: Uuid,
    priority: Priority,
    seq: u64,
    job: AiJob,
    enqueued_at: Instant,
    reply: oneshot::Sender<Result<AiOutput>>,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // BinaryHeap pops the greatest: lowest priority value, then oldest.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .value()
            .cmp(&self.priority.value())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Clone)]
pub struct AiQueue {
    sender: mpsc::Sender<QueuedJob>,
    state: Arc<Mutex<QueueState>>,
    seq: Arc<AtomicU64>,
}

impl AiQueue {
    /// Spawns the worker on the current tokio runtime. The worker stops once
    /// every handle is dropped and the backlog is drained.
    pub fn start(llm: Arc<LlmService>, capacity: usize) -> Self {
        Self::with_timeouts(llm, capacity, JobTimeouts::default())
    }

    pub fn with_timeouts(llm: Arc<LlmService>, capacity: usize, timeouts: JobTimeouts) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let state = Arc::new(Mutex::new(QueueState::default()));

        let worker_state = Arc::clone(&state);
        tokio::spawn(async move {
            worker_loop(llm, rx, capacity, worker_state, timeouts).await;
        });

        Self {
            sender: tx,
            state,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn submit(&self, job: AiJob, priority: Priority) -> Result<AiOutput> {
        let (reply, response) = oneshot::channel();
        let id = Uuid::new_v4();
        let kind = job.kind();

        let queued = QueuedJob {
            id,
            priority,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            job,
            enqueued_at: Instant::now(),
            reply,
        };

        self.with_state(|s| s.pending += 1);
        if self.sender.send(queued).await.is_err() {
            self.with_state(|s| s.pending = s.pending.saturating_sub(1));
            return Err(Error::Queue("AI queue is closed".to_string()));
        }
        log::debug!("Queued job {} ({}, priority {})", id, kind.as_str(), priority.value());

        response
            .await
            .map_err(|_| Error::Queue(format!("job {} was dropped by the worker", id)))?
    }

    pub async fn generate_question(&self, note: Note, priority: Priority) -> Result<GeneratedQuestion> {
        match self.submit(AiJob::GenerateQuestion(note), priority).await? {
            AiOutput::Question(q) => Ok(q),
            other => Err(unexpected(JobKind::GenerateQuestion, &other)),
        }
    }

    pub async fn pre_generate(&self, note: Note) -> Result<GeneratedQuestion> {
        match self.submit(AiJob::PreGenerate(note), Priority::Low).await? {
            AiOutput::Question(q) => Ok(q),
            other => Err(unexpected(JobKind::PreGenerate, &other)),
        }
    }

    pub async fn evaluate_answer(&self, question: &str, answer: &str, context: &str) -> Result<Evaluation> {
        let job = AiJob::EvaluateAnswer {
            question: question.to_string(),
            answer: answer.to_string(),
            context: context.to_string(),
        };
        match self.submit(job, Priority::High).await? {
            AiOutput::Evaluation(e) => Ok(e),
            other => Err(unexpected(JobKind::EvaluateAnswer, &other)),
        }
    }

    pub async fn generate_hint(&self, note: Note) -> Result<String> {
        match self.submit(AiJob::GenerateHint(note), Priority::High).await? {
            AiOutput::Hint(h) => Ok(h),
            other => Err(unexpected(JobKind::GenerateHint, &other)),
        }
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let total_time_ms = state.total_time.as_millis() as u64;
        let average_time_ms = if state.total_processed > 0 {
            (total_time_ms as f64 / state.total_processed as f64 * 100.0).round() / 100.0
        } else {
            0.0
        };

        QueueStats {
            total_processed: state.total_processed,
            total_failed: state.total_failed,
            total_time_ms,
            average_time_ms,
            queue_size: state.pending,
            current_job: state.current.clone(),
        }
    }

    fn with_state(&self, f: impl FnOnce(&mut QueueState)) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
    }
}

fn unexpected(kind: JobKind, output: &AiOutput) -> Error {
    Error::Queue(format!("unexpected output for {}: {:?}", kind.as_str(), output))
}

async fn worker_loop(
    llm: Arc<LlmService>,
    mut receiver: mpsc::Receiver<QueuedJob>,
    capacity: usize,
    state: Arc<Mutex<QueueState>>,
    timeouts: JobTimeouts,
) {
    let mut backlog: BinaryHeap<QueuedJob> = BinaryHeap::with_capacity(capacity);

    loop {
        if backlog.is_empty() {
            match receiver.recv().await {
                Some(job) => backlog.push(job),
                None => break,
            }
        }
        fill_backlog(&mut backlog, &mut receiver, capacity);

        let Some(job) = backlog.pop() else {
            continue;
        };
        run_job(&llm, &state, timeouts, job).await;
    }

    log::info!("AI queue: worker stopped");
}

/// Moves waiting jobs into the backlog, never past `capacity`. The rest
/// stay in the channel so senders keep blocking.
fn fill_backlog(backlog: &mut BinaryHeap<QueuedJob>, receiver: &mut mpsc::Receiver<QueuedJob>, capacity: usize) {
    while backlog.len() < capacity {
        match receiver.try_recv() {
            Ok(job) => backlog.push(job),
            Err(_) => break,
        }
    }
}

async fn run_job(llm: &LlmService, state: &Mutex<QueueState>, timeouts: JobTimeouts, queued: QueuedJob) {
    let kind = queued.job.kind();
    let timeout = timeouts.for_kind(kind);
    {
        let mut s = state.lock().unwrap_or_else(PoisonError::into_inner);
        s.pending = s.pending.saturating_sub(1);
        s.current = Some(CurrentJob {
            id: queued.id,
            kind,
            priority: queued.priority,
        });
    }
    log::debug!(
        "Starting job {} ({}) after {:.2}s in queue",
        queued.id,
        kind.as_str(),
        queued.enqueued_at.elapsed().as_secs_f64()
    );

    let started = Instant::now();
    let result = match tokio::time::timeout(timeout, execute(llm, queued.job)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Llm(LlmError::Timeout(timeout))),
    };
    let elapsed = started.elapsed();

    {
        let mut s = state.lock().unwrap_or_else(PoisonError::into_inner);
        s.current = None;
        match &result {
            Ok(_) => {
                s.total_processed += 1;
                s.total_time += elapsed;
            }
            Err(_) => s.total_failed += 1,
        }
    }

    match &result {
        Ok(_) => log::info!(
            "Job {} ({}) done in {:.2}s",
            queued.id,
            kind.as_str(),
            elapsed.as_secs_f64()
        ),
        Err(e) => log::error!("Job {} ({}) failed: {}", queued.id, kind.as_str(), e),
    }

    // The submitter may have given up waiting.
    let _ = queued.reply.send(result);
}

async fn execute(llm: &LlmService, job: AiJob) -> Result<AiOutput> {
    let output = match job {
        AiJob::GenerateQuestion(note) | AiJob::PreGenerate(note) => {
            AiOutput::Question(llm.generate_question(&note).await?)
        }
        AiJob::EvaluateAnswer {
            question,
            answer,
            context,
        } => AiOutput::Evaluation(llm.evaluate_answer(&question, &answer, &context).await?),
        AiJob::GenerateHint(note) => AiOutput::Hint(llm.generate_hint(&note).await?),
    };
    Ok(output)
}
