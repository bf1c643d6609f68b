// TestDependencies - mock implementations for testing
//
// Provides mock collaborators that can be injected into the engine for tests.
// Every mock records its calls so tests can assert on what the engine did.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{ApplicantProfile, BaseArtifactStore, BaseProfileStore, BaseScoringService, UsageStore};
use crate::common::{ApplicationId, JobId, UserId};
use crate::domains::automation::{AutomationSession, DiagnosticSnapshot, SessionFactory, StepAction};
use crate::domains::crawling::{FetchedPage, PageToken, SourceAdapter};
use crate::domains::jobs::{JobPosting, JobSource, NewPosting};
use crate::domains::metering::{UsageRecord, UsageStats};
use crate::error::{AutomationStepError, CrawlAdapterError};

// =============================================================================
// Mock Source Adapter
// =============================================================================

/// Arguments captured from a fetch_page call
#[derive(Debug, Clone)]
pub struct FetchCallArgs {
    pub query: String,
    pub location: Option<String>,
    pub page: Option<String>,
}

/// Serves a fixed list of pages. The page token is the page index.
pub struct MockSourceAdapter {
    source: JobSource,
    pages: Vec<Vec<String>>,
    failures: Mutex<HashMap<usize, CrawlAdapterError>>,
    panic_pages: HashSet<usize>,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<FetchCallArgs>>>,
}

impl MockSourceAdapter {
    pub fn new(source: JobSource) -> Self {
        Self {
            source,
            pages: Vec::new(),
            failures: Mutex::new(HashMap::new()),
            panic_pages: HashSet::new(),
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Add a page holding postings with these external ids
    pub fn with_page<S: Into<String>>(mut self, external_ids: Vec<S>) -> Self {
        self.pages
            .push(external_ids.into_iter().map(Into::into).collect());
        self
    }

    /// Fail the fetch of page `index` (0-based) with `error`
    pub fn fail_on_page(self, index: usize, error: CrawlAdapterError) -> Self {
        self.failures.lock().unwrap().insert(index, error);
        self
    }

    /// Panic while fetching page `index`, like a buggy adapter would
    pub fn panic_on_page(mut self, index: usize) -> Self {
        self.panic_pages.insert(index);
        self
    }

    /// Sleep before answering each fetch
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shared handle on the recorded calls, usable after the adapter moves
    pub fn calls_handle(&self) -> Arc<Mutex<Vec<FetchCallArgs>>> {
        self.calls.clone()
    }

    pub fn calls(&self) -> Vec<FetchCallArgs> {
        self.calls.lock().unwrap().clone()
    }

    pub fn posting(source: JobSource, external_id: &str) -> NewPosting {
        NewPosting::builder()
            .source(source)
            .external_id(external_id)
            .title(format!("Engineer {external_id}"))
            .company("Acme")
            .source_url(format!("https://jobs.example/{external_id}"))
            .location("Remote".to_string())
            .remote(true)
            .build()
    }
}

#[async_trait]
impl SourceAdapter for MockSourceAdapter {
    fn source(&self) -> JobSource {
        self.source
    }

    async fn fetch_page(
        &self,
        query: &str,
        location: Option<&str>,
        page: Option<&PageToken>,
    ) -> Result<FetchedPage, CrawlAdapterError> {
        self.calls.lock().unwrap().push(FetchCallArgs {
            query: query.to_string(),
            location: location.map(str::to_string),
            page: page.map(|p| p.as_str().to_string()),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let index = match page {
            Some(token) => token
                .as_str()
                .parse::<usize>()
                .map_err(|_| CrawlAdapterError::Permanent(format!("bad page token {token:?}")))?,
            None => 0,
        };

        if self.panic_pages.contains(&index) {
            panic!("adapter blew up on page {index}");
        }
        if let Some(error) = self.failures.lock().unwrap().get(&index) {
            return Err(error.clone());
        }

        let postings = self
            .pages
            .get(index)
            .map(|ids| ids.iter().map(|id| Self::posting(self.source, id)).collect())
            .unwrap_or_default();
        let next_page = (index + 1 < self.pages.len()).then(|| PageToken::new((index + 1).to_string()));

        Ok(FetchedPage {
            postings,
            next_page,
        })
    }
}

// =============================================================================
// Mock Automation Session
// =============================================================================

/// Behavior and call log shared by a mock session and its factory.
#[derive(Default)]
struct SessionScript {
    failures: Mutex<HashMap<String, VecDeque<AutomationStepError>>>,
    performed: Mutex<Vec<String>>,
    failing_snapshots: Mutex<bool>,
    /// Steps whose next execution panics
    panics: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    closed: AtomicUsize,
}

pub struct MockSession {
    script: Arc<SessionScript>,
}

impl MockSession {
    pub fn new() -> Self {
        Self {
            script: Arc::new(SessionScript::default()),
        }
    }

    /// Queue one failure for the next execution of the named step
    pub fn fail_step(self, step: &str, error: AutomationStepError) -> Self {
        queue_failure(&self.script, step, error);
        self
    }

    pub fn failing_snapshots(self) -> Self {
        *self.script.failing_snapshots.lock().unwrap() = true;
        self
    }

    /// Panic on the next execution of the named step
    pub fn panic_on_step(self, step: &str) -> Self {
        self.script.panics.lock().unwrap().insert(step.to_string());
        self
    }

    /// Sleep before each action
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.script.delay.lock().unwrap() = Some(delay);
        self
    }

    /// Names of every action performed, failed ones included
    pub fn performed(&self) -> Vec<String> {
        self.script.performed.lock().unwrap().clone()
    }
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

fn queue_failure(script: &SessionScript, step: &str, error: AutomationStepError) {
    script
        .failures
        .lock()
        .unwrap()
        .entry(step.to_string())
        .or_default()
        .push_back(error);
}

#[async_trait]
impl AutomationSession for MockSession {
    async fn perform(&mut self, action: &StepAction) -> Result<(), AutomationStepError> {
        let delay = *self.script.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.script
            .performed
            .lock()
            .unwrap()
            .push(action.name().to_string());

        let panics = self.script.panics.lock().unwrap().remove(action.name());
        if panics {
            panic!("session crashed during {}", action.name());
        }

        let failure = self
            .script
            .failures
            .lock()
            .unwrap()
            .get_mut(action.name())
            .and_then(|queue| queue.pop_front());
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn snapshot(&mut self) -> Result<DiagnosticSnapshot> {
        if *self.script.failing_snapshots.lock().unwrap() {
            return Err(anyhow!("browser context unavailable"));
        }
        Ok(DiagnosticSnapshot {
            captured_at: Utc::now(),
            url: Some("https://jobs.example/apply".to_string()),
            html: Some("<html><body><form id=\"apply\"></form></body></html>".to_string()),
            screenshot_png: None,
            note: None,
        })
    }

    async fn close(&mut self) {
        self.script.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out `MockSession`s that share one script, so failures queued on the
/// factory hit whichever session runs the step.
pub struct MockSessionFactory {
    script: Arc<SessionScript>,
    created: AtomicUsize,
}

impl MockSessionFactory {
    pub fn new() -> Self {
        Self {
            script: Arc::new(SessionScript::default()),
            created: AtomicUsize::new(0),
        }
    }

    pub fn fail_step(self, step: &str, error: AutomationStepError) -> Self {
        queue_failure(&self.script, step, error);
        self
    }

    pub fn failing_snapshots(self) -> Self {
        *self.script.failing_snapshots.lock().unwrap() = true;
        self
    }

    /// Panic on the next execution of the named step
    pub fn panic_on_step(self, step: &str) -> Self {
        self.script.panics.lock().unwrap().insert(step.to_string());
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.script.delay.lock().unwrap() = Some(delay);
        self
    }

    /// Number of sessions created
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Number of sessions closed (discarded)
    pub fn closed(&self) -> usize {
        self.script.closed.load(Ordering::SeqCst)
    }

    /// Actions performed across all sessions
    pub fn performed(&self) -> Vec<String> {
        self.script.performed.lock().unwrap().clone()
    }

    /// How many times the named action ran
    pub fn performed_count(&self, step: &str) -> usize {
        self.performed().iter().filter(|s| *s == step).count()
    }
}

impl Default for MockSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionFactory for MockSessionFactory {
    async fn create(&self) -> Result<Box<dyn AutomationSession>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            script: self.script.clone(),
        }))
    }
}

// =============================================================================
// Mock Profile Store
// =============================================================================

pub struct MockProfileStore {
    profiles: Arc<Mutex<HashMap<UserId, ApplicantProfile>>>,
    permissive: bool,
    calls: Arc<Mutex<Vec<UserId>>>,
}

impl MockProfileStore {
    /// Knows only the profiles added with `with_profile`
    pub fn new() -> Self {
        Self {
            profiles: Arc::new(Mutex::new(HashMap::new())),
            permissive: false,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns a complete profile for any user without one on file
    pub fn permissive() -> Self {
        Self {
            permissive: true,
            ..Self::new()
        }
    }

    pub fn with_profile(self, profile: ApplicantProfile) -> Self {
        self.profiles
            .lock()
            .unwrap()
            .insert(profile.user_id, profile);
        self
    }

    pub fn profile_for(user_id: UserId) -> ApplicantProfile {
        ApplicantProfile {
            user_id,
            full_name: "Test Applicant".to_string(),
            email: format!("{user_id}@example.com"),
            phone: Some("+1 555 0100".to_string()),
            location: Some("Minneapolis, MN".to_string()),
            resume_ref: Some(format!("resumes/{user_id}.pdf")),
            site_credentials: HashMap::new(),
        }
    }

    pub fn calls(&self) -> Vec<UserId> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for MockProfileStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BaseProfileStore for MockProfileStore {
    async fn profile(&self, user_id: UserId) -> Result<Option<ApplicantProfile>> {
        self.calls.lock().unwrap().push(user_id);
        if let Some(profile) = self.profiles.lock().unwrap().get(&user_id) {
            return Ok(Some(profile.clone()));
        }
        Ok(self.permissive.then(|| Self::profile_for(user_id)))
    }
}

// =============================================================================
// Mock Scoring Service
// =============================================================================

pub struct MockScoringService {
    score: Option<f32>,
    calls: Arc<Mutex<Vec<JobId>>>,
}

impl MockScoringService {
    pub fn returning(score: f32) -> Self {
        Self {
            score: Some(score),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing() -> Self {
        Self {
            score: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<JobId> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BaseScoringService for MockScoringService {
    async fn score(&self, _profile: &ApplicantProfile, job: &JobPosting) -> Result<f32> {
        self.calls.lock().unwrap().push(job.id);
        self.score
            .ok_or_else(|| anyhow!("scoring model unavailable"))
    }
}

// =============================================================================
// Memory Artifact Store
// =============================================================================

pub struct MemoryArtifactStore {
    artifacts: Arc<Mutex<HashMap<String, DiagnosticSnapshot>>>,
    failing: bool,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self {
            artifacts: Arc::new(Mutex::new(HashMap::new())),
            failing: false,
        }
    }

    /// Every store call fails
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::new()
        }
    }

    pub fn get(&self, reference: &str) -> Option<DiagnosticSnapshot> {
        self.artifacts.lock().unwrap().get(reference).cloned()
    }

    pub fn len(&self) -> usize {
        self.artifacts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BaseArtifactStore for MemoryArtifactStore {
    async fn store(
        &self,
        application_id: ApplicationId,
        snapshot: &DiagnosticSnapshot,
    ) -> Result<String> {
        if self.failing {
            return Err(anyhow!("artifact store offline"));
        }
        let mut artifacts = self.artifacts.lock().unwrap();
        let reference = format!("memory://{application_id}/{}", artifacts.len());
        artifacts.insert(reference.clone(), snapshot.clone());
        Ok(reference)
    }
}

// =============================================================================
// Failing Usage Store
// =============================================================================

/// Usage store whose every call fails, for best-effort metering tests.
pub struct FailingUsageStore;

#[async_trait]
impl UsageStore for FailingUsageStore {
    async fn insert_usage(&self, _record: &UsageRecord) -> Result<()> {
        Err(anyhow!("usage table unavailable"))
    }

    async fn usage_stats(
        &self,
        _user_id: UserId,
        _day_start: DateTime<Utc>,
    ) -> Result<UsageStats> {
        Err(anyhow!("usage table unavailable"))
    }
}
