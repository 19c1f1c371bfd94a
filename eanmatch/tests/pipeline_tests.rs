//! End-to-end pipeline tests with mock catalog sources
//!
//! The mocks implement `CatalogSource` directly (no HTTP, no cache), so
//! these tests exercise the orchestrator's state machine, ordering,
//! ledger writes, resume, and cancellation behavior in isolation.

use async_trait::async_trait;
use eanmatch::db::{self, RunLedger};
use eanmatch::services::catalog::{CatalogSource, SourceError, SourceResponse};
use eanmatch::workflow::pipeline::{BatchSummary, Pipeline, RecordOutcome};
use eanmatch_common::config::MatcherConfig;
use eanmatch_common::types::{Candidate, CandidateSource, InputRecord, Marketplace, MatchStatus};
use eanmatch_common::{CanonicalEan, RequestFingerprint};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// Valid EAN-13 test identifiers
const EAN_A: &str = "4006381333931";
const EAN_B: &str = "0036000291452";
const EAN_C: &str = "4006381333948";
const EAN_D: &str = "5001591010039";

#[derive(Clone)]
enum MockReply {
    Candidates(Vec<Candidate>),
    Unauthorized,
    Transient,
}

/// Scripted catalog source with a call counter
struct MockSource {
    id: &'static str,
    replies: HashMap<String, MockReply>,
    calls: AtomicUsize,
    delay_ms: u64,
    /// Cancel this token once the given call count is reached (models an
    /// operator interrupt arriving mid-batch)
    cancel_on_call: Option<(usize, CancellationToken)>,
}

impl MockSource {
    fn new(id: &'static str) -> Self {
        Self {
            id,
            replies: HashMap::new(),
            calls: AtomicUsize::new(0),
            delay_ms: 0,
            cancel_on_call: None,
        }
    }

    fn reply(mut self, ean: &str, reply: MockReply) -> Self {
        self.replies.insert(ean.to_string(), reply);
        self
    }

    fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    fn cancel_on_call(mut self, call: usize, token: CancellationToken) -> Self {
        self.cancel_on_call = Some((call, token));
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogSource for MockSource {
    fn source_id(&self) -> &'static str {
        self.id
    }

    async fn lookup(
        &self,
        record: &InputRecord,
        ean: &CanonicalEan,
    ) -> Result<SourceResponse, SourceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((threshold, token)) = &self.cancel_on_call {
            if call >= *threshold {
                token.cancel();
            }
        }
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }

        let fingerprint =
            RequestFingerprint::compute(self.id, "mock", ean.as_str(), record.marketplace);

        match self.replies.get(&record.ean) {
            None => Ok(SourceResponse {
                candidates: Vec::new(),
                fingerprint,
            }),
            Some(MockReply::Candidates(candidates)) => Ok(SourceResponse {
                candidates: candidates.clone(),
                fingerprint,
            }),
            Some(MockReply::Unauthorized) => {
                Err(SourceError::Unauthorized("bad token".to_string()))
            }
            Some(MockReply::Transient) => Err(SourceError::Transient("boom".to_string())),
        }
    }
}

fn candidate(asin: &str, source: CandidateSource, identifiers: &[&str]) -> Candidate {
    Candidate {
        asin: asin.to_string(),
        source,
        title: Some("Schneider Slider Memo XB ballpoint pen".to_string()),
        brand: Some("Schneider".to_string()),
        identifiers: identifiers.iter().map(|s| s.to_string()).collect(),
    }
}

fn record(ean: &str) -> InputRecord {
    InputRecord {
        ean: ean.to_string(),
        hint_title: Some("Schneider Slider Memo XB ballpoint pen".to_string()),
        hint_brand: Some("Schneider".to_string()),
        marketplace: Marketplace::DE,
    }
}

fn record_without_hints(ean: &str) -> InputRecord {
    InputRecord {
        ean: ean.to_string(),
        hint_title: None,
        hint_brand: None,
        marketplace: Marketplace::DE,
    }
}

fn test_config(workers: usize) -> Arc<MatcherConfig> {
    Arc::new(MatcherConfig {
        worker_pool_size: workers,
        ..Default::default()
    })
}

async fn open_store() -> (tempfile::TempDir, SqlitePool) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let pool = db::init_run_store(&dir.path().join("run.db"))
        .await
        .expect("init run store");
    (dir, pool)
}

async fn pipeline_with(
    pool: &SqlitePool,
    workers: usize,
    primary: Arc<MockSource>,
    fallback: Arc<MockSource>,
) -> Pipeline {
    let ledger = Arc::new(RunLedger::open(pool.clone()).await.expect("open ledger"));
    Pipeline::new(test_config(workers), primary, fallback, ledger)
}

/// Run a batch and collect the ordered outcome stream
async fn run_collect(
    pipeline: &Pipeline,
    records: Vec<InputRecord>,
    resume: bool,
    cancel: CancellationToken,
) -> (BatchSummary, Vec<RecordOutcome>) {
    let (tx, mut rx) = mpsc::channel::<RecordOutcome>(64);
    let collector = tokio::spawn(async move {
        let mut outcomes = Vec::new();
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }
        outcomes
    });

    let summary = pipeline
        .run_batch(records, resume, cancel, tx)
        .await
        .expect("batch should not abort");
    let outcomes = collector.await.expect("collector task");
    (summary, outcomes)
}

#[tokio::test]
async fn batch_completes_with_mixed_outcomes() {
    let (_dir, pool) = open_store().await;

    let primary = Arc::new(
        MockSource::new("primary")
            .reply(
                EAN_A,
                MockReply::Candidates(vec![candidate("B0MATCH001", CandidateSource::Primary, &[EAN_A])]),
            )
            .reply(EAN_C, MockReply::Unauthorized),
    );
    let fallback = Arc::new(MockSource::new("fallback"));

    let pipeline = pipeline_with(&pool, 2, primary.clone(), fallback.clone()).await;

    let records = vec![
        record(EAN_A),          // exact identifier match
        record(EAN_B),          // empty everywhere -> NotFound
        record(EAN_C),          // unauthorized -> Failed
        record("123"),          // invalid identifier -> Failed
    ];

    let (summary, outcomes) = run_collect(&pipeline, records, false, CancellationToken::new()).await;

    assert_eq!(summary.total, 4);
    assert_eq!(summary.emitted, 4);
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.not_found, 1);
    assert_eq!(summary.failed, 2);
    assert!(summary.needs_attention());

    assert_eq!(outcomes.len(), 4);
    assert_eq!(outcomes[0].decision.status, MatchStatus::Matched);
    assert_eq!(outcomes[0].decision.asin.as_deref(), Some("B0MATCH001"));
    assert_eq!(outcomes[0].decision.confidence, 1.0);
    assert_eq!(outcomes[0].decision.evidence, vec!["exact-identifier".to_string()]);

    assert_eq!(outcomes[1].decision.status, MatchStatus::NotFound);

    assert_eq!(outcomes[2].decision.status, MatchStatus::Failed);
    assert_eq!(
        outcomes[2].decision.evidence,
        vec!["primary-unauthorized".to_string()]
    );

    assert_eq!(outcomes[3].decision.status, MatchStatus::Failed);
    assert_eq!(
        outcomes[3].decision.evidence,
        vec!["invalid-identifier".to_string()]
    );

    // Every record has exactly one ledger entry
    let ledger = RunLedger::open(pool).await.unwrap();
    assert_eq!(ledger.len(), 4);
}

#[tokio::test]
async fn fallback_runs_only_when_needed() {
    let (_dir, pool) = open_store().await;

    // EAN_A hits the fast path in primary; EAN_B needs the fallback search
    let primary = Arc::new(MockSource::new("primary").reply(
        EAN_A,
        MockReply::Candidates(vec![candidate("B0MATCH001", CandidateSource::Primary, &[EAN_A])]),
    ));
    let fallback = Arc::new(MockSource::new("fallback").reply(
        EAN_B,
        MockReply::Candidates(vec![candidate("B0FALLBACK1", CandidateSource::Fallback, &[])]),
    ));

    let pipeline = pipeline_with(&pool, 1, primary.clone(), fallback.clone()).await;

    let records = vec![
        record(EAN_A),
        record(EAN_B),
        record_without_hints(EAN_C), // nothing to search on -> fallback skipped
    ];

    let (summary, outcomes) = run_collect(&pipeline, records, false, CancellationToken::new()).await;

    assert_eq!(summary.matched, 2);
    assert_eq!(summary.not_found, 1);

    // Fast-path record never reached the fallback; hint-less record skipped it
    assert_eq!(primary.calls(), 3);
    assert_eq!(fallback.calls(), 1);

    assert_eq!(outcomes[1].decision.status, MatchStatus::Matched);
    assert_eq!(outcomes[1].decision.asin.as_deref(), Some("B0FALLBACK1"));
    assert_eq!(outcomes[2].decision.status, MatchStatus::NotFound);
}

#[tokio::test]
async fn primary_failure_still_tries_fallback() {
    let (_dir, pool) = open_store().await;

    let primary = Arc::new(MockSource::new("primary").reply(EAN_A, MockReply::Transient));
    let fallback = Arc::new(MockSource::new("fallback").reply(
        EAN_A,
        MockReply::Candidates(vec![candidate("B0FALLBACK1", CandidateSource::Fallback, &[])]),
    ));

    let pipeline = pipeline_with(&pool, 1, primary.clone(), fallback.clone()).await;

    let (_, outcomes) =
        run_collect(&pipeline, vec![record(EAN_A)], false, CancellationToken::new()).await;

    assert_eq!(outcomes[0].decision.status, MatchStatus::Matched);
    assert_eq!(outcomes[0].decision.asin.as_deref(), Some("B0FALLBACK1"));
    assert_eq!(fallback.calls(), 1);
}

#[tokio::test]
async fn unauthorized_is_fatal_for_record_only() {
    let (_dir, pool) = open_store().await;

    let primary = Arc::new(
        MockSource::new("primary")
            .reply(EAN_A, MockReply::Unauthorized)
            .reply(
                EAN_B,
                MockReply::Candidates(vec![candidate("B0MATCH002", CandidateSource::Primary, &[EAN_B])]),
            ),
    );
    let fallback = Arc::new(MockSource::new("fallback"));

    let pipeline = pipeline_with(&pool, 1, primary.clone(), fallback.clone()).await;

    let (summary, outcomes) = run_collect(
        &pipeline,
        vec![record(EAN_A), record(EAN_B)],
        false,
        CancellationToken::new(),
    )
    .await;

    // The unauthorized record fails without a fallback attempt, and the
    // batch keeps going
    assert_eq!(outcomes[0].decision.status, MatchStatus::Failed);
    assert_eq!(outcomes[1].decision.status, MatchStatus::Matched);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.matched, 1);
    assert_eq!(primary.calls(), 2);
    assert_eq!(fallback.calls(), 0);
}

#[tokio::test]
async fn resume_replays_without_upstream_calls() {
    let (_dir, pool) = open_store().await;

    let records = vec![record(EAN_A), record(EAN_B), record(EAN_D)];

    let first_decisions = {
        let primary = Arc::new(MockSource::new("primary").reply(
            EAN_A,
            MockReply::Candidates(vec![candidate("B0MATCH001", CandidateSource::Primary, &[EAN_A])]),
        ));
        let fallback = Arc::new(MockSource::new("fallback"));
        let pipeline = pipeline_with(&pool, 2, primary, fallback).await;

        let (summary, outcomes) =
            run_collect(&pipeline, records.clone(), false, CancellationToken::new()).await;
        assert_eq!(summary.emitted, 3);
        assert_eq!(summary.resumed, 0);
        outcomes
            .into_iter()
            .map(|o| o.decision)
            .collect::<Vec<_>>()
    };

    // Second run against the untouched ledger: identical output, zero
    // upstream traffic
    let primary = Arc::new(MockSource::new("primary"));
    let fallback = Arc::new(MockSource::new("fallback"));
    let pipeline = pipeline_with(&pool, 2, primary.clone(), fallback.clone()).await;

    let (summary, outcomes) =
        run_collect(&pipeline, records, true, CancellationToken::new()).await;

    assert_eq!(summary.emitted, 3);
    assert_eq!(summary.resumed, 3);
    assert_eq!(primary.calls(), 0);
    assert_eq!(fallback.calls(), 0);

    let second_decisions: Vec<_> = outcomes.into_iter().map(|o| o.decision).collect();
    assert_eq!(first_decisions, second_decisions);
}

#[tokio::test]
async fn output_order_matches_input_order_despite_concurrency() {
    let (_dir, pool) = open_store().await;

    // A shared delay shuffles completion order across the 4 workers
    let primary = Arc::new(MockSource::new("primary").with_delay(10));
    let fallback = Arc::new(MockSource::new("fallback"));
    let pipeline = pipeline_with(&pool, 4, primary, fallback).await;

    let eans = [EAN_A, EAN_B, EAN_C, EAN_D];
    let records: Vec<InputRecord> = (0..8)
        .map(|i| record_without_hints(eans[i % eans.len()]))
        .collect();
    // Distinct (ean, marketplace) identities for the duplicate EANs
    let records: Vec<InputRecord> = records
        .into_iter()
        .enumerate()
        .map(|(i, mut r)| {
            if i >= 4 {
                r.marketplace = Marketplace::FR;
            }
            r
        })
        .collect();

    let (summary, outcomes) =
        run_collect(&pipeline, records.clone(), false, CancellationToken::new()).await;

    assert_eq!(summary.emitted, 8);
    let emitted: Vec<(String, Marketplace)> = outcomes.iter().map(|o| o.record.key()).collect();
    let expected: Vec<(String, Marketplace)> = records.iter().map(|r| r.key()).collect();
    assert_eq!(emitted, expected);
}

#[tokio::test]
async fn cancellation_mid_batch_is_resumable() {
    let (_dir, pool) = open_store().await;
    let cancel = CancellationToken::new();

    // The token fires during the second upstream call; with one worker the
    // remaining records are never dispatched
    let primary = Arc::new(
        MockSource::new("primary")
            .cancel_on_call(2, cancel.clone()),
    );
    let fallback = Arc::new(MockSource::new("fallback"));
    let pipeline = pipeline_with(&pool, 1, primary, fallback).await;

    let records = vec![
        record_without_hints(EAN_A),
        record_without_hints(EAN_B),
        record_without_hints(EAN_C),
        record_without_hints(EAN_D),
    ];

    let (summary, outcomes) = run_collect(&pipeline, records.clone(), false, cancel).await;

    // The two in-flight records finished and were ledgered; the rest were
    // skipped without partial entries
    assert_eq!(summary.emitted, 2);
    assert_eq!(summary.cancelled, 2);
    assert_eq!(outcomes.len(), 2);

    {
        let ledger = RunLedger::open(pool.clone()).await.unwrap();
        assert_eq!(ledger.len(), 2);
    }

    // Resuming completes every record exactly once, with no duplicates
    let primary = Arc::new(MockSource::new("primary"));
    let fallback = Arc::new(MockSource::new("fallback"));
    let pipeline = pipeline_with(&pool, 1, primary.clone(), fallback).await;

    let (summary, outcomes) =
        run_collect(&pipeline, records, true, CancellationToken::new()).await;

    assert_eq!(summary.emitted, 4);
    assert_eq!(summary.resumed, 2);
    assert_eq!(primary.calls(), 2); // only the two unfinished records

    let mut seen: Vec<(String, Marketplace)> = outcomes.iter().map(|o| o.record.key()).collect();
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 4);

    let ledger = RunLedger::open(pool).await.unwrap();
    assert_eq!(ledger.len(), 4);
}

#[tokio::test]
async fn fresh_run_clears_previous_ledger() {
    let (_dir, pool) = open_store().await;

    let records = vec![record_without_hints(EAN_A)];

    let primary = Arc::new(MockSource::new("primary"));
    let fallback = Arc::new(MockSource::new("fallback"));
    let pipeline = pipeline_with(&pool, 1, primary, fallback).await;
    run_collect(&pipeline, records.clone(), false, CancellationToken::new()).await;

    // A second non-resume run starts over instead of choking on the
    // existing entries
    let primary = Arc::new(MockSource::new("primary"));
    let fallback = Arc::new(MockSource::new("fallback"));
    let pipeline = pipeline_with(&pool, 1, primary.clone(), fallback).await;
    let (summary, _) = run_collect(&pipeline, records, false, CancellationToken::new()).await;

    assert_eq!(summary.emitted, 1);
    assert_eq!(summary.resumed, 0);
    assert_eq!(primary.calls(), 1);
}
