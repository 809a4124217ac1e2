// Scan orchestrator: runs one session at a time, drives the structured
// strategy under the retry runner, and decides when to hand off to
// free-text extraction based on attempt budgets, deadlines, error kinds,
// and recent capture quality.

pub mod events;
pub mod session;
pub mod state;

use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info};
use tokio::sync::mpsc;
use tokio::task;

use crate::config::{ActiveSessionPolicy, ScanConfig};
use crate::models::{
    NormalizedRecord, ParseResult, QualitySample, RawInput, ReadinessScore, ScanMode, Strategy,
    TextObservation,
};
use crate::processing::{BarcodeParser, FreeTextExtractor};
use crate::quality::{QualityEngine, QualityWindow};
use crate::runtime::{PerformanceMonitor, RetryPolicy, RetryRunner};
use crate::utils::ScanError;

pub use events::ScanEvent;
pub use session::ScanSession;
pub use state::{transition, Effect, ScanState, SessionEvent, SwitchReason};

/// Pause between abandoning one strategy and starting the next, giving the
/// capture layer a beat to deliver fresher observations.
const STRATEGY_HANDOFF_DELAY_MS: u64 = 25;

/// Consecutive adequate quality samples required before a failure is
/// blamed on the payload rather than the capture.
const QUALITY_CONSISTENCY_RUN: usize = 3;

/// Structured-payload parsing strategy, injectable for tests.
pub trait PayloadParser: Send + Sync {
    fn parse(&self, payload: &str) -> ParseResult;
}

impl PayloadParser for BarcodeParser {
    fn parse(&self, payload: &str) -> ParseResult {
        BarcodeParser::parse(self, payload)
    }
}

/// Free-text parsing strategy, injectable for tests.
pub trait ObservationParser: Send + Sync {
    fn parse(&self, observations: &[TextObservation], region_hint: Option<&str>) -> ParseResult;
}

impl ObservationParser for FreeTextExtractor {
    fn parse(&self, observations: &[TextObservation], region_hint: Option<&str>) -> ParseResult {
        FreeTextExtractor::parse(self, observations, region_hint)
    }
}

struct ActiveSlot {
    id: u64,
    runner: Arc<RetryRunner>,
}

/// Entry point exposed to the application collaborator.
///
/// One orchestrator supports one active session at a time; quality samples
/// and observation batches may be pushed concurrently with an in-flight
/// scan and are never blocked by it.
pub struct ScanOrchestrator {
    config: ScanConfig,
    payload_parser: Arc<dyn PayloadParser>,
    observation_parser: Arc<dyn ObservationParser>,
    quality_engine: QualityEngine,
    quality_window: Mutex<QualityWindow>,
    latest_observations: Mutex<Option<Arc<Vec<TextObservation>>>>,
    events_tx: mpsc::UnboundedSender<ScanEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ScanEvent>>>,
    active: Mutex<Option<ActiveSlot>>,
}

impl ScanOrchestrator {
    pub fn new(config: ScanConfig) -> Self {
        let extractor = FreeTextExtractor::new(config.confidence_threshold);
        Self::with_parsers(config, Arc::new(BarcodeParser::new()), Arc::new(extractor))
    }

    pub fn with_parsers(
        config: ScanConfig,
        payload_parser: Arc<dyn PayloadParser>,
        observation_parser: Arc<dyn ObservationParser>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        ScanOrchestrator {
            config,
            payload_parser,
            observation_parser,
            quality_engine: QualityEngine::new(),
            quality_window: Mutex::new(QualityWindow::default()),
            latest_observations: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            active: Mutex::new(None),
        }
    }

    /// Take the event stream. Yields `None` after the first call.
    pub fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<ScanEvent>> {
        lock(&self.events_rx).take()
    }

    /// Ingest one capture-quality sample. Independent of any in-flight
    /// parse attempt; only this call touches the quality window.
    pub fn push_quality_sample(&self, sample: QualitySample) -> ReadinessScore {
        let score = self.quality_engine.assess(&sample);
        lock(&self.quality_window).push(score.score);
        score
    }

    /// Stash the latest observation batch from the capture layer, used
    /// when an auto-mode session falls back to free-text extraction.
    pub fn push_observations(&self, observations: Vec<TextObservation>) {
        *lock(&self.latest_observations) = Some(Arc::new(observations));
    }

    /// Cancel the active session, if any. Idempotent and always safe.
    pub fn cancel(&self) {
        if let Some(slot) = lock(&self.active).as_ref() {
            info!("cancelling scan session {}", slot.id);
            slot.runner.cancel_all();
        }
    }

    /// Run one scan session to completion.
    pub async fn scan(
        &self,
        input: RawInput,
        mode: ScanMode,
    ) -> Result<NormalizedRecord, ScanError> {
        self.config.validate()?;

        let (payload, observations) = match input {
            RawInput::StructuredPayload(payload) => {
                if mode == ScanMode::FreeText {
                    return Err(ScanError::InvalidInput(
                        "free-text mode requires observations, got a structured payload".into(),
                    ));
                }
                (Some(Arc::new(payload)), None)
            }
            RawInput::Observations(observations) => {
                if mode == ScanMode::Structured {
                    return Err(ScanError::InvalidInput(
                        "structured mode requires a payload, got observations".into(),
                    ));
                }
                (None, Some(Arc::new(observations)))
            }
        };

        let initial_strategy = if payload.is_some() {
            Strategy::Structured
        } else {
            Strategy::FreeText
        };
        let fallback_allowed =
            mode == ScanMode::Auto && self.config.auto_fallback && payload.is_some();

        let runner = Arc::new(RetryRunner::new());
        let monitor = PerformanceMonitor::start_session(match mode {
            ScanMode::Auto => "auto",
            ScanMode::Structured => "structured",
            ScanMode::FreeText => "free_text",
        });
        let session_id = monitor.session_id();
        self.acquire_slot(session_id, Arc::clone(&runner)).await?;
        let _slot = SlotGuard {
            orchestrator: self,
            id: session_id,
        };
        lock(&self.quality_window).clear();

        let mut session = ScanSession::new(initial_strategy, monitor);
        if let Some(payload) = &payload {
            session.monitor.track_memory("payload", payload.len() as i64);
        }
        if let Some(observations) = &observations {
            session
                .monitor
                .track_memory("observations", observation_bytes(observations));
        }

        let mut last_error = ScanError::ParsingFailed("no strategy was attempted".into());
        let mut final_parse: Option<ParseResult> = None;

        self.apply(
            &mut session,
            SessionEvent::Started(initial_strategy),
            fallback_allowed,
        );

        let result = loop {
            match session.state {
                ScanState::Structured => {
                    let Some(payload) = payload.clone() else {
                        last_error = ScanError::InvalidInput(
                            "structured strategy requires a payload".into(),
                        );
                        self.apply(&mut session, SessionEvent::CancelRequested, fallback_allowed);
                        break Err(last_error.clone());
                    };
                    session.monitor.checkpoint("structured_start");
                    let phase = self
                        .run_structured(
                            Arc::clone(&session.structured_attempts),
                            payload,
                            &runner,
                        )
                        .await;
                    session.monitor.checkpoint("structured_end");
                    match phase {
                        Ok(parse) => {
                            final_parse = Some(parse);
                            self.apply(&mut session, SessionEvent::ParseSucceeded, fallback_allowed);
                        }
                        Err(ScanError::Cancelled) => {
                            self.apply(
                                &mut session,
                                SessionEvent::CancelRequested,
                                fallback_allowed,
                            );
                            break Err(ScanError::Cancelled);
                        }
                        Err(error) => {
                            let reason = classify_exhaustion(&error);
                            if matches!(
                                reason,
                                SwitchReason::Timeout | SwitchReason::MaxAttempts
                            ) && !session.quality_grace_used
                                && self.capture_quality_inadequate()
                            {
                                // The frame, not the payload, was the likely
                                // culprit; grant the strategy one more round.
                                session.quality_grace_used = true;
                                info!(
                                    "session {} holding strategy, capture quality inadequate",
                                    session.id()
                                );
                                self.emit_progress(&session, "fallback_suppressed_by_quality");
                                continue;
                            }
                            last_error = error;
                            self.apply(
                                &mut session,
                                SessionEvent::StrategyExhausted(reason),
                                fallback_allowed,
                            );
                        }
                    }
                }
                ScanState::Switching => {
                    if runner
                        .delay(Duration::from_millis(STRATEGY_HANDOFF_DELAY_MS))
                        .await
                        .is_err()
                    {
                        self.apply(&mut session, SessionEvent::CancelRequested, fallback_allowed);
                        break Err(ScanError::Cancelled);
                    }
                    self.apply(&mut session, SessionEvent::SwitchCompleted, fallback_allowed);
                }
                ScanState::FreeText => {
                    let observations = observations
                        .clone()
                        .or_else(|| lock(&self.latest_observations).clone())
                        .unwrap_or_else(|| Arc::new(Vec::new()));
                    session.monitor.checkpoint("free_text_start");
                    let phase = self
                        .run_free_text(
                            Arc::clone(&session.free_text_attempts),
                            observations,
                            &runner,
                        )
                        .await;
                    session.monitor.checkpoint("free_text_end");
                    match phase {
                        Ok(parse) => {
                            final_parse = Some(parse);
                            self.apply(&mut session, SessionEvent::ParseSucceeded, fallback_allowed);
                        }
                        Err(ScanError::Cancelled) => {
                            self.apply(
                                &mut session,
                                SessionEvent::CancelRequested,
                                fallback_allowed,
                            );
                            break Err(ScanError::Cancelled);
                        }
                        Err(error) => {
                            let reason = classify_exhaustion(&error);
                            last_error = error;
                            self.apply(
                                &mut session,
                                SessionEvent::StrategyExhausted(reason),
                                fallback_allowed,
                            );
                        }
                    }
                }
                ScanState::Completed => match final_parse.take().and_then(|p| p.record) {
                    Some(record) => break Ok(record),
                    None => {
                        break Err(ScanError::ParsingFailed(
                            "successful parse produced no record".into(),
                        ))
                    }
                },
                ScanState::Failed => break Err(last_error.clone()),
                ScanState::Idle => {
                    break Err(ScanError::InvalidInput("session failed to start".into()))
                }
            }
        };

        let metrics = session.monitor.end_session();
        debug!(
            "session {} finished in {}ms ({} alerts)",
            session_id,
            metrics.total_ms,
            metrics.alerts.len()
        );
        self.emit(ScanEvent::Metrics(metrics));

        result
    }

    async fn run_structured(
        &self,
        attempts: Arc<AtomicU32>,
        payload: Arc<String>,
        runner: &RetryRunner,
    ) -> Result<ParseResult, ScanError> {
        let policy = RetryPolicy {
            attempt_timeout: Duration::from_millis(self.config.structured_timeout_ms),
            max_attempts: self.config.max_structured_attempts,
            retry_delay: Duration::from_millis(self.config.retry_delay_ms),
        };
        let parser = Arc::clone(&self.payload_parser);
        runner
            .run(Strategy::Structured, policy, move |attempt| {
                let parser = Arc::clone(&parser);
                let payload = Arc::clone(&payload);
                let attempts = Arc::clone(&attempts);
                async move {
                    attempts.store(attempt, Ordering::SeqCst);
                    let result = task::spawn_blocking(move || parser.parse(&payload))
                        .await
                        .map_err(|e| {
                            ScanError::ParsingFailed(format!("structured parse task failed: {e}"))
                        })?;
                    into_phase_outcome(result, "structured parser reported failure")
                }
            })
            .await
    }

    async fn run_free_text(
        &self,
        attempts: Arc<AtomicU32>,
        observations: Arc<Vec<TextObservation>>,
        runner: &RetryRunner,
    ) -> Result<ParseResult, ScanError> {
        let policy = RetryPolicy {
            attempt_timeout: Duration::from_millis(self.config.free_text_timeout_ms),
            max_attempts: self.config.max_free_text_attempts,
            retry_delay: Duration::from_millis(self.config.retry_delay_ms),
        };
        let parser = Arc::clone(&self.observation_parser);
        runner
            .run(Strategy::FreeText, policy, move |attempt| {
                let parser = Arc::clone(&parser);
                let observations = Arc::clone(&observations);
                let attempts = Arc::clone(&attempts);
                async move {
                    attempts.store(attempt, Ordering::SeqCst);
                    let result = task::spawn_blocking(move || parser.parse(&observations, None))
                        .await
                        .map_err(|e| {
                            ScanError::ParsingFailed(format!("free-text parse task failed: {e}"))
                        })?;
                    into_phase_outcome(result, "free-text extraction reported failure")
                }
            })
            .await
    }

    /// Whether recent capture quality argues against abandoning the
    /// structured strategy. With no samples at all there is nothing to
    /// argue from.
    fn capture_quality_inadequate(&self) -> bool {
        let window = lock(&self.quality_window);
        !window.is_empty()
            && !window.consistently_adequate(
                QUALITY_CONSISTENCY_RUN,
                self.config.quality_switch_threshold,
            )
    }

    async fn acquire_slot(
        &self,
        id: u64,
        runner: Arc<RetryRunner>,
    ) -> Result<(), ScanError> {
        // Bounded wait for a preempted session to unwind cooperatively.
        for _ in 0..200 {
            {
                let mut active = lock(&self.active);
                match active.as_ref() {
                    None => {
                        *active = Some(ActiveSlot {
                            id,
                            runner: Arc::clone(&runner),
                        });
                        return Ok(());
                    }
                    Some(current) => match self.config.on_active_session {
                        ActiveSessionPolicy::Reject => {
                            return Err(ScanError::InvalidInput(
                                "a scan session is already active".into(),
                            ));
                        }
                        ActiveSessionPolicy::Preempt => {
                            debug!("preempting active scan session {}", current.id);
                            current.runner.cancel_all();
                        }
                    },
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(ScanError::InvalidInput(
            "active session did not yield to preemption".into(),
        ))
    }

    fn apply(&self, session: &mut ScanSession, event: SessionEvent, fallback_allowed: bool) {
        let (next, effects) = transition(session.state, event, fallback_allowed);
        if next != session.state {
            info!(
                "session {} state {:?} -> {:?}",
                session.id(),
                session.state,
                next
            );
        }
        session.state = next;
        if let SessionEvent::Started(strategy) = event {
            session.strategy = strategy;
        }
        for effect in effects {
            match effect {
                Effect::EmitProgress(reason) => self.emit_progress(session, reason),
                Effect::EmitSwitch { from, to, reason } => {
                    session.strategy = to;
                    info!(
                        "session {} switching {} -> {} ({})",
                        session.id(),
                        from,
                        to,
                        reason.as_str()
                    );
                    self.emit(ScanEvent::ModeSwitch { from, to, reason });
                    self.emit_progress(session, reason.as_str());
                }
            }
        }
    }

    fn emit_progress(&self, session: &ScanSession, reason: &str) {
        self.emit(ScanEvent::Progress {
            state: session.state,
            strategy: session.strategy,
            elapsed_ms: session.elapsed_ms(),
            structured_attempts: session.structured_attempt_count(),
            free_text_attempts: session.free_text_attempt_count(),
            reason: reason.to_string(),
        });
    }

    fn emit(&self, event: ScanEvent) {
        // A missing or dropped subscriber must never stall the session.
        let _ = self.events_tx.send(event);
    }
}

struct SlotGuard<'a> {
    orchestrator: &'a ScanOrchestrator,
    id: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut active = lock(&self.orchestrator.active);
        if active.as_ref().map(|slot| slot.id == self.id).unwrap_or(false) {
            *active = None;
        }
    }
}

fn into_phase_outcome(result: ParseResult, fallback_msg: &str) -> Result<ParseResult, ScanError> {
    if result.success {
        Ok(result)
    } else {
        Err(result
            .error
            .unwrap_or_else(|| ScanError::ParsingFailed(fallback_msg.into())))
    }
}

fn classify_exhaustion(error: &ScanError) -> SwitchReason {
    match error {
        ScanError::Timeout { .. } => SwitchReason::Timeout,
        ScanError::RetryExhausted { last, .. } => match **last {
            ScanError::Timeout { .. } => SwitchReason::Timeout,
            _ => SwitchReason::MaxAttempts,
        },
        _ => SwitchReason::NonRecoverableError,
    }
}

fn observation_bytes(observations: &[TextObservation]) -> i64 {
    let text: usize = observations.iter().map(|o| o.text.len()).sum();
    (text + observations.len() * mem::size_of::<TextObservation>()) as i64
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BoundingBox, DistanceCategory};
    use std::time::Instant;

    fn sample_payload() -> String {
        let subfile = "DLDAQD1234567\nDCSDOE\nDACJOHN\nDBB01151990\nDBA06012028\nDAJCA\r";
        format!("@\n\x1e\rANSI 636014090001DL00410200{}", subfile)
    }

    fn obs(text: &str, confidence: f64, y: f64) -> TextObservation {
        TextObservation {
            text: text.to_string(),
            confidence,
            bounds: BoundingBox {
                x: 0.1,
                y,
                width: 0.8,
                height: 0.04,
            },
        }
    }

    fn license_observations() -> Vec<TextObservation> {
        vec![
            obs("CALIFORNIA DRIVER LICENSE", 0.93, 0.05),
            obs("DL D1234567", 0.93, 0.15),
            obs("LN DOE", 0.93, 0.25),
            obs("FN JOHN", 0.93, 0.35),
            obs("DOB 01/15/1990", 0.93, 0.45),
        ]
    }

    fn quick_config() -> ScanConfig {
        ScanConfig {
            structured_timeout_ms: 50,
            free_text_timeout_ms: 200,
            max_structured_attempts: 1,
            max_free_text_attempts: 1,
            retry_delay_ms: 5,
            ..Default::default()
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ScanEvent>) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn mode_switches(events: &[ScanEvent]) -> Vec<(Strategy, Strategy, SwitchReason)> {
        events
            .iter()
            .filter_map(|e| match e {
                ScanEvent::ModeSwitch { from, to, reason } => Some((*from, *to, *reason)),
                _ => None,
            })
            .collect()
    }

    /// Parser that blocks for a fixed duration, then fails.
    struct SlowParser {
        delay: Duration,
    }

    impl PayloadParser for SlowParser {
        fn parse(&self, _payload: &str) -> ParseResult {
            std::thread::sleep(self.delay);
            ParseResult::failure(ScanError::ParsingFailed("slow parser".into()))
        }
    }

    /// Parser that fails every call with a fixed error and counts calls.
    struct FailingParser {
        calls: Arc<AtomicU32>,
        error: ScanError,
        delay: Duration,
    }

    impl FailingParser {
        fn immediate(calls: Arc<AtomicU32>, error: ScanError) -> Self {
            FailingParser {
                calls,
                error,
                delay: Duration::ZERO,
            }
        }
    }

    impl PayloadParser for FailingParser {
        fn parse(&self, _payload: &str) -> ParseResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            ParseResult::failure(self.error.clone())
        }
    }

    fn with_payload_parser(
        config: ScanConfig,
        parser: Arc<dyn PayloadParser>,
    ) -> ScanOrchestrator {
        let extractor = FreeTextExtractor::new(config.confidence_threshold);
        ScanOrchestrator::with_parsers(config, parser, Arc::new(extractor))
    }

    fn poor_sample() -> QualitySample {
        QualitySample {
            blur: 0.9,
            brightness: 0.4,
            uniformity: 0.5,
            alignment: 0.3,
            document_detected: true,
            distance: DistanceCategory::TooFar,
        }
    }

    #[tokio::test]
    async fn structured_auto_scan_extracts_exact_fields() {
        let orchestrator = ScanOrchestrator::new(ScanConfig::default());
        let mut rx = orchestrator.subscribe().expect("first subscriber");
        let record = orchestrator
            .scan(RawInput::StructuredPayload(sample_payload()), ScanMode::Auto)
            .await
            .expect("scan should succeed");
        assert_eq!(record.first_name.as_deref(), Some("JOHN"));
        assert_eq!(record.last_name.as_deref(), Some("DOE"));
        assert_eq!(record.document_number.as_deref(), Some("D1234567"));

        let events = drain(&mut rx);
        assert!(mode_switches(&events).is_empty());
        assert!(events.iter().any(|e| matches!(
            e,
            ScanEvent::Progress { state: ScanState::Completed, .. }
        )));
        assert!(events.iter().any(|e| matches!(e, ScanEvent::Metrics(_))));
    }

    #[tokio::test]
    async fn forced_structured_bad_payload_is_invalid_format() {
        let orchestrator = ScanOrchestrator::new(ScanConfig::default());
        let mut rx = orchestrator.subscribe().expect("first subscriber");
        let error = orchestrator
            .scan(
                RawInput::StructuredPayload("BADDATA".into()),
                ScanMode::Structured,
            )
            .await
            .unwrap_err();
        assert_eq!(error.code(), "invalid_format");
        assert!(error.recoverable());
        // Forced mode: failure, never a switch.
        assert!(mode_switches(&drain(&mut rx)).is_empty());
    }

    #[tokio::test]
    async fn auto_mode_falls_back_to_pushed_observations() {
        let orchestrator = ScanOrchestrator::new(ScanConfig::default());
        let mut rx = orchestrator.subscribe().expect("first subscriber");
        orchestrator.push_observations(license_observations());
        let record = orchestrator
            .scan(RawInput::StructuredPayload("BADDATA".into()), ScanMode::Auto)
            .await
            .expect("fallback should recover the record");
        assert_eq!(record.first_name.as_deref(), Some("JOHN"));
        assert_eq!(record.document_number.as_deref(), Some("D1234567"));

        let switches = mode_switches(&drain(&mut rx));
        assert_eq!(
            switches,
            vec![(
                Strategy::Structured,
                Strategy::FreeText,
                SwitchReason::NonRecoverableError
            )]
        );
    }

    #[tokio::test]
    async fn slow_structured_operation_never_wedges_the_session() {
        // 50ms budget against a 500ms operation with one attempt: the
        // session must end in FreeText or Failed, promptly.
        let orchestrator = with_payload_parser(
            quick_config(),
            Arc::new(SlowParser {
                delay: Duration::from_millis(500),
            }),
        );
        let mut rx = orchestrator.subscribe().expect("first subscriber");
        let started = Instant::now();
        let result = orchestrator
            .scan(RawInput::StructuredPayload(sample_payload()), ScanMode::Auto)
            .await;
        assert!(started.elapsed() < Duration::from_secs(2));
        // No observations were pushed, so the fallback has nothing to read.
        assert_eq!(result.unwrap_err().code(), "insufficient_data");

        let switches = mode_switches(&drain(&mut rx));
        assert_eq!(
            switches,
            vec![(Strategy::Structured, Strategy::FreeText, SwitchReason::Timeout)]
        );
    }

    #[tokio::test]
    async fn exhausted_attempts_fall_back_exactly_once_with_reason() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = ScanConfig {
            max_structured_attempts: 2,
            retry_delay_ms: 5,
            ..Default::default()
        };
        let orchestrator = with_payload_parser(
            config,
            Arc::new(FailingParser::immediate(
                calls.clone(),
                ScanError::ParsingFailed("garbled".into()),
            )),
        );
        let mut rx = orchestrator.subscribe().expect("first subscriber");
        orchestrator.push_observations(license_observations());
        let record = orchestrator
            .scan(RawInput::StructuredPayload(sample_payload()), ScanMode::Auto)
            .await
            .expect("fallback should succeed");
        assert_eq!(record.last_name.as_deref(), Some("DOE"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let switches = mode_switches(&drain(&mut rx));
        assert_eq!(
            switches,
            vec![(
                Strategy::Structured,
                Strategy::FreeText,
                SwitchReason::MaxAttempts
            )]
        );
    }

    #[tokio::test]
    async fn forced_mode_exhaustion_fails_without_fallback() {
        let calls = Arc::new(AtomicU32::new(0));
        let orchestrator = with_payload_parser(
            ScanConfig {
                max_structured_attempts: 2,
                retry_delay_ms: 5,
                ..Default::default()
            },
            Arc::new(FailingParser::immediate(
                calls.clone(),
                ScanError::ParsingFailed("garbled".into()),
            )),
        );
        let mut rx = orchestrator.subscribe().expect("first subscriber");
        orchestrator.push_observations(license_observations());
        let error = orchestrator
            .scan(
                RawInput::StructuredPayload(sample_payload()),
                ScanMode::Structured,
            )
            .await
            .unwrap_err();
        assert_eq!(error.code(), "retry_exhausted");
        assert!(mode_switches(&drain(&mut rx)).is_empty());
    }

    #[tokio::test]
    async fn disabled_auto_fallback_behaves_like_forced_mode() {
        let orchestrator = ScanOrchestrator::new(ScanConfig {
            auto_fallback: false,
            ..Default::default()
        });
        let mut rx = orchestrator.subscribe().expect("first subscriber");
        orchestrator.push_observations(license_observations());
        let error = orchestrator
            .scan(RawInput::StructuredPayload("BADDATA".into()), ScanMode::Auto)
            .await
            .unwrap_err();
        assert_eq!(error.code(), "invalid_format");
        assert!(mode_switches(&drain(&mut rx)).is_empty());
    }

    #[tokio::test]
    async fn wrong_input_shape_for_forced_mode_is_caller_misuse() {
        let orchestrator = ScanOrchestrator::new(ScanConfig::default());
        let error = orchestrator
            .scan(RawInput::Observations(license_observations()), ScanMode::Structured)
            .await
            .unwrap_err();
        assert_eq!(error.code(), "invalid_input");
        assert!(!error.recoverable());

        let error = orchestrator
            .scan(
                RawInput::StructuredPayload(sample_payload()),
                ScanMode::FreeText,
            )
            .await
            .unwrap_err();
        assert_eq!(error.code(), "invalid_input");
    }

    #[tokio::test]
    async fn observations_input_in_auto_mode_parses_free_text_directly() {
        let orchestrator = ScanOrchestrator::new(ScanConfig::default());
        let mut rx = orchestrator.subscribe().expect("first subscriber");
        let record = orchestrator
            .scan(RawInput::Observations(license_observations()), ScanMode::Auto)
            .await
            .expect("free-text scan should succeed");
        assert_eq!(record.first_name.as_deref(), Some("JOHN"));
        assert!(mode_switches(&drain(&mut rx)).is_empty());
    }

    #[tokio::test]
    async fn cancel_interrupts_and_is_idempotent() {
        let orchestrator = Arc::new(with_payload_parser(
            ScanConfig {
                structured_timeout_ms: 10_000,
                max_structured_attempts: 3,
                ..Default::default()
            },
            Arc::new(SlowParser {
                delay: Duration::from_secs(2),
            }),
        ));
        let background = Arc::clone(&orchestrator);
        let task = tokio::spawn(async move {
            background
                .scan(RawInput::StructuredPayload(sample_payload()), ScanMode::Auto)
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = Instant::now();
        orchestrator.cancel();
        orchestrator.cancel(); // second call is a no-op
        let result = task.await.expect("scan task must not panic");
        assert_eq!(result.unwrap_err(), ScanError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
        // The slot is free again.
        orchestrator.cancel();
    }

    #[tokio::test]
    async fn second_scan_rejected_while_one_is_active() {
        let orchestrator = Arc::new(with_payload_parser(
            ScanConfig {
                structured_timeout_ms: 3_000,
                max_structured_attempts: 1,
                ..Default::default()
            },
            Arc::new(SlowParser {
                delay: Duration::from_secs(2),
            }),
        ));
        let background = Arc::clone(&orchestrator);
        let task = tokio::spawn(async move {
            background
                .scan(RawInput::StructuredPayload(sample_payload()), ScanMode::Auto)
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let error = orchestrator
            .scan(RawInput::StructuredPayload(sample_payload()), ScanMode::Auto)
            .await
            .unwrap_err();
        assert_eq!(error.code(), "invalid_input");
        orchestrator.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn preempt_policy_cancels_the_active_session() {
        let orchestrator = Arc::new(with_payload_parser(
            ScanConfig {
                structured_timeout_ms: 10_000,
                max_structured_attempts: 1,
                on_active_session: ActiveSessionPolicy::Preempt,
                ..Default::default()
            },
            Arc::new(SlowParser {
                delay: Duration::from_secs(2),
            }),
        ));
        let background = Arc::clone(&orchestrator);
        let first = tokio::spawn(async move {
            background
                .scan(RawInput::StructuredPayload(sample_payload()), ScanMode::Auto)
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Second session preempts; it parses free-text directly.
        let record = orchestrator
            .scan(RawInput::Observations(license_observations()), ScanMode::Auto)
            .await
            .expect("preempting scan should succeed");
        assert_eq!(record.last_name.as_deref(), Some("DOE"));
        assert_eq!(
            first.await.expect("first scan must not panic").unwrap_err(),
            ScanError::Cancelled
        );
    }

    #[tokio::test]
    async fn poor_capture_quality_suppresses_fallback_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let orchestrator = Arc::new(with_payload_parser(
            ScanConfig {
                max_structured_attempts: 1,
                retry_delay_ms: 5,
                ..Default::default()
            },
            Arc::new(FailingParser {
                calls: calls.clone(),
                error: ScanError::ParsingFailed("garbled".into()),
                delay: Duration::from_millis(150),
            }),
        ));
        let mut rx = orchestrator.subscribe().expect("first subscriber");
        let background = Arc::clone(&orchestrator);
        let task = tokio::spawn(async move {
            background
                .scan(RawInput::StructuredPayload(sample_payload()), ScanMode::Auto)
                .await
        });
        // Feed poor samples while the first structured round is in flight.
        tokio::time::sleep(Duration::from_millis(30)).await;
        for _ in 0..4 {
            orchestrator.push_quality_sample(poor_sample());
        }
        let result = task.await.expect("scan task must not panic");
        assert!(result.is_err());
        // One ordinary round plus the single quality-granted round.
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ScanEvent::Progress { reason, .. } if reason == "fallback_suppressed_by_quality"
        )));
        assert_eq!(mode_switches(&events).len(), 1);
    }

    #[tokio::test]
    async fn quality_scores_feed_the_window() {
        let orchestrator = ScanOrchestrator::new(ScanConfig::default());
        let score = orchestrator.push_quality_sample(poor_sample());
        assert!(score.score < 0.6);
        let good = QualitySample {
            blur: 0.05,
            brightness: 0.9,
            uniformity: 0.9,
            alignment: 0.9,
            document_detected: true,
            distance: DistanceCategory::Good,
        };
        let score = orchestrator.push_quality_sample(good);
        assert!(score.score > 0.75);
    }

    #[tokio::test]
    async fn subscribe_is_single_shot() {
        let orchestrator = ScanOrchestrator::new(ScanConfig::default());
        assert!(orchestrator.subscribe().is_some());
        assert!(orchestrator.subscribe().is_none());
    }
}
