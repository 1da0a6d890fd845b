use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::cua::{CuaRequest, CuaResponse, SafetyCheck, Transport};
use crate::error::{AgentError, ErrorClass, TransportError};
use crate::escalation::SafetyAcknowledger;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 9,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(ra) = retry_after {
            return ra.min(self.max_backoff);
        }
        let base = self.base_delay(attempt);
        base + jitter(base)
    }
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let secs = rand::thread_rng().gen_range(0.0..max.as_secs_f64());
    Duration::from_secs_f64(secs)
}

#[derive(Clone, Debug)]
pub struct RetryAttempt {
    pub attempt_number: u32,
    pub classified_error: ErrorClass,
    pub retry_after_seconds: Option<f64>,
    pub elapsed_backoff: f64,
}

#[derive(Clone)]
pub struct RetryingClient {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    acknowledger: Option<SafetyAcknowledger>,
}

impl RetryingClient {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy, acknowledger: None }
    }

    pub fn with_safety_acknowledger(mut self, acknowledger: SafetyAcknowledger) -> Self {
        self.acknowledger = Some(acknowledger);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Issues `request`, retrying retryable failures with backoff.
    ///
    /// The payload is resent unchanged, except that safety checks the server
    /// reports as unacknowledged are appended once they have been granted.
    pub async fn send(&self, request: &CuaRequest) -> Result<CuaResponse, AgentError> {
        let mut request = request.clone();
        let mut backoff_total = 0.0_f64;
        let mut last: Option<TransportError> = None;

        for attempt in 0..self.policy.max_attempts {
            let err = match self.transport.create(&request).await {
                Ok(resp) => {
                    if attempt > 0 {
                        info!(attempts = attempt + 1, response_id = %resp.id, "request succeeded after retry");
                    }
                    return Ok(resp);
                }
                Err(err) => err,
            };

            let record = RetryAttempt {
                attempt_number: attempt,
                classified_error: err.class,
                retry_after_seconds: err.retry_after.map(|d| d.as_secs_f64()),
                elapsed_backoff: backoff_total,
            };
            debug!(?record, "request attempt failed");

            match err.class {
                ErrorClass::Fatal => {
                    return Err(AgentError::Request { class: err.class, message: err.message });
                }
                ErrorClass::SafetyRequired if attempt + 1 >= self.policy.max_attempts => {
                    warn!(max = self.policy.max_attempts, "safety check reported on the final attempt; not resubmitting");
                }
                ErrorClass::SafetyRequired => {
                    let checks: Vec<SafetyCheck> =
                        err.safety_check_ids.iter().map(|id| SafetyCheck::from_id(id.as_str())).collect();
                    let granted = match &self.acknowledger {
                        Some(ack) => ack.acknowledge(&checks).await,
                        None => false,
                    };
                    if !granted {
                        return Err(AgentError::SafetyDeclined(err.safety_check_ids));
                    }
                    request.acknowledge(&checks);
                    info!(
                        count = checks.len(),
                        attempt = attempt + 1,
                        max = self.policy.max_attempts,
                        "acknowledged safety check(s); resubmitting"
                    );
                }
                class if class.is_retryable() => {
                    if attempt + 1 < self.policy.max_attempts {
                        let delay = self.policy.delay(attempt, err.retry_after);
                        warn!(
                            class = %err.class,
                            attempt = attempt + 1,
                            max = self.policy.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            "retrying request: {}",
                            err.message
                        );
                        tokio::time::sleep(delay).await;
                        backoff_total += delay.as_secs_f64();
                    }
                }
                class => {
                    return Err(AgentError::Request { class, message: err.message });
                }
            }
            last = Some(err);
        }

        let (class, message) = match last {
            Some(err) => (err.class, err.message),
            None => (ErrorClass::Fatal, "no attempts were made".to_string()),
        };
        Err(AgentError::RetriesExhausted { class, attempts: self.policy.max_attempts, message })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cua::{CuaResponse, ResponseId};
    use crate::escalation::{EscalationChannel, EscalationDecision};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub(crate) struct ScriptedTransport {
        script: Mutex<VecDeque<Result<CuaResponse, TransportError>>>,
        pub(crate) seen: Mutex<Vec<CuaRequest>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(script: Vec<Result<CuaResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self { script: Mutex::new(script.into()), seen: Mutex::new(Vec::new()) })
        }

        pub(crate) fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn create(&self, request: &CuaRequest) -> Result<CuaResponse, TransportError> {
            self.seen.lock().unwrap().push(request.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::new(ErrorClass::Fatal, "script exhausted")))
        }
    }

    pub(crate) fn ok(id: &str) -> Result<CuaResponse, TransportError> {
        Ok(CuaResponse { id: ResponseId(id.into()), computer_call: None, texts: vec![] })
    }

    pub(crate) fn fail(class: ErrorClass) -> Result<CuaResponse, TransportError> {
        Err(TransportError::new(class, format!("{class} failure")))
    }

    pub(crate) fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }

    struct FixedChannel(bool);

    #[async_trait]
    impl EscalationChannel for FixedChannel {
        async fn request_decision(&self, _utterance: &str) -> EscalationDecision {
            EscalationDecision::Confirm
        }

        async fn acknowledge_safety_checks(&self, _checks: &[SafetyCheck]) -> bool {
            self.0
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(9);
        assert_eq!(p.base_delay(0), Duration::from_millis(100));
        assert_eq!(p.base_delay(1), Duration::from_millis(200));
        assert_eq!(p.base_delay(3), Duration::from_millis(800));
        assert_eq!(p.base_delay(5), Duration::from_secs(2));
        assert_eq!(p.base_delay(40), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_below_base() {
        let p = policy(9);
        for attempt in 0..6 {
            let base = p.base_delay(attempt);
            for _ in 0..50 {
                let d = p.delay(attempt, None);
                assert!(d >= base && d < base * 2, "attempt {attempt}: {d:?}");
            }
        }
    }

    #[test]
    fn retry_after_takes_precedence() {
        let p = policy(9);
        assert_eq!(p.delay(4, Some(Duration::from_millis(1500))), Duration::from_millis(1500));
        assert_eq!(p.delay(0, Some(Duration::ZERO)), Duration::ZERO);
    }

    #[test]
    fn retry_after_is_capped_at_max_backoff() {
        let p = policy(9);
        assert_eq!(p.delay(0, Some(Duration::from_secs(86400))), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn long_retry_after_does_not_stall_the_step() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::rate_limited("429", Some(Duration::from_secs(86400)))),
            ok("r"),
        ]);
        let client = RetryingClient::new(transport.clone(), policy(3));
        let started = tokio::time::Instant::now();
        client.send(&CuaRequest::new("m")).await.unwrap();
        assert!(started.elapsed() <= Duration::from_secs(2));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        for failures in 0..5u32 {
            let mut script: Vec<_> = (0..failures)
                .map(|i| match i % 3 {
                    0 => fail(ErrorClass::RateLimited),
                    1 => fail(ErrorClass::Transient),
                    _ => fail(ErrorClass::ServerError),
                })
                .collect();
            script.push(ok("resp_ok"));
            let transport = ScriptedTransport::new(script);
            let client = RetryingClient::new(transport.clone(), policy(5));
            let resp = client.send(&CuaRequest::new("m")).await.unwrap();
            assert_eq!(resp.id.0, "resp_ok");
            assert_eq!(transport.calls() as u32, failures + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_the_ceiling_is_fatal() {
        let script = (0..10).map(|_| fail(ErrorClass::ServerError)).collect();
        let transport = ScriptedTransport::new(script);
        let client = RetryingClient::new(transport.clone(), policy(4));
        let err = client.send(&CuaRequest::new("m")).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::RetriesExhausted { class: ErrorClass::ServerError, attempts: 4, .. }
        ));
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_is_not_retried() {
        let transport = ScriptedTransport::new(vec![fail(ErrorClass::Fatal), ok("never")]);
        let client = RetryingClient::new(transport.clone(), policy(4));
        let err = client.send(&CuaRequest::new("m")).await.unwrap_err();
        assert!(matches!(err, AgentError::Request { class: ErrorClass::Fatal, .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_reuse_identical_payload() {
        let transport =
            ScriptedTransport::new(vec![fail(ErrorClass::Transient), fail(ErrorClass::RateLimited), ok("r")]);
        let client = RetryingClient::new(transport.clone(), policy(5));
        let req = CuaRequest::new("m").with_previous(ResponseId("resp_0".into()));
        client.send(&req).await.unwrap();
        let seen = transport.seen.lock().unwrap();
        assert!(seen.iter().all(|r| *r == req));
    }

    #[tokio::test(start_paused = true)]
    async fn server_safety_checks_are_acknowledged_and_resubmitted() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::safety_required("unacknowledged", vec!["cu_sc_1".into(), "cu_sc_2".into()])),
            ok("resp_after_ack"),
        ]);
        let ack = SafetyAcknowledger::new(false, Arc::new(FixedChannel(true)));
        let client = RetryingClient::new(transport.clone(), policy(5)).with_safety_acknowledger(ack);
        let resp = client.send(&CuaRequest::new("m")).await.unwrap();
        assert_eq!(resp.id.0, "resp_after_ack");
        let seen = transport.seen.lock().unwrap();
        assert!(seen[0].acknowledged_safety_checks.is_empty());
        let ids: Vec<_> = seen[1].acknowledged_safety_checks.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["cu_sc_1", "cu_sc_2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn safety_check_on_last_attempt_is_not_put_to_the_human() {
        struct CountingChannel(Mutex<u32>);

        #[async_trait]
        impl EscalationChannel for CountingChannel {
            async fn request_decision(&self, _utterance: &str) -> EscalationDecision {
                EscalationDecision::Confirm
            }

            async fn acknowledge_safety_checks(&self, _checks: &[SafetyCheck]) -> bool {
                *self.0.lock().unwrap() += 1;
                true
            }
        }

        let transport = ScriptedTransport::new(vec![
            fail(ErrorClass::ServerError),
            Err(TransportError::safety_required("unacknowledged", vec!["cu_sc_1".into()])),
        ]);
        let channel = Arc::new(CountingChannel(Mutex::new(0)));
        let ack = SafetyAcknowledger::new(false, channel.clone());
        let client = RetryingClient::new(transport.clone(), policy(2)).with_safety_acknowledger(ack);
        let err = client.send(&CuaRequest::new("m")).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::RetriesExhausted { class: ErrorClass::SafetyRequired, attempts: 2, .. }
        ));
        assert_eq!(*channel.0.lock().unwrap(), 0);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn declined_safety_checks_abort() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::safety_required(
            "unacknowledged",
            vec!["cu_sc_1".into()],
        ))]);
        let ack = SafetyAcknowledger::new(false, Arc::new(FixedChannel(false)));
        let client = RetryingClient::new(transport.clone(), policy(5)).with_safety_acknowledger(ack);
        let err = client.send(&CuaRequest::new("m")).await.unwrap_err();
        assert!(matches!(err, AgentError::SafetyDeclined(ref ids) if ids == &vec!["cu_sc_1".to_string()]));
        assert_eq!(transport.calls(), 1);
    }
}
