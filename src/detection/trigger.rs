// Trigger policy
// Turns per-window confidence scores into discrete, debounced, cooldown-gated events

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::error::Error as StdError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::detection::types::{ClassScope, ConfidenceScore, TriggerEvent};

pub const DEFAULT_HISTORY_SIZE: usize = 100;

/// One uniform rule evaluated for every class scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRule {
    pub class_scope: ClassScope,

    /// Scores strictly above this count toward firing
    pub threshold: f32,

    /// Consecutive above-threshold windows required to fire
    pub debounce_count: u32,

    /// Minimum stream time between two firings
    pub cooldown_seconds: f64,

    /// After firing, the score must drop to or below threshold before the
    /// scope can fire again
    pub require_release: bool,

    /// Capacity of the diagnostic confidence history
    pub history_size: usize,
}

impl TriggerRule {
    pub fn new(class_scope: ClassScope) -> Self {
        TriggerRule {
            class_scope,
            threshold: 0.5,
            debounce_count: 2,
            cooldown_seconds: 3.0,
            require_release: false,
            history_size: DEFAULT_HISTORY_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerPhase {
    /// Waiting for an above-threshold score
    Idle,
    /// Counting consecutive above-threshold windows
    Armed,
    /// Fired recently; suppressed until the cooldown elapses
    Cooldown,
}

/// Bounded ring buffer of recent scores
#[derive(Debug, Clone)]
pub struct ConfidenceHistory {
    capacity: usize,
    entries: VecDeque<ConfidenceScore>,
}

impl ConfidenceHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        ConfidenceHistory {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, score: ConfidenceScore) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(score);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest first
    pub fn to_vec(&self) -> Vec<ConfidenceScore> {
        self.entries.iter().cloned().collect()
    }
}

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("Trigger callback for {scope} failed: {message}")]
    Failed { scope: ClassScope, message: String },

    #[error("Trigger callback for {scope} panicked: {message}")]
    Panicked { scope: ClassScope, message: String },
}

pub type CallbackResult = Result<(), Box<dyn StdError + Send + Sync>>;

pub type TriggerCallback = Arc<dyn Fn(&TriggerEvent) -> CallbackResult + Send + Sync>;

/// Per-scope state machine
#[derive(Debug, Clone)]
struct ScopeState {
    rule: TriggerRule,
    phase: TriggerPhase,
    consecutive: u32,
    last_fired_at: Option<f64>,
    released: bool,
    fire_count: u64,
    history: ConfidenceHistory,
}

impl ScopeState {
    fn new(rule: TriggerRule) -> Self {
        let history = ConfidenceHistory::new(rule.history_size);
        ScopeState {
            rule,
            phase: TriggerPhase::Idle,
            consecutive: 0,
            last_fired_at: None,
            released: true,
            fire_count: 0,
            history,
        }
    }

    fn cooled_down(&self, now: f64) -> bool {
        match self.last_fired_at {
            Some(last) => now - last >= self.rule.cooldown_seconds,
            None => true,
        }
    }

    fn observe(&mut self, score: &ConfidenceScore) -> Option<TriggerEvent> {
        self.history.push(score.clone());
        let now = score.timestamp;

        if self.phase == TriggerPhase::Cooldown && self.cooled_down(now) {
            self.phase = TriggerPhase::Idle;
        }

        let above = score.probability > self.rule.threshold;
        if above {
            self.consecutive = self.consecutive.saturating_add(1);
        } else {
            self.consecutive = 0;
            self.released = true;
        }

        if self.phase != TriggerPhase::Cooldown {
            self.phase = if self.consecutive > 0 {
                TriggerPhase::Armed
            } else {
                TriggerPhase::Idle
            };
        }

        let ready = self.consecutive >= self.rule.debounce_count.max(1)
            && self.cooled_down(now)
            && (!self.rule.require_release || self.released);
        if !ready {
            return None;
        }

        self.last_fired_at = Some(now);
        self.phase = TriggerPhase::Cooldown;
        self.released = false;
        self.fire_count += 1;
        Some(TriggerEvent::from_score(score))
    }

    fn reset(&mut self) {
        self.phase = TriggerPhase::Idle;
        self.consecutive = 0;
        self.last_fired_at = None;
        self.released = true;
    }
}

/// Debounce and cooldown for every configured class scope
#[derive(Debug, Clone, Default)]
pub struct TriggerPolicy {
    scopes: BTreeMap<ClassScope, ScopeState>,
}

impl TriggerPolicy {
    pub fn new(rules: impl IntoIterator<Item = TriggerRule>) -> Self {
        let scopes = rules
            .into_iter()
            .map(|rule| (rule.class_scope.clone(), ScopeState::new(rule)))
            .collect();
        TriggerPolicy { scopes }
    }

    pub fn rule(&self, class_scope: &ClassScope) -> Option<&TriggerRule> {
        self.scopes.get(class_scope).map(|s| &s.rule)
    }

    /// Feed one score. Returns the event if this score fires the scope.
    /// Scores for scopes without a rule are ignored.
    pub fn observe(&mut self, score: &ConfidenceScore) -> Option<TriggerEvent> {
        let state = self.scopes.get_mut(&score.class_scope)?;
        let event = state.observe(score)?;

        log::info!(
            "Trigger fired: {} at {:.2}s (confidence {:.3}, model v{})",
            event.class_scope,
            event.stream_time,
            event.confidence,
            event.model_version
        );
        Some(event)
    }

    pub fn phase(&self, class_scope: &ClassScope) -> Option<TriggerPhase> {
        self.scopes.get(class_scope).map(|s| s.phase)
    }

    pub fn last_fired_at(&self, class_scope: &ClassScope) -> Option<f64> {
        self.scopes.get(class_scope).and_then(|s| s.last_fired_at)
    }

    pub fn fire_count(&self, class_scope: &ClassScope) -> u64 {
        self.scopes.get(class_scope).map_or(0, |s| s.fire_count)
    }

    /// Recent scores for a scope, oldest first
    pub fn history(&self, class_scope: &ClassScope) -> Vec<ConfidenceScore> {
        self.scopes
            .get(class_scope)
            .map(|s| s.history.to_vec())
            .unwrap_or_default()
    }

    /// Forget timing state when stream time restarts. History is kept.
    pub fn reset_timing(&mut self) {
        for state in self.scopes.values_mut() {
            state.reset();
        }
    }
}

/// Callbacks per class scope, invoked on the processing thread.
///
/// A callback that errors or panics is logged and counted; the remaining
/// callbacks still run.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: RwLock<HashMap<ClassScope, Vec<TriggerCallback>>>,
    failures: AtomicU64,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, class_scope: ClassScope, callback: F)
    where
        F: Fn(&TriggerEvent) -> CallbackResult + Send + Sync + 'static,
    {
        let callback: TriggerCallback = Arc::new(callback);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(class_scope)
            .or_default()
            .push(callback);
    }

    pub fn count(&self, class_scope: &ClassScope) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(class_scope)
            .map_or(0, Vec::len)
    }

    /// Total callback errors and panics so far
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Invoke every callback registered for the event's scope exactly once
    pub fn dispatch(&self, event: &TriggerEvent) -> Vec<CallbackError> {
        // Clone out so callbacks may register further callbacks
        let callbacks: Vec<TriggerCallback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event.class_scope)
            .cloned()
            .unwrap_or_default();

        let mut errors = Vec::new();
        for callback in callbacks {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(event)));

            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => CallbackError::Failed {
                    scope: event.class_scope.clone(),
                    message: e.to_string(),
                },
                Err(payload) => CallbackError::Panicked {
                    scope: event.class_scope.clone(),
                    message: panic_message(payload.as_ref()),
                },
            };

            log::error!("{}", error);
            self.failures.fetch_add(1, Ordering::Relaxed);
            errors.push(error);
        }
        errors
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn score(p: f32, t: f64) -> ConfidenceScore {
        ConfidenceScore {
            class_scope: ClassScope::hotword(),
            probability: p,
            timestamp: t,
            model_version: 0,
        }
    }

    fn policy(debounce: u32, cooldown: f64) -> TriggerPolicy {
        let mut rule = TriggerRule::new(ClassScope::hotword());
        rule.debounce_count = debounce;
        rule.cooldown_seconds = cooldown;
        TriggerPolicy::new([rule])
    }

    fn run(policy: &mut TriggerPolicy, scores: &[(f32, f64)]) -> Vec<f64> {
        scores
            .iter()
            .filter_map(|&(p, t)| policy.observe(&score(p, t)))
            .map(|e| e.stream_time)
            .collect()
    }

    #[test]
    fn test_debounce_requires_consecutive_windows() {
        let mut p = policy(3, 0.0);
        let fired = run(
            &mut p,
            &[(0.9, 0.25), (0.9, 0.5), (0.1, 0.75), (0.9, 1.0), (0.9, 1.25), (0.9, 1.5)],
        );
        assert_eq!(fired, vec![1.5]);
    }

    #[test]
    fn test_phase_transitions() {
        let mut p = policy(2, 1.0);
        let scope = ClassScope::hotword();
        assert_eq!(p.phase(&scope), Some(TriggerPhase::Idle));

        p.observe(&score(0.9, 0.25));
        assert_eq!(p.phase(&scope), Some(TriggerPhase::Armed));

        assert!(p.observe(&score(0.9, 0.5)).is_some());
        assert_eq!(p.phase(&scope), Some(TriggerPhase::Cooldown));
        assert_eq!(p.last_fired_at(&scope), Some(0.5));

        p.observe(&score(0.1, 1.0));
        assert_eq!(p.phase(&scope), Some(TriggerPhase::Cooldown));

        p.observe(&score(0.1, 1.5));
        assert_eq!(p.phase(&scope), Some(TriggerPhase::Idle));
    }

    #[test]
    fn test_sustained_confidence_respects_cooldown() {
        let mut p = policy(2, 3.0);
        let scores: Vec<(f32, f64)> = (1..=80).map(|i| (1.0, i as f64 * 0.25)).collect();
        let fired = run(&mut p, &scores);

        assert!(!fired.is_empty());
        for pair in fired.windows(2) {
            assert!(pair[1] - pair[0] >= 3.0, "fired at {:?}", fired);
        }
        assert_eq!(fired, vec![0.5, 3.5, 6.5, 9.5, 12.5, 15.5, 18.5]);
        assert_eq!(p.fire_count(&ClassScope::hotword()), 7);
    }

    #[test]
    fn test_require_release_is_single_shot() {
        let mut rule = TriggerRule::new(ClassScope::hotword());
        rule.cooldown_seconds = 0.5;
        rule.require_release = true;
        let mut p = TriggerPolicy::new([rule]);

        let scores: Vec<(f32, f64)> = (1..=20).map(|i| (1.0, i as f64 * 0.25)).collect();
        assert_eq!(run(&mut p, &scores), vec![0.5]);

        let fired = run(&mut p, &[(0.2, 5.25), (0.9, 5.5), (0.9, 5.75)]);
        assert_eq!(fired, vec![5.75]);
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut p = policy(1, 0.0);
        assert!(run(&mut p, &[(0.5, 0.25), (0.5, 0.5)]).is_empty());
        assert_eq!(run(&mut p, &[(0.51, 0.75)]), vec![0.75]);
    }

    #[test]
    fn test_history_is_bounded_and_independent_of_debounce() {
        let mut rule = TriggerRule::new(ClassScope::hotword());
        rule.history_size = 5;
        let mut p = TriggerPolicy::new([rule]);

        for i in 0..12 {
            p.observe(&score(0.1, i as f64));
        }
        let history = p.history(&ClassScope::hotword());
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].timestamp, 7.0);
        assert_eq!(history[4].timestamp, 11.0);
    }

    #[test]
    fn test_unknown_scope_ignored() {
        let mut p = policy(1, 0.0);
        let mut other = score(1.0, 1.0);
        other.class_scope = ClassScope::new("siren");
        assert!(p.observe(&other).is_none());
        assert!(p.history(&other.class_scope).is_empty());
    }

    #[test]
    fn test_reset_timing_allows_restart_at_zero() {
        let mut p = policy(1, 3.0);
        assert_eq!(run(&mut p, &[(0.9, 5.0)]), vec![5.0]);

        p.reset_timing();
        assert_eq!(run(&mut p, &[(0.9, 0.25)]), vec![0.25]);
    }

    #[test]
    fn test_callbacks_survive_errors_and_panics() {
        let registry = CallbackRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        registry.register(ClassScope::hotword(), |_| Err("consumer offline".into()));
        registry.register(ClassScope::hotword(), |_| panic!("boom"));
        let counter = Arc::clone(&calls);
        registry.register(ClassScope::hotword(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let event = TriggerEvent::from_score(&score(0.9, 1.0));
        let errors = registry.dispatch(&event);

        assert_eq!(errors.len(), 2);
        assert!(matches!(errors[0], CallbackError::Failed { .. }));
        assert!(matches!(errors[1], CallbackError::Panicked { ref message, .. } if message == "boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.failures(), 2);
    }

    #[test]
    fn test_dispatch_only_matching_scope() {
        let registry = CallbackRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        registry.register(ClassScope::new("siren"), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        registry.dispatch(&TriggerEvent::from_score(&score(0.9, 1.0)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.count(&ClassScope::new("siren")), 1);
    }
}
