//! Retries async post-commit actions with exponential backoff and jitter,
//! without ever blocking the commit that scheduled them.
//!
//! No dependency already in this crate's stack supplies a generic
//! retry/backoff primitive, so this is implemented directly over
//! `tokio::time::sleep` and `rand`, in the same "plain async primitives, no
//! extra crate" spirit used for the in-memory store backends elsewhere in
//! this crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;

use crate::document::ObjectDocument;
use crate::event::Event;

/// Parameters controlling how a post-commit action is retried.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between retries.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
    /// Whether to multiply each delay by a uniform factor in `[0.5, 1.5]`.
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let millis = (self.initial_delay.as_millis() as f64) * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);

        let jittered = if self.use_jitter {
            let jitter = rand::thread_rng().gen_range(0.5..=1.5);
            capped * jitter
        } else {
            capped
        };

        Duration::from_millis(jittered.round() as u64).min(self.max_delay)
    }
}

/// An action scheduled to run after a commit has already been made durable.
/// Failures here never undo or block the commit; they are only reported.
#[async_trait]
pub trait PostCommitAction: Send + Sync {
    /// Caller-facing name of this action, used in [`PostCommitActionResult`].
    fn name(&self) -> &str;

    /// Logical type of this action, e.g. `"projection"`, `"webhook"`.
    fn action_type(&self) -> &str;

    /// Runs the action against the events just committed and the document
    /// they were committed against.
    async fn run(&self, events: &[Event], document: &ObjectDocument) -> Result<(), anyhow::Error>;
}

/// Outcome of running one [`PostCommitAction`] to completion (including
/// retries).
#[derive(Debug, Clone)]
pub enum PostCommitActionResult {
    /// The action eventually succeeded.
    Succeeded {
        /// The action's name.
        name: String,
        /// The action's type.
        action_type: String,
        /// Total wall-clock time across all attempts.
        duration: Duration,
    },
    /// The action exhausted its retries without succeeding.
    Failed {
        /// The action's name.
        name: String,
        /// The action's type.
        action_type: String,
        /// The last error observed.
        error: String,
        /// How many retries were attempted (not counting the first try).
        retry_attempts: u32,
        /// Total wall-clock time across all attempts.
        total_duration: Duration,
    },
}

/// Runs post-commit actions sequentially, in registration order, retrying
/// each with exponential backoff and jitter.
#[derive(Debug, Clone, Copy)]
pub struct PostCommitExecutor {
    policy: RetryPolicy,
}

impl Default for PostCommitExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl PostCommitExecutor {
    /// Builds an executor with the given retry policy.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Runs a single action to completion, retrying per the policy. Never
    /// propagates an error to the caller; failure is encoded in the
    /// returned [`PostCommitActionResult`].
    pub async fn run_with_retry(
        &self,
        action: &(dyn PostCommitAction),
        events: &[Event],
        document: &ObjectDocument,
    ) -> PostCommitActionResult {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            match action.run(events, document).await {
                Ok(()) => {
                    return PostCommitActionResult::Succeeded {
                        name: action.name().to_string(),
                        action_type: action.action_type().to_string(),
                        duration: started.elapsed(),
                    }
                }
                Err(err) => {
                    if attempt >= self.policy.max_retries {
                        return PostCommitActionResult::Failed {
                            name: action.name().to_string(),
                            action_type: action.action_type().to_string(),
                            error: err.to_string(),
                            retry_attempts: attempt,
                            total_duration: started.elapsed(),
                        };
                    }

                    let delay = self.policy.delay_for_attempt(attempt);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Runs every action in `actions` sequentially, in order, so a later
    /// action observes the side effects of an earlier one.
    pub async fn run_all(
        &self,
        actions: &[Arc<dyn PostCommitAction>],
        events: &[Event],
        document: &ObjectDocument,
    ) -> Vec<PostCommitActionResult> {
        let mut results = Vec::with_capacity(actions.len());
        for action in actions {
            results.push(self.run_with_retry(action.as_ref(), events, document).await);
        }
        results
    }

    /// Schedules `actions` to run in a detached background task, so that a
    /// slow or failing action never blocks the commit that produced
    /// `events`, nor any other commit. When `on_complete` is set, the
    /// aggregated results are sent to it once every action has finished.
    pub fn schedule(
        &self,
        actions: Vec<Arc<dyn PostCommitAction>>,
        events: Vec<Event>,
        document: ObjectDocument,
        on_complete: Option<tokio::sync::mpsc::UnboundedSender<Vec<PostCommitActionResult>>>,
    ) {
        let executor = *self;
        tokio::spawn(async move {
            let results = executor.run_all(&actions, &events, &document).await;
            if let Some(sender) = on_complete {
                let _ = sender.send(results);
            }
        });
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::document::StreamInformation;

    struct FlakyAction {
        name: &'static str,
        fail_times: u32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl PostCommitAction for FlakyAction {
        fn name(&self) -> &str {
            self.name
        }

        fn action_type(&self) -> &str {
            "test"
        }

        async fn run(&self, _events: &[Event], _document: &ObjectDocument) -> Result<(), anyhow::Error> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_times {
                anyhow::bail!("simulated failure on attempt {attempt}");
            }
            Ok(())
        }
    }

    fn document() -> ObjectDocument {
        ObjectDocument {
            object_name: "Order".to_string(),
            object_id: "o1".to_string(),
            schema_version: 1,
            hash: String::new(),
            active: StreamInformation::new("s1", "memory"),
            terminated_streams: Vec::new(),
        }
    }

    #[tokio::test]
    async fn succeeds_after_retrying_within_policy() {
        let executor = PostCommitExecutor::new(RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 1.0,
            use_jitter: false,
        });

        let action = FlakyAction {
            name: "retry-me",
            fail_times: 2,
            attempts: AtomicU32::new(0),
        };

        let result = executor.run_with_retry(&action, &[], &document()).await;
        assert!(matches!(result, PostCommitActionResult::Succeeded { .. }));
    }

    #[tokio::test]
    async fn fails_after_exhausting_retries() {
        let executor = PostCommitExecutor::new(RetryPolicy {
            max_retries: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 1.0,
            use_jitter: false,
        });

        let action = FlakyAction {
            name: "always-fails",
            fail_times: 100,
            attempts: AtomicU32::new(0),
        };

        let result = executor.run_with_retry(&action, &[], &document()).await;
        match result {
            PostCommitActionResult::Failed { retry_attempts, .. } => assert_eq!(retry_attempts, 1),
            _ => panic!("expected Failed"),
        }
    }

    #[tokio::test]
    async fn run_all_preserves_registration_order() {
        use std::sync::Mutex;

        let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));

        struct Logger {
            name: &'static str,
            log: Arc<Mutex<Vec<&'static str>>>,
        }

        #[async_trait]
        impl PostCommitAction for Logger {
            fn name(&self) -> &str {
                self.name
            }
            fn action_type(&self) -> &str {
                "logger"
            }
            async fn run(&self, _events: &[Event], _document: &ObjectDocument) -> Result<(), anyhow::Error> {
                self.log.lock().unwrap().push(self.name);
                Ok(())
            }
        }

        let actions: Vec<Arc<dyn PostCommitAction>> = vec![
            Arc::new(Logger { name: "a", log: log.clone() }),
            Arc::new(Logger { name: "b", log: log.clone() }),
        ];

        let executor = PostCommitExecutor::default();
        executor.run_all(&actions, &[], &document()).await;

        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }
}
