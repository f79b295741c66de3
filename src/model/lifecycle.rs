//! # Model Lifecycle Manager
//!
//! Owns the single shared recognizer instance and every rule about when it
//! may be created, used, and released.
//!
//! ## Key Responsibilities:
//! - **Lazy loading**: the model is only materialized when a client asks
//! - **Single-flight**: concurrent load requests collapse into one load
//! - **Guarded unloading**: release is a no-op unless the model is resident
//! - **Idle tracking**: every use stamps `last_used` so the idle monitor can
//!   evict a model nobody is talking to
//! - **Status fan-out**: every state transition is broadcast to all sessions
//!
//! ## Concurrency discipline:
//! `state`, the recognizer handle, and `last_used` live together under one
//! `RwLock` and every transition takes the write lock, so the state machine
//! can never be observed mid-transition. The slow operations (loading,
//! transcribing) happen with the lock released; a transcription clones the
//! `Arc` handle first, which keeps the model alive for that call even if an
//! unload commits while it is running.

use crate::model::recognizer::{Recognizer, RecognizerLoader};
use crate::session::protocol::WebSocketMessage;
use crate::session::registry::SessionRegistry;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info};

/// Residency state of the shared model.
///
/// ## State Transitions:
/// ```text
/// Unloaded --request_load--> Loading
/// Loading  --load success--> Loaded
/// Loading  --load failure--> Unloaded
/// Loaded   --request_unload | idle timeout--> Unloaded
/// ```
/// There is no other path; in particular the model can never jump straight
/// from `Unloaded` to `Loaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Unloaded,
    Loading,
    Loaded,
}

impl ModelState {
    /// Wire representation used in `status` messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelState::Unloaded => "unloaded",
            ModelState::Loading => "loading",
            ModelState::Loaded => "loaded",
        }
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time view of the model resource, derived on demand and never
/// cached.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub state: ModelState,
    /// Seconds until idle eviction. None unless the model is loaded.
    pub idle_remaining: Option<f64>,
}

impl StatusSnapshot {
    pub fn to_message(&self) -> WebSocketMessage {
        WebSocketMessage::Status {
            model_state: self.state.as_str().to_string(),
            idle_remaining: self.idle_remaining,
        }
    }
}

/// What a `request_load` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// This call performed the load and the model is now resident.
    Loaded,
    /// A load was already in flight or the model was already resident, so
    /// the request was ignored.
    Ignored,
}

/// What a `request_unload` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadOutcome {
    /// The model was resident and has been released.
    Unloaded,
    /// Nothing was loaded; the caller asked for an impossible release.
    NotLoaded,
    /// A load is in flight; the request is ignored rather than racing it.
    LoadInProgress,
}

/// Errors surfaced to the session that issued the failing request. These are
/// never broadcast; other sessions only observe the resulting state change.
#[derive(Debug)]
pub enum LifecycleError {
    /// Recognizer construction failed; the state reverted to unloaded.
    LoadFailed(String),
    /// Audio arrived while no model was resident.
    ModelNotLoaded,
    /// The recognizer accepted the audio but could not produce text.
    Recognition(String),
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::LoadFailed(msg) => write!(f, "Load failed: {}", msg),
            LifecycleError::ModelNotLoaded => write!(f, "Model not loaded"),
            LifecycleError::Recognition(msg) => write!(f, "Transcription failed: {}", msg),
        }
    }
}

impl std::error::Error for LifecycleError {}

/// The one shared mutable unit: residency state, the handle, and the idle
/// clock. Guarded as a whole so the invariant "handle present iff loaded"
/// holds at every observable instant.
struct ModelSlot {
    state: ModelState,
    recognizer: Option<Arc<dyn Recognizer>>,
    last_used: Instant,
}

/// Manager for the single expensive recognizer resource.
///
/// Constructed once at startup and shared by every session handler, the REST
/// handlers, and the idle monitor. There are no other owners of model state
/// anywhere in the process.
pub struct ModelLifecycle {
    slot: RwLock<ModelSlot>,
    loader: Arc<dyn RecognizerLoader>,
    registry: Arc<SessionRegistry>,
    idle_timeout: Duration,
}

impl ModelLifecycle {
    pub fn new(
        loader: Arc<dyn RecognizerLoader>,
        registry: Arc<SessionRegistry>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            slot: RwLock::new(ModelSlot {
                state: ModelState::Unloaded,
                recognizer: None,
                last_used: Instant::now(),
            }),
            loader,
            registry,
            idle_timeout,
        }
    }

    /// Request that the model be loaded.
    ///
    /// If the model is unloaded this transitions to `Loading`, broadcasts,
    /// performs the load with the lock released, then commits the terminal
    /// state and broadcasts again. If a load is already in flight or the
    /// model is already resident, the call is an idempotent no-op: at most
    /// one load can be executing process-wide.
    ///
    /// A failure is returned to the caller for a session-local error reply;
    /// the broadcast only carries the resulting `unloaded` state.
    pub async fn request_load(&self) -> Result<LoadOutcome, LifecycleError> {
        {
            let mut slot = self.slot.write().await;
            match slot.state {
                ModelState::Loading | ModelState::Loaded => return Ok(LoadOutcome::Ignored),
                ModelState::Unloaded => slot.state = ModelState::Loading,
            }
        }
        self.broadcast_status().await;

        info!("Loading recognizer model");
        let started = Instant::now();

        match self.loader.load().await {
            Ok(recognizer) => {
                {
                    let mut slot = self.slot.write().await;
                    slot.state = ModelState::Loaded;
                    slot.recognizer = Some(recognizer);
                    slot.last_used = Instant::now();
                }
                info!(
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "Recognizer model loaded"
                );
                self.broadcast_status().await;
                Ok(LoadOutcome::Loaded)
            }
            Err(err) => {
                {
                    let mut slot = self.slot.write().await;
                    slot.state = ModelState::Unloaded;
                    slot.recognizer = None;
                }
                error!(error = %err, "Recognizer model load failed");
                self.broadcast_status().await;
                Err(LifecycleError::LoadFailed(err.to_string()))
            }
        }
    }

    /// Request that the model be released.
    ///
    /// Only a resident model is released. A load in flight is left alone,
    /// and an already-unloaded model is reported back to the caller. An
    /// in-flight transcription that captured the handle before this commit
    /// finishes normally; the memory is returned once that last clone of the
    /// handle drops.
    pub async fn request_unload(&self) -> UnloadOutcome {
        let outcome = {
            let mut slot = self.slot.write().await;
            match slot.state {
                ModelState::Loaded => {
                    slot.recognizer = None;
                    slot.state = ModelState::Unloaded;
                    UnloadOutcome::Unloaded
                }
                ModelState::Loading => UnloadOutcome::LoadInProgress,
                ModelState::Unloaded => UnloadOutcome::NotLoaded,
            }
        };

        if outcome == UnloadOutcome::Unloaded {
            info!("Recognizer model unloaded");
            self.broadcast_status().await;
        }
        outcome
    }

    /// Transcribe an audio clip with the resident model.
    ///
    /// Fails immediately when no model is resident. Otherwise the handle is
    /// captured and `last_used` is stamped under the same lock acquisition,
    /// so the idle countdown restarts at request start and an eviction
    /// racing this call can never observe a stale clock. The recognizer runs
    /// with the lock released; concurrent calls from different sessions are
    /// allowed.
    ///
    /// A completed call broadcasts the refreshed status whether or not the
    /// recognizer succeeded, because the idle clock moved either way.
    pub async fn transcribe(&self, samples: &[f32]) -> Result<String, LifecycleError> {
        let recognizer = {
            let mut slot = self.slot.write().await;
            match slot.recognizer.clone() {
                Some(recognizer) if slot.state == ModelState::Loaded => {
                    slot.last_used = Instant::now();
                    recognizer
                }
                _ => return Err(LifecycleError::ModelNotLoaded),
            }
        };

        let result = recognizer
            .transcribe(samples)
            .await
            .map_err(|err| LifecycleError::Recognition(err.to_string()));

        self.broadcast_status().await;
        result
    }

    /// Release the model if it has been unused for longer than the idle
    /// timeout. Returns whether an eviction happened.
    ///
    /// The elapsed-idle check and the release happen under one write lock
    /// acquisition, so a transcription that stamped `last_used` a moment
    /// earlier reliably cancels the eviction.
    pub async fn evict_if_idle(&self) -> bool {
        let evicted = {
            let mut slot = self.slot.write().await;
            if slot.state == ModelState::Loaded && slot.last_used.elapsed() >= self.idle_timeout {
                slot.recognizer = None;
                slot.state = ModelState::Unloaded;
                true
            } else {
                false
            }
        };

        if evicted {
            info!(
                idle_timeout_secs = self.idle_timeout.as_secs(),
                "Recognizer model evicted after idle timeout"
            );
            self.broadcast_status().await;
        }
        evicted
    }

    /// Current derived view of the resource. Pure read.
    pub async fn status_snapshot(&self) -> StatusSnapshot {
        let slot = self.slot.read().await;
        let idle_remaining = match slot.state {
            ModelState::Loaded => Some(
                self.idle_timeout
                    .saturating_sub(slot.last_used.elapsed())
                    .as_secs_f64(),
            ),
            _ => None,
        };
        StatusSnapshot {
            state: slot.state,
            idle_remaining,
        }
    }

    /// Whether a transcription would be accepted right now.
    pub async fn is_loaded(&self) -> bool {
        self.slot.read().await.state == ModelState::Loaded
    }

    /// Push the current status to every connected session.
    async fn broadcast_status(&self) {
        let snapshot = self.status_snapshot().await;
        self.registry.broadcast(snapshot.to_message());
    }

    #[cfg(test)]
    async fn invariant_holds(&self) -> bool {
        let slot = self.slot.read().await;
        (slot.state == ModelState::Loaded) == slot.recognizer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubRecognizer {
        delay: Duration,
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Recognizer for StubRecognizer {
        async fn transcribe(&self, _samples: &[f32]) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err(anyhow!("decoder rejected the audio"))
            } else {
                Ok("stub transcript".to_string())
            }
        }
    }

    struct StubLoader {
        load_delay: Duration,
        fail_load: bool,
        transcribe_delay: Duration,
        fail_transcribe: bool,
        load_calls: Arc<AtomicUsize>,
        transcribe_calls: Arc<AtomicUsize>,
    }

    impl StubLoader {
        fn quick() -> Self {
            Self {
                load_delay: Duration::from_millis(10),
                fail_load: false,
                transcribe_delay: Duration::ZERO,
                fail_transcribe: false,
                load_calls: Arc::new(AtomicUsize::new(0)),
                transcribe_calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl RecognizerLoader for StubLoader {
        async fn load(&self) -> anyhow::Result<Arc<dyn Recognizer>> {
            self.load_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.load_delay).await;
            if self.fail_load {
                return Err(anyhow!("model files are corrupt"));
            }
            Ok(Arc::new(StubRecognizer {
                delay: self.transcribe_delay,
                fail: self.fail_transcribe,
                calls: Arc::clone(&self.transcribe_calls),
            }))
        }
    }

    fn manager_with(loader: StubLoader, idle_timeout: Duration) -> Arc<ModelLifecycle> {
        Arc::new(ModelLifecycle::new(
            Arc::new(loader),
            Arc::new(SessionRegistry::new()),
            idle_timeout,
        ))
    }

    #[tokio::test]
    async fn test_concurrent_loads_collapse_into_one() {
        let loader = StubLoader {
            load_delay: Duration::from_millis(50),
            ..StubLoader::quick()
        };
        let load_calls = Arc::clone(&loader.load_calls);
        let manager = manager_with(loader, Duration::from_secs(300));

        let (a, b, c, d) = tokio::join!(
            manager.request_load(),
            manager.request_load(),
            manager.request_load(),
            manager.request_load(),
        );

        let outcomes = [a.unwrap(), b.unwrap(), c.unwrap(), d.unwrap()];
        let loaded = outcomes
            .iter()
            .filter(|o| **o == LoadOutcome::Loaded)
            .count();
        assert_eq!(loaded, 1, "exactly one caller performs the load");
        assert_eq!(load_calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status_snapshot().await.state, ModelState::Loaded);
        assert!(manager.invariant_holds().await);
    }

    #[tokio::test]
    async fn test_load_after_loaded_is_ignored() {
        let loader = StubLoader::quick();
        let load_calls = Arc::clone(&loader.load_calls);
        let manager = manager_with(loader, Duration::from_secs(300));

        assert_eq!(manager.request_load().await.unwrap(), LoadOutcome::Loaded);
        assert_eq!(manager.request_load().await.unwrap(), LoadOutcome::Ignored);
        assert_eq!(load_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_load_failure_reverts_to_unloaded() {
        let loader = StubLoader {
            fail_load: true,
            ..StubLoader::quick()
        };
        let manager = manager_with(loader, Duration::from_secs(300));

        let err = manager.request_load().await.unwrap_err();
        assert!(matches!(err, LifecycleError::LoadFailed(_)));
        assert_eq!(manager.status_snapshot().await.state, ModelState::Unloaded);
        assert!(manager.invariant_holds().await);
    }

    #[tokio::test]
    async fn test_transcribe_without_model_fails_fast() {
        let loader = StubLoader::quick();
        let transcribe_calls = Arc::clone(&loader.transcribe_calls);
        let manager = manager_with(loader, Duration::from_secs(300));

        let err = manager.transcribe(&[0.0; 160]).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ModelNotLoaded));
        assert_eq!(transcribe_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transcribe_returns_text_and_restarts_idle_clock() {
        let manager = manager_with(StubLoader::quick(), Duration::from_secs(300));
        manager.request_load().await.unwrap();

        let text = manager.transcribe(&[0.0; 160]).await.unwrap();
        assert_eq!(text, "stub transcript");

        let snapshot = manager.status_snapshot().await;
        assert_eq!(snapshot.state, ModelState::Loaded);
        let remaining = snapshot.idle_remaining.unwrap();
        assert!(remaining > 299.0 && remaining <= 300.0);
    }

    #[tokio::test]
    async fn test_recognition_failure_keeps_model_loaded() {
        let loader = StubLoader {
            fail_transcribe: true,
            ..StubLoader::quick()
        };
        let manager = manager_with(loader, Duration::from_secs(300));
        manager.request_load().await.unwrap();

        let err = manager.transcribe(&[0.0; 160]).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Recognition(_)));
        assert_eq!(manager.status_snapshot().await.state, ModelState::Loaded);
    }

    #[tokio::test]
    async fn test_unload_outcomes_by_state() {
        let loader = StubLoader {
            load_delay: Duration::from_millis(80),
            ..StubLoader::quick()
        };
        let manager = manager_with(loader, Duration::from_secs(300));

        // Nothing resident yet
        assert_eq!(manager.request_unload().await, UnloadOutcome::NotLoaded);

        // Mid-load the request is ignored rather than racing the loader
        let background = Arc::clone(&manager);
        let load_task = tokio::spawn(async move { background.request_load().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.status_snapshot().await.state, ModelState::Loading);
        assert_eq!(manager.request_unload().await, UnloadOutcome::LoadInProgress);

        load_task.await.unwrap().unwrap();
        assert_eq!(manager.status_snapshot().await.state, ModelState::Loaded);

        // Resident model releases cleanly
        assert_eq!(manager.request_unload().await, UnloadOutcome::Unloaded);
        assert_eq!(manager.status_snapshot().await.state, ModelState::Unloaded);
        assert!(manager.invariant_holds().await);
    }

    #[tokio::test]
    async fn test_idle_eviction_after_timeout() {
        let manager = manager_with(StubLoader::quick(), Duration::from_millis(100));
        manager.request_load().await.unwrap();

        // Not idle long enough yet
        assert!(!manager.evict_if_idle().await);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(manager.evict_if_idle().await);
        assert_eq!(manager.status_snapshot().await.state, ModelState::Unloaded);
        assert!(manager.invariant_holds().await);
    }

    #[tokio::test]
    async fn test_recent_use_cancels_eviction() {
        let manager = manager_with(StubLoader::quick(), Duration::from_millis(150));
        manager.request_load().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.transcribe(&[0.0; 160]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // 200ms since load but only 100ms since last use
        assert!(!manager.evict_if_idle().await);
        assert_eq!(manager.status_snapshot().await.state, ModelState::Loaded);
    }

    #[tokio::test]
    async fn test_unload_never_interrupts_a_running_transcription() {
        let loader = StubLoader {
            transcribe_delay: Duration::from_millis(100),
            ..StubLoader::quick()
        };
        let manager = manager_with(loader, Duration::from_secs(300));
        manager.request_load().await.unwrap();

        let background = Arc::clone(&manager);
        let transcribe_task =
            tokio::spawn(async move { background.transcribe(&[0.0; 160]).await });

        // Let the transcription capture the handle, then pull the model out
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.request_unload().await, UnloadOutcome::Unloaded);

        // The in-flight call still completes with a result
        let text = transcribe_task.await.unwrap().unwrap();
        assert_eq!(text, "stub transcript");
        assert_eq!(manager.status_snapshot().await.state, ModelState::Unloaded);
    }

    #[tokio::test]
    async fn test_snapshot_reports_no_countdown_unless_loaded() {
        let manager = manager_with(StubLoader::quick(), Duration::from_secs(300));
        let snapshot = manager.status_snapshot().await;
        assert_eq!(snapshot.state, ModelState::Unloaded);
        assert!(snapshot.idle_remaining.is_none());
    }

    mod broadcast {
        use super::*;
        use crate::session::registry::Outbound;
        use actix::prelude::*;
        use std::sync::Mutex;

        /// Records the model_state of every status message it receives.
        struct StatusCollector {
            states: Arc<Mutex<Vec<String>>>,
        }

        impl Actor for StatusCollector {
            type Context = Context<Self>;
        }

        impl Handler<Outbound> for StatusCollector {
            type Result = ();

            fn handle(&mut self, msg: Outbound, _ctx: &mut Self::Context) {
                if let WebSocketMessage::Status { model_state, .. } = msg.0 {
                    self.states.lock().unwrap().push(model_state);
                }
            }
        }

        fn register_collector(registry: &SessionRegistry, id: &str) -> Arc<Mutex<Vec<String>>> {
            let states = Arc::new(Mutex::new(Vec::new()));
            let addr = StatusCollector {
                states: Arc::clone(&states),
            }
            .start();
            registry.register(id, addr.recipient());
            states
        }

        #[actix_web::test]
        async fn test_every_session_observes_load_transitions() {
            let registry = Arc::new(SessionRegistry::new());
            let manager = ModelLifecycle::new(
                Arc::new(StubLoader::quick()),
                Arc::clone(&registry),
                Duration::from_secs(300),
            );
            let states_a = register_collector(&registry, "a");
            let states_b = register_collector(&registry, "b");

            manager.request_load().await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;

            assert_eq!(*states_a.lock().unwrap(), vec!["loading", "loaded"]);
            assert_eq!(*states_b.lock().unwrap(), vec!["loading", "loaded"]);
        }

        #[actix_web::test]
        async fn test_load_failure_broadcasts_the_reverted_state() {
            let registry = Arc::new(SessionRegistry::new());
            let manager = ModelLifecycle::new(
                Arc::new(StubLoader {
                    fail_load: true,
                    ..StubLoader::quick()
                }),
                Arc::clone(&registry),
                Duration::from_secs(300),
            );
            let states = register_collector(&registry, "a");

            assert!(manager.request_load().await.is_err());
            tokio::time::sleep(Duration::from_millis(50)).await;

            // The failure itself is not broadcast, only the state it left
            // behind
            assert_eq!(*states.lock().unwrap(), vec!["loading", "unloaded"]);
        }

        #[actix_web::test]
        async fn test_unload_broadcasts_once_per_session() {
            let registry = Arc::new(SessionRegistry::new());
            let manager = ModelLifecycle::new(
                Arc::new(StubLoader::quick()),
                Arc::clone(&registry),
                Duration::from_secs(300),
            );
            manager.request_load().await.unwrap();

            let states = register_collector(&registry, "late-joiner");
            manager.request_unload().await;
            tokio::time::sleep(Duration::from_millis(50)).await;

            assert_eq!(*states.lock().unwrap(), vec!["unloaded"]);
        }
    }
}
