//! HTTP result bridge using Axum.
//!
//! Test code running inside the target posts lifecycle events to
//! `POST /update` on a loopback port. The bridge counts them and reports when
//! the run should end the session. The listener stops once the run finishes
//! or the bridge is closed, whichever comes first.

use crate::handler::{handle_live, handle_not_found, handle_update};
use crate::run::{RunOutcome, TestEvent, TestRun};
use axum::{
    routing::{get, post},
    Router,
};
use plugdev_core::TestConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Largest accepted event body.
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// How long `close` waits for open connections to finish.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared across handlers.
pub struct BridgeState {
    policy: TestConfig,
    run: Mutex<TestRun>,
    outcome: watch::Sender<Option<RunOutcome>>,
    finished: Notify,
}

impl BridgeState {
    pub fn new(policy: TestConfig) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            policy,
            run: Mutex::new(TestRun::default()),
            outcome,
            finished: Notify::new(),
        }
    }

    /// Count an event and return the aggregate after it.
    pub async fn record(&self, event: &TestEvent) -> TestRun {
        let mut run = self.run.lock().await;
        let was_finished = run.finished;
        if let Some(outcome) = run.record(event, &self.policy) {
            info!("Test run ended: {:?}", outcome);
            self.outcome.send_if_modified(|current| {
                if current.is_none() {
                    *current = Some(outcome);
                    true
                } else {
                    false
                }
            });
        }
        if run.finished && !was_finished {
            self.finished.notify_one();
        }
        run.clone()
    }

    pub async fn snapshot(&self) -> TestRun {
        self.run.lock().await.clone()
    }

    pub fn outcome(&self) -> watch::Receiver<Option<RunOutcome>> {
        self.outcome.subscribe()
    }
}

/// Build the bridge router.
pub fn router(state: Arc<BridgeState>) -> Router {
    // In-target code posts from page and extension origins.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_live).fallback(handle_not_found))
        .route("/update", post(handle_update).fallback(handle_not_found))
        .fallback(handle_not_found)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Running result bridge.
///
/// Closed exactly once, by [`ResultBridge::close`] or on drop.
pub struct ResultBridge {
    addr: SocketAddr,
    state: Arc<BridgeState>,
    outcome: watch::Receiver<Option<RunOutcome>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ResultBridge {
    /// Start the bridge on a free loopback port.
    pub async fn start(policy: TestConfig) -> anyhow::Result<Self> {
        let state = Arc::new(BridgeState::new(policy));
        let app = router(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let finished = Arc::clone(&state);
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    tokio::select! {
                        _ = shutdown_rx => {}
                        _ = finished.finished.notified() => {
                            debug!("Test run finished; result bridge stops listening");
                        }
                    }
                })
                .await;
            if let Err(e) = result {
                error!("Result bridge error: {}", e);
            }
        });

        info!("Result bridge listening on {}", addr);

        Ok(Self {
            addr,
            outcome: state.outcome(),
            state,
            shutdown: Some(shutdown),
            task: Some(task),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Current aggregate.
    pub async fn snapshot(&self) -> TestRun {
        self.state.snapshot().await
    }

    /// Wait until the run decides to end the session.
    pub async fn outcome(&mut self) -> Option<RunOutcome> {
        self.outcome
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|outcome| *outcome)
    }

    /// Stop listening. Further calls do nothing.
    pub async fn close(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };
        let _ = shutdown.send(());

        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
                warn!("Result bridge did not drain in time; aborting");
                task.abort();
            }
        }
        info!("Result bridge closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_none()
    }
}

impl Drop for ResultBridge {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
