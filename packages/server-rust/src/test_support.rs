//! Shared test helpers: log capture and a scripted identity resolver.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{Layer, Registry};

use crate::service::auth::{AuthFailure, AuthResolver};
use crate::service::context::Principal;

// ---------------------------------------------------------------------------
// Log capture
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub message: String,
    fields: HashMap<String, String>,
}

impl CapturedEvent {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: HashMap<String, String>,
}

impl FieldVisitor {
    fn put(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, format!("{value:?}"));
    }
}

struct CaptureLayer {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        self.events.lock().push(CapturedEvent {
            level: *event.metadata().level(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

/// Captures every event on the current thread until the guard drops.
/// Pair with `#[tokio::test]` (current-thread runtime).
pub fn capture_events() -> (Arc<Mutex<Vec<CapturedEvent>>>, DefaultGuard) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let subscriber = Registry::default().with(CaptureLayer {
        events: Arc::clone(&events),
    });
    let guard = tracing::subscriber::set_default(subscriber);
    (events, guard)
}

// ---------------------------------------------------------------------------
// StubResolver
// ---------------------------------------------------------------------------

/// Resolver with a fixed answer that counts how often it was consulted.
pub struct StubResolver {
    outcome: Result<Principal, AuthFailure>,
    calls: AtomicUsize,
}

impl StubResolver {
    pub fn accepting(id: &str) -> Self {
        Self {
            outcome: Ok(Principal {
                id: id.to_string(),
                username: format!("user{id}"),
                email: format!("user{id}@example.com"),
            }),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(failure: AuthFailure) -> Self {
        Self {
            outcome: Err(failure),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthResolver for StubResolver {
    async fn resolve(&self, _credential: &str) -> Result<Principal, AuthFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}
