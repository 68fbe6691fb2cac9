use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::{AbortHandle, AbortRegistration, Abortable};
use http::HeaderValue;
use http::header::ACCEPT;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{Instrument, debug, info_span, warn};

use crate::ReqflowResult;
use crate::descriptor::{CachePolicy, Credential, Environment, Method, RequestDescriptor};
use crate::error::Error;
use crate::headers::HeaderSet;
use crate::mock::{MockRegistry, MockRequest};
use crate::processor::{Chain, HttpResponse, ParseRequest};
use crate::retry::{RetryBehavior, RetryContext, RetryOutcome, RetryVerdict};
use crate::state::{TaskState, TaskStateBox};
use crate::transport::{
    HyperTransport, PreparedRequest, Transport, TransportResponse, mime_from_headers,
};

/// Session-wide values seeded into every descriptor the manager creates.
#[derive(Clone, Default)]
struct SessionDefaults {
    headers: HeaderSet,
    credential: Option<Credential>,
    timeout: Option<Duration>,
    cache_policy: Option<CachePolicy>,
    retry_behavior: Option<RetryBehavior>,
}

type ActivityObserver = Arc<dyn Fn(usize) + Send + Sync>;

struct ManagerInner {
    environment: RwLock<Environment>,
    defaults: RwLock<SessionDefaults>,
    transport: Arc<dyn Transport>,
    mocks: MockRegistry,
    network_activity: AtomicUsize,
    activity_observer: Option<ActivityObserver>,
}

impl ManagerInner {
    fn activity_begin(&self) {
        let count = self.network_activity.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(observer) = &self.activity_observer {
            observer(count);
        }
    }

    fn activity_end(&self) {
        let count = self
            .network_activity
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1);
        if let Some(observer) = &self.activity_observer {
            observer(count);
        }
    }
}

/// Entry point for issuing requests: owns the environment, the transport,
/// session defaults, and the mock registry. Cheap to clone; clones share
/// state.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

pub struct ManagerBuilder {
    environment: Environment,
    transport: Option<Arc<dyn Transport>>,
    defaults: SessionDefaults,
    activity_observer: Option<ActivityObserver>,
}

impl ManagerBuilder {
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn default_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.defaults.headers.set(name, value);
        self
    }

    pub fn default_credential(mut self, credential: Credential) -> Self {
        self.defaults.credential = Some(credential);
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.defaults.timeout = Some(timeout);
        self
    }

    pub fn default_cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.defaults.cache_policy = Some(cache_policy);
        self
    }

    pub fn default_retry_behavior(mut self, behavior: RetryBehavior) -> Self {
        self.defaults.retry_behavior = Some(behavior);
        self
    }

    /// Observer invoked with the in-flight task count whenever it changes.
    /// Useful for driving an activity indicator.
    pub fn activity_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.activity_observer = Some(Arc::new(observer));
        self
    }

    /// Builds the manager, constructing the stock TLS transport when none
    /// was supplied.
    pub fn try_build(self) -> ReqflowResult<Manager> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::try_new()?),
        };
        Ok(Manager {
            inner: Arc::new(ManagerInner {
                environment: RwLock::new(self.environment),
                defaults: RwLock::new(self.defaults),
                transport,
                mocks: MockRegistry::default(),
                network_activity: AtomicUsize::new(0),
                activity_observer: self.activity_observer,
            }),
        })
    }
}

impl Manager {
    pub fn builder(environment: Environment) -> ManagerBuilder {
        ManagerBuilder {
            environment,
            transport: None,
            defaults: SessionDefaults::default(),
            activity_observer: None,
        }
    }

    pub fn environment(&self) -> Environment {
        read_unpoisoned(&self.inner.environment).clone()
    }

    /// Swaps the environment. Already-spawned tasks keep the environment
    /// they were resolved against.
    pub fn set_environment(&self, environment: Environment) {
        *write_unpoisoned(&self.inner.environment) = environment;
    }

    pub fn set_default_header(&self, name: &str, value: impl Into<String>) {
        write_unpoisoned(&self.inner.defaults).headers.set(name, value);
    }

    pub fn set_default_credential(&self, credential: Option<Credential>) {
        write_unpoisoned(&self.inner.defaults).credential = credential;
    }

    pub fn set_default_timeout(&self, timeout: Option<Duration>) {
        write_unpoisoned(&self.inner.defaults).timeout = timeout;
    }

    pub fn set_default_cache_policy(&self, cache_policy: Option<CachePolicy>) {
        write_unpoisoned(&self.inner.defaults).cache_policy = cache_policy;
    }

    pub fn set_default_retry_behavior(&self, behavior: Option<RetryBehavior>) {
        write_unpoisoned(&self.inner.defaults).retry_behavior = behavior;
    }

    pub fn mocks(&self) -> &MockRegistry {
        &self.inner.mocks
    }

    /// Number of tasks currently between dispatch and result delivery.
    pub fn network_activity_count(&self) -> usize {
        self.inner.network_activity.load(Ordering::Acquire)
    }

    /// Creates a descriptor seeded with the session defaults. Later changes
    /// to the defaults do not affect descriptors already created.
    pub fn request(&self, method: Method, path: impl Into<String>) -> RequestDescriptor {
        let defaults = read_unpoisoned(&self.inner.defaults);
        let mut descriptor = RequestDescriptor::new(method, path);
        descriptor.headers = defaults.headers.clone();
        descriptor.credential = defaults.credential.clone();
        descriptor.timeout = defaults.timeout;
        descriptor.cache_policy = defaults.cache_policy;
        descriptor.retry_behavior = defaults.retry_behavior.clone();
        descriptor
    }

    pub fn get(&self, path: impl Into<String>) -> RequestDescriptor {
        self.request(Method::Get, path)
    }

    pub fn post(&self, path: impl Into<String>) -> RequestDescriptor {
        self.request(Method::Post, path)
    }

    pub fn put(&self, path: impl Into<String>) -> RequestDescriptor {
        self.request(Method::Put, path)
    }

    pub fn patch(&self, path: impl Into<String>) -> RequestDescriptor {
        self.request(Method::Patch, path)
    }

    pub fn delete(&self, path: impl Into<String>) -> RequestDescriptor {
        self.request(Method::Delete, path)
    }

    /// Resolves the URL, spawns the task, and hands back its handle. URL
    /// composition failures surface here, before anything is spawned.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn<T>(
        &self,
        descriptor: RequestDescriptor,
        chain: Chain<T>,
    ) -> ReqflowResult<Task<T>>
    where
        T: Send + 'static,
    {
        let environment = self.environment();
        let mut prepared = descriptor.prepare_for_transport(&environment)?;
        if !prepared.headers.contains_key(ACCEPT)
            && let Some(accept) = chain.accept_header_value()
            && let Ok(value) = HeaderValue::from_str(&accept)
        {
            prepared.headers.insert(ACCEPT, value);
        }

        let (handle, registration) = AbortHandle::new_pair();
        let state = Arc::new(TaskStateBox::new(handle));
        let (sender, receiver) = oneshot::channel();

        self.inner.activity_begin();
        state.set_tracking_network_activity();

        tokio::spawn(run_task(
            Arc::clone(&self.inner),
            environment,
            descriptor,
            chain,
            prepared,
            Arc::clone(&state),
            sender,
            registration,
        ));

        Ok(Task { state, receiver })
    }
}

/// Terminal outcome of a task, delivered exactly once.
#[derive(Debug)]
pub enum TaskResult<T> {
    /// Validation and decoding succeeded.
    Success(HttpResponse, T),
    /// The exchange, validation, or decoding failed. The response is
    /// present when one was received before the failure.
    Error(Option<HttpResponse>, Error),
    /// The task was canceled before a result was committed.
    Canceled,
}

impl<T> TaskResult<T> {
    pub fn success(self) -> Option<(HttpResponse, T)> {
        match self {
            Self::Success(response, value) => Some((response, value)),
            _ => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// Handle to an in-flight request. Dropping the handle does not cancel the
/// task; call [`cancel`](Self::cancel) for that.
pub struct Task<T> {
    state: Arc<TaskStateBox>,
    receiver: oneshot::Receiver<TaskResult<T>>,
}

impl<T> Task<T> {
    pub fn state(&self) -> TaskState {
        self.state.state()
    }

    /// Requests cancellation. Returns true when this call moved the task
    /// into the canceled state; false when the task had already reached a
    /// terminal state or was canceled earlier. Cancellation is advisory
    /// once processing has begun: a result already being committed wins.
    pub fn cancel(&self) -> bool {
        self.state.cancel()
    }

    /// Waits for the task's result. Consumes the handle; a result is
    /// observed at most once.
    pub async fn join(self) -> TaskResult<T> {
        self.receiver.await.unwrap_or(TaskResult::Canceled)
    }
}

impl RequestDescriptor {
    /// Dispatches the request without response validation beyond the
    /// network-level status check, yielding the raw body.
    pub fn send(self, manager: &Manager) -> ReqflowResult<Task<Bytes>> {
        manager.spawn(self, Chain::network())
    }
}

impl<T: Send + 'static> ParseRequest<T> {
    /// Dispatches the request; the decode handler runs after validation.
    pub fn send(self, manager: &Manager) -> ReqflowResult<Task<T>> {
        manager.spawn(self.descriptor, self.chain)
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_task<T>(
    inner: Arc<ManagerInner>,
    environment: Environment,
    descriptor: RequestDescriptor,
    chain: Chain<T>,
    prepared: PreparedRequest,
    state: Arc<TaskStateBox>,
    sender: oneshot::Sender<TaskResult<T>>,
    mut registration: AbortRegistration,
) where
    T: Send + 'static,
{
    let mut attempt: u32 = 0;
    let result = loop {
        let span = info_span!(
            "request",
            method = %prepared.method,
            url = %prepared.url,
            attempt,
        );
        let outcome = Abortable::new(
            perform_attempt(&inner, &environment, &descriptor, prepared.clone()),
            registration,
        )
        .instrument(span)
        .await;

        let attempt_result = match outcome {
            Err(_aborted) => break TaskResult::Canceled,
            Ok(result) => result,
        };

        // The exchange is over; from here on the box either reaches
        // Completed or a concurrent cancel wins.
        if !state.transition(TaskState::Processing).reached {
            break TaskResult::Canceled;
        }

        let failure = match attempt_result {
            Ok(transport_response) => {
                let response = HttpResponse::from_transport(&transport_response);
                match chain.validate(
                    descriptor.credential.as_ref(),
                    &response,
                    &transport_response.body,
                ) {
                    Ok(()) => {
                        if state.state() == TaskState::Canceled {
                            break TaskResult::Canceled;
                        }
                        match (chain.finish)(&response, &transport_response.body) {
                            Ok(value) => {
                                if state.transition(TaskState::Completed).reached {
                                    break TaskResult::Success(response, value);
                                }
                                break TaskResult::Canceled;
                            }
                            // Decode failures are final; the exchange
                            // itself succeeded.
                            Err(error) => break commit_error(&state, Some(response), error),
                        }
                    }
                    Err(error) => (Some(response), error),
                }
            }
            Err(error) => (None, error),
        };

        let (response, error) = failure;
        if let Some(outcome) = retry_outcome_for(&error)
            && let Some(behavior) = &descriptor.retry_behavior
        {
            let context = RetryContext {
                attempt,
                is_idempotent: descriptor.is_idempotent,
                outcome,
            };
            if let RetryVerdict::Retry { delay } = behavior.evaluate(&context) {
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying request",
                );
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                let (handle, next_registration) = AbortHandle::new_pair();
                if !state.reset_to_running(handle) {
                    break TaskResult::Canceled;
                }
                registration = next_registration;
                attempt += 1;
                continue;
            }
        }
        break commit_error(&state, response, error);
    };

    if state.clear_tracking_network_activity() {
        inner.activity_end();
    }
    // The receiver may have been dropped; the result is discarded then.
    let _ = sender.send(result);
}

fn commit_error<T>(
    state: &TaskStateBox,
    response: Option<HttpResponse>,
    error: Error,
) -> TaskResult<T> {
    if state.transition(TaskState::Completed).reached {
        TaskResult::Error(response, error)
    } else {
        TaskResult::Canceled
    }
}

fn retry_outcome_for(error: &Error) -> Option<RetryOutcome> {
    match error {
        Error::Transport { kind, .. } => Some(RetryOutcome::NetworkFailure { kind: *kind }),
        Error::FailedResponse { status, .. } => {
            Some(RetryOutcome::FailedStatus { status: *status })
        }
        _ => None,
    }
}

/// One exchange: materialize the body, then serve from a mock when one
/// matches, otherwise hit the transport.
async fn perform_attempt(
    inner: &ManagerInner,
    environment: &Environment,
    descriptor: &RequestDescriptor,
    mut prepared: PreparedRequest,
) -> Result<TransportResponse, Error> {
    prepared.body = descriptor.body.materialize(&descriptor.params).await?;

    let mock = descriptor
        .mock
        .as_ref()
        .map(|handler| (Arc::clone(handler), BTreeMap::new()))
        .or_else(|| inner.mocks.resolve(&prepared, environment));
    if let Some((handler, path_parameters)) = mock {
        debug!(url = %prepared.url, "serving mocked response");
        let request = MockRequest {
            method: prepared.method.clone(),
            url: prepared.url.clone(),
            headers: prepared.headers.clone(),
            body: prepared.body.clone(),
            path_parameters,
        };
        let response = handler(request).await;
        let mime_type = mime_from_headers(&response.headers);
        return Ok(TransportResponse {
            status: response.status,
            headers: response.headers,
            body: response.body,
            mime_type,
            url: prepared.url,
        });
    }

    inner
        .transport
        .perform(prepared)
        .await
        .map_err(Error::from)
}

fn read_unpoisoned<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_unpoisoned<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
