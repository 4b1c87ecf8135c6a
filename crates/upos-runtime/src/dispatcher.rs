//! Request queue of one physical device.
//!
//! Requests of every handle opened on the device share one FIFO queue that a
//! single worker task drains, so at most one non-concurrent request body
//! runs at a time. Requests of operations declared concurrent run on their
//! own task instead.
//!
//! When an asynchronous request fails, it and the remaining asynchronous
//! requests of the same handle are parked until the application answers the
//! error event: `Retry` puts them back at the head of the queue, `Clear`
//! drops them.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use upos_core::{ControlState, DeviceError, ErrorLocus, Result, WaitTimeout};

use crate::driver::DeviceDriver;
use crate::event::ErrorEvent;
use crate::properties::{PropertySet, SessionId};
use crate::request::{Params, Request, RequestContext, RequestKind, RequestOutcome};
use crate::schema::OperationSpec;

#[derive(Debug, Default)]
struct DispatchQueue {
    pending: VecDeque<Arc<Request>>,
    current: Option<Arc<Request>>,
    concurrent: Vec<Arc<Request>>,
    suspended: HashMap<SessionId, VecDeque<Arc<Request>>>,
    worker_running: bool,
}

impl DispatchQueue {
    fn has_work(&self, session: SessionId) -> bool {
        self.count(session) > 0
    }

    fn count(&self, session: SessionId) -> usize {
        let mine = |r: &&Arc<Request>| r.session() == session;
        self.pending.iter().filter(mine).count()
            + self.current.iter().filter(mine).count()
            + self.concurrent.iter().filter(mine).count()
            + self.suspended.get(&session).map_or(0, VecDeque::len)
    }

    fn remove_running(&mut self, request: &Arc<Request>) {
        if self
            .current
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, request))
        {
            self.current = None;
        } else {
            self.concurrent.retain(|r| !Arc::ptr_eq(r, request));
        }
    }
}

struct DispatchInner {
    name: String,
    driver: Arc<dyn DeviceDriver>,
    runtime: Handle,
    queue: Mutex<DispatchQueue>,
    next_id: AtomicU64,
}

/// Serializes the request bodies of one device.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    inner: Arc<DispatchInner>,
}

impl Dispatcher {
    pub(crate) fn new(name: &str, driver: Arc<dyn DeviceDriver>, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(DispatchInner {
                name: name.to_string(),
                driver,
                runtime,
                queue: Mutex::new(DispatchQueue::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn queue(&self) -> MutexGuard<'_, DispatchQueue> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Build a request for an already validated call.
    pub(crate) fn request(
        &self,
        props: &Arc<PropertySet>,
        spec: &OperationSpec,
        params: Params,
        synchronous: bool,
    ) -> Arc<Request> {
        Arc::new(Request::new(
            self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            spec.kind(),
            spec.name(),
            params,
            props.clone(),
            synchronous,
            spec.is_concurrent(),
        ))
    }

    /// Number of requests of `session` not yet finished, parked ones
    /// included.
    pub(crate) fn count_commands(&self, session: SessionId) -> usize {
        self.queue().count(session)
    }

    /// Queue `request`. Idle handles become busy; output requests get the
    /// next `OutputID`.
    pub(crate) fn enqueue(&self, request: Arc<Request>) {
        let props = request.property_set().clone();
        {
            let mut queue = self.queue();
            let parked = {
                let mut state = props.lock();
                if state.state() == ControlState::Idle {
                    state.set_state(ControlState::Busy);
                }
                if request.kind() == RequestKind::Output {
                    request.set_output_id(state.next_output_id());
                }
                !request.is_synchronous() && state.state() == ControlState::Error
            };

            debug!(
                "{}: Enqueue {} #{} (output id {})",
                self.inner.name,
                request.operation(),
                request.id(),
                request.output_id()
            );

            if parked {
                queue
                    .suspended
                    .entry(request.session())
                    .or_default()
                    .push_back(request);
            } else if request.is_concurrent() {
                queue.concurrent.push(request.clone());
                self.spawn_concurrent(request);
            } else {
                queue.pending.push_back(request);
                self.ensure_worker(&mut queue);
            }
        }
        props.flush_notifications();
        props.signal_waiters();
    }

    /// Wait for an already queued synchronous request to finish.
    pub(crate) async fn finish_synchronous(request: &Request) -> Result<()> {
        match request.wait(WaitTimeout::Forever).await {
            Some(RequestOutcome::Completed) => Ok(()),
            Some(RequestOutcome::Failed(error)) => Err(error),
            Some(RequestOutcome::Aborted) | None => {
                Err(DeviceError::aborted(request.operation()))
            }
        }
    }

    fn ensure_worker(&self, queue: &mut DispatchQueue) {
        if queue.worker_running || queue.pending.is_empty() {
            return;
        }
        queue.worker_running = true;
        let dispatcher = self.clone();
        self.inner.runtime.spawn(async move { dispatcher.run_worker().await });
    }

    fn spawn_concurrent(&self, request: Arc<Request>) {
        let dispatcher = self.clone();
        self.inner.runtime.spawn(async move {
            let outcome = dispatcher.run(&request).await;
            dispatcher.complete(&request, outcome);
        });
    }

    async fn run_worker(self) {
        loop {
            let request = {
                let mut queue = self.queue();
                match queue.pending.pop_front() {
                    Some(request) => {
                        queue.current = Some(request.clone());
                        request
                    }
                    None => {
                        queue.worker_running = false;
                        return;
                    }
                }
            };
            let outcome = self.run(&request).await;
            self.complete(&request, outcome);
        }
    }

    async fn run(&self, request: &Arc<Request>) -> RequestOutcome {
        if request.is_aborted() {
            return RequestOutcome::Aborted;
        }
        debug!(
            "{}: Execute {} #{}",
            self.inner.name,
            request.operation(),
            request.id()
        );
        let ctx = RequestContext::new(request.clone());
        let result = AssertUnwindSafe(self.inner.driver.execute(&ctx))
            .catch_unwind()
            .await;
        match result {
            _ if request.is_aborted() => RequestOutcome::Aborted,
            Ok(Ok(())) => RequestOutcome::Completed,
            Ok(Err(error)) => RequestOutcome::Failed(error),
            Err(_) => RequestOutcome::Failed(DeviceError::failure(format!(
                "{} panicked",
                request.operation()
            ))),
        }
    }

    fn complete(&self, request: &Arc<Request>, outcome: RequestOutcome) {
        let props = request.property_set().clone();

        if let RequestOutcome::Failed(error) = &outcome
            && !request.is_synchronous()
            && !request.no_events()
            && props.snapshot(|s| s.device_enabled())
        {
            warn!(
                "{}: {} #{} failed: {}",
                self.inner.name,
                request.operation(),
                request.id(),
                error
            );
            self.park(request);
            request.finish(outcome.clone());
            let locus = match request.kind() {
                RequestKind::Output => ErrorLocus::Output,
                RequestKind::Input => ErrorLocus::Input,
            };
            props.post_error(ErrorEvent::from_error(error, locus));
            return;
        }

        match &outcome {
            RequestOutcome::Completed => info!(
                "{}: {} #{} completed",
                self.inner.name,
                request.operation(),
                request.id()
            ),
            RequestOutcome::Failed(error) => warn!(
                "{}: {} #{} failed: {}",
                self.inner.name,
                request.operation(),
                request.id(),
                error
            ),
            RequestOutcome::Aborted => debug!(
                "{}: {} #{} aborted",
                self.inner.name,
                request.operation(),
                request.id()
            ),
        }

        self.queue().remove_running(request);
        if outcome == RequestOutcome::Completed
            && !request.is_synchronous()
            && !request.no_events()
            && request.kind() == RequestKind::Output
        {
            props.post_output_complete(request.output_id());
        }
        self.settle(&props);
        request.finish(outcome);
    }

    /// Move a failed request and the asynchronous requests its handle still
    /// has queued to the parked list, and enter the error state.
    fn park(&self, failed: &Arc<Request>) {
        let props = failed.property_set();
        let session = failed.session();
        {
            let mut queue = self.queue();
            queue.remove_running(failed);

            let mut parked = VecDeque::from([failed.clone()]);
            let (mine, others): (VecDeque<_>, VecDeque<_>) = queue
                .pending
                .drain(..)
                .partition(|r| r.session() == session && !r.is_synchronous());
            queue.pending = others;
            parked.extend(mine);

            let entry = queue.suspended.entry(session).or_default();
            parked.extend(entry.drain(..));
            *entry = parked;

            props.lock().set_state(ControlState::Error);
        }
        props.flush_notifications();
    }

    /// Give the parked requests of `props` another run.
    pub(crate) fn reactivate(&self, props: &Arc<PropertySet>) {
        let session = props.session();
        {
            let mut queue = self.queue();
            let parked = queue.suspended.remove(&session).unwrap_or_default();
            debug!(
                "{}: Retry {} parked request(s)",
                self.inner.name,
                parked.len()
            );
            {
                let mut state = props.lock();
                if !parked.is_empty() {
                    state.set_state(ControlState::Busy);
                }
            }
            for request in parked.into_iter().rev() {
                request.reset();
                if request.is_concurrent() {
                    queue.concurrent.push(request.clone());
                    self.spawn_concurrent(request);
                } else {
                    queue.pending.push_front(request);
                }
            }
            self.ensure_worker(&mut queue);
        }
        self.settle(props);
    }

    /// Abort the requests of `props`, all of them or only those of `kind`.
    ///
    /// Queued and parked requests end at once. Running ones are signalled
    /// and waited for. No events are generated for any of them.
    pub(crate) async fn clear(&self, props: &Arc<PropertySet>, kind: Option<RequestKind>) {
        let session = props.session();
        let matches =
            |r: &Arc<Request>| r.session() == session && kind.is_none_or(|k| r.kind() == k);

        let (removed, running) = {
            let mut queue = self.queue();
            let mut removed = Vec::new();

            if let Some(parked) = queue.suspended.get_mut(&session) {
                let (drop, keep): (VecDeque<_>, VecDeque<_>) =
                    parked.drain(..).partition(|r| matches(r));
                *parked = keep;
                removed.extend(drop);
                if parked.is_empty() {
                    queue.suspended.remove(&session);
                }
            }

            let (drop, keep): (VecDeque<_>, VecDeque<_>) =
                queue.pending.drain(..).partition(|r| matches(r));
            queue.pending = keep;
            removed.extend(drop);

            let running: Vec<_> = queue
                .current
                .iter()
                .chain(queue.concurrent.iter())
                .filter(|r| matches(r))
                .cloned()
                .collect();
            (removed, running)
        };

        debug!(
            "{}: Clear {:?}: {} queued, {} running",
            self.inner.name,
            kind,
            removed.len(),
            running.len()
        );

        for request in removed {
            request.abort(true);
            if request.outcome().is_none() {
                request.finish(RequestOutcome::Aborted);
            }
        }
        for request in running {
            request.abort_and_wait(true).await;
        }
        self.settle(props);
    }

    /// Leave the error state if nothing is parked, leave the busy state if
    /// nothing is queued, and fire the idle status if it was asked for.
    pub(crate) fn settle(&self, props: &Arc<PropertySet>) {
        let session = props.session();
        let idle_status = {
            let queue = self.queue();
            let has_work = queue.has_work(session);
            let parked = queue.suspended.get(&session).is_some_and(|p| !p.is_empty());

            let mut state = props.lock();
            match state.state() {
                ControlState::Error if !parked => {
                    state.set_state(if has_work {
                        ControlState::Busy
                    } else {
                        ControlState::Idle
                    });
                }
                ControlState::Busy if !has_work => state.set_state(ControlState::Idle),
                _ => {}
            }
            if state.state() == ControlState::Idle && state.flag_when_idle() {
                state.set_flag_when_idle(false);
                props.schema().idle_status()
            } else {
                None
            }
        };
        props.flush_notifications();
        props.signal_waiters();
        if let Some(status) = idle_status {
            props.deliver_status(status);
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}
