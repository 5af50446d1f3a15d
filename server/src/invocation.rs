//! Server side of the invocation protocol
//!
//! Incoming requests name a target oid and a method id. The target resolves
//! to a [`DispatchChain`]: an ordered list of per-service [`DispatchTable`]s,
//! the service's own table first and any base tables after it. The first
//! table with a handler for the method id wins; if none has one the request
//! fails with [`InvocationError::UnknownMethod`].
//!
//! Listener references in the arguments are turned into [`ListenerProxy`]s.
//! Calling a response method on a proxy marshals an [`InvocationResponse`]
//! addressed to the caller's token and posts it to the [`ResponseSink`].
//! Any dispatch failure is reported to the caller through the first listener
//! in the request, never propagated beyond this one invocation.

use log::{debug, warn};
use shared::service::{
    ConfirmListener, InvocationListener, ListenerDescriptor, ServiceDescriptor, INVOCATION_LISTENER,
    REQUEST_FAILED, REQUEST_PROCESSED,
};
use shared::{
    Args, InvocationError, InvocationRequest, InvocationResponse, ListenerRef, MethodId, ObjectId,
    ServiceBinding, Value,
};
use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Service oids are handed out from here upward
pub const FIRST_SERVICE_OID: ObjectId = 1;

/// Destination for responses produced by listener proxies
pub trait ResponseSink: Send + Sync {
    fn post_response(&self, response: InvocationResponse);
}

/// The session a request arrived on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub client_oid: ObjectId,
    pub username: String,
}

/// Server-side stand-in for a listener living on the caller's side
#[derive(Clone)]
pub struct ListenerProxy {
    token: ListenerRef,
    listener_type: &'static ListenerDescriptor,
    sink: Arc<dyn ResponseSink>,
    responded: Arc<AtomicBool>,
}

impl ListenerProxy {
    pub fn new(token: ListenerRef, sink: Arc<dyn ResponseSink>) -> Self {
        Self {
            token,
            listener_type: &INVOCATION_LISTENER,
            sink,
            responded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Narrows the proxy to a concrete listener type (used for logging)
    pub fn typed(mut self, listener_type: &'static ListenerDescriptor) -> Self {
        self.listener_type = listener_type;
        self
    }

    pub fn token(&self) -> ListenerRef {
        self.token
    }

    pub fn has_responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }

    /// Posts the terminal response for this token. Only the first call per
    /// token goes out; later ones are logged and dropped.
    pub fn respond(&self, method_id: MethodId, args: Vec<Value>) -> bool {
        let name = self.listener_type.method_name(method_id).unwrap_or("?");
        if self.responded.swap(true, Ordering::AcqRel) {
            warn!(
                "Dropping second response {}.{} to {:?}",
                self.listener_type.name, name, self.token
            );
            return false;
        }

        debug!(
            "Responding {}.{} to {:?}",
            self.listener_type.name, name, self.token
        );
        self.sink.post_response(InvocationResponse {
            caller_oid: self.token.caller_oid,
            request_id: self.token.request_id,
            method_id,
            args,
        });
        true
    }
}

impl InvocationListener for ListenerProxy {
    fn request_failed(&mut self, cause: String) {
        self.respond(REQUEST_FAILED, vec![Value::Str(cause)]);
    }
}

impl ConfirmListener for ListenerProxy {
    fn request_processed(&mut self) {
        self.respond(REQUEST_PROCESSED, vec![]);
    }
}

/// Request arguments with their listener references already proxied
pub struct RequestArgs {
    args: Args,
    proxies: BTreeMap<usize, ListenerProxy>,
}

impl RequestArgs {
    pub fn new(values: Vec<Value>, sink: Arc<dyn ResponseSink>) -> Self {
        let args = Args::new(values);
        let proxies = args
            .listener_indices()
            .filter_map(|i| {
                let token = args.get::<ListenerRef>(i).ok()?;
                Some((i, ListenerProxy::new(token, Arc::clone(&sink))))
            })
            .collect();
        Self { args, proxies }
    }

    /// The proxy standing in for the listener at `index`
    pub fn listener(&self, index: usize) -> Result<ListenerProxy, InvocationError> {
        match self.proxies.get(&index) {
            Some(proxy) => Ok(proxy.clone()),
            None => Err(self
                .args
                .get::<ListenerRef>(index)
                .err()
                .unwrap_or_else(|| InvocationError::BadArguments {
                    index,
                    reason: "expected listener".to_string(),
                })),
        }
    }

    pub fn first_listener(&self) -> Option<ListenerProxy> {
        self.proxies.values().next().cloned()
    }
}

impl Deref for RequestArgs {
    type Target = Args;

    fn deref(&self) -> &Args {
        &self.args
    }
}

pub type RequestHandler =
    Box<dyn FnMut(&Caller, &RequestArgs) -> Result<(), InvocationError> + Send>;

/// Request id -> handler mapping for one service
pub struct DispatchTable {
    service: &'static ServiceDescriptor,
    handlers: HashMap<MethodId, RequestHandler>,
}

impl DispatchTable {
    pub fn new(service: &'static ServiceDescriptor) -> Self {
        Self {
            service,
            handlers: HashMap::new(),
        }
    }

    pub fn with<F>(mut self, method_id: MethodId, handler: F) -> Self
    where
        F: FnMut(&Caller, &RequestArgs) -> Result<(), InvocationError> + Send + 'static,
    {
        debug_assert!(
            self.service.method_name(method_id).is_some(),
            "{} declares no method {}",
            self.service.name,
            method_id
        );
        self.handlers.insert(method_id, Box::new(handler));
        self
    }

    pub fn service(&self) -> &'static ServiceDescriptor {
        self.service
    }

    pub fn handles(&self, method_id: MethodId) -> bool {
        self.handlers.contains_key(&method_id)
    }
}

/// Tables consulted in order; base services go last
pub struct DispatchChain {
    tables: Vec<DispatchTable>,
}

impl DispatchChain {
    pub fn new(primary: DispatchTable) -> Self {
        Self {
            tables: vec![primary],
        }
    }

    pub fn with_base(mut self, base: DispatchTable) -> Self {
        self.tables.push(base);
        self
    }

    pub fn service(&self) -> &'static ServiceDescriptor {
        self.tables[0].service
    }

    pub fn method_name(&self, method_id: MethodId) -> Option<&'static str> {
        self.tables
            .iter()
            .find(|t| t.handles(method_id))
            .and_then(|t| t.service.method_name(method_id))
    }

    fn dispatch(
        &mut self,
        target_oid: ObjectId,
        caller: &Caller,
        method_id: MethodId,
        args: &RequestArgs,
    ) -> Result<(), InvocationError> {
        for table in &mut self.tables {
            if let Some(handler) = table.handlers.get_mut(&method_id) {
                return handler(caller, args);
            }
        }
        Err(InvocationError::UnknownMethod {
            target_oid,
            method_id,
        })
    }
}

/// Registry of invocation targets. Lives on the dispatch queue's consumer.
pub struct InvocationManager {
    targets: HashMap<ObjectId, DispatchChain>,
    next_oid: ObjectId,
    sink: Arc<dyn ResponseSink>,
}

impl InvocationManager {
    pub fn new(sink: Arc<dyn ResponseSink>) -> Self {
        Self {
            targets: HashMap::new(),
            next_oid: FIRST_SERVICE_OID,
            sink,
        }
    }

    /// Registers a dispatcher at the next free oid and returns that oid
    pub fn register(&mut self, chain: DispatchChain) -> ObjectId {
        while self.targets.contains_key(&self.next_oid) {
            self.next_oid += 1;
        }
        let oid = self.next_oid;
        self.next_oid += 1;
        self.targets.insert(oid, chain);
        oid
    }

    /// Registers a dispatcher at a fixed oid; false if it is taken
    pub fn register_at(&mut self, oid: ObjectId, chain: DispatchChain) -> bool {
        if self.targets.contains_key(&oid) {
            return false;
        }
        self.targets.insert(oid, chain);
        true
    }

    pub fn clear(&mut self, oid: ObjectId) -> bool {
        self.targets.remove(&oid).is_some()
    }

    /// Service name to oid mapping sent to clients at logon
    pub fn bindings(&self) -> Vec<ServiceBinding> {
        let mut bindings: Vec<ServiceBinding> = self
            .targets
            .iter()
            .map(|(oid, chain)| ServiceBinding {
                service: chain.service().name.to_string(),
                oid: *oid,
            })
            .collect();
        bindings.sort_by_key(|b| b.oid);
        bindings
    }

    /// Routes one request to its provider. A failure is also reported to the
    /// caller's listener, when the request carried one.
    pub fn dispatch_request(
        &mut self,
        caller: &Caller,
        request: InvocationRequest,
    ) -> Result<(), InvocationError> {
        let InvocationRequest {
            target_oid,
            method_id,
            args,
        } = request;
        let args = RequestArgs::new(args, Arc::clone(&self.sink));

        let result = match self.targets.get_mut(&target_oid) {
            Some(chain) => {
                debug!(
                    "Dispatching {}.{} from {}",
                    chain.service().name,
                    chain.method_name(method_id).unwrap_or("?"),
                    caller.username
                );
                chain.dispatch(target_oid, caller, method_id, &args)
            }
            None => Err(InvocationError::NoSuchTarget(target_oid)),
        };

        if let Err(err) = &result {
            report_failure(caller, target_oid, method_id, &args, err);
        }
        result
    }
}

fn report_failure(
    caller: &Caller,
    target_oid: ObjectId,
    method_id: MethodId,
    args: &RequestArgs,
    err: &InvocationError,
) {
    match args.first_listener() {
        Some(mut listener) if !listener.has_responded() => {
            debug!(
                "Invocation {}:{} from {} failed: {}",
                target_oid, method_id, caller.username, err
            );
            listener.request_failed(err.to_string());
        }
        Some(_) => warn!(
            "Invocation {}:{} from {} failed after responding: {}",
            target_oid, method_id, caller.username, err
        ),
        None => warn!(
            "Invocation {}:{} from {} failed with no listener to notify: {}",
            target_oid, method_id, caller.username, err
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const ECHO_SERVICE: ServiceDescriptor =
        ServiceDescriptor::new("echo", &[("echo", 1), ("shout", 2)]);
    const BASE_SERVICE: ServiceDescriptor = ServiceDescriptor::new("base", &[("ping", 9)]);

    #[derive(Default)]
    struct CaptureSink {
        responses: Mutex<Vec<InvocationResponse>>,
    }

    impl ResponseSink for CaptureSink {
        fn post_response(&self, response: InvocationResponse) {
            self.responses.lock().unwrap().push(response);
        }
    }

    impl CaptureSink {
        fn taken(&self) -> Vec<InvocationResponse> {
            std::mem::take(&mut *self.responses.lock().unwrap())
        }
    }

    fn caller() -> Caller {
        Caller {
            client_oid: 1000,
            username: "alice".to_string(),
        }
    }

    fn token(request_id: u32) -> Value {
        Value::Listener(ListenerRef {
            caller_oid: 1000,
            request_id,
        })
    }

    fn echo_chain() -> DispatchChain {
        DispatchChain::new(DispatchTable::new(&ECHO_SERVICE).with(1, |_caller, args| {
            args.expect_len(2)?;
            let text: String = args.get(0)?;
            let mut listener = args.listener(1)?;
            listener.request_failed(format!("echo:{}", text));
            Ok(())
        }))
    }

    fn manager() -> (InvocationManager, Arc<CaptureSink>) {
        let sink = Arc::new(CaptureSink::default());
        (InvocationManager::new(sink.clone()), sink)
    }

    #[test]
    fn test_dispatch_invokes_handler_with_proxy() {
        let (mut invmgr, sink) = manager();
        let oid = invmgr.register(echo_chain());

        let request = InvocationRequest {
            target_oid: oid,
            method_id: 1,
            args: vec!["hello".into(), token(4)],
        };
        assert!(invmgr.dispatch_request(&caller(), request).is_ok());

        let responses = sink.taken();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].caller_oid, 1000);
        assert_eq!(responses[0].request_id, 4);
        assert_eq!(responses[0].method_id, REQUEST_FAILED);
        assert_eq!(responses[0].args, vec![Value::Str("echo:hello".into())]);
    }

    #[test]
    fn test_unknown_method_reported_to_listener() {
        let (mut invmgr, sink) = manager();
        let oid = invmgr.register(echo_chain());

        let request = InvocationRequest {
            target_oid: oid,
            method_id: 2,
            args: vec![token(8)],
        };
        let result = invmgr.dispatch_request(&caller(), request);
        assert_eq!(
            result,
            Err(InvocationError::UnknownMethod {
                target_oid: oid,
                method_id: 2
            })
        );

        let responses = sink.taken();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].request_id, 8);
        assert_eq!(responses[0].method_id, REQUEST_FAILED);
    }

    #[test]
    fn test_base_table_consulted_last() {
        let (mut invmgr, sink) = manager();
        let pings = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&pings);
        let chain = echo_chain().with_base(DispatchTable::new(&BASE_SERVICE).with(
            9,
            move |_caller, args| {
                *counter.lock().unwrap() += 1;
                args.listener(0)?.request_processed();
                Ok(())
            },
        ));
        let oid = invmgr.register(chain);

        let request = InvocationRequest {
            target_oid: oid,
            method_id: 9,
            args: vec![token(1)],
        };
        assert!(invmgr.dispatch_request(&caller(), request).is_ok());
        assert_eq!(*pings.lock().unwrap(), 1);
        assert_eq!(sink.taken()[0].method_id, REQUEST_PROCESSED);
    }

    #[test]
    fn test_malformed_arguments_fail_only_that_call() {
        let (mut invmgr, sink) = manager();
        let oid = invmgr.register(echo_chain());

        let bad = InvocationRequest {
            target_oid: oid,
            method_id: 1,
            args: vec![Value::Int(3), token(2)],
        };
        assert!(matches!(
            invmgr.dispatch_request(&caller(), bad),
            Err(InvocationError::BadArguments { index: 0, .. })
        ));

        let good = InvocationRequest {
            target_oid: oid,
            method_id: 1,
            args: vec!["ok".into(), token(3)],
        };
        assert!(invmgr.dispatch_request(&caller(), good).is_ok());

        let responses = sink.taken();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].request_id, 2);
        assert_eq!(responses[1].request_id, 3);
        assert_eq!(responses[1].args, vec![Value::Str("echo:ok".into())]);
    }

    #[test]
    fn test_no_such_target() {
        let (mut invmgr, sink) = manager();
        let request = InvocationRequest {
            target_oid: 77,
            method_id: 1,
            args: vec![],
        };
        assert_eq!(
            invmgr.dispatch_request(&caller(), request),
            Err(InvocationError::NoSuchTarget(77))
        );
        // nothing to report to without a listener
        assert!(sink.taken().is_empty());
    }

    #[test]
    fn test_failure_after_response_not_reported_twice() {
        let (mut invmgr, sink) = manager();
        let oid = invmgr.register(DispatchChain::new(DispatchTable::new(&ECHO_SERVICE).with(
            1,
            |_caller, args| {
                args.listener(0)?.request_processed();
                Err(InvocationError::Failed("late".into()))
            },
        )));

        let request = InvocationRequest {
            target_oid: oid,
            method_id: 1,
            args: vec![token(5)],
        };
        assert!(invmgr.dispatch_request(&caller(), request).is_err());

        let responses = sink.taken();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].method_id, REQUEST_PROCESSED);
    }

    #[test]
    fn test_proxy_responds_once() {
        let sink = Arc::new(CaptureSink::default());
        let token = ListenerRef {
            caller_oid: 1000,
            request_id: 6,
        };
        let proxy = ListenerProxy::new(token, sink.clone());
        let copy = proxy.clone();

        assert!(proxy.respond(REQUEST_PROCESSED, vec![]));
        assert!(!copy.respond(REQUEST_FAILED, vec!["again".into()]));
        assert_eq!(sink.taken().len(), 1);
    }

    #[test]
    fn test_registration_and_bindings() {
        let (mut invmgr, _) = manager();
        assert!(invmgr.register_at(5, echo_chain()));
        assert!(!invmgr.register_at(5, echo_chain()));

        let first = invmgr.register(echo_chain());
        assert_eq!(first, FIRST_SERVICE_OID);

        let bindings = invmgr.bindings();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].oid, first);
        assert_eq!(bindings[1].oid, 5);
        assert_eq!(bindings[1].service, "echo");

        assert!(invmgr.clear(5));
        assert_eq!(invmgr.bindings().len(), 1);
    }

    #[test]
    fn test_listener_index_without_token() {
        let sink: Arc<dyn ResponseSink> = Arc::new(CaptureSink::default());
        let args = RequestArgs::new(vec!["x".into()], sink);
        assert!(matches!(
            args.listener(0),
            Err(InvocationError::BadArguments { index: 0, .. })
        ));
        assert!(args.first_listener().is_none());
    }
}
