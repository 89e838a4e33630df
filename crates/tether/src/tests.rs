use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tetherwire::CallEnvelope;
use tetherwire::ResultEnvelope;
use serde_json::json;

use crate::BoxedValue;
use crate::BridgeError;
use crate::BridgeService;
use crate::BridgeStream;
use crate::EventListener;
use crate::FunctionDescriptor;
use crate::OutboundCallHandler;
use crate::ProxyScope;
use crate::Result;
use crate::ServiceAdapter;
use crate::StateStream;
use crate::descriptor::downcast_value;
use crate::descriptor::take_arg;
use crate::event::Call;
use crate::event::CallResult;
use crate::event::StartToken;
use crate::json_codec;
use crate::mock_channel::endpoint_pair;
use crate::mock_channel::endpoint_pair_with;
use crate::service_codec;
use crate::stream::state_codec;
use crate::stream::stream_codec;

// -- Greeter: the synchronous exemplar ---------------------------------------

const GREET_SIGNATURE: &str = "fun greet(String): String";

trait Greeter: BridgeService {
    fn greet(&self, name: String) -> Result<String>;
}

impl std::fmt::Debug for dyn Greeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Greeter")
    }
}

#[derive(Clone)]
struct GreeterAdapter;

impl ServiceAdapter for GreeterAdapter {
    type Service = dyn Greeter;

    fn serial_name(&self) -> &'static str {
        "test.Greeter"
    }

    fn functions(&self) -> Vec<Arc<FunctionDescriptor<dyn Greeter>>> {
        vec![
            FunctionDescriptor::returning(
                GREET_SIGNATURE,
                vec![json_codec::<String>()],
                json_codec::<String>(),
                |service: &dyn Greeter, mut args| {
                    let name = take_arg::<String>(&mut args, GREET_SIGNATURE)?;
                    let reply = service.greet(name)?;
                    Ok(Box::new(reply))
                },
            ),
            FunctionDescriptor::close(),
        ]
    }

    fn new_proxy(&self, handler: OutboundCallHandler<dyn Greeter>) -> Arc<dyn Greeter> {
        Arc::new(GreeterProxy { handler })
    }
}

struct GreeterProxy {
    handler: OutboundCallHandler<dyn Greeter>,
}

impl BridgeService for GreeterProxy {
    fn close(&self) {
        self.handler.close();
    }
}

impl Greeter for GreeterProxy {
    fn greet(&self, name: String) -> Result<String> {
        let reply = self.handler.call(0, vec![Box::new(name)])?;
        downcast_value::<String>(reply, GREET_SIGNATURE)
    }
}

struct RealGreeter;

impl BridgeService for RealGreeter {}

impl Greeter for RealGreeter {
    fn greet(&self, name: String) -> Result<String> {
        if name == "grump" {
            return Err(BridgeError::remote("Grumpy", "come back after coffee"));
        }
        Ok(format!("hello, {name}"))
    }
}

struct PanickyGreeter;

impl BridgeService for PanickyGreeter {}

impl Greeter for PanickyGreeter {
    fn greet(&self, _name: String) -> Result<String> {
        panic!("greeting machine jammed");
    }
}

// A different interface taken against the same bound name, to provoke
// version-skew diagnostics.
const HELLO_SIGNATURE: &str = "fun hello(): String";

trait Hello: BridgeService {
    fn hello(&self) -> Result<String>;
}

#[derive(Clone)]
struct HelloAdapter;

impl ServiceAdapter for HelloAdapter {
    type Service = dyn Hello;

    fn serial_name(&self) -> &'static str {
        "test.Hello"
    }

    fn functions(&self) -> Vec<Arc<FunctionDescriptor<dyn Hello>>> {
        vec![
            FunctionDescriptor::returning(
                HELLO_SIGNATURE,
                vec![],
                json_codec::<String>(),
                |service: &dyn Hello, _args| {
                    let reply = service.hello()?;
                    Ok(Box::new(reply))
                },
            ),
            FunctionDescriptor::close(),
        ]
    }

    fn new_proxy(&self, handler: OutboundCallHandler<dyn Hello>) -> Arc<dyn Hello> {
        Arc::new(HelloProxy { handler })
    }
}

struct HelloProxy {
    handler: OutboundCallHandler<dyn Hello>,
}

impl BridgeService for HelloProxy {
    fn close(&self) {
        self.handler.close();
    }
}

impl Hello for HelloProxy {
    fn hello(&self) -> Result<String> {
        let reply = self.handler.call(0, vec![])?;
        downcast_value::<String>(reply, HELLO_SIGNATURE)
    }
}

// -- TextSink / Publisher: pass-by-reference ---------------------------------

const ACCEPT_SIGNATURE: &str = "fun accept(String): Unit";
const PUBLISH_SIGNATURE: &str = "fun publish(String, TextSink): Unit";

trait TextSink: BridgeService {
    fn accept(&self, line: String) -> Result<()>;
}

#[derive(Clone)]
struct TextSinkAdapter;

impl ServiceAdapter for TextSinkAdapter {
    type Service = dyn TextSink;

    fn serial_name(&self) -> &'static str {
        "test.TextSink"
    }

    fn functions(&self) -> Vec<Arc<FunctionDescriptor<dyn TextSink>>> {
        vec![
            FunctionDescriptor::returning(
                ACCEPT_SIGNATURE,
                vec![json_codec::<String>()],
                json_codec::<()>(),
                |service: &dyn TextSink, mut args| {
                    let line = take_arg::<String>(&mut args, ACCEPT_SIGNATURE)?;
                    service.accept(line)?;
                    Ok(Box::new(()))
                },
            ),
            FunctionDescriptor::close(),
        ]
    }

    fn new_proxy(&self, handler: OutboundCallHandler<dyn TextSink>) -> Arc<dyn TextSink> {
        Arc::new(TextSinkProxy { handler })
    }
}

struct TextSinkProxy {
    handler: OutboundCallHandler<dyn TextSink>,
}

impl BridgeService for TextSinkProxy {
    fn close(&self) {
        self.handler.close();
    }
}

impl TextSink for TextSinkProxy {
    fn accept(&self, line: String) -> Result<()> {
        self.handler
            .call(0, vec![Box::new(line)])
            .map(|_| ())
    }
}

struct CollectingSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl BridgeService for CollectingSink {}

impl TextSink for CollectingSink {
    fn accept(&self, line: String) -> Result<()> {
        self.lines.lock().unwrap().push(line);
        Ok(())
    }
}

trait Publisher: BridgeService {
    fn publish(&self, line: String, sink: Arc<dyn TextSink>) -> Result<()>;
}

#[derive(Clone)]
struct PublisherAdapter;

impl ServiceAdapter for PublisherAdapter {
    type Service = dyn Publisher;

    fn serial_name(&self) -> &'static str {
        "test.Publisher"
    }

    fn functions(&self) -> Vec<Arc<FunctionDescriptor<dyn Publisher>>> {
        vec![
            FunctionDescriptor::returning(
                PUBLISH_SIGNATURE,
                vec![json_codec::<String>(), service_codec(TextSinkAdapter)],
                json_codec::<()>(),
                |service: &dyn Publisher, mut args| {
                    let line = take_arg::<String>(&mut args, PUBLISH_SIGNATURE)?;
                    let sink = take_arg::<Arc<dyn TextSink>>(&mut args, PUBLISH_SIGNATURE)?;
                    service.publish(line, sink)?;
                    Ok(Box::new(()))
                },
            ),
            FunctionDescriptor::close(),
        ]
    }

    fn new_proxy(&self, handler: OutboundCallHandler<dyn Publisher>) -> Arc<dyn Publisher> {
        Arc::new(PublisherProxy { handler })
    }
}

struct PublisherProxy {
    handler: OutboundCallHandler<dyn Publisher>,
}

impl BridgeService for PublisherProxy {
    fn close(&self) {
        self.handler.close();
    }
}

impl Publisher for PublisherProxy {
    fn publish(&self, line: String, sink: Arc<dyn TextSink>) -> Result<()> {
        self.handler
            .call(0, vec![Box::new(line), Box::new(sink)])
            .map(|_| ())
    }
}

struct RealPublisher;

impl BridgeService for RealPublisher {}

impl Publisher for RealPublisher {
    fn publish(&self, line: String, sink: Arc<dyn TextSink>) -> Result<()> {
        sink.accept(format!("published: {line}"))?;
        sink.close();
        Ok(())
    }
}

// -- Sleeper: the suspending exemplar ----------------------------------------

const NAP_SIGNATURE: &str = "fun nap(String): String";

#[async_trait]
trait Sleeper: BridgeService {
    async fn nap(&self, label: String) -> Result<String>;
}

#[derive(Clone)]
struct SleeperAdapter;

impl ServiceAdapter for SleeperAdapter {
    type Service = dyn Sleeper;

    fn serial_name(&self) -> &'static str {
        "test.Sleeper"
    }

    fn functions(&self) -> Vec<Arc<FunctionDescriptor<dyn Sleeper>>> {
        vec![
            FunctionDescriptor::suspending(
                NAP_SIGNATURE,
                vec![json_codec::<String>()],
                json_codec::<String>(),
                |service: Arc<dyn Sleeper>, mut args| {
                    async move {
                        let label = take_arg::<String>(&mut args, NAP_SIGNATURE)?;
                        let reply = service.nap(label).await?;
                        Ok(Box::new(reply) as BoxedValue)
                    }
                    .boxed()
                },
            ),
            FunctionDescriptor::close(),
        ]
    }

    fn new_proxy(&self, handler: OutboundCallHandler<dyn Sleeper>) -> Arc<dyn Sleeper> {
        Arc::new(SleeperProxy { handler })
    }
}

struct SleeperProxy {
    handler: OutboundCallHandler<dyn Sleeper>,
}

impl BridgeService for SleeperProxy {
    fn close(&self) {
        self.handler.close();
    }
}

#[async_trait]
impl Sleeper for SleeperProxy {
    async fn nap(&self, label: String) -> Result<String> {
        let reply = self
            .handler
            .call_suspending(0, vec![Box::new(label)])
            .await?;
        downcast_value::<String>(reply, NAP_SIGNATURE)
    }
}

struct EchoSleeper;

impl BridgeService for EchoSleeper {}

#[async_trait]
impl Sleeper for EchoSleeper {
    async fn nap(&self, label: String) -> Result<String> {
        tokio::task::yield_now().await;
        Ok(format!("woke: {label}"))
    }
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

// Never completes on its own; its body future being dropped is observable.
struct StuckSleeper {
    dropped: Arc<AtomicBool>,
}

impl BridgeService for StuckSleeper {}

#[async_trait]
impl Sleeper for StuckSleeper {
    async fn nap(&self, _label: String) -> Result<String> {
        let _guard = SetOnDrop(self.dropped.clone());
        futures::future::pending::<()>().await;
        Ok("unreachable".to_string())
    }
}

// -- Numbers: streams --------------------------------------------------------

const NUMBERS_SIGNATURE: &str = "fun numbers(): Stream<UInt>";
const TEMPERATURE_SIGNATURE: &str = "fun temperature(): StateStream<Int>";

trait Numbers: BridgeService {
    fn numbers(&self) -> Result<BridgeStream<u32>>;
    fn temperature(&self) -> Result<StateStream<i64>>;
}

#[derive(Clone)]
struct NumbersAdapter;

impl ServiceAdapter for NumbersAdapter {
    type Service = dyn Numbers;

    fn serial_name(&self) -> &'static str {
        "test.Numbers"
    }

    fn functions(&self) -> Vec<Arc<FunctionDescriptor<dyn Numbers>>> {
        vec![
            FunctionDescriptor::returning(
                NUMBERS_SIGNATURE,
                vec![],
                stream_codec::<u32>(),
                |service: &dyn Numbers, _args| {
                    let stream = service.numbers()?;
                    Ok(Box::new(stream))
                },
            ),
            FunctionDescriptor::returning(
                TEMPERATURE_SIGNATURE,
                vec![],
                state_codec::<i64>(),
                |service: &dyn Numbers, _args| {
                    let stream = service.temperature()?;
                    Ok(Box::new(stream))
                },
            ),
            FunctionDescriptor::close(),
        ]
    }

    fn new_proxy(&self, handler: OutboundCallHandler<dyn Numbers>) -> Arc<dyn Numbers> {
        Arc::new(NumbersProxy { handler })
    }
}

struct NumbersProxy {
    handler: OutboundCallHandler<dyn Numbers>,
}

impl BridgeService for NumbersProxy {
    fn close(&self) {
        self.handler.close();
    }
}

impl Numbers for NumbersProxy {
    fn numbers(&self) -> Result<BridgeStream<u32>> {
        let stream = self.handler.call(0, vec![])?;
        downcast_value::<BridgeStream<u32>>(stream, NUMBERS_SIGNATURE)
    }

    fn temperature(&self) -> Result<StateStream<i64>> {
        let stream = self.handler.call(1, vec![])?;
        downcast_value::<StateStream<i64>>(stream, TEMPERATURE_SIGNATURE)
    }
}

struct RealNumbers {
    temperature: tokio::sync::watch::Receiver<i64>,
}

impl BridgeService for RealNumbers {}

impl Numbers for RealNumbers {
    fn numbers(&self) -> Result<BridgeStream<u32>> {
        Ok(BridgeStream::new(futures::stream::iter(vec![1u32, 2, 3])))
    }

    fn temperature(&self) -> Result<StateStream<i64>> {
        Ok(StateStream::new(self.temperature.clone()))
    }
}

// -- Telemetry ---------------------------------------------------------------

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl EventListener for RecordingListener {
    fn on_bind(&self, name: &str, type_name: &str) {
        self.record(format!("bind {name} {type_name}"));
    }

    fn on_take(&self, name: &str, type_name: &str) {
        self.record(format!("take {name} {type_name}"));
    }

    fn on_service_leaked(&self, name: &str) {
        self.record(format!("leak {name}"));
    }

    fn on_call_start(&self, call: &Call) -> StartToken {
        self.record(format!("start {}", call.function));
        Some(Box::new(call.function.clone()))
    }

    fn on_call_end(&self, call: &Call, result: &CallResult, start: StartToken) {
        let token = start
            .and_then(|token| token.downcast::<String>().ok())
            .map(|token| *token)
            .unwrap_or_default();
        self.record(format!(
            "end {} success={} token_matched={}",
            call.function,
            result.success,
            token == call.function
        ));
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

// -- Tests -------------------------------------------------------------------

#[test]
fn sync_call_round_trip() {
    let (a, b) = endpoint_pair();
    b.bind("greeter", Arc::new(RealGreeter) as Arc<dyn Greeter>, &GreeterAdapter).unwrap();

    let greeter = a.take("greeter", &GreeterAdapter);
    assert_eq!(greeter.greet("world".to_string()).unwrap(), "hello, world");
}

#[test]
fn bind_rejects_duplicate_names() {
    let (_a, b) = endpoint_pair();
    b.bind("greeter", Arc::new(RealGreeter) as Arc<dyn Greeter>, &GreeterAdapter).unwrap();
    let err = b
        .bind("greeter", Arc::new(RealGreeter) as Arc<dyn Greeter>, &GreeterAdapter)
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvariantViolation(_)));
}

#[test]
fn unbind_absent_name_is_an_error() {
    let (_a, b) = endpoint_pair();
    let err = b.unbind("nobody").unwrap_err();
    assert!(matches!(err, BridgeError::InvariantViolation(_)));
}

#[test]
fn unknown_service_reports_available_names() {
    let (a, b) = endpoint_pair();
    b.bind("greeter", Arc::new(RealGreeter) as Arc<dyn Greeter>, &GreeterAdapter).unwrap();

    let greeter = a.take("missing", &GreeterAdapter);
    let err = greeter.greet("world".to_string()).unwrap_err();
    let BridgeError::ApiMismatch(message) = err else {
        panic!("expected an API mismatch, got {err}");
    };
    assert!(message.contains("no such service"));
    assert!(message.contains("greeter"));
}

#[test]
fn unknown_function_reports_available_signatures() {
    let (a, b) = endpoint_pair();
    b.bind("greeter", Arc::new(RealGreeter) as Arc<dyn Greeter>, &GreeterAdapter).unwrap();

    let hello = a.take("greeter", &HelloAdapter);
    let err = hello.hello().unwrap_err();
    let BridgeError::ApiMismatch(message) = err else {
        panic!("expected an API mismatch, got {err}");
    };
    assert!(message.contains("no such function"));
    assert!(message.contains(GREET_SIGNATURE));
}

#[test]
fn remote_errors_cross_as_surrogates() {
    let (a, b) = endpoint_pair();
    b.bind("greeter", Arc::new(RealGreeter) as Arc<dyn Greeter>, &GreeterAdapter).unwrap();

    let greeter = a.take("greeter", &GreeterAdapter);
    let err = greeter.greet("grump".to_string()).unwrap_err();
    let BridgeError::Remote { types, detail } = err else {
        panic!("expected a remote failure, got {err}");
    };
    assert_eq!(types, vec!["Grumpy".to_string()]);
    assert!(detail.contains("coffee"));
}

#[test]
fn a_panicking_service_fails_one_call_not_the_endpoint() {
    let (a, b) = endpoint_pair();
    b.bind("panicky", Arc::new(PanickyGreeter) as Arc<dyn Greeter>, &GreeterAdapter).unwrap();
    b.bind("greeter", Arc::new(RealGreeter) as Arc<dyn Greeter>, &GreeterAdapter).unwrap();

    let panicky = a.take("panicky", &GreeterAdapter);
    let err = panicky.greet("world".to_string()).unwrap_err();
    let BridgeError::Remote { detail, .. } = err else {
        panic!("expected a remote failure, got {err}");
    };
    assert!(detail.contains("implementation panicked"));

    let greeter = a.take("greeter", &GreeterAdapter);
    assert_eq!(greeter.greet("still".to_string()).unwrap(), "hello, still");
}

#[test]
fn close_removes_the_binding_and_is_idempotent() {
    let (a, b) = endpoint_pair();
    b.bind("greeter", Arc::new(RealGreeter) as Arc<dyn Greeter>, &GreeterAdapter).unwrap();

    let greeter = a.take("greeter", &GreeterAdapter);
    assert_eq!(greeter.greet("once".to_string()).unwrap(), "hello, once");
    greeter.close();
    greeter.close();
    assert!(b.bound_names().is_empty());

    let err = greeter.greet("again".to_string()).unwrap_err();
    assert!(matches!(err, BridgeError::InvariantViolation(_)));
}

#[test]
fn pass_by_reference_round_trip_releases_the_binding() {
    let (a, b) = endpoint_pair();
    b.bind("publisher", Arc::new(RealPublisher) as Arc<dyn Publisher>, &PublisherAdapter).unwrap();

    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink: Arc<dyn TextSink> = Arc::new(CollectingSink {
        lines: lines.clone(),
    });

    let publisher = a.take("publisher", &PublisherAdapter);
    publisher.publish("news".to_string(), sink).unwrap();

    assert_eq!(
        lines.lock().unwrap().clone(),
        vec!["published: news".to_string()]
    );
    // the publisher closed its sink reference, releasing the caller's binding
    assert!(a.bound_names().is_empty());
}

#[test]
fn scope_closes_every_member_once() {
    let (a, b) = endpoint_pair();
    b.bind("one", Arc::new(RealGreeter) as Arc<dyn Greeter>, &GreeterAdapter).unwrap();
    b.bind("two", Arc::new(RealGreeter) as Arc<dyn Greeter>, &GreeterAdapter).unwrap();

    let scope = ProxyScope::new();
    let one = a.take_in("one", &scope, &GreeterAdapter).unwrap();
    let two = a.take_in("two", &scope, &GreeterAdapter).unwrap();
    assert_eq!(one.greet("a".to_string()).unwrap(), "hello, a");

    scope.close();
    scope.close();
    assert!(b.bound_names().is_empty());
    assert!(one.greet("b".to_string()).is_err());
    assert!(two.greet("b".to_string()).is_err());

    let err = a.take_in("one", &scope, &GreeterAdapter).unwrap_err();
    assert!(matches!(err, BridgeError::InvariantViolation(_)));
}

#[test]
fn scope_tolerates_members_closed_individually() {
    let (a, b) = endpoint_pair();
    b.bind("greeter", Arc::new(RealGreeter) as Arc<dyn Greeter>, &GreeterAdapter).unwrap();

    let scope = ProxyScope::new();
    let greeter = a.take_in("greeter", &scope, &GreeterAdapter).unwrap();
    greeter.close();
    scope.close();
    assert!(b.bound_names().is_empty());
}

#[test]
fn leaked_proxies_are_reported_once() {
    init_tracing();
    let listener = Arc::new(RecordingListener::default());
    let (a, b) = endpoint_pair_with(listener.clone(), Arc::new(RecordingListener::default()));
    b.bind("greeter", Arc::new(RealGreeter) as Arc<dyn Greeter>, &GreeterAdapter).unwrap();

    {
        let _leaky = a.take("greeter", &GreeterAdapter);
    }
    let _second = a.take("greeter", &GreeterAdapter);
    let _third = a.take("greeter", &GreeterAdapter);

    let leaks: Vec<String> = listener
        .events()
        .into_iter()
        .filter(|e| e.starts_with("leak "))
        .collect();
    assert_eq!(leaks, vec!["leak greeter".to_string()]);
}

#[test]
fn telemetry_sees_calls_with_matching_tokens() {
    let listener_a = Arc::new(RecordingListener::default());
    let listener_b = Arc::new(RecordingListener::default());
    let (a, b) = endpoint_pair_with(listener_a.clone(), listener_b.clone());
    b.bind("greeter", Arc::new(RealGreeter) as Arc<dyn Greeter>, &GreeterAdapter).unwrap();

    let greeter = a.take("greeter", &GreeterAdapter);
    greeter.greet("world".to_string()).unwrap();

    let events_a = listener_a.events();
    assert!(events_a.contains(&"take greeter test.Greeter".to_string()));
    assert!(events_a.contains(&format!("start {GREET_SIGNATURE}")));
    assert!(events_a.contains(&format!(
        "end {GREET_SIGNATURE} success=true token_matched=true"
    )));

    let events_b = listener_b.events();
    assert!(events_b.contains(&"bind greeter test.Greeter".to_string()));
    assert!(events_b.contains(&format!("start {GREET_SIGNATURE}")));
}

#[tokio::test]
async fn suspending_call_round_trip() {
    let (a, b) = endpoint_pair();
    b.bind("sleeper", Arc::new(EchoSleeper) as Arc<dyn Sleeper>, &SleeperAdapter).unwrap();

    let sleeper = a.take("sleeper", &SleeperAdapter);
    assert_eq!(sleeper.nap("noon".to_string()).await.unwrap(), "woke: noon");

    // the one-shot callback and its cancel callback are both unbound
    settle().await;
    assert!(a.bound_names().is_empty());
    assert_eq!(b.bound_names(), vec!["sleeper".to_string()]);
}

#[tokio::test]
async fn suspending_call_to_a_missing_service_fails_through_the_callback() {
    let (a, _b) = endpoint_pair();

    let sleeper = a.take("missing", &SleeperAdapter);
    let err = sleeper.nap("noon".to_string()).await.unwrap_err();
    assert!(matches!(err, BridgeError::ApiMismatch(_)));
}

#[tokio::test]
async fn dropping_a_suspending_call_cancels_the_remote_body() {
    init_tracing();
    let (a, b) = endpoint_pair();
    let dropped = Arc::new(AtomicBool::new(false));
    b.bind(
        "sleeper",
        Arc::new(StuckSleeper {
            dropped: dropped.clone(),
        }) as Arc<dyn Sleeper>,
        &SleeperAdapter,
    )
    .unwrap();

    let sleeper = a.take("sleeper", &SleeperAdapter);
    let call = tokio::spawn(async move { sleeper.nap("forever".to_string()).await });
    settle().await;
    assert!(!dropped.load(Ordering::SeqCst));

    call.abort();
    settle().await;
    assert!(dropped.load(Ordering::SeqCst));

    // both sides cleaned up their callback bindings
    assert!(a.bound_names().is_empty());
    assert_eq!(b.bound_names(), vec!["sleeper".to_string()]);
}

#[tokio::test]
async fn late_delivery_to_a_finished_call_is_rejected_quietly() {
    let (a, b) = endpoint_pair();
    b.bind("sleeper", Arc::new(EchoSleeper) as Arc<dyn Sleeper>, &SleeperAdapter).unwrap();

    let sleeper = a.take("sleeper", &SleeperAdapter);
    sleeper.nap("noon".to_string()).await.unwrap();
    settle().await;

    // replay a delivery to the first generated callback name; its binding
    // was removed when the real result arrived
    let stale = CallEnvelope {
        service: "tether/0".to_string(),
        function: "fun deliver(ResultEnvelope): Unit".to_string(),
        callback: None,
        args: vec![serde_json::to_value(ResultEnvelope::success(json!("dupe"))).unwrap()],
    };
    let reply = a.dispatch_incoming(&stale.to_json().unwrap());
    assert!(reply.contains("Failure"));
    assert!(reply.contains("no such service"));
}

#[tokio::test]
async fn endpoint_close_stops_accepting_suspending_work() {
    let (a, b) = endpoint_pair();
    b.bind("sleeper", Arc::new(EchoSleeper) as Arc<dyn Sleeper>, &SleeperAdapter).unwrap();
    b.close();

    let sleeper = a.take("sleeper", &SleeperAdapter);
    let pending = sleeper.nap("noon".to_string());
    let result = tokio::time::timeout(Duration::from_millis(50), pending).await;
    assert!(result.is_err(), "a closed endpoint must not deliver results");
}

#[tokio::test]
async fn streams_cross_by_reference_and_clean_up() {
    let (a, b) = endpoint_pair();
    let (_tx, rx) = tokio::sync::watch::channel(0i64);
    b.bind(
        "numbers",
        Arc::new(RealNumbers { temperature: rx }) as Arc<dyn Numbers>,
        &NumbersAdapter,
    )
    .unwrap();

    let numbers = a.take("numbers", &NumbersAdapter);
    let stream = numbers.numbers().unwrap();
    let mut items = stream.subscribe(8);

    let mut received = Vec::new();
    while let Some(item) = items.recv().await {
        received.push(item);
    }
    assert_eq!(received, vec![1, 2, 3]);

    settle().await;
    assert!(!a.bound_names().iter().any(|n| n.starts_with("tether/")));
    assert!(!b.bound_names().iter().any(|n| n.starts_with("tether/")));
}

#[tokio::test]
async fn dropping_a_subscription_stops_the_producer() {
    let (a, b) = endpoint_pair();
    let (_tx, rx) = tokio::sync::watch::channel(0i64);
    b.bind(
        "numbers",
        Arc::new(RealNumbers { temperature: rx }) as Arc<dyn Numbers>,
        &NumbersAdapter,
    )
    .unwrap();

    let numbers = a.take("numbers", &NumbersAdapter);
    let stream = numbers.numbers().unwrap();
    let mut items = stream.subscribe(1);
    let first = items.recv().await.unwrap();
    assert_eq!(first, 1);
    drop(items);

    settle().await;
    assert!(!a.bound_names().iter().any(|n| n.starts_with("tether/")));
    assert!(!b.bound_names().iter().any(|n| n.starts_with("tether/")));
}

#[tokio::test]
async fn state_streams_replay_the_current_value() {
    let (a, b) = endpoint_pair();
    let (tx, rx) = tokio::sync::watch::channel(18i64);
    b.bind(
        "numbers",
        Arc::new(RealNumbers { temperature: rx }) as Arc<dyn Numbers>,
        &NumbersAdapter,
    )
    .unwrap();

    let numbers = a.take("numbers", &NumbersAdapter);
    let state = numbers.temperature().unwrap();
    assert_eq!(state.value().unwrap(), 18);

    let mut updates = state.subscribe(8);
    assert_eq!(updates.recv().await.unwrap(), 18);
    tx.send(21).unwrap();
    assert_eq!(updates.recv().await.unwrap(), 21);
    drop(tx);
    assert!(updates.recv().await.is_none());
}

#[tokio::test]
async fn suspending_calls_run_concurrently() {
    let (a, b) = endpoint_pair();
    b.bind("sleeper", Arc::new(EchoSleeper) as Arc<dyn Sleeper>, &SleeperAdapter).unwrap();

    let sleeper = a.take("sleeper", &SleeperAdapter);
    let first = sleeper.nap("first".to_string());
    let second = sleeper.nap("second".to_string());
    let (first, second) = tokio::join!(first, second);
    assert_eq!(first.unwrap(), "woke: first");
    assert_eq!(second.unwrap(), "woke: second");
}
