//! Performance benchmarks for the dispatch hot paths

use client::director::{Arg, InvocationDirector};
use server::invocation::{Caller, DispatchChain, DispatchTable, InvocationManager, ResponseSink};
use shared::framing::{FrameReader, DEFAULT_MAX_FRAME_LEN};
use shared::service::{ServiceDescriptor, REQUEST_PROCESSED};
use shared::{
    event_queue, InvocationRequest, InvocationResponse, ListenerRef, Message, MessageSink,
    ProtocolError, Value,
};
use std::sync::{Arc, Mutex};
use std::time::Instant;

const COUNTER_SERVICE: ServiceDescriptor = ServiceDescriptor::new("counter", &[("bump", 1)]);

struct NullSink;

impl ResponseSink for NullSink {
    fn post_response(&self, _response: InvocationResponse) {}
}

impl MessageSink for NullSink {
    fn post_message(&self, _message: Message) -> Result<(), ProtocolError> {
        Ok(())
    }
}

/// Benchmarks enqueue and execution on the event dispatch queue
#[test]
fn benchmark_event_queue_throughput() {
    let (queue, mut dispatcher) = event_queue(0u64);

    let iterations = 100_000;
    let start = Instant::now();

    for i in 0..iterations {
        queue.enqueue(move |total: &mut u64| *total += i).unwrap();
    }
    let executed = dispatcher.run_pending();

    let duration = start.elapsed();
    println!(
        "Event queue: {} actions in {:?} ({:.2} ns/action)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert_eq!(executed, iterations as usize);
    assert_eq!(*dispatcher.context(), (0..iterations).sum::<u64>());
    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks server-side request dispatch including argument checks
#[test]
fn benchmark_request_dispatch() {
    let bumps = Arc::new(Mutex::new(0i64));
    let counter = Arc::clone(&bumps);
    let table = DispatchTable::new(&COUNTER_SERVICE).with(1, move |_caller, args| {
        args.expect_len(2)?;
        let by: i64 = args.get(0)?;
        *counter.lock().unwrap() += by;
        args.listener(1)?.respond(REQUEST_PROCESSED, vec![]);
        Ok(())
    });
    let mut invmgr = InvocationManager::new(Arc::new(NullSink));
    let oid = invmgr.register(DispatchChain::new(table));
    let caller = Caller {
        client_oid: 1000,
        username: "bench".into(),
    };

    let iterations = 50_000;
    let start = Instant::now();

    for i in 0..iterations {
        let request = InvocationRequest {
            target_oid: oid,
            method_id: 1,
            args: vec![
                Value::Long(1),
                Value::Listener(ListenerRef {
                    caller_oid: 1000,
                    request_id: i,
                }),
            ],
        };
        invmgr.dispatch_request(&caller, request).unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Request dispatch: {} requests in {:?} ({:.2} μs/request)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert_eq!(*bumps.lock().unwrap(), iterations as i64);
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks correlation table registration and response delivery
#[test]
fn benchmark_correlation_round_trip() {
    let director = InvocationDirector::new(1000, Arc::new(NullSink));
    let delivered = Arc::new(Mutex::new(0u32));

    struct Count(Arc<Mutex<u32>>);

    impl client::ResponseDispatcher for Count {
        fn listener_type(&self) -> &'static shared::service::ListenerDescriptor {
            &shared::service::CONFIRM_LISTENER
        }

        fn dispatch_response(
            &mut self,
            _method_id: shared::MethodId,
            _args: shared::Args,
        ) -> Result<(), shared::InvocationError> {
            *self.0.lock().unwrap() += 1;
            Ok(())
        }

        fn request_failed(&mut self, _cause: String) {}
    }

    let iterations: u32 = 50_000;
    let start = Instant::now();

    for i in 0..iterations {
        director
            .invoke(5, 2, vec![Arg::listener(Count(Arc::clone(&delivered)))])
            .unwrap();
        // ids are handed out sequentially from 1
        director.dispatch_response(InvocationResponse {
            caller_oid: 1000,
            request_id: i + 1,
            method_id: REQUEST_PROCESSED,
            args: vec![],
        });
    }

    let duration = start.elapsed();
    println!(
        "Correlation round trip: {} calls in {:?} ({:.2} μs/call)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert_eq!(*delivered.lock().unwrap(), iterations);
    assert_eq!(director.pending_count(), 0);
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks envelope framing and decoding
#[test]
fn benchmark_frame_decoding() {
    let message = Message::InvocationResponse(InvocationResponse {
        caller_oid: 1000,
        request_id: 7,
        method_id: 2,
        args: vec![Value::Long(1500), "idle".into()],
    });
    let frame = message.to_frame().unwrap();
    let mut stream = Vec::new();
    let iterations = 20_000;
    for _ in 0..iterations {
        stream.extend_from_slice(&frame);
    }

    let start = Instant::now();

    let mut reader = FrameReader::new(DEFAULT_MAX_FRAME_LEN);
    let mut decoded = 0;
    // feed in uneven chunks like a socket would
    for chunk in stream.chunks(1000) {
        reader.extend(chunk);
        while let Some(body) = reader.next_frame().unwrap() {
            assert_eq!(Message::from_frame_body(&body).unwrap(), message);
            decoded += 1;
        }
    }

    let duration = start.elapsed();
    println!(
        "Frame decoding: {} frames in {:?} ({:.2} μs/frame)",
        decoded,
        duration,
        duration.as_micros() as f64 / decoded as f64
    );

    assert_eq!(decoded, iterations);
    assert!(duration.as_millis() < 2000);
}
