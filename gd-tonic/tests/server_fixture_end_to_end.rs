use grpc_double_core::{init_fixture_logging, Clock, SimulatedClock};
use grpc_double_tonic::{
    response_stream, Code, FixtureError, Json, Metadata, RequestIterator, Router, ServerBuilder,
    ServerFixture, ServicerContext, Status,
};
use serde::{Deserialize, Serialize};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Clone, PartialEq, prost::Message)]
struct Reading {
    #[prost(string, tag = "1")]
    sensor: String,
    #[prost(double, tag = "2")]
    value: f64,
}

#[derive(Clone, PartialEq, prost::Message)]
struct Summary {
    #[prost(uint32, tag = "1")]
    count: u32,
    #[prost(double, tag = "2")]
    mean: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Lookup {
    key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Entry {
    key: String,
    value: Option<String>,
}

fn reading(sensor: &str, value: f64) -> Reading {
    Reading {
        sensor: sensor.to_string(),
        value,
    }
}

fn sensors_router() -> Router {
    let mut router = Router::new();
    router
        .add_stream_unary("test.Sensors", "Summarize", |readings: RequestIterator<Reading>, _ctx: &ServicerContext| {
            let mut count = 0;
            let mut total = 0.0;
            for reading in readings {
                total += reading?.value;
                count += 1;
            }
            let mean = if count == 0 { 0.0 } else { total / f64::from(count) };
            Ok(Summary { count, mean })
        })
        .add_stream_stream("test.Sensors", "Watch", |readings: RequestIterator<Reading>, ctx: &ServicerContext| {
            ctx.send_initial_metadata(&Metadata::from_pairs([("watching", "yes")]))
                .map_err(|e| Status::internal(e.to_string()))?;
            // Echo back only readings above the threshold.
            let alerts: Vec<_> = readings
                .filter(|r| r.as_ref().map_or(true, |r| r.value > 10.0))
                .collect();
            Ok(response_stream(alerts))
        })
        .add_unary_unary("test.Sensors", "Twice", |_r: Reading, ctx: &ServicerContext| {
            ctx.send_initial_metadata(&Metadata::new())
                .map_err(|e| Status::internal(e.to_string()))?;
            match ctx.send_initial_metadata(&Metadata::new()) {
                Err(FixtureError::InitialMetadataAlreadySent) => Ok(Summary { count: 1, mean: 0.0 }),
                _ => Err(Status::internal("second send should fail")),
            }
        })
        .add_unary_stream("test.Sensors", "Stall", |_r: Reading, ctx: &ServicerContext| {
            let ctx = ctx.clone();
            ctx.set_details("application details");
            Ok(response_stream(std::iter::from_fn(move || {
                while ctx.is_active() {
                    thread::sleep(Duration::from_millis(1));
                }
                None::<Result<Summary, Status>>
            })))
        });
    router
}

fn kv_router() -> Router {
    let mut router = Router::new();
    router.add_unary_unary("test.Kv", "Get", |lookup: Json<Lookup>, ctx: &ServicerContext| {
        let tenant = ctx.invocation_metadata().get("tenant").map(str::to_string);
        ctx.set_trailing_metadata(&Metadata::from_pairs([("served-by", "kv")]));
        Ok(Json(Entry {
            key: lookup.0.key,
            value: tenant,
        }))
    });
    router
}

fn fixture(clock: Arc<dyn Clock>) -> ServerFixture {
    init_fixture_logging();
    ServerBuilder::new(clock)
        .add_router(sensors_router())
        .add_router(kv_router())
        .build_fixture()
}

#[test]
fn json_messages_and_metadata_round_trip() {
    let fixture = fixture(Arc::new(SimulatedClock::default()));
    let rpc = fixture
        .invoke_unary_unary(
            "test.Kv",
            "Get",
            Some(&Metadata::from_pairs([("tenant", "acme")])),
            &Json(Lookup { key: "color".into() }),
            None,
        )
        .unwrap();

    let (entry, termination) = rpc.terminate_unary::<Json<Entry>>().unwrap();
    assert_eq!(
        entry,
        Some(Json(Entry {
            key: "color".into(),
            value: Some("acme".into()),
        }))
    );
    assert!(termination.is_ok());
    assert_eq!(termination.trailing_metadata.get("served-by"), Some("kv"));
}

#[test]
fn client_streaming_with_interleaved_sends() {
    let fixture = fixture(Arc::new(SimulatedClock::default()));
    let rpc = fixture
        .invoke_stream_unary("test.Sensors", "Summarize", None, None)
        .unwrap();

    let driver = thread::spawn(move || {
        for value in [1.0, 2.0, 6.0] {
            assert!(rpc.send_request(&reading("a", value)).unwrap());
        }
        rpc.no_more_requests();
        rpc.terminate_unary::<Summary>().unwrap()
    });

    let (summary, termination) = driver.join().unwrap();
    let summary = summary.unwrap();
    assert_eq!(summary.count, 3);
    assert!((summary.mean - 3.0).abs() < f64::EPSILON);
    assert!(termination.is_ok());
}

#[test]
fn bidi_streaming_filters_and_sends_initial_metadata() {
    let fixture = fixture(Arc::new(SimulatedClock::default()));
    let rpc = fixture.invoke_stream_stream("test.Sensors", "Watch", None, None).unwrap();

    assert_eq!(rpc.initial_metadata().get("watching"), Some("yes"));
    for value in [5.0, 15.0, 25.0] {
        rpc.send_request(&reading("b", value)).unwrap();
    }
    rpc.no_more_requests();

    let mut alerts = Vec::new();
    loop {
        match rpc.take_response::<Reading>() {
            Ok(alert) => alerts.push(alert.value),
            Err(FixtureError::NoMoreResponses) => break,
            Err(e) => panic!("unexpected: {e}"),
        }
    }
    assert_eq!(alerts, vec![15.0, 25.0]);
    assert!(rpc.terminate().is_ok());
}

#[test]
fn second_initial_metadata_send_fails_at_the_call_site() {
    let fixture = fixture(Arc::new(SimulatedClock::default()));
    let rpc = fixture
        .invoke_unary_unary("test.Sensors", "Twice", None, &reading("c", 0.0), None)
        .unwrap();
    let (summary, termination) = rpc.terminate_unary::<Summary>().unwrap();
    assert!(termination.is_ok(), "{termination:?}");
    assert_eq!(summary.unwrap().count, 1);
}

#[test]
fn zero_requests_to_a_unary_method_is_unimplemented() {
    let fixture = fixture(Arc::new(SimulatedClock::default()));
    let rpc = fixture
        .invoke_rpc("test.Sensors", "Twice", None, Vec::new(), true, None)
        .unwrap();
    let termination = rpc.terminate();
    assert_eq!(termination.code, Code::Unimplemented);
}

#[test]
fn deadline_overrides_staged_details() {
    let clock = Arc::new(SimulatedClock::default());
    let fixture = fixture(clock.clone());
    let rpc = fixture
        .invoke_unary_stream("test.Sensors", "Stall", None, &reading("d", 1.0), Some(Duration::from_secs(1)))
        .unwrap();

    clock.sleep_for(Duration::from_millis(500));
    assert!(rpc.is_active());
    assert_eq!(rpc.time_remaining(), Some(Duration::from_millis(500)));

    clock.sleep_for(Duration::from_millis(1500));
    let termination = rpc.terminate();
    assert_eq!(termination.code, Code::DeadlineExceeded);
    assert_eq!(termination.details, "Took too much time!");
    assert_eq!(rpc.time_remaining(), Some(Duration::ZERO));
}

#[test]
fn cancelled_stream_is_noticed_by_the_servicer() {
    let (seen_tx, seen_rx) = mpsc::channel();
    let mut router = Router::new();
    router.add_unary_stream("test.Ticker", "Ticks", move |count: u32, ctx: &ServicerContext| {
        let seen_tx = seen_tx.clone();
        ctx.add_callback(move || seen_tx.send(()).unwrap());
        Ok(response_stream((0..count).map(|tick| {
            thread::sleep(Duration::from_millis(1));
            Ok(tick)
        })))
    });
    let fixture = ServerBuilder::new(Arc::new(SimulatedClock::default()))
        .add_router(router)
        .build_fixture();

    let rpc = fixture.invoke_unary_stream("test.Ticker", "Ticks", None, &100_000u32, None).unwrap();
    assert_eq!(rpc.take_response::<u32>().unwrap(), 0);
    assert!(rpc.cancel());

    // The servicer's callbacks run once it checks liveness and finds the
    // client gone.
    seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let termination = rpc.terminate();
    assert_eq!(termination.code, Code::Cancelled);
    assert_eq!(termination.details, "Locally cancelled!");
}
