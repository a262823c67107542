use grpc_double_core::{init_fixture_logging, RealClock, SimulatedClock};
use grpc_double_tonic::{
    response_stream, CallOptions, Code, Connection, Json, Metadata, RequestIterator, Router,
    ServerBuilder, ServicerContext, Status,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Clone, PartialEq, prost::Message)]
struct Word {
    #[prost(string, tag = "1")]
    text: String,
}

fn word(text: &str) -> Word {
    Word { text: text.to_string() }
}

fn words_router() -> Router {
    let mut router = Router::new();
    router
        .add_unary_unary("test.Words", "Upper", |w: Word, ctx: &ServicerContext| {
            if w.text.is_empty() {
                return Err(Status::invalid_argument("empty word"));
            }
            ctx.set_trailing_metadata(&Metadata::from_pairs([("len", w.text.len().to_string())]));
            Ok(word(&w.text.to_uppercase()))
        })
        .add_unary_stream("test.Words", "Letters", |w: Word, _ctx: &ServicerContext| {
            let letters: Vec<_> = w.text.chars().map(|c| Ok(word(&c.to_string()))).collect();
            Ok(response_stream(letters))
        })
        .add_stream_unary("test.Words", "Join", |words: RequestIterator<Word>, _ctx: &ServicerContext| {
            let words = words.map(|w| w.map(|w| w.text)).collect::<Result<Vec<_>, _>>()?;
            Ok(word(&words.join(" ")))
        })
        .add_stream_stream("test.Words", "Reverse", |words: RequestIterator<Word>, _ctx: &ServicerContext| {
            let reversed = words.map(|w| w.map(|w| word(&w.text.chars().rev().collect::<String>())));
            Ok(response_stream(reversed))
        })
        .add_unary_unary("test.Words", "Slow", |w: Word, ctx: &ServicerContext| {
            while ctx.is_active() {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(w)
        });
    router
}

fn connection() -> Connection {
    init_fixture_logging();
    ServerBuilder::new(Arc::new(SimulatedClock::default()))
        .add_router(words_router())
        .build_connection()
}

#[test]
fn every_cardinality_reaches_the_service() {
    let channel = connection().channel();

    let upper = channel.unary_unary::<Word, Word>("/test.Words/Upper");
    let (response, call) = upper.with_call(&word("quiet"), CallOptions::new()).unwrap();
    assert_eq!(response.text, "QUIET");
    assert_eq!(call.trailing_metadata().get("len"), Some("5"));

    let letters = channel.unary_stream::<Word, Word>("/test.Words/Letters");
    let letters: Vec<_> = letters
        .call(&word("abc"), CallOptions::new())
        .unwrap()
        .map(|w| w.unwrap().text)
        .collect();
    assert_eq!(letters, vec!["a", "b", "c"]);

    let join = channel.stream_unary::<Word, Word>("/test.Words/Join");
    let joined = join
        .call(vec![word("in"), word("process")], CallOptions::new())
        .unwrap();
    assert_eq!(joined.text, "in process");

    let reverse = channel.stream_stream::<Word, Word>("/test.Words/Reverse");
    let reversed: Vec<_> = reverse
        .call(vec![word("abc"), word("xy")], CallOptions::new())
        .unwrap()
        .map(|w| w.unwrap().text)
        .collect();
    assert_eq!(reversed, vec!["cba", "yx"]);
}

#[test]
fn service_status_reaches_the_client() {
    let upper = connection().channel().unary_unary::<Word, Word>("/test.Words/Upper");
    let error = upper.call(&word(""), CallOptions::new()).unwrap_err();
    assert_eq!(error.code(), Code::InvalidArgument);
    assert_eq!(error.details(), "empty word");
    let status: Status = error.into();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[test]
fn unknown_method_is_unimplemented() {
    let channel = connection().channel();
    let missing = channel.unary_unary::<Word, Word>("/test.Words/Missing");
    assert_eq!(
        missing.call(&word("x"), CallOptions::new()).unwrap_err().code(),
        Code::Unimplemented
    );
    let malformed = channel.unary_unary::<Word, Word>("test.Words.Upper");
    assert_eq!(
        malformed.call(&word("x"), CallOptions::new()).unwrap_err().code(),
        Code::Unimplemented
    );
}

#[test]
fn client_cancel_stops_a_waiting_service() {
    let slow = connection().channel().unary_unary::<Word, Word>("/test.Words/Slow");
    let future = slow.future(&word("zzz"), CallOptions::new()).unwrap();
    assert!(future.running());
    assert!(future.cancel());
    assert_eq!(future.exception().unwrap().code(), Code::Cancelled);
    assert!(future.done());
}

#[test]
fn real_clock_deadline_expires() {
    init_fixture_logging();
    let clock = Arc::new(RealClock::new().unwrap());
    let connection = ServerBuilder::new(clock).add_router(words_router()).build_connection();
    let slow = connection.channel().unary_unary::<Word, Word>("/test.Words/Slow");

    let error = slow
        .call(&word("zzz"), CallOptions::new().timeout(Duration::from_millis(50)))
        .unwrap_err();
    assert_eq!(error.code(), Code::DeadlineExceeded);
    assert_eq!(error.details(), "Took too much time!");
}

/// Deliberately not `Clone`.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Tally {
    words: usize,
}

#[test]
fn blocking_calls_accept_responses_that_are_not_clone() {
    let mut router = Router::new();
    router
        .add_unary_unary("test.Tally", "One", |w: Word, _ctx: &ServicerContext| {
            Ok(Json(Tally { words: w.text.split_whitespace().count() }))
        })
        .add_stream_unary("test.Tally", "Many", |words: RequestIterator<Word>, _ctx: &ServicerContext| {
            Ok(Json(Tally { words: words.count() }))
        });
    let channel = ServerBuilder::new(Arc::new(SimulatedClock::default()))
        .add_router(router)
        .build_connection()
        .channel();

    let one = channel.unary_unary::<Word, Json<Tally>>("/test.Tally/One");
    let tally = one.call(&word("three little words"), CallOptions::new()).unwrap();
    assert_eq!(tally.0, Tally { words: 3 });

    let many = channel.stream_unary::<Word, Json<Tally>>("/test.Tally/Many");
    let (tally, call) = many
        .with_call(vec![word("a"), word("b")], CallOptions::new())
        .unwrap();
    assert_eq!(tally.0, Tally { words: 2 });
    assert_eq!(call.code(), Code::Ok);
}
