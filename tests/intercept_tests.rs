//! Interceptor bridge tests: the interactive edit round trip and the
//! one-edit-at-a-time guarantee

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{duplex_pipe, test_tls};
use mallory::dispatch::spawn_workers;
use mallory::intercept::{InterceptChannel, InterceptError, Interceptor};
use mallory::module::{Data, Module};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

/// Channel backed by in-memory queues; the test plays the operator.
struct TestChannel {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl InterceptChannel for TestChannel {
    async fn send_text(&mut self, text: String) -> Result<(), InterceptError> {
        self.outbound
            .send(text)
            .map_err(|_| InterceptError::Channel("operator went away".to_string()))
    }

    async fn recv_text(&mut self) -> Result<String, InterceptError> {
        self.inbound
            .recv()
            .await
            .ok_or_else(|| InterceptError::Channel("operator went away".to_string()))
    }
}

/// Intercepts the first client chunk only.
struct InterceptFirst {
    pending: AtomicBool,
}

#[async_trait]
impl Module for InterceptFirst {
    fn should_intercept(&self, data: &Data) -> bool {
        data.from_client && self.pending.swap(false, Ordering::SeqCst)
    }

    fn should_print(&self, _data: &Data) -> bool {
        false
    }
}

#[tokio::test]
async fn operator_edit_replaces_the_chunk() {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    let interceptor = Arc::new(Interceptor::new());
    interceptor
        .attach(Box::new(TestChannel {
            outbound: outbound_tx,
            inbound: inbound_rx,
        }))
        .await;

    let harness = duplex_pipe(test_tls());
    spawn_workers(
        Arc::clone(&harness.pipe),
        Arc::new(InterceptFirst {
            pending: AtomicBool::new(true),
        }),
        Arc::clone(&interceptor),
        false,
    );

    // The operator sees the chunk as spaced hex and rewrites it.
    let operator = tokio::spawn(async move {
        let outbound = outbound_rx.recv().await.expect("intercepted chunk");
        assert_eq!(outbound, "41 42");
        inbound_tx.send("5a 5a".to_string()).unwrap();
    });

    let mut client = harness.client;
    let mut server = harness.server;

    client.write_all(&[0x41, 0x42]).await.unwrap();
    let mut buf = [0u8; 2];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, [0x5a, 0x5a]);

    operator.await.unwrap();

    // Later chunks are no longer intercepted.
    client.write_all(b"plain").await.unwrap();
    let mut buf = [0u8; 5];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"plain");
}

/// Echoes every chunk back after a delay, recording how many round trips
/// overlap.
struct SerializationProbe {
    inflight: Arc<AtomicUsize>,
    max_inflight: Arc<AtomicUsize>,
    last: String,
}

#[async_trait]
impl InterceptChannel for SerializationProbe {
    async fn send_text(&mut self, text: String) -> Result<(), InterceptError> {
        let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inflight.fetch_max(now, Ordering::SeqCst);
        self.last = text;
        Ok(())
    }

    async fn recv_text(&mut self) -> Result<String, InterceptError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.inflight.fetch_sub(1, Ordering::SeqCst);
        Ok(self.last.clone())
    }
}

#[tokio::test]
async fn at_most_one_round_trip_in_flight_process_wide() {
    let inflight = Arc::new(AtomicUsize::new(0));
    let max_inflight = Arc::new(AtomicUsize::new(0));

    let interceptor = Arc::new(Interceptor::new());
    interceptor
        .attach(Box::new(SerializationProbe {
            inflight: Arc::clone(&inflight),
            max_inflight: Arc::clone(&max_inflight),
            last: String::new(),
        }))
        .await;

    // Eight concurrent edits from independent tasks, as if from eight pipes.
    let mut tasks = Vec::new();
    for i in 0..8u8 {
        let interceptor = Arc::clone(&interceptor);
        tasks.push(tokio::spawn(async move {
            interceptor.intercept(&[i]).await.unwrap()
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), vec![i as u8]);
    }

    assert_eq!(max_inflight.load(Ordering::SeqCst), 1);
}
