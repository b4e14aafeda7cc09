use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tvgate::server::error::Error;
use tvgate::server::utils::retry_utils::{
    CATCHUP_MAX_ATTEMPTS, LIVE_MAX_ATTEMPTS, RetryAction, TransportFailure, retry_immediately,
};

/// accepts connections, reads the request and hangs up without answering
async fn spawn_hangup_backend() -> (String, Arc<AtomicU32>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicU32::new(0));

    let counter = accepted.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            drop(socket);
        }
    });

    (format!("http://{}/geturl", addr), accepted)
}

#[tokio::test]
async fn test_hangup_before_response_is_a_closed_connection() {
    let (url, _) = spawn_hangup_backend().await;

    let err = reqwest::Client::new().post(&url).send().await.unwrap_err();
    assert_eq!(TransportFailure::classify(&err), TransportFailure::ConnectionClosed);
    assert!(TransportFailure::classify(&err).is_retryable());
}

#[tokio::test]
async fn test_hangups_are_resent_up_to_the_bound() {
    for max_attempts in [LIVE_MAX_ATTEMPTS, CATCHUP_MAX_ATTEMPTS] {
        let (url, accepted) = spawn_hangup_backend().await;
        let client = reqwest::Client::new();

        let result: Result<(), Error> = retry_immediately(max_attempts, |_| {
            let request = client.post(&url).body("channel_id=144");
            async move {
                match request.send().await {
                    Ok(_) => RetryAction::Success(()),
                    Err(e) => RetryAction::from_transport(e, "playback"),
                }
            }
        })
        .await;

        assert!(matches!(
            result,
            Err(Error::TransientNetworkError { attempts, .. }) if attempts == max_attempts
        ));
        assert_eq!(accepted.load(Ordering::SeqCst), max_attempts);
    }
}

#[tokio::test]
async fn test_refused_connection_is_not_retried() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/geturl", listener.local_addr().unwrap());
    drop(listener);

    let calls = AtomicU32::new(0);
    let client = reqwest::Client::new();
    let result: Result<(), Error> = retry_immediately(LIVE_MAX_ATTEMPTS, |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        let request = client.get(&url);
        async move {
            match request.send().await {
                Ok(_) => RetryAction::Success(()),
                Err(e) => RetryAction::from_transport(e, "playback"),
            }
        }
    })
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(result, Err(Error::InternalServerErrorWithContext(_))));
}
