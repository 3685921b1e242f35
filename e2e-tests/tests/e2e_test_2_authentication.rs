// E2E Test 2: LOGIN and AUTHENTICATE flows against the scripted auth service

mod e2e;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use e2e::helpers::{TestOptions, TestServer};
use e2e::imap_client::ImapTestClient;

#[tokio::test]
async fn test_login_success_and_handoff() {
    let mut server = TestServer::spawn(TestOptions::default()).await;
    let mut client = ImapTestClient::connect(server.addr).await;
    client.expect_prefix("* OK ").await;

    client.send("a LOGIN alice s3cret").await;
    client.expect("a OK Logged in.").await;

    let handoff = server.handoffs.recv().await.expect("no handoff");
    assert_eq!(handoff.user, "alice");
    assert_eq!(handoff.credentials, b"token");
    assert!(handoff.secured);
    assert_eq!(server.registry.count(), 0);
}

#[tokio::test]
async fn test_login_quoted_credentials() {
    let mut server = TestServer::spawn(TestOptions::default()).await;
    let mut client = ImapTestClient::connect(server.addr).await;
    client.expect_prefix("* OK ").await;

    client.send("a LOGIN \"alice\" \"s3cret\"").await;
    client.expect("a OK Logged in.").await;

    let handoff = server.handoffs.recv().await.expect("no handoff");
    assert_eq!(handoff.user, "alice");
}

#[tokio::test]
async fn test_login_wrong_password() {
    let server = TestServer::spawn(TestOptions::default()).await;
    let mut client = ImapTestClient::connect(server.addr).await;
    client.expect_prefix("* OK ").await;

    client.send("a LOGIN alice wrong").await;
    client.expect("a NO Authentication failed.").await;

    // connection survives a rejected login
    client.send("b NOOP").await;
    client.expect("b OK NOOP completed.").await;
}

#[tokio::test]
async fn test_login_missing_arguments_is_bad() {
    let server = TestServer::spawn(TestOptions::default()).await;
    let mut client = ImapTestClient::connect(server.addr).await;
    client.expect_prefix("* OK ").await;

    client.send("a LOGIN alice").await;
    client
        .expect("a BAD Error in IMAP command received by server.")
        .await;
}

#[tokio::test]
async fn test_authenticate_plain_with_cancel() {
    let server = TestServer::spawn(TestOptions::default()).await;
    let mut client = ImapTestClient::connect(server.addr).await;
    client.expect_prefix("* OK ").await;

    client.send("a AUTHENTICATE PLAIN").await;
    client.expect("+").await;
    client.send("*").await;
    client.expect("a BAD Authentication aborted").await;

    // pumping resumes after the abort
    client.send("b NOOP").await;
    client.expect("b OK NOOP completed.").await;
}

#[tokio::test]
async fn test_authenticate_plain_round_trip() {
    let mut server = TestServer::spawn(TestOptions::default()).await;
    let mut client = ImapTestClient::connect(server.addr).await;
    client.expect_prefix("* OK ").await;

    client.send("a AUTHENTICATE PLAIN").await;
    client.expect("+").await;
    client.send(&BASE64.encode(b"\0bob\0s3cret")).await;
    client.expect("a OK Logged in.").await;

    let handoff = server.handoffs.recv().await.expect("no handoff");
    assert_eq!(handoff.user, "bob");
}

#[tokio::test]
async fn test_authenticate_unknown_mechanism() {
    let server = TestServer::spawn(TestOptions::default()).await;
    let mut client = ImapTestClient::connect(server.addr).await;
    client.expect_prefix("* OK ").await;

    client.send("a AUTHENTICATE CRAM-MD5").await;
    client.expect("a NO Unsupported authentication mechanism.").await;
}

#[tokio::test]
async fn test_input_blocked_until_auth_service_connects() {
    let server = TestServer::spawn(TestOptions {
        auth_connected: false,
        ..Default::default()
    })
    .await;

    let mut client = ImapTestClient::connect(server.addr).await;
    client.expect("* OK [CAPABILITY IMAP4rev1 AUTH=PLAIN] ready").await;

    client.send("a CAPABILITY").await;
    client
        .expect("* OK Waiting for authentication process to respond..")
        .await;

    // the buffered command is processed once the service is back
    server.auth.set_connected(true);
    client.expect("* CAPABILITY IMAP4rev1 AUTH=PLAIN").await;
    client.expect("a OK Capability completed.").await;
}
